use crate::fusion::FusedTest;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

pub const HOT_FUNC_KEY: &str = "opcache.jit_hot_func=1";
pub const HOT_LOOP_KEY: &str = "opcache.jit_hot_loop=1";

/// JIT activation block added to the jitted variants of a fused test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitProfile {
    /// Tracing JIT with the hot-function threshold forced to one, so the
    /// wrapped body compiles on its first call.
    TracingHotFunc,
    /// Function JIT: every function compiles regardless of call counts.
    Function,
}

impl JitProfile {
    pub fn pick<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.random_bool(0.5) {
            JitProfile::TracingHotFunc
        } else {
            JitProfile::Function
        }
    }

    pub fn ini(self) -> &'static str {
        match self {
            JitProfile::TracingHotFunc => {
                "opcache.enable=1\nopcache.enable_cli=1\nopcache.jit=tracing\nopcache.jit_hot_func=1"
            }
            JitProfile::Function => "opcache.enable=1\nopcache.enable_cli=1\nopcache.jit=function",
        }
    }
}

/// The three execution variants derived from one fused test.
///
/// `nonjit` runs with every configuration line stripped so the interpreter
/// path sees plain defaults. `hot_func` and `hot_loop` share one JIT profile
/// and differ only in how the body is made hot. Exactly one of the jitted
/// variants is serialized per test.
#[derive(Debug, Clone)]
pub struct VariantSet {
    pub id: u64,
    pub nonjit: String,
    pub hot_func: String,
    pub hot_loop: String,
}

impl VariantSet {
    /// Derives the variant set for one fused test.
    pub fn generate<R: Rng + ?Sized>(test: &FusedTest, rng: &mut R) -> Self {
        let jitconfig = JitProfile::pick(rng).ini();

        let (nonjit, jit) = match ini_span(&test.text) {
            Some((start, end)) => {
                let mut nonjit = String::with_capacity(test.text.len());
                nonjit.push_str(&test.text[..start]);
                nonjit.push_str(&test.text[end..]);
                let nonjit = nonjit
                    .replace("--INI--\n--FILE--", "--FILE--")
                    .replace("--INI----FILE--", "--FILE--");

                let mut jit = String::with_capacity(test.text.len() + jitconfig.len());
                jit.push_str(&test.text[..start]);
                jit.push('\n');
                jit.push_str(jitconfig);
                jit.push('\n');
                jit.push_str(&test.text[end..]);
                (nonjit, jit)
            }
            None => {
                let jit = test.text.replacen(
                    "--FILE--",
                    &format!("--INI--\n{jitconfig}\n--FILE--"),
                    1,
                );
                (test.text.clone(), jit)
            }
        };

        let code = extract_section(&jit, "--FILE--");
        let hot_func = jit.replacen(&code, &wrap_hot_func(&code), 1);
        let hot_loop = jit
            .replacen(&code, &wrap_hot_loop(&code), 1)
            .replace(HOT_FUNC_KEY, HOT_LOOP_KEY);

        Self {
            id: test.id,
            nonjit,
            hot_func,
            hot_loop,
        }
    }

    /// Writes the variant files for one test into `dir` and returns the
    /// written paths.
    ///
    /// The non-JIT test and one uniformly chosen jitted variant are always
    /// written. At verification level 2 each gets a `_check` copy, at level 3
    /// additionally a `_check_` copy; the harness executes every file, so the
    /// copies become the repeat runs the oracle compares against.
    pub fn materialize<R: Rng + ?Sized>(
        &self,
        dir: &Path,
        level: u8,
        rng: &mut R,
    ) -> Result<Vec<PathBuf>, anyhow::Error> {
        let jit = if rng.random_bool(0.5) {
            &self.hot_func
        } else {
            &self.hot_loop
        };

        let mut written = Vec::new();
        let mut emit = |suffix: &str, content: &str| -> Result<(), anyhow::Error> {
            let path = dir.join(format!("fused{}{}.phpt", self.id, suffix));
            fs::write(&path, content)
                .map_err(|e| anyhow::anyhow!("Failed to write {:?}: {}", path, e))?;
            written.push(path);
            Ok(())
        };

        emit("", &self.nonjit)?;
        if level >= 2 {
            emit("_check", &self.nonjit)?;
        }
        if level >= 3 {
            emit("_check_", &self.nonjit)?;
        }
        emit("_jit", jit)?;
        if level >= 2 {
            emit("_jit_check", jit)?;
        }
        if level >= 3 {
            emit("_jit_check_", jit)?;
        }
        Ok(written)
    }
}

/// Byte range of the raw `--INI--` section content, excluding the marker
/// itself and ending at the next marker.
fn ini_span(test: &str) -> Option<(usize, usize)> {
    let start = test.find("--INI--")? + "--INI--".len();
    let end = match find_marker(&test[start..]) {
        Some(rel) => start + rel,
        None => test.len(),
    };
    Some((start, end))
}

/// Extracts the content of one section, without the marker and without
/// surrounding newlines. Empty string when the marker is absent.
pub fn extract_section(test: &str, marker: &str) -> String {
    let Some(idx) = test.find(marker) else {
        return String::new();
    };
    let rest = &test[idx + marker.len()..];
    let end = find_marker(rest).unwrap_or(rest.len());
    rest[..end].trim_matches('\n').to_string()
}

/// Position of the next `--NAME--` section marker, where NAME is one or more
/// uppercase letters or underscores.
fn find_marker(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 4 <= bytes.len() {
        if bytes[i] == b'-' && bytes[i + 1] == b'-' {
            let mut j = i + 2;
            while j < bytes.len() && (bytes[j].is_ascii_uppercase() || bytes[j] == b'_') {
                j += 1;
            }
            if j > i + 2 && j + 1 < bytes.len() && bytes[j] == b'-' && bytes[j + 1] == b'-' {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn strip_open_tag(code: &str) -> &str {
    code.strip_prefix("<?php").unwrap_or(code)
}

/// Wraps the body in a function that is defined and immediately called, so
/// the hot-function JIT path compiles it.
fn wrap_hot_func(code: &str) -> String {
    let body = strip_open_tag(code);
    let wrapped = format!("<?php\nfunction make_it_hot() {{\n{body}\n}}\nmake_it_hot();\n");
    collapse_blank_lines(&wrapped)
}

/// Wraps the body in a single-iteration loop inside a block, so the hot-loop
/// JIT path compiles it.
fn wrap_hot_loop(code: &str) -> String {
    let body = strip_open_tag(code);
    let wrapped = format!("<?php\n{{\nfor ($i = 0; $i < 1; $i++) {{\n{body}\n}}\n}}\n");
    collapse_blank_lines(&wrapped)
}

/// Collapses every blank line to nothing: any two newlines separated only by
/// whitespace become one newline, greedily across the whole whitespace run.
/// Idempotent.
pub fn collapse_blank_lines(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\n' {
            let mut last_newline = i;
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                if chars[j] == '\n' {
                    last_newline = j;
                }
                j += 1;
            }
            out.push('\n');
            i = last_newline + 1;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    fn fused(text: &str) -> FusedTest {
        FusedTest {
            id: 7,
            text: text.to_string(),
        }
    }

    const WITH_INI: &str = "--TEST--\nfirst + second\n--INI--\nprecision=10\nmemory_limit=32M\n--FILE--\n<?php\necho $a;\nvar_dump(get_defined_vars());\n--EXPECT--\nthis is a fused test\n";

    const WITHOUT_INI: &str = "--TEST--\nfirst + second\n--FILE--\n<?php\necho $a;\n--EXPECT--\nthis is a fused test\n";

    #[test]
    fn extract_section_returns_trimmed_content() {
        assert_eq!(extract_section(WITH_INI, "--INI--"), "precision=10\nmemory_limit=32M");
        assert_eq!(
            extract_section(WITH_INI, "--FILE--"),
            "<?php\necho $a;\nvar_dump(get_defined_vars());"
        );
        assert_eq!(extract_section(WITH_INI, "--EXPECT--"), "this is a fused test");
        assert_eq!(extract_section(WITH_INI, "--SKIPIF--"), "");
    }

    #[test]
    fn collapse_blank_lines_is_idempotent() {
        let messy = "<?php\n\n   \necho $a;\n\t\n\necho $b;\n";
        let collapsed = collapse_blank_lines(messy);
        assert_eq!(collapsed, "<?php\necho $a;\necho $b;\n");
        assert_eq!(collapse_blank_lines(&collapsed), collapsed);
    }

    #[test]
    fn nonjit_variant_drops_every_configuration_line() {
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let set = VariantSet::generate(&fused(WITH_INI), &mut rng);
        assert!(!set.nonjit.contains("--INI--"));
        assert!(!set.nonjit.contains("precision=10"));
        assert!(!set.nonjit.contains("opcache."));
        assert!(set.nonjit.contains("--FILE--\n<?php"));
    }

    #[test]
    fn jitted_variants_carry_one_shared_profile() {
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let set = VariantSet::generate(&fused(WITH_INI), &mut rng);
        for variant in [&set.hot_func, &set.hot_loop] {
            assert!(variant.contains("opcache.enable=1"));
            assert!(variant.contains("opcache.enable_cli=1"));
            assert!(variant.contains("opcache.jit="));
            assert!(!variant.contains("precision=10"), "seed INI lines are dropped");
        }
    }

    #[test]
    fn test_without_ini_gains_section_only_in_jitted_variants() {
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let set = VariantSet::generate(&fused(WITHOUT_INI), &mut rng);
        assert_eq!(set.nonjit, WITHOUT_INI);
        assert!(set.hot_func.contains("--INI--"));
        let ini_idx = set.hot_func.find("--INI--").unwrap();
        let file_idx = set.hot_func.find("--FILE--").unwrap();
        assert!(ini_idx < file_idx);
    }

    #[test]
    fn hot_func_wraps_body_in_called_function() {
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        let set = VariantSet::generate(&fused(WITH_INI), &mut rng);
        assert!(set.hot_func.contains("function make_it_hot() {"));
        assert!(set.hot_func.contains("make_it_hot();"));
        assert!(set.hot_func.contains("echo $a;"));
        assert!(!set.nonjit.contains("make_it_hot"));
    }

    #[test]
    fn hot_loop_wraps_body_and_never_keeps_hot_func_key() {
        for stream in 0..16u8 {
            let mut rng = ChaCha8Rng::from_seed([stream; 32]);
            let set = VariantSet::generate(&fused(WITH_INI), &mut rng);
            assert!(set.hot_loop.contains("for ($i = 0; $i < 1; $i++) {"));
            assert!(!set.hot_loop.contains(HOT_FUNC_KEY));
            if set.hot_func.contains(HOT_FUNC_KEY) {
                assert!(set.hot_loop.contains(HOT_LOOP_KEY));
            }
        }
    }

    #[test]
    fn materialize_writes_file_pairs_per_level() {
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        let set = VariantSet::generate(&fused(WITH_INI), &mut rng);

        for (level, expected) in [(1u8, 2usize), (2, 4), (3, 6)] {
            let dir = tempdir().unwrap();
            let written = set.materialize(dir.path(), level, &mut rng).unwrap();
            assert_eq!(written.len(), expected, "level {level}");
            assert!(dir.path().join("fused7.phpt").exists());
            assert!(dir.path().join("fused7_jit.phpt").exists());
            assert_eq!(dir.path().join("fused7_check.phpt").exists(), level >= 2);
            assert_eq!(dir.path().join("fused7_jit_check.phpt").exists(), level >= 2);
            assert_eq!(dir.path().join("fused7_check_.phpt").exists(), level >= 3);
            assert_eq!(dir.path().join("fused7_jit_check_.phpt").exists(), level >= 3);
        }
    }

    #[test]
    fn check_copies_match_their_source_variant() {
        let mut rng = ChaCha8Rng::from_seed([6; 32]);
        let set = VariantSet::generate(&fused(WITH_INI), &mut rng);
        let dir = tempdir().unwrap();
        set.materialize(dir.path(), 3, &mut rng).unwrap();

        let base = fs::read_to_string(dir.path().join("fused7.phpt")).unwrap();
        assert_eq!(base, set.nonjit);
        assert_eq!(
            fs::read_to_string(dir.path().join("fused7_check.phpt")).unwrap(),
            base
        );
        let jit = fs::read_to_string(dir.path().join("fused7_jit.phpt")).unwrap();
        assert!(jit == set.hot_func || jit == set.hot_loop);
        assert_eq!(
            fs::read_to_string(dir.path().join("fused7_jit_check_.phpt")).unwrap(),
            jit
        );
    }
}
