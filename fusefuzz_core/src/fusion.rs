use crate::config::GeneratorConfig;
use crate::corpus::{Corpus, FUSION_VAR};
use crate::mutator::Mutator;
use rand::Rng;

/// Placeholder for the `--EXPECT--` section. The harness needs the section to
/// be present; the oracle only ever compares raw captured output.
pub const EXPECT_MARKER: &str = "this is a fused test";

/// Guarded API calls emitted per fused test when API fuzzing is enabled.
const API_FUZZ_ATTEMPTS: usize = 10;

/// Numeric JIT modes the random INI generator may activate.
const JIT_MODES: &[&str] = &["1254", "1205"];

/// Fixed catalog of configuration options the random INI generator draws
/// from: one uniformly chosen key, one uniformly chosen value. Contradictory
/// combinations with seed-carried configuration are allowed by design; the
/// runtime keeps the last directive it parses.
const CONFIG_CATALOG: &[(&str, &[&str])] = &[
    ("precision", &["10", "12", "13", "14", "17"]),
    ("serialize_precision", &["5", "10", "14", "15", "75", "-1"]),
    (
        "memory_limit",
        &["2M", "16M", "32M", "100M", "256M", "5M", "128M", "6G", "-1"],
    ),
    ("post_max_size", &["1", "1M", "1024"]),
    ("max_input_vars", &["1", "4", "5", "10", "100", "1000"]),
    ("max_execution_time", &["0", "1", "2", "10", "12", "60"]),
    (
        "default_charset",
        &["cp932", "big5", "ISO-8859-1", "UTF-8", "", "cp1251", "cp1254"],
    ),
    ("short_open_tag", &["on", "off", "1"]),
    ("auto_globals_jit", &["0", "1"]),
    ("implicit_flush", &["0", "1"]),
    (
        "date.timezone",
        &[
            "Europe/London",
            "UTC",
            "GMT",
            "America/Los_Angeles",
            "Asia/Singapore",
            "Europe/Berlin",
            "America/New_York",
            "Mars/Utopia_Planitia",
            "Incorrect/Zone",
        ],
    ),
    ("opcache.enable", &["0", "1"]),
    ("opcache.enable_cli", &["0", "1"]),
    ("opcache.jit", &["0", "1205", "1235", "1255"]),
    ("opcache.jit_buffer_size", &["1M", "128M", "0"]),
    ("opcache.jit_blacklist_root_trace", &["16", "255"]),
    ("opcache.jit_blacklist_side_trace", &["8", "255"]),
    ("opcache.jit_max_loop_unrolls", &["8", "10"]),
    ("opcache.jit_max_recursive_calls", &["2", "10"]),
    ("opcache.jit_max_recursive_returns", &["2", "4"]),
    ("opcache.jit_max_polymorphic_calls", &["2", "1000"]),
    (
        "opcache.optimization_level",
        &["-1", "0", "0x7fffffff", "0x4ff", "0x7FFFBFFF"],
    ),
    ("opcache.memory_consumption", &["7", "64"]),
    ("opcache.interned_strings_buffer", &["-1", "16", "131072"]),
    ("session.save_handler", &["files", "non-existent", "qwerty"]),
    ("session.auto_start", &["0", "1"]),
    ("session.use_strict_mode", &["0", "1"]),
    ("session.gc_maxlifetime", &["300", "0"]),
    ("session.gc_probability", &["0", "1"]),
    (
        "error_reporting",
        &[
            "0",
            "-1",
            "1",
            "8191",
            "2047",
            "E_ALL",
            "E_ALL^E_NOTICE",
            "E_ALL & ~E_DEPRECATED",
            "E_ALL & ~E_WARNING & ~E_NOTICE",
        ],
    ),
];

/// How the two seeds' dataflows are bridged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    /// One random variable from one random chain of each seed.
    Simple,
    /// One random variable from the single longest chain of each seed
    /// (first-seen wins on ties).
    Advanced,
}

impl FusionStrategy {
    fn pick<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.random_bool(0.5) {
            FusionStrategy::Simple
        } else {
            FusionStrategy::Advanced
        }
    }
}

/// One synthesized test, fully assembled in the harness wire format.
/// Owned by a single generation cycle and discarded after serialization.
#[derive(Debug, Clone)]
pub struct FusedTest {
    /// Cycle counter value, used for file naming (`fused<id>.phpt`).
    pub id: u64,
    /// Complete section-structured test text.
    pub text: String,
}

/// Combines two corpus seeds into one fused test per cycle.
///
/// The engine borrows the immutable corpus snapshot; the only state it
/// carries across cycles is the monotonically increasing cycle counter.
pub struct FusionEngine<'c> {
    corpus: &'c Corpus,
    mutator: Box<dyn Mutator>,
    api_fuzz: bool,
    ini_fuzz: bool,
    mutation: bool,
    cycle: u64,
}

impl<'c> FusionEngine<'c> {
    pub fn new(corpus: &'c Corpus, mutator: Box<dyn Mutator>, options: &GeneratorConfig) -> Self {
        Self {
            corpus,
            mutator,
            api_fuzz: options.api_fuzz,
            ini_fuzz: options.ini_fuzz,
            mutation: options.mutation,
            cycle: 0,
        }
    }

    /// The id the next fused test will be assigned.
    pub fn next_id(&self) -> u64 {
        self.cycle
    }

    /// Produces one fused test: two uniformly drawn seeds (with replacement),
    /// each mutated, their dataflows bridged, configurations merged, and the
    /// result assembled into ordered `--TEST--`/`--INI--`/`--EXTENSION--`/
    /// `--FILE--`/`--EXPECT--` sections.
    pub fn fuse<R: Rng>(&mut self, rng: &mut R) -> Result<FusedTest, anyhow::Error> {
        let seed1 = self.corpus.random_seed(rng);
        let seed2 = self.corpus.random_seed(rng);

        let mut code1 = seed1.code.clone();
        let mut code2 = seed2.code.clone();
        if self.mutation {
            code1 = self.mutator.mutate(&code1, rng)?;
            code2 = self.mutator.mutate(&code2, rng)?;
        }
        let code1 = clean_body(&code1);
        let code2 = clean_body(&code2);

        let (code1, code2) =
            interleave_dataflow(code1, code2, &seed1.dataflow, &seed2.dataflow, rng);

        let mut pool: Vec<String> =
            Vec::with_capacity(seed1.variables.len() + seed2.variables.len() + 1);
        pool.extend(seed1.variables.iter().cloned());
        pool.extend(seed2.variables.iter().cloned());
        pool.push(FUSION_VAR.to_string());

        let apifuzz = if self.api_fuzz {
            self.apifuzz_block(&pool, rng)
        } else {
            String::new()
        };

        let description = format!("--TEST--\n{} + {}\n", seed1.description, seed2.description);
        let ini = format!(
            "\n--INI--\n{}\n{}\n{}\n",
            seed1.configuration,
            seed2.configuration,
            self.random_inis(rng)
        );
        let extension = if !seed1.extension.is_empty() || !seed2.extension.is_empty() {
            format!("\n--EXTENSION--\n{}\n{}\n", seed1.extension, seed2.extension)
        } else {
            String::new()
        };
        let file = format!(
            "\n--FILE--\n<?php\n{code1}\n{code2}\n\nvar_dump(get_defined_vars());\n\n{apifuzz}\n"
        );
        let expect = format!("\n--EXPECT--\n{EXPECT_MARKER}\n");

        let assembled = format!("{description}{ini}{extension}{file}{expect}");
        // A stray close tag would end the wrapped JIT variants early.
        let assembled = assembled.replace("?>", "");
        let text = collapse_newlines(&assembled);

        let id = self.cycle;
        self.cycle += 1;
        Ok(FusedTest { id, text })
    }

    /// Emits `API_FUZZ_ATTEMPTS` calls of one uniformly chosen API function,
    /// each argument drawn with replacement from the variable pool and each
    /// call guarded so a thrown error does not abort the test.
    fn apifuzz_block<R: Rng + ?Sized>(&self, pool: &[String], rng: &mut R) -> String {
        let api = self.corpus.random_api(rng);
        let mut calls = Vec::with_capacity(API_FUZZ_ATTEMPTS);
        for _ in 0..API_FUZZ_ATTEMPTS {
            let args: Vec<String> = (0..api.arity)
                .map(|_| pool[rng.random_range(0..pool.len())].clone())
                .collect();
            calls.push(format!(
                "try {{{}({});}} catch (Exception $e) {{ echo($e); }}",
                api.name,
                args.join(",")
            ));
        }
        format!("\n{}\n", calls.join("\n"))
    }

    /// One random configuration line, plus a JIT activation block one time
    /// in four. Empty when INI fuzzing is disabled.
    fn random_inis<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        if !self.ini_fuzz {
            return String::new();
        }
        let mut inis = random_config_line(rng);
        inis.push('\n');
        if rng.random_range(0..4) == 0 {
            inis.push_str(&random_jit_mode(rng));
        }
        inis
    }
}

/// One `key=value` line drawn uniformly from the fixed catalog.
pub fn random_config_line<R: Rng + ?Sized>(rng: &mut R) -> String {
    let (key, values) = CONFIG_CATALOG[rng.random_range(0..CONFIG_CATALOG.len())];
    let value = values[rng.random_range(0..values.len())];
    format!("{key}={value}")
}

fn random_jit_mode<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mode = JIT_MODES[rng.random_range(0..JIT_MODES.len())];
    format!("\nopcache.enable=1\nopcache.enable_cli=1\nopcache.jit={mode}\n")
}

/// Bridges the two bodies through one variable each: `$fusion = <v1>;` is
/// appended to the first body and one random textual occurrence of `<v2>` in
/// the second body becomes `$fusion`.
///
/// If either seed carries no usable chain the bodies are returned untouched;
/// the fused test is then a plain concatenation. That is deliberate
/// degradation, not an error.
fn interleave_dataflow<R: Rng + ?Sized>(
    body1: String,
    body2: String,
    chains1: &[Vec<String>],
    chains2: &[Vec<String>],
    rng: &mut R,
) -> (String, String) {
    if chains1.is_empty() || chains2.is_empty() {
        return (body1, body2);
    }

    let mut chains1 = chains1.to_vec();
    // Optional class-fuzz hook; the runtime tolerates these being undefined.
    chains1.push(vec!["$cls".to_string(), "$clsAttr".to_string()]);

    let usable1: Vec<&Vec<String>> = chains1.iter().filter(|c| !c.is_empty()).collect();
    let usable2: Vec<&Vec<String>> = chains2.iter().filter(|c| !c.is_empty()).collect();
    if usable1.is_empty() || usable2.is_empty() {
        return (body1, body2);
    }

    let (from_var, into_var) = match FusionStrategy::pick(rng) {
        FusionStrategy::Simple => (
            random_chain_var(&usable1, rng).to_string(),
            random_chain_var(&usable2, rng).to_string(),
        ),
        FusionStrategy::Advanced => (
            random_var(longest_chain(&usable1), rng).to_string(),
            random_var(longest_chain(&usable2), rng).to_string(),
        ),
    };

    let mut body1 = body1;
    body1.push_str(&format!("\n{FUSION_VAR} = {from_var};\n"));
    let body2 = replace_random_occurrence(&body2, &into_var, FUSION_VAR, rng);
    (body1, body2)
}

fn longest_chain<'a>(chains: &[&'a Vec<String>]) -> &'a Vec<String> {
    let mut best = chains[0];
    for chain in &chains[1..] {
        if chain.len() > best.len() {
            best = chain;
        }
    }
    best
}

fn random_chain_var<'a, R: Rng + ?Sized>(chains: &[&'a Vec<String>], rng: &mut R) -> &'a str {
    random_var(chains[rng.random_range(0..chains.len())], rng)
}

fn random_var<'a, R: Rng + ?Sized>(chain: &'a [String], rng: &mut R) -> &'a str {
    &chain[rng.random_range(0..chain.len())]
}

/// Replaces one uniformly chosen non-overlapping occurrence of `old` in `s`
/// with `new`. Returns `s` unchanged when `old` does not occur.
pub fn replace_random_occurrence<R: Rng + ?Sized>(
    s: &str,
    old: &str,
    new: &str,
    rng: &mut R,
) -> String {
    if old.is_empty() {
        return s.to_string();
    }
    let positions: Vec<usize> = s.match_indices(old).map(|(i, _)| i).collect();
    if positions.is_empty() {
        return s.to_string();
    }
    let pos = positions[rng.random_range(0..positions.len())];
    let mut out = String::with_capacity(s.len() + new.len());
    out.push_str(&s[..pos]);
    out.push_str(new);
    out.push_str(&s[pos + old.len()..]);
    out
}

/// Collapses every run of consecutive newlines to a single newline.
/// Idempotent: re-applying it to collapsed text is a no-op.
pub fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_newline = false;
    for ch in text.chars() {
        if ch == '\n' {
            if !prev_newline {
                out.push('\n');
            }
            prev_newline = true;
        } else {
            prev_newline = false;
            out.push(ch);
        }
    }
    out
}

/// Strips open/close tags and completion trailers from a seed body and
/// surrounds it with single newlines, ready for concatenation.
fn clean_body(code: &str) -> String {
    let mut code = code.trim();
    for trailer in ["===DONE===", "==DONE==", "Done"] {
        if let Some(stripped) = code.strip_suffix(trailer) {
            code = stripped.trim_end();
        }
    }
    if let Some(stripped) = code.strip_prefix("<?php") {
        code = stripped.trim_start();
    }
    if let Some(stripped) = code.strip_suffix("?>") {
        code = stripped.trim_end();
    }
    format!("\n{code}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_utils::{sample_apis, sample_seed};
    use crate::corpus::Seed;
    use crate::mutator::IdentityMutator;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn engine_options(api_fuzz: bool, ini_fuzz: bool) -> GeneratorConfig {
        GeneratorConfig {
            api_fuzz,
            ini_fuzz,
            mutation: false,
            ..GeneratorConfig::default()
        }
    }

    fn linked_pair() -> (Seed, Seed) {
        let seed1 = Seed {
            code: "echo $a;".to_string(),
            variables: vec!["$a".to_string()],
            dataflow: vec![vec!["$a".to_string()]],
            description: "first".to_string(),
            configuration: "precision=10".to_string(),
            skipif: String::new(),
            extension: String::new(),
        };
        let seed2 = Seed {
            code: "echo $b;\nprint($b);".to_string(),
            variables: vec!["$b".to_string()],
            dataflow: vec![vec!["$b".to_string()]],
            description: "second".to_string(),
            configuration: "memory_limit=32M".to_string(),
            skipif: String::new(),
            extension: String::new(),
        };
        (seed1, seed2)
    }

    #[test]
    fn replace_random_occurrence_replaces_exactly_one() {
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let text = "echo $b;\nprint($b);\n$c = $b;";
        let replaced = replace_random_occurrence(text, "$b", "$fusion", &mut rng);
        assert_eq!(replaced.matches("$fusion").count(), 1);
        assert_eq!(replaced.matches("$b").count(), 2);
    }

    #[test]
    fn replace_random_occurrence_without_match_is_identity() {
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        let text = "echo $b;";
        assert_eq!(replace_random_occurrence(text, "$z", "$fusion", &mut rng), text);
    }

    #[test]
    fn collapse_newlines_is_idempotent() {
        let messy = "--TEST--\n\n\nfirst\n\n--FILE--\n\n<?php\n\n\n";
        let collapsed = collapse_newlines(messy);
        assert_eq!(collapsed, "--TEST--\nfirst\n--FILE--\n<?php\n");
        assert_eq!(collapse_newlines(&collapsed), collapsed);
    }

    #[test]
    fn clean_body_strips_tags_and_trailers() {
        let cleaned = clean_body("<?php\n$a = 1;\necho $a;\n?>");
        assert_eq!(cleaned, "\n$a = 1;\necho $a;\n");
        let cleaned = clean_body("$a = 1;\n===DONE===");
        assert_eq!(cleaned, "\n$a = 1;\n");
    }

    #[test]
    fn fusion_links_bodies_through_single_assignment() {
        let (seed1, seed2) = linked_pair();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(false, false);

        // Both strategies must insert the bridge exactly once; exercise many
        // RNG streams so Simple and Advanced both occur.
        for stream in 0..20u8 {
            let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
            let mut rng = ChaCha8Rng::from_seed([stream; 32]);
            let fused = engine.fuse(&mut rng).unwrap();
            assert_eq!(
                fused.text.matches("$fusion = ").count(),
                1,
                "exactly one bridge assignment, stream {stream}"
            );
        }
    }

    #[test]
    fn fusion_replaces_one_occurrence_of_target_variable() {
        let (seed1, seed2) = linked_pair();
        // Restrict the corpus so seed selection is deterministic per draw:
        // both draws come from the same two-seed pool, and `$b` only occurs
        // in seed2's body (twice).
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(false, false);

        for stream in 0..20u8 {
            let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
            let mut rng = ChaCha8Rng::from_seed([stream; 32]);
            let fused = engine.fuse(&mut rng).unwrap();
            let b_before = 2 * count_seed2_draws(&fused.text);
            let b_after = fused.text.matches("$b").count();
            // Exactly one `$b` was rewritten iff `$b` was the replacement
            // target, which holds whenever seed2 contributed the second body.
            if b_before > 0 {
                assert!(b_after == b_before || b_after == b_before - 1);
            }
        }
    }

    fn count_seed2_draws(text: &str) -> usize {
        // The `--TEST--` line joins both drawn descriptions, and "second"
        // occurs nowhere else in the fused text.
        text.matches("second").count()
    }

    #[test]
    fn seeds_without_chains_concatenate_without_bridge() {
        let mut seed1 = sample_seed("a");
        let mut seed2 = sample_seed("b");
        seed1.dataflow.clear();
        seed2.dataflow.clear();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(false, false);
        let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
        let mut rng = ChaCha8Rng::from_seed([11; 32]);

        let fused = engine.fuse(&mut rng).unwrap();
        assert!(!fused.text.contains("$fusion = "));
        assert!(fused.text.contains("--FILE--"));
        assert!(fused.text.contains("var_dump(get_defined_vars());"));
    }

    #[test]
    fn sections_appear_in_harness_order() {
        let (seed1, seed2) = linked_pair();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(true, true);
        let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
        let mut rng = ChaCha8Rng::from_seed([5; 32]);

        let fused = engine.fuse(&mut rng).unwrap();
        let test_idx = fused.text.find("--TEST--").unwrap();
        let ini_idx = fused.text.find("--INI--").unwrap();
        let file_idx = fused.text.find("--FILE--").unwrap();
        let expect_idx = fused.text.find("--EXPECT--").unwrap();
        assert!(test_idx < ini_idx && ini_idx < file_idx && file_idx < expect_idx);
        assert!(fused.text.ends_with(&format!("{EXPECT_MARKER}\n")));
        assert!(!fused.text.contains("--EXTENSION--"));
        assert!(!fused.text.contains("\n\n"), "newlines are collapsed");
    }

    #[test]
    fn extension_section_emitted_when_either_seed_declares_one() {
        let (seed1, mut seed2) = linked_pair();
        seed2.extension = "opcache".to_string();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(false, false);
        let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
        let mut rng = ChaCha8Rng::from_seed([6; 32]);

        // Draws are random with replacement; run until a fusion includes the
        // extension-bearing seed.
        let mut saw_extension = false;
        for _ in 0..20 {
            let fused = engine.fuse(&mut rng).unwrap();
            if fused.text.contains("--EXTENSION--") {
                assert!(fused.text.contains("opcache"));
                saw_extension = true;
                break;
            }
        }
        assert!(saw_extension);
    }

    #[test]
    fn api_fuzz_emits_guarded_calls() {
        let (seed1, seed2) = linked_pair();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(true, false);
        let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
        let mut rng = ChaCha8Rng::from_seed([8; 32]);

        let fused = engine.fuse(&mut rng).unwrap();
        assert_eq!(fused.text.matches("try {").count(), API_FUZZ_ATTEMPTS);
        assert_eq!(
            fused.text.matches("catch (Exception $e) { echo($e); }").count(),
            API_FUZZ_ATTEMPTS
        );
    }

    #[test]
    fn fused_ids_increase_monotonically() {
        let (seed1, seed2) = linked_pair();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(false, false);
        let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
        let mut rng = ChaCha8Rng::from_seed([9; 32]);

        assert_eq!(engine.fuse(&mut rng).unwrap().id, 0);
        assert_eq!(engine.fuse(&mut rng).unwrap().id, 1);
        assert_eq!(engine.next_id(), 2);
    }

    #[test]
    fn close_tags_never_survive_assembly() {
        let (mut seed1, seed2) = linked_pair();
        seed1.code = "$a = 1; ?> trailing".to_string();
        let corpus = Corpus::from_parts(vec![seed1, seed2], sample_apis()).unwrap();
        let options = engine_options(false, false);
        let mut engine = FusionEngine::new(&corpus, Box::new(IdentityMutator), &options);
        let mut rng = ChaCha8Rng::from_seed([10; 32]);

        let fused = engine.fuse(&mut rng).unwrap();
        assert!(!fused.text.contains("?>"));
    }

    #[test]
    fn random_config_line_is_key_value_from_catalog() {
        let mut rng = ChaCha8Rng::from_seed([12; 32]);
        for _ in 0..50 {
            let line = random_config_line(&mut rng);
            let (key, _value) = line.split_once('=').expect("key=value shape");
            assert!(CONFIG_CATALOG.iter().any(|(k, _)| *k == key));
        }
    }
}
