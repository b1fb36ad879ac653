use crate::diff::diff_outputs;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise while scanning captures or recording bugs.
///
/// Missing or unreadable repeat captures are not errors; they classify the
/// pair INCOMPLETE and the scan moves on. Errors here mean the scan itself
/// cannot proceed or a confirmed bug could not be persisted.
#[derive(Error, Debug)]
pub enum OracleError {
    /// The results directory could not be listed.
    #[error("Failed to list results directory {path}: {source}")]
    ListDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A confirmed bug could not be written to the bug store.
    #[error("Failed to record bug {id} under {path}: {source}")]
    Record {
        id: u64,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome for one JIT/non-JIT capture pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Outputs agree at level 1.
    Pass,
    /// Outputs disagreed but a repeat run did not reproduce them.
    Noise,
    /// The divergence survived every configured verification level.
    Bug,
    /// A required repeat capture was missing or unreadable.
    Incomplete,
}

/// Counters for one verification level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    /// Pairs that reached this level.
    pub checked: u64,
    /// Pairs this level cleared (agreement at level 1, non-reproduction above).
    pub passed: u64,
    /// Pairs this level could not clear.
    pub failed: u64,
}

/// Statistics for one scan, or accumulated across scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub levels: [LevelStats; 3],
    pub incomplete: u64,
    pub bugs: u64,
}

impl ScanStats {
    pub fn absorb(&mut self, other: &ScanStats) {
        for (mine, theirs) in self.levels.iter_mut().zip(other.levels.iter()) {
            mine.checked += theirs.checked;
            mine.passed += theirs.passed;
            mine.failed += theirs.failed;
        }
        self.incomplete += other.incomplete;
        self.bugs += other.bugs;
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, level) in self.levels.iter().enumerate() {
            writeln!(
                f,
                "check{}[total,pass,fail]: {} {} {}",
                depth + 1,
                level.checked,
                level.passed,
                level.failed
            )?;
        }
        writeln!(f, "incomplete: {}", self.incomplete)?;
        write!(f, "bugs: {}", self.bugs)
    }
}

/// Compares captured JIT and non-JIT outputs and persists confirmed bugs.
///
/// A scan is one pass over a point-in-time listing of `.out` files. The
/// harness that produced them may still be appending; pairs whose repeat
/// captures have not landed yet come back INCOMPLETE and are retried for
/// free on the next scan.
pub struct DifferentialOracle {
    level: u8,
    store: BugStore,
    total: ScanStats,
}

impl DifferentialOracle {
    /// `level` is the verification depth, 1 to 3. Values are validated at
    /// config load; anything above 3 behaves as 3.
    pub fn new(level: u8, bug_dir: PathBuf) -> Self {
        Self {
            level,
            store: BugStore::new(bug_dir),
            total: ScanStats::default(),
        }
    }

    /// Scans `results_dir` for capture pairs and returns this scan's
    /// statistics. Confirmed bugs are recorded before the scan returns.
    pub fn scan(&mut self, results_dir: &Path) -> Result<ScanStats, OracleError> {
        let outputs = list_outputs(results_dir)?;
        let mut stats = ScanStats::default();

        for jit_name in &outputs {
            if !jit_name.contains("_jit") || jit_name.contains("_jit_check") {
                continue;
            }
            let normal_name = jit_name.replace("_jit", "");
            if !outputs.contains(&normal_name) {
                continue;
            }

            stats.levels[0].checked += 1;
            let Ok(normal) = fs::read(results_dir.join(&normal_name)) else {
                stats.incomplete += 1;
                continue;
            };
            let Ok(jit) = fs::read(results_dir.join(jit_name)) else {
                stats.incomplete += 1;
                continue;
            };

            if normal == jit {
                stats.levels[0].passed += 1;
                continue;
            }
            stats.levels[0].failed += 1;

            let verdict = self.escalate(
                results_dir,
                &outputs,
                jit_name,
                &normal,
                &jit,
                &mut stats,
            );
            match verdict {
                Verdict::Bug => {
                    let id =
                        self.store
                            .record(results_dir, &normal_name, jit_name, &normal, &jit)?;
                    println!(
                        "bug {id}: {normal_name} {:x} vs {jit_name} {:x}",
                        md5::compute(&normal),
                        md5::compute(&jit)
                    );
                    stats.bugs += 1;
                }
                Verdict::Noise | Verdict::Incomplete => {}
                Verdict::Pass => unreachable!("level 1 already failed"),
            }
        }

        self.total.absorb(&stats);
        Ok(stats)
    }

    /// Statistics accumulated across every scan so far.
    pub fn cumulative(&self) -> &ScanStats {
        &self.total
    }

    /// Runs the repeat-execution levels for a pair that diverged at level 1.
    fn escalate(
        &self,
        results_dir: &Path,
        outputs: &BTreeSet<String>,
        jit_name: &str,
        normal: &[u8],
        jit: &[u8],
        stats: &mut ScanStats,
    ) -> Verdict {
        for depth in 2..=self.level.min(3) {
            let (check_suffix, jit_check_suffix) = if depth == 2 {
                ("_check", "_jit_check")
            } else {
                ("_check_", "_jit_check_")
            };
            let check_name = jit_name.replace("_jit", check_suffix);
            let jit_check_name = jit_name.replace("_jit", jit_check_suffix);
            if !outputs.contains(&check_name) || !outputs.contains(&jit_check_name) {
                stats.incomplete += 1;
                return Verdict::Incomplete;
            }

            stats.levels[(depth - 1) as usize].checked += 1;
            let check = read_normalized(
                &results_dir.join(&check_name),
                &format!("{check_suffix}.php"),
                ".php",
            );
            let jit_check = read_normalized(
                &results_dir.join(&jit_check_name),
                &format!("{jit_check_suffix}.php"),
                "_jit.php",
            );
            let (Some(check), Some(jit_check)) = (check, jit_check) else {
                stats.incomplete += 1;
                return Verdict::Incomplete;
            };

            if check != normal || jit_check != jit {
                // The divergence did not reproduce; flaky, not a bug.
                stats.levels[(depth - 1) as usize].passed += 1;
                return Verdict::Noise;
            }
            stats.levels[(depth - 1) as usize].failed += 1;
        }
        Verdict::Bug
    }
}

fn list_outputs(results_dir: &Path) -> Result<BTreeSet<String>, OracleError> {
    let entries = fs::read_dir(results_dir).map_err(|e| OracleError::ListDir {
        path: results_dir.display().to_string(),
        source: e,
    })?;
    let mut outputs = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| OracleError::ListDir {
            path: results_dir.display().to_string(),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".out") {
            outputs.insert(name);
        }
    }
    Ok(outputs)
}

/// Reads a repeat capture and rewrites its filename self-references back to
/// the name of the run it repeats, so path-bearing diagnostics compare equal
/// across the original and the repeat.
fn read_normalized(path: &Path, from: &str, to: &str) -> Option<Vec<u8>> {
    let bytes = fs::read(path).ok()?;
    Some(replace_bytes(&bytes, from.as_bytes(), to.as_bytes()))
}

fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Persists confirmed bugs, one numbered directory per bug.
///
/// Ids restart from the current directory count on each run but are bumped
/// past any existing directory, so they stay strictly increasing even after
/// an operator deletes triaged entries.
pub struct BugStore {
    dir: PathBuf,
}

impl BugStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Copies every file sharing either capture's stem into a fresh bug
    /// directory, together with a `diff` of the two raw outputs. Returns the
    /// assigned bug id.
    pub fn record(
        &self,
        results_dir: &Path,
        normal_out: &str,
        jit_out: &str,
        normal: &[u8],
        jit: &[u8],
    ) -> Result<u64, OracleError> {
        let id = self.next_id()?;
        let bug_dir = self.dir.join(id.to_string());
        let io_err = |e: std::io::Error| OracleError::Record {
            id,
            path: bug_dir.display().to_string(),
            source: e,
        };

        fs::create_dir_all(&bug_dir).map_err(io_err)?;
        self.copy_stem_files(results_dir, normal_out, &bug_dir, id)?;
        self.copy_stem_files(results_dir, jit_out, &bug_dir, id)?;
        fs::write(bug_dir.join("diff"), diff_outputs(normal, jit)).map_err(io_err)?;
        Ok(id)
    }

    /// Copies every sibling of `capture` that shares its stem, for any
    /// extension (`.out`, `.phpt`, whatever else the harness left behind).
    fn copy_stem_files(
        &self,
        results_dir: &Path,
        capture: &str,
        bug_dir: &Path,
        id: u64,
    ) -> Result<(), OracleError> {
        let io_err = |e: std::io::Error| OracleError::Record {
            id,
            path: bug_dir.display().to_string(),
            source: e,
        };
        let stem = capture.split('.').next().unwrap_or(capture);
        let prefix = format!("{stem}.");
        let entries = fs::read_dir(results_dir).map_err(io_err)?;
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                fs::copy(entry.path(), bug_dir.join(&name)).map_err(io_err)?;
            }
        }
        Ok(())
    }

    fn next_id(&self) -> Result<u64, OracleError> {
        let io_err = |e: std::io::Error| OracleError::Record {
            id: 0,
            path: self.dir.display().to_string(),
            source: e,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let count = fs::read_dir(&self.dir).map_err(io_err)?.count() as u64;
        let mut id = count + 1;
        while self.dir.join(id.to_string()).exists() {
            id += 1;
        }
        Ok(id)
    }
}
