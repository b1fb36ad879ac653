use rand_core::RngCore;

/// A `Mutator` applies a black-box structural perturbation to one test body.
///
/// The fusion engine runs each selected seed through a mutator before the two
/// bodies are merged. How a mutator rewrites code is its own business; the
/// engine only relies on `mutate(code) -> code`.
pub trait Mutator: Send + Sync {
    /// Returns a perturbed copy of `code`. Implementations should prefer
    /// perturbations that keep the body parseable, but the pipeline tolerates
    /// anything: a body the runtime rejects simply produces identical
    /// captured output on both execution paths.
    fn mutate(&mut self, code: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error>;
}

/// A `Mutator` that returns the body unchanged.
///
/// Used when mutation is disabled in the generator configuration, and as a
/// stand-in for an external mutator in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMutator;

impl Mutator for IdentityMutator {
    fn mutate(&mut self, code: &str, _rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        Ok(code.to_string())
    }
}

/// A simple structural `Mutator` that swaps two randomly chosen lines.
///
/// Reordering statements is enough to shake loose ordering-sensitive JIT
/// behavior while keeping the body recognizable. Bodies with fewer than two
/// lines are returned unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineSwapMutator;

impl Mutator for LineSwapMutator {
    fn mutate(&mut self, code: &str, rng: &mut dyn RngCore) -> Result<String, anyhow::Error> {
        let mut lines: Vec<&str> = code.lines().collect();
        if lines.len() < 2 {
            return Ok(code.to_string());
        }
        let first = rng.next_u64() as usize % lines.len();
        let second = rng.next_u64() as usize % lines.len();
        lines.swap(first, second);
        Ok(lines.join("\n"))
    }
}
