pub mod config;
pub mod corpus;
pub mod diff;
pub mod fusion;
pub mod mutator;
pub mod oracle;
pub mod variant;

pub use config::FuzzConfig;
pub use corpus::{ApiFunction, Corpus, CorpusError, Seed};
pub use diff::{DIFF_SIZE_CAP, diff_outputs};
pub use fusion::{FusedTest, FusionEngine, FusionStrategy};
pub use mutator::{IdentityMutator, LineSwapMutator, Mutator};
pub use oracle::{BugStore, DifferentialOracle, OracleError, ScanStats, Verdict};
pub use variant::{JitProfile, VariantSet};
