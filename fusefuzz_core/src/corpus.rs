use rand_core::RngCore;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Variable name injected by the fusion engine to bridge the two seeds' dataflows.
/// Seeds are not allowed to declare it themselves.
pub const FUSION_VAR: &str = "$fusion";

/// Defines errors that can arise while loading the knowledge base.
///
/// Loading is strict: an unreadable table, a malformed record, or an empty
/// table all abort the load. Generation cannot proceed without seed and API
/// material, so there is no degraded mode here.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading a knowledge-base file.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file was readable but is not a JSON array of records.
    #[error("Table at {path} is not a JSON array of records: {source}")]
    Table {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// One record has unparseable structured fields (variables, dataflow, ...).
    /// Reported with the record index so the offending seed can be fixed or
    /// removed, rather than silently producing corrupted fused tests.
    #[error("Seed {id} has malformed structured fields: {source}")]
    MalformedSeed {
        id: usize,
        #[source]
        source: serde_json::Error,
    },

    /// One API record has unparseable fields.
    #[error("API record {id} is malformed: {source}")]
    MalformedApi {
        id: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A seed declares the reserved `$fusion` variable name.
    #[error("Seed {id} declares the reserved variable {FUSION_VAR}")]
    ReservedVariable { id: usize },

    /// The seed table loaded successfully but contains no records.
    #[error("No seeds available in {0}")]
    NoSeeds(String),

    /// The API table loaded successfully but contains no records.
    #[error("No API records available in {0}")]
    NoApis(String),
}

/// One seed test as stored in the knowledge base.
///
/// Structured fields (`variables`, `dataflow`) are explicit JSON decoded by
/// serde; the loader never evaluates seed content as code. All fields are
/// immutable after load.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    /// The test body, without section markers.
    pub code: String,
    /// Variable names defined by the body, in definition order.
    pub variables: Vec<String>,
    /// Dataflow chains: each an ordered list of variable names through which
    /// a value is believed to travel. Precomputed upstream, never recomputed
    /// here.
    pub dataflow: Vec<Vec<String>>,
    /// Human-readable test description, used for the `--TEST--` section.
    pub description: String,
    /// Raw configuration lines carried by the seed (`--INI--` material).
    #[serde(default)]
    pub configuration: String,
    /// Skip condition carried for completeness; fusion currently ignores it.
    #[serde(default)]
    pub skipif: String,
    /// Extension requirement (`--EXTENSION--` material), empty if none.
    #[serde(default)]
    pub extension: String,
}

/// One callable from the API knowledge base: a function name and how many
/// arguments it takes.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApiFunction {
    pub name: String,
    pub arity: usize,
}

/// Immutable snapshot of the seed and API knowledge base.
///
/// Loaded once at startup and passed by shared reference into the fusion
/// engine. Nothing mutates it after load, so it is safe to share across
/// concurrent generation workers.
#[derive(Debug)]
pub struct Corpus {
    seeds: Vec<Seed>,
    apis: Vec<ApiFunction>,
}

impl Corpus {
    /// Loads the seed table and API table from two JSON files.
    ///
    /// Each file must hold a JSON array of records. Records are decoded
    /// individually so a malformed entry is reported with its index. An
    /// empty table is an error: generation has nothing to work with.
    pub fn load(seeds_path: &Path, apis_path: &Path) -> Result<Self, CorpusError> {
        let seeds = Self::load_seeds(seeds_path)?;
        let apis = Self::load_apis(apis_path)?;
        Ok(Self { seeds, apis })
    }

    fn read_records(path: &Path) -> Result<Vec<serde_json::Value>, CorpusError> {
        let content = fs::read_to_string(path).map_err(|e| CorpusError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| CorpusError::Table {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn load_seeds(path: &Path) -> Result<Vec<Seed>, CorpusError> {
        let records = Self::read_records(path)?;
        let mut seeds = Vec::with_capacity(records.len());
        for (id, record) in records.into_iter().enumerate() {
            let seed: Seed = serde_json::from_value(record)
                .map_err(|e| CorpusError::MalformedSeed { id, source: e })?;
            if seed.variables.iter().any(|v| v == FUSION_VAR) {
                return Err(CorpusError::ReservedVariable { id });
            }
            seeds.push(seed);
        }
        if seeds.is_empty() {
            return Err(CorpusError::NoSeeds(path.display().to_string()));
        }
        Ok(seeds)
    }

    fn load_apis(path: &Path) -> Result<Vec<ApiFunction>, CorpusError> {
        let records = Self::read_records(path)?;
        let mut apis = Vec::with_capacity(records.len());
        for (id, record) in records.into_iter().enumerate() {
            let api: ApiFunction = serde_json::from_value(record)
                .map_err(|e| CorpusError::MalformedApi { id, source: e })?;
            apis.push(api);
        }
        if apis.is_empty() {
            return Err(CorpusError::NoApis(path.display().to_string()));
        }
        Ok(apis)
    }

    /// Builds a snapshot directly from records, mainly for tests and for
    /// embedders that keep their knowledge base elsewhere.
    pub fn from_parts(seeds: Vec<Seed>, apis: Vec<ApiFunction>) -> Result<Self, CorpusError> {
        if seeds.is_empty() {
            return Err(CorpusError::NoSeeds("<memory>".to_string()));
        }
        if apis.is_empty() {
            return Err(CorpusError::NoApis("<memory>".to_string()));
        }
        for (id, seed) in seeds.iter().enumerate() {
            if seed.variables.iter().any(|v| v == FUSION_VAR) {
                return Err(CorpusError::ReservedVariable { id });
            }
        }
        Ok(Self { seeds, apis })
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    pub fn apis(&self) -> &[ApiFunction] {
        &self.apis
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Selects one seed uniformly at random. The snapshot is never empty
    /// after a successful load, so this always returns a seed.
    pub fn random_seed<R: RngCore + ?Sized>(&self, rng: &mut R) -> &Seed {
        let index = rng.next_u64() as usize % self.seeds.len();
        &self.seeds[index]
    }

    /// Selects one API record uniformly at random.
    pub fn random_api<R: RngCore + ?Sized>(&self, rng: &mut R) -> &ApiFunction {
        let index = rng.next_u64() as usize % self.apis.len();
        &self.apis[index]
    }
}
