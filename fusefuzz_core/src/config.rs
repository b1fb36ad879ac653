use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default = "default_seeds_path")]
    pub seeds_path: PathBuf,
    #[serde(default = "default_apis_path")]
    pub apis_path: PathBuf,
}

fn default_seeds_path() -> PathBuf {
    PathBuf::from("./knowledges/seeds.json")
}

fn default_apis_path() -> PathBuf {
    PathBuf::from("./knowledges/apis.json")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            seeds_path: default_seeds_path(),
            apis_path: default_apis_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Directory the fused `.phpt` variants are written to. The external
    /// execution harness consumes them from here and drops `.out` captures
    /// next to them.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Fused tests produced per `generate` invocation.
    #[serde(default = "default_tests_per_cycle")]
    pub tests_per_cycle: u32,
    /// Instrument fused tests with guarded random API calls.
    #[serde(default = "default_true")]
    pub api_fuzz: bool,
    /// Append a random configuration line (and sometimes a JIT mode block)
    /// to the merged INI section.
    #[serde(default = "default_true")]
    pub ini_fuzz: bool,
    /// Run each seed body through the mutator before fusion.
    #[serde(default = "default_true")]
    pub mutation: bool,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./tests/fused")
}

fn default_tests_per_cycle() -> u32 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            tests_per_cycle: default_tests_per_cycle(),
            api_fuzz: true,
            ini_fuzz: true,
            mutation: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleConfig {
    /// Verification depth: 1 compares JIT vs non-JIT once, 2 and 3 demand
    /// the divergence reproduce across that many repeat executions.
    #[serde(default = "default_verification_level")]
    pub verification_level: u8,
    #[serde(default = "default_bug_dir")]
    pub bug_dir: PathBuf,
}

pub fn default_verification_level() -> u8 {
    2
}

fn default_bug_dir() -> PathBuf {
    PathBuf::from("./bugs")
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            verification_level: default_verification_level(),
            bug_dir: default_bug_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

impl FuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        if !(1..=3).contains(&config.oracle.verification_level) {
            return Err(anyhow::anyhow!(
                "verification-level must be 1, 2 or 3 (got {})",
                config.oracle.verification_level
            ));
        }

        Ok(config)
    }
}
