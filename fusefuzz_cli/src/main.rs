use fusefuzz_core::config::FuzzConfig;
use fusefuzz_core::corpus::Corpus;
use fusefuzz_core::fusion::FusionEngine;
use fusefuzz_core::mutator::{LineSwapMutator, Mutator};
use fusefuzz_core::oracle::DifferentialOracle;
use fusefuzz_core::variant::VariantSet;

use clap::{Parser, Subcommand};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuse seed pairs and write the test variants for the harness to run.
    Generate {
        /// Number of fused tests to produce; overrides the configured
        /// tests-per-cycle.
        #[clap(short = 'n', long)]
        cycles: Option<u32>,
        /// Seed for the generation RNG; the same seed over the same corpus
        /// reproduces the same tests.
        #[clap(long)]
        rng_seed: Option<u64>,
    },
    /// Scan captured outputs for JIT/non-JIT divergences and record bugs.
    Check {
        /// Directory of `.out` captures; defaults to the generator output dir.
        #[clap(long)]
        results_dir: Option<PathBuf>,
    },
}

fn load_config(config_file: Option<PathBuf>) -> Result<FuzzConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            FuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                FuzzConfig::load_from_file(&default_config_path)
            } else {
                println!(
                    "No config file specified and default 'config.toml' not found, using built-in defaults."
                );
                Ok(FuzzConfig::default())
            }
        }
    }
}

fn generate(
    config: &FuzzConfig,
    cycles: Option<u32>,
    rng_seed: Option<u64>,
) -> Result<(), anyhow::Error> {
    let corpus = Corpus::load(&config.corpus.seeds_path, &config.corpus.apis_path)?;
    println!(
        "Loaded {} seeds and {} API records",
        corpus.len(),
        corpus.apis().len()
    );

    let output_dir = &config.generator.output_dir;
    std::fs::create_dir_all(output_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create output dir {:?}: {}", output_dir, e))?;

    let mutator: Box<dyn Mutator> = Box::new(LineSwapMutator);
    let mut engine = FusionEngine::new(&corpus, mutator, &config.generator);

    let seed = rng_seed.unwrap_or_else(rand::random::<u64>);
    println!("RNG seed: {seed}");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let cycles = cycles.unwrap_or(config.generator.tests_per_cycle);
    let level = config.oracle.verification_level;
    println!("Generating {cycles} fused tests into {output_dir:?} (verification level {level})");

    let start_time = Instant::now();
    let mut files_written = 0usize;
    for _ in 0..cycles {
        let fused = engine.fuse(&mut rng)?;
        let variants = VariantSet::generate(&fused, &mut rng);
        files_written += variants.materialize(output_dir, level, &mut rng)?.len();
    }

    println!(
        "Wrote {} files for {} tests in {:.2?}",
        files_written,
        cycles,
        start_time.elapsed()
    );
    Ok(())
}

fn check(config: &FuzzConfig, results_dir: Option<PathBuf>) -> Result<(), anyhow::Error> {
    let results_dir = results_dir.unwrap_or_else(|| config.generator.output_dir.clone());
    let mut oracle = DifferentialOracle::new(
        config.oracle.verification_level,
        config.oracle.bug_dir.clone(),
    );

    println!("Scanning {results_dir:?} for divergences");
    let stats = oracle.scan(&results_dir)?;
    println!("{stats}");
    println!("cumulative:");
    println!("{}", oracle.cumulative());
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let config = load_config(cli.config_file)?;

    match cli.command {
        Command::Generate { cycles, rng_seed } => generate(&config, cycles, rng_seed),
        Command::Check { results_dir } => check(&config, results_dir),
    }
}
