//! FlapNet command line: evolve a population of bird brains or replay a
//! persisted champion.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use flapnet_app::{run_evolve, run_replay, EvolveOutcome, RunOptions};
use flapnet_core::{FrameSink, NullSink, SimConfig};
use flapnet_render::TerminalSink;

/// Pause after the final frame so the winning state is visible before exit.
const WIN_LINGER: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    name = "flapnet",
    version,
    about = "Neuro-evolution harness for a terminal flappy-bird clone"
)]
struct Cli {
    /// Path of the champion artifact, written on a win and read for replay.
    #[arg(long, default_value = "champion.json")]
    champion: PathBuf,

    /// Run headless: no terminal rendering, no tick pacing.
    #[arg(long)]
    headless: bool,

    /// Seed shared by the world RNG and the optimizer, for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Simulation tick rate in Hz.
    #[arg(long, default_value_t = 60)]
    fps: u32,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evolve a fresh population until the win threshold or the generation cap.
    Evolve {
        /// Genomes per generation.
        #[arg(long, default_value_t = 100)]
        population: usize,

        /// Give up after this many generations (0 means unlimited).
        #[arg(long, default_value_t = 50)]
        max_generations: u32,
    },
    /// Replay the persisted champion as a single bird.
    Replay,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let sim_config = SimConfig {
        paced: !cli.headless,
        rng_seed: cli.seed,
        tick_rate: cli.fps,
        ..SimConfig::default()
    };

    match cli.command {
        Some(Command::Replay) => replay(&cli, sim_config),
        Some(Command::Evolve {
            population,
            max_generations,
        }) => evolve(&cli, sim_config, population, max_generations),
        // No subcommand: replay when an artifact exists, otherwise evolve.
        None => {
            if cli.champion.exists() {
                replay(&cli, sim_config)
            } else {
                evolve(&cli, sim_config, 100, 50)
            }
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn make_sink(headless: bool, config: &SimConfig) -> Result<Box<dyn FrameSink>> {
    if headless {
        Ok(Box::new(NullSink))
    } else {
        let sink =
            TerminalSink::new(config.clone()).context("failed to initialize the terminal")?;
        Ok(Box::new(sink))
    }
}

fn options(cli: &Cli, population: usize, max_generations: u32) -> RunOptions {
    RunOptions {
        champion: cli.champion.clone(),
        seed: cli.seed,
        population,
        max_generations,
    }
}

fn evolve(
    cli: &Cli,
    sim_config: SimConfig,
    population: usize,
    max_generations: u32,
) -> Result<ExitCode> {
    let mut sink = make_sink(cli.headless, &sim_config)?;
    let outcome = run_evolve(
        &options(cli, population, max_generations),
        &sim_config,
        sink.as_mut(),
    )?;
    match outcome {
        EvolveOutcome::ChampionPersisted { .. } => {
            std::thread::sleep(WIN_LINGER);
            Ok(ExitCode::SUCCESS)
        }
        EvolveOutcome::Aborted { .. } => Ok(ExitCode::SUCCESS),
        EvolveOutcome::CapReached { .. } => Ok(ExitCode::FAILURE),
    }
}

fn replay(cli: &Cli, sim_config: SimConfig) -> Result<ExitCode> {
    if !cli.champion.exists() {
        // A missing artifact is not an error; fall back to evolving one.
        warn!(
            path = %cli.champion.display(),
            "no champion artifact found, starting evolution instead"
        );
        return evolve(cli, sim_config, 100, 50);
    }
    let mut sink = make_sink(cli.headless, &sim_config)?;
    run_replay(&options(cli, 100, 50), &sim_config, sink.as_mut())?;
    Ok(ExitCode::SUCCESS)
}
