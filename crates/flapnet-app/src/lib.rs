//! Shared driver plumbing for the FlapNet binary: the evolve loop and
//! champion replay, kept apart from terminal setup so both can run
//! headless against any [`FrameSink`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use flapnet_core::{FrameSink, GenerationOutcome, RunMode, SimConfig, Simulation};
use flapnet_neat::{ChampionArtifact, NeatBrain, NeatConfig, Population};

/// Knobs the command line exposes to the driver.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Path of the champion artifact, written on a win and read for replay.
    pub champion: PathBuf,
    /// Seed shared by the world RNG and the optimizer.
    pub seed: Option<u64>,
    /// Genomes per generation.
    pub population: usize,
    /// Give up after this many generations (0 means unlimited).
    pub max_generations: u32,
}

/// How an evolve run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolveOutcome {
    /// The win threshold was reached and the champion was written to disk.
    ChampionPersisted { generation: u32, score: u32 },
    /// The generation cap passed without a win.
    CapReached { best_score: u32 },
    /// The user quit mid-run.
    Aborted { best_score: u32 },
}

/// Evolve generations until the win threshold, the generation cap, or a
/// user quit. Persists the champion genome only on a win.
pub fn run_evolve(
    options: &RunOptions,
    sim_config: &SimConfig,
    sink: &mut dyn FrameSink,
) -> Result<EvolveOutcome> {
    let neat_config = NeatConfig {
        population_size: options.population,
        rng_seed: options.seed,
        ..NeatConfig::default()
    };
    let mut population = Population::new(neat_config)?;

    let mut generation = 0u32;
    let mut best_score = 0u32;
    loop {
        generation += 1;
        if options.max_generations != 0 && generation > options.max_generations {
            info!(best_score, "generation cap reached without a win");
            return Ok(EvolveOutcome::CapReached { best_score });
        }

        population.reset_fitness();
        let mut generation_config = sim_config.clone();
        // Distinct pipe sequences per generation while staying reproducible.
        if let Some(seed) = generation_config.rng_seed {
            generation_config.rng_seed = Some(seed.wrapping_add(u64::from(generation)));
        }
        let mut sim = Simulation::new(generation_config, RunMode::Evolve, generation, best_score)?;
        for (slot, genome) in population.genomes().iter().enumerate() {
            let brain = NeatBrain::from_genome(genome)
                .with_context(|| format!("genome {slot} failed to compile"))?;
            sim.spawn_agent(Box::new(brain), Some(slot));
        }

        let outcome = sim.run(sink)?;
        best_score = sim.best_score();
        match outcome {
            GenerationOutcome::Aborted => {
                info!(generation, best_score, "run aborted by user");
                return Ok(EvolveOutcome::Aborted { best_score });
            }
            GenerationOutcome::ThresholdReached => {
                let slot = sim
                    .lead_slot()
                    .context("threshold reached with no surviving agent")?;
                let artifact = ChampionArtifact {
                    genome: population.genomes()[slot].clone(),
                    generation,
                    score: sim.score(),
                };
                artifact.save(&options.champion)?;
                info!(
                    generation,
                    score = sim.score(),
                    path = %options.champion.display(),
                    "win threshold reached, champion persisted"
                );
                return Ok(EvolveOutcome::ChampionPersisted {
                    generation,
                    score: sim.score(),
                });
            }
            GenerationOutcome::Exhausted => {
                population.apply_ledger(sim.ledger().deltas());
                info!(
                    generation,
                    score = sim.score(),
                    best_score,
                    champion_fitness = population.champion().fitness,
                    "generation exhausted"
                );
                population.evolve();
            }
        }
    }
}

/// Replay the persisted champion as a single bird. Never writes anything:
/// the artifact on disk is read once and the fitness ledger stays untouched.
pub fn run_replay(
    options: &RunOptions,
    sim_config: &SimConfig,
    sink: &mut dyn FrameSink,
) -> Result<u32> {
    let brain = load_champion(&options.champion)?;

    let mut sim = Simulation::new(sim_config.clone(), RunMode::Replay, 1, 0)?;
    sim.spawn_agent(Box::new(brain), None);

    let outcome = sim.run(sink)?;
    match outcome {
        GenerationOutcome::Aborted => info!(score = sim.score(), "replay aborted by user"),
        GenerationOutcome::Exhausted => info!(score = sim.score(), "replay finished"),
        GenerationOutcome::ThresholdReached => unreachable!("replay ignores the win threshold"),
    }
    Ok(sim.score())
}

/// Load and compile the champion genome at `path`.
pub fn load_champion(path: &Path) -> Result<NeatBrain> {
    let artifact = ChampionArtifact::load(path)
        .with_context(|| format!("failed to load champion from {}", path.display()))?;
    info!(
        generation = artifact.generation,
        score = artifact.score,
        "champion loaded"
    );
    artifact.brain().context("champion genome failed to compile")
}
