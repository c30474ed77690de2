//! End-to-end driver checks: a win persists exactly one champion artifact,
//! and replay leaves the filesystem untouched.

use std::fs;

use rand::SeedableRng;
use rand::rngs::SmallRng;

use flapnet_app::{run_evolve, run_replay, EvolveOutcome, RunOptions};
use flapnet_core::{NullSink, SimConfig};
use flapnet_neat::{ChampionArtifact, Genome, NeatConfig};

/// A wide-open course: the gap spans most of the world, so every bird of the
/// first generation survives to the pass tick and the run wins immediately.
fn trivial_course() -> SimConfig {
    SimConfig {
        first_pipe_x: 250.0,
        gap_min: 100.0,
        gap_max: 100.0,
        pipe_gap: 550.0,
        win_threshold: 1,
        paced: false,
        rng_seed: Some(11),
        ..SimConfig::default()
    }
}

#[test]
fn threshold_win_persists_a_champion_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let champion = dir.path().join("champion.json");
    let options = RunOptions {
        champion: champion.clone(),
        seed: Some(11),
        population: 10,
        max_generations: 3,
    };

    let outcome =
        run_evolve(&options, &trivial_course(), &mut NullSink).expect("evolve run");
    assert_eq!(
        outcome,
        EvolveOutcome::ChampionPersisted {
            generation: 1,
            score: 1
        }
    );

    let artifact = ChampionArtifact::load(&champion).expect("persisted artifact loads");
    assert_eq!(artifact.generation, 1);
    assert_eq!(artifact.score, 1);
    assert!(artifact.brain().is_ok(), "persisted genome compiles");
}

#[test]
fn replay_reads_the_artifact_and_writes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let champion = dir.path().join("champion.json");

    // A brain that never fires: all weights and biases zero keeps the
    // output at tanh(0), below the jump threshold, so the bird glides to
    // the floor and the run exhausts on its own.
    let mut rng = SmallRng::seed_from_u64(5);
    let mut genome = Genome::minimal(&NeatConfig::default(), &mut rng);
    for node in &mut genome.nodes {
        node.bias = 0.0;
    }
    for connection in &mut genome.connections {
        connection.weight = 0.0;
    }
    let artifact = ChampionArtifact {
        genome,
        generation: 4,
        score: 50,
    };
    artifact.save(&champion).expect("artifact saved");
    let before = fs::read(&champion).expect("artifact bytes");

    let config = SimConfig {
        paced: false,
        rng_seed: Some(3),
        ..SimConfig::default()
    };
    let options = RunOptions {
        champion: champion.clone(),
        seed: Some(3),
        population: 10,
        max_generations: 1,
    };
    let score = run_replay(&options, &config, &mut NullSink).expect("replay run");
    assert_eq!(score, 0, "a glider never passes a pipe");

    let after = fs::read(&champion).expect("artifact bytes");
    assert_eq!(before, after, "replay must not rewrite the artifact");
    let entries = fs::read_dir(dir.path()).expect("dir listing").count();
    assert_eq!(entries, 1, "replay must not create files");
}
