//! NEAT optimizer for FlapNet bird brains.
//!
//! Genomes describe feed-forward network topologies that grow by structural
//! mutation. Structural identity is hash-based: the innovation number of a
//! connection is a deterministic function of its endpoints, so independent
//! genomes that discover the same link agree on its identity without a shared
//! counter. The [`Population`] speciates by compatibility distance, shares
//! fitness inside each species, and breeds the next generation by
//! innovation-aligned crossover.

pub mod artifact;
pub mod genome;
pub mod network;
pub mod population;

pub use artifact::ChampionArtifact;
pub use genome::{ConnectionGene, Genome, NodeGene, NodeKind};
pub use network::{FeedForwardNetwork, NeatBrain};
pub use population::{NeatConfig, Population};

use thiserror::Error;

/// Errors surfaced by the optimizer.
#[derive(Debug, Error)]
pub enum NeatError {
    /// Indicates an invalid optimizer configuration value.
    #[error("invalid optimizer configuration: {0}")]
    InvalidConfig(&'static str),
    /// A genome could not be compiled into a network.
    #[error("invalid genome: {0}")]
    InvalidGenome(&'static str),
    /// Filesystem failure while reading or writing an artifact.
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
    /// Artifact encoding or decoding failure.
    #[error("artifact encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
