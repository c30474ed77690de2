//! Champion persistence.
//!
//! The winning genome is stored as JSON next to run metadata, so a replay
//! session can rebuild the exact network that cleared the threshold.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::NeatError;
use crate::genome::Genome;
use crate::network::NeatBrain;

/// A persisted champion: the genome plus the context it won in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChampionArtifact {
    /// The winning genome.
    pub genome: Genome,
    /// Generation in which the threshold was cleared.
    pub generation: u32,
    /// Score at the moment of persistence.
    pub score: u32,
}

impl ChampionArtifact {
    /// Write the artifact as pretty-printed JSON, replacing any previous file.
    pub fn save(&self, path: &Path) -> Result<(), NeatError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(self)?;
        fs::write(path, encoded)?;
        info!(
            path = %path.display(),
            generation = self.generation,
            score = self.score,
            "champion persisted"
        );
        Ok(())
    }

    /// Load a previously persisted artifact.
    pub fn load(path: &Path) -> Result<Self, NeatError> {
        let encoded = fs::read(path)?;
        let artifact: Self = serde_json::from_slice(&encoded)?;
        Ok(artifact)
    }

    /// Compile the stored genome into a runnable brain.
    pub fn brain(&self) -> Result<NeatBrain, NeatError> {
        NeatBrain::from_genome(&self.genome)
    }
}
