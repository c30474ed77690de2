//! Speciated population and the generational reproduction cycle.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::NeatError;
use crate::genome::Genome;

/// Tunables of the optimizer.
///
/// Defaults are conservative rates that evolve a pipe-threading bird in a few
/// dozen generations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeatConfig {
    /// Genomes per generation.
    pub population_size: usize,
    /// Half-width of the uniform range for fresh connection weights.
    pub weight_init_range: f32,
    /// Probability a connection weight is mutated at all.
    pub weight_mutate_rate: f32,
    /// Probability a mutated weight is replaced instead of perturbed.
    pub weight_replace_rate: f32,
    /// Magnitude of a weight perturbation.
    pub weight_perturb_power: f32,
    /// Probability a node bias is perturbed.
    pub bias_mutate_rate: f32,
    /// Magnitude of a bias perturbation.
    pub bias_perturb_power: f32,
    /// Probability an add-connection mutation is attempted.
    pub add_connection_rate: f32,
    /// Probability an add-node mutation is attempted.
    pub add_node_rate: f32,
    /// Compatibility distance beyond which genomes split species.
    pub compatibility_threshold: f32,
    /// Weight of disjoint and excess genes in compatibility distance.
    pub excess_coefficient: f32,
    /// Weight of matching-gene weight differences in compatibility distance.
    pub weight_coefficient: f32,
    /// Fraction of each species allowed to reproduce.
    pub survival_fraction: f32,
    /// Generations a species may go without improvement before removal.
    pub stagnation_limit: u32,
    /// Top genomes copied unchanged into the next generation.
    pub elitism: usize,
    /// Optional RNG seed for reproducible evolution.
    pub rng_seed: Option<u64>,
}

impl Default for NeatConfig {
    fn default() -> Self {
        Self {
            population_size: 100,
            weight_init_range: 1.0,
            weight_mutate_rate: 0.8,
            weight_replace_rate: 0.1,
            weight_perturb_power: 0.5,
            bias_mutate_rate: 0.7,
            bias_perturb_power: 0.5,
            add_connection_rate: 0.5,
            add_node_rate: 0.2,
            compatibility_threshold: 3.0,
            excess_coefficient: 1.0,
            weight_coefficient: 0.5,
            survival_fraction: 0.2,
            stagnation_limit: 15,
            elitism: 2,
            rng_seed: None,
        }
    }
}

impl NeatConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), NeatError> {
        if self.population_size < 2 {
            return Err(NeatError::InvalidConfig(
                "population needs at least two genomes",
            ));
        }
        if self.elitism >= self.population_size {
            return Err(NeatError::InvalidConfig(
                "elitism must leave room for offspring",
            ));
        }
        if !(0.0..=1.0).contains(&self.survival_fraction) || self.survival_fraction == 0.0 {
            return Err(NeatError::InvalidConfig(
                "survival fraction must sit in (0, 1]",
            ));
        }
        if self.compatibility_threshold <= 0.0 {
            return Err(NeatError::InvalidConfig(
                "compatibility threshold must be positive",
            ));
        }
        if self.weight_init_range <= 0.0 {
            return Err(NeatError::InvalidConfig(
                "weight init range must be positive",
            ));
        }
        if self.stagnation_limit == 0 {
            return Err(NeatError::InvalidConfig(
                "stagnation limit must be non-zero",
            ));
        }
        let rates = [
            self.weight_mutate_rate,
            self.weight_replace_rate,
            self.bias_mutate_rate,
            self.add_connection_rate,
            self.add_node_rate,
        ];
        if rates.iter().any(|rate| !(0.0..=1.0).contains(rate)) {
            return Err(NeatError::InvalidConfig(
                "mutation rates must sit in [0, 1]",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Species {
    representative: Genome,
    /// Member indices into the population's genome vector.
    members: Vec<usize>,
    best_fitness: f32,
    stagnation: u32,
}

/// The full genome pool plus its species bookkeeping.
pub struct Population {
    config: NeatConfig,
    rng: SmallRng,
    genomes: Vec<Genome>,
    species: Vec<Species>,
}

impl Population {
    /// Seed a population of minimal genomes, each mutated once for initial
    /// diversity.
    pub fn new(config: NeatConfig) -> Result<Self, NeatError> {
        config.validate()?;
        let mut rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        };
        let mut genomes = Vec::with_capacity(config.population_size);
        for _ in 0..config.population_size {
            let mut genome = Genome::minimal(&config, &mut rng);
            genome.mutate(&config, &mut rng);
            genomes.push(genome);
        }
        Ok(Self {
            config,
            rng,
            genomes,
            species: Vec::new(),
        })
    }

    /// Number of genomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.genomes.len()
    }

    /// Whether the pool is empty. Never true for a constructed population.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.genomes.is_empty()
    }

    /// Immutable access to the genome pool, indexed by slot.
    #[must_use]
    pub fn genomes(&self) -> &[Genome] {
        &self.genomes
    }

    /// Optimizer configuration.
    #[must_use]
    pub fn config(&self) -> &NeatConfig {
        &self.config
    }

    /// Zero every genome's fitness before a fresh evaluation.
    pub fn reset_fitness(&mut self) {
        for genome in &mut self.genomes {
            genome.fitness = 0.0;
        }
    }

    /// Fold a generation's fitness deltas back into the pool. Slots beyond
    /// the ledger keep their current fitness.
    pub fn apply_ledger(&mut self, deltas: &[f32]) {
        for (genome, delta) in self.genomes.iter_mut().zip(deltas) {
            genome.fitness += delta;
        }
    }

    /// Slot of the fittest genome; ties resolve to the earliest slot.
    #[must_use]
    pub fn champion_slot(&self) -> usize {
        self.genomes
            .iter()
            .enumerate()
            .max_by_key(|(index, genome)| (OrderedFloat(genome.fitness), std::cmp::Reverse(*index)))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    /// The fittest genome.
    #[must_use]
    pub fn champion(&self) -> &Genome {
        &self.genomes[self.champion_slot()]
    }

    /// Breed the next generation: speciate, retire stagnant species, share
    /// fitness, then fill the pool with elites and mutated offspring.
    pub fn evolve(&mut self) {
        self.speciate();
        self.retire_stagnant();

        let shares = self.species_shares();
        let mut next = Vec::with_capacity(self.config.population_size);

        // Global elites survive unchanged regardless of species allocation.
        let mut by_fitness: Vec<usize> = (0..self.genomes.len()).collect();
        by_fitness
            .sort_by_key(|&index| std::cmp::Reverse(OrderedFloat(self.genomes[index].fitness)));
        for &index in by_fitness.iter().take(self.config.elitism) {
            next.push(self.genomes[index].clone());
        }

        for (species_index, offspring) in shares {
            let parents = self.breeding_pool(species_index);
            if parents.is_empty() {
                continue;
            }
            for _ in 0..offspring {
                if next.len() >= self.config.population_size {
                    break;
                }
                let mother = parents[self.rng.random_range(0..parents.len())];
                let father = parents[self.rng.random_range(0..parents.len())];
                let (fitter, other) =
                    if self.genomes[mother].fitness >= self.genomes[father].fitness {
                        (mother, father)
                    } else {
                        (father, mother)
                    };
                let mut child =
                    self.genomes[fitter].crossover(&self.genomes[other], &mut self.rng);
                child.mutate(&self.config, &mut self.rng);
                next.push(child);
            }
        }

        // Rounding in the share allocation can leave the pool short; top up
        // with mutated copies of the champion.
        while next.len() < self.config.population_size {
            let mut filler = self.champion().clone();
            filler.mutate(&self.config, &mut self.rng);
            filler.fitness = 0.0;
            next.push(filler);
        }

        for genome in &mut next {
            genome.fitness = 0.0;
        }
        self.genomes = next;
        for species in &mut self.species {
            species.members.clear();
        }
        info!(
            species = self.species.len(),
            population = self.genomes.len(),
            "generation bred"
        );
    }

    /// Assign every genome to the first species whose representative sits
    /// within the compatibility threshold, minting new species as needed.
    fn speciate(&mut self) {
        for species in &mut self.species {
            species.members.clear();
        }
        for (index, genome) in self.genomes.iter().enumerate() {
            let assigned = self.species.iter().position(|species| {
                genome.compatibility(&species.representative, &self.config)
                    < self.config.compatibility_threshold
            });
            match assigned {
                Some(slot) => self.species[slot].members.push(index),
                None => self.species.push(Species {
                    representative: genome.clone(),
                    members: vec![index],
                    best_fitness: f32::NEG_INFINITY,
                    stagnation: 0,
                }),
            }
        }
        self.species.retain(|species| !species.members.is_empty());
        // Fresh representatives keep the clusters anchored to live genomes.
        for species in &mut self.species {
            let anchor = species.members[0];
            species.representative = self.genomes[anchor].clone();
        }
        debug!(species = self.species.len(), "population speciated");
    }

    fn retire_stagnant(&mut self) {
        for species in &mut self.species {
            let best = species
                .members
                .iter()
                .map(|&index| self.genomes[index].fitness)
                .fold(f32::NEG_INFINITY, f32::max);
            if best > species.best_fitness {
                species.best_fitness = best;
                species.stagnation = 0;
            } else {
                species.stagnation += 1;
            }
        }
        if self.species.len() > 1 {
            let limit = self.config.stagnation_limit;
            self.species.retain(|species| species.stagnation <= limit);
        }
    }

    /// Offspring allocation per surviving species, proportional to its
    /// fitness-shared sum. Fitness is shifted to non-negative first so a
    /// penalized generation still breeds.
    fn species_shares(&self) -> Vec<(usize, usize)> {
        let floor = self
            .genomes
            .iter()
            .map(|genome| genome.fitness)
            .fold(f32::INFINITY, f32::min)
            .min(0.0);
        let adjusted: Vec<f32> = self
            .species
            .iter()
            .map(|species| {
                species
                    .members
                    .iter()
                    .map(|&index| {
                        (self.genomes[index].fitness - floor) / species.members.len() as f32
                    })
                    .sum()
            })
            .collect();
        let total: f32 = adjusted.iter().sum();
        let budget = self
            .config
            .population_size
            .saturating_sub(self.config.elitism);

        if total <= f32::EPSILON {
            // Degenerate generation: split the budget evenly.
            let per_species = budget / self.species.len().max(1);
            return (0..self.species.len())
                .map(|index| (index, per_species.max(1)))
                .collect();
        }
        adjusted
            .iter()
            .enumerate()
            .map(|(index, share)| {
                let count = ((share / total) * budget as f32).round() as usize;
                (index, count.max(1))
            })
            .collect()
    }

    /// Top `survival_fraction` of a species by fitness, always at least one.
    fn breeding_pool(&self, species_index: usize) -> Vec<usize> {
        let species = &self.species[species_index];
        let mut members = species.members.clone();
        members.sort_by_key(|&index| std::cmp::Reverse(OrderedFloat(self.genomes[index].fitness)));
        let keep = ((members.len() as f32 * self.config.survival_fraction).ceil() as usize)
            .clamp(1, members.len());
        members.truncate(keep);
        members
    }
}
