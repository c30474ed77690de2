//! Genome representation and mutation operators.

use flapnet_core::{INPUT_SIZE, OUTPUT_SIZE};
use rand::{Rng, rngs::SmallRng};
use serde::{Deserialize, Serialize};

use crate::population::NeatConfig;

/// Attempts made to find a valid endpoint pair for an add-connection mutation.
const ADD_CONNECTION_ATTEMPTS: usize = 20;

/// Role of a node inside the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Sensor node fed from the simulation.
    Input,
    /// Node introduced by an add-node mutation.
    Hidden,
    /// Control node read by the simulation.
    Output,
}

/// One node of the network graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGene {
    /// Stable node identifier.
    pub id: u32,
    /// Node role.
    pub kind: NodeKind,
    /// Additive bias applied before activation.
    pub bias: f32,
}

/// One weighted edge of the network graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionGene {
    /// Hash-based structural identity of the `(from, to)` pair.
    pub innovation: u64,
    /// Source node id.
    pub from: u32,
    /// Target node id.
    pub to: u32,
    /// Edge weight.
    pub weight: f32,
    /// Disabled edges are kept for crossover but never evaluated.
    pub enabled: bool,
}

/// Innovation number of a connection, derived from its endpoints.
///
/// Splitmix64 finalizer over the packed pair, so any two genomes assign the
/// same identity to the same structural link.
#[must_use]
pub fn connection_innovation(from: u32, to: u32) -> u64 {
    let mut x = (u64::from(from) << 32) | u64::from(to);
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

/// Whether `target` is reachable from `start` over the stored edges.
fn reaches(connections: &[ConnectionGene], start: u32, target: u32) -> bool {
    let mut stack = vec![start];
    let mut visited = Vec::new();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if visited.contains(&node) {
            continue;
        }
        visited.push(node);
        for gene in connections {
            if gene.from == node {
                stack.push(gene.to);
            }
        }
    }
    false
}

/// Node id minted when the connection with `innovation` is split.
#[must_use]
pub fn split_node_id(innovation: u64) -> u32 {
    // Hidden ids live above the reserved input/output range.
    let base = (INPUT_SIZE + OUTPUT_SIZE) as u32;
    base + (innovation % u64::from(u32::MAX - base)) as u32
}

/// A network blueprint plus the fitness it earned this generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genome {
    /// Node genes, inputs and outputs first.
    pub nodes: Vec<NodeGene>,
    /// Connection genes, sorted by innovation number.
    pub connections: Vec<ConnectionGene>,
    /// Accumulated fitness for the current generation.
    pub fitness: f32,
}

impl Genome {
    /// Minimal seed genome: every input wired straight to every output.
    #[must_use]
    pub fn minimal(config: &NeatConfig, rng: &mut SmallRng) -> Self {
        let mut nodes = Vec::with_capacity(INPUT_SIZE + OUTPUT_SIZE);
        for id in 0..INPUT_SIZE as u32 {
            nodes.push(NodeGene {
                id,
                kind: NodeKind::Input,
                bias: 0.0,
            });
        }
        for id in INPUT_SIZE as u32..(INPUT_SIZE + OUTPUT_SIZE) as u32 {
            nodes.push(NodeGene {
                id,
                kind: NodeKind::Output,
                bias: rng.random_range(-1.0..1.0),
            });
        }
        let mut connections = Vec::with_capacity(INPUT_SIZE * OUTPUT_SIZE);
        for from in 0..INPUT_SIZE as u32 {
            for to in INPUT_SIZE as u32..(INPUT_SIZE + OUTPUT_SIZE) as u32 {
                connections.push(ConnectionGene {
                    innovation: connection_innovation(from, to),
                    from,
                    to,
                    weight: rng.random_range(-config.weight_init_range..config.weight_init_range),
                    enabled: true,
                });
            }
        }
        connections.sort_by_key(|gene| gene.innovation);
        Self {
            nodes,
            connections,
            fitness: 0.0,
        }
    }

    /// Look up a node gene by id.
    #[must_use]
    pub fn node(&self, id: u32) -> Option<&NodeGene> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Whether a direct edge between the endpoints already exists.
    #[must_use]
    pub fn has_connection(&self, from: u32, to: u32) -> bool {
        self.connections
            .iter()
            .any(|gene| gene.from == from && gene.to == to)
    }

    /// Whether adding `from -> to` would close a directed cycle.
    ///
    /// Follows every stored edge, enabled or not, since crossover may
    /// re-enable a disabled gene inherited from the other parent.
    #[must_use]
    pub fn would_create_cycle(&self, from: u32, to: u32) -> bool {
        from == to || reaches(&self.connections, to, from)
    }

    /// Apply weight, bias, and structural mutations per the configured rates.
    pub fn mutate(&mut self, config: &NeatConfig, rng: &mut SmallRng) {
        for gene in &mut self.connections {
            if rng.random::<f32>() < config.weight_mutate_rate {
                if rng.random::<f32>() < config.weight_replace_rate {
                    gene.weight =
                        rng.random_range(-config.weight_init_range..config.weight_init_range);
                } else {
                    gene.weight += rng.random_range(-1.0..1.0) * config.weight_perturb_power;
                }
            }
        }
        for node in &mut self.nodes {
            if node.kind != NodeKind::Input && rng.random::<f32>() < config.bias_mutate_rate {
                node.bias += rng.random_range(-1.0..1.0) * config.bias_perturb_power;
            }
        }
        if rng.random::<f32>() < config.add_connection_rate {
            self.mutate_add_connection(config, rng);
        }
        if rng.random::<f32>() < config.add_node_rate {
            self.mutate_add_node(rng);
        }
    }

    fn mutate_add_connection(&mut self, config: &NeatConfig, rng: &mut SmallRng) {
        for _ in 0..ADD_CONNECTION_ATTEMPTS {
            let from = self.nodes[rng.random_range(0..self.nodes.len())].id;
            let to = self.nodes[rng.random_range(0..self.nodes.len())].id;
            let from_kind = self.node(from).map(|node| node.kind);
            let to_kind = self.node(to).map(|node| node.kind);
            if from_kind == Some(NodeKind::Output) || to_kind == Some(NodeKind::Input) {
                continue;
            }
            if self.has_connection(from, to) || self.would_create_cycle(from, to) {
                continue;
            }
            self.connections.push(ConnectionGene {
                innovation: connection_innovation(from, to),
                from,
                to,
                weight: rng.random_range(-config.weight_init_range..config.weight_init_range),
                enabled: true,
            });
            self.connections.sort_by_key(|gene| gene.innovation);
            return;
        }
    }

    fn mutate_add_node(&mut self, rng: &mut SmallRng) {
        let enabled: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter(|(_, gene)| gene.enabled)
            .map(|(index, _)| index)
            .collect();
        if enabled.is_empty() {
            return;
        }
        let index = enabled[rng.random_range(0..enabled.len())];
        let new_id = split_node_id(self.connections[index].innovation);
        // The same split in this genome has happened before; skip rather
        // than duplicate the node.
        if self.node(new_id).is_some() {
            return;
        }
        let (from, to, weight) = {
            let gene = &mut self.connections[index];
            gene.enabled = false;
            (gene.from, gene.to, gene.weight)
        };
        self.nodes.push(NodeGene {
            id: new_id,
            kind: NodeKind::Hidden,
            bias: 0.0,
        });
        // Weight 1.0 into the new node and the old weight out of it, which
        // preserves the behavior of the split edge at the moment of the split.
        self.connections.push(ConnectionGene {
            innovation: connection_innovation(from, new_id),
            from,
            to: new_id,
            weight: 1.0,
            enabled: true,
        });
        self.connections.push(ConnectionGene {
            innovation: connection_innovation(new_id, to),
            from: new_id,
            to,
            weight,
            enabled: true,
        });
        self.connections.sort_by_key(|gene| gene.innovation);
    }

    /// Innovation-aligned crossover. `self` must be the fitter parent;
    /// disjoint and excess genes are inherited from it, matching genes pick a
    /// parent at random.
    #[must_use]
    pub fn crossover(&self, other: &Genome, rng: &mut SmallRng) -> Genome {
        let mut connections = Vec::with_capacity(self.connections.len());
        let mut left = self.connections.iter().peekable();
        let mut right = other.connections.iter().peekable();
        loop {
            match (left.peek(), right.peek()) {
                (Some(a), Some(b)) if a.innovation == b.innovation => {
                    let pick = if rng.random::<bool>() { *a } else { *b };
                    let mut gene = pick.clone();
                    // A gene disabled in either parent stays disabled only
                    // most of the time.
                    if (!a.enabled || !b.enabled) && rng.random::<f32>() < 0.75 {
                        gene.enabled = false;
                    } else {
                        gene.enabled = true;
                    }
                    connections.push(gene);
                    left.next();
                    right.next();
                }
                (Some(a), Some(b)) if a.innovation < b.innovation => {
                    connections.push((*a).clone());
                    left.next();
                }
                (Some(_), Some(_)) => {
                    right.next();
                }
                (Some(a), None) => {
                    connections.push((*a).clone());
                    left.next();
                }
                (None, _) => break,
            }
        }

        let mut nodes = self.nodes.clone();
        // Matching genes can come from the other parent and reference hidden
        // nodes the fitter parent lacks.
        for gene in &connections {
            for id in [gene.from, gene.to] {
                if !nodes.iter().any(|node| node.id == id)
                    && let Some(node) = other.node(id)
                {
                    nodes.push(node.clone());
                }
            }
        }

        let mut child = Genome {
            nodes,
            connections,
            fitness: 0.0,
        };
        // Inheriting a re-enabled gene from the weaker parent can close a
        // loop the fitter parent avoided; drop such genes outright.
        child.break_cycles();
        child
    }

    fn break_cycles(&mut self) {
        loop {
            let Some(index) = self.first_cycle_edge() else {
                return;
            };
            self.connections.remove(index);
        }
    }

    fn first_cycle_edge(&self) -> Option<usize> {
        for (index, gene) in self.connections.iter().enumerate() {
            let mut without = self.connections.clone();
            without.remove(index);
            if gene.from == gene.to || reaches(&without, gene.to, gene.from) {
                return Some(index);
            }
        }
        None
    }

    /// Compatibility distance used for speciation.
    #[must_use]
    pub fn compatibility(&self, other: &Genome, config: &NeatConfig) -> f32 {
        let mut mismatched = 0usize;
        let mut matching = 0usize;
        let mut weight_diff = 0.0f32;
        let mut left = self.connections.iter().peekable();
        let mut right = other.connections.iter().peekable();
        loop {
            match (left.peek(), right.peek()) {
                (Some(a), Some(b)) if a.innovation == b.innovation => {
                    matching += 1;
                    weight_diff += (a.weight - b.weight).abs();
                    left.next();
                    right.next();
                }
                (Some(a), Some(b)) if a.innovation < b.innovation => {
                    mismatched += 1;
                    left.next();
                }
                (Some(_), Some(_)) => {
                    mismatched += 1;
                    right.next();
                }
                (Some(_), None) => {
                    mismatched += 1;
                    left.next();
                }
                (None, Some(_)) => {
                    mismatched += 1;
                    right.next();
                }
                (None, None) => break,
            }
        }
        let n = self.connections.len().max(other.connections.len()).max(1) as f32;
        let average_diff = if matching > 0 {
            weight_diff / matching as f32
        } else {
            0.0
        };
        config.excess_coefficient * mismatched as f32 / n
            + config.weight_coefficient * average_diff
    }
}
