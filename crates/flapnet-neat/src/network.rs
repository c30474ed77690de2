//! Feed-forward network compiled from a genome.

use flapnet_core::{BrainRunner, INPUT_SIZE, OUTPUT_SIZE};

use crate::NeatError;
use crate::genome::{Genome, NodeKind};

/// One evaluation step: a non-input node plus its incoming weighted edges.
#[derive(Debug, Clone)]
struct EvalStep {
    /// Index of this node's slot in the value buffer.
    slot: usize,
    bias: f32,
    /// `(value slot, weight)` pairs of enabled incoming edges.
    incoming: Vec<(usize, f32)>,
}

/// A genome compiled into a dense evaluation plan.
///
/// Compilation assigns each node a slot in a flat value buffer and orders the
/// non-input nodes topologically, so activation is a single pass with no
/// per-tick allocation.
#[derive(Debug, Clone)]
pub struct FeedForwardNetwork {
    values: Vec<f32>,
    steps: Vec<EvalStep>,
    output_slots: [usize; OUTPUT_SIZE],
}

impl FeedForwardNetwork {
    /// Compile a genome. Fails on dangling edges or a cyclic topology.
    pub fn compile(genome: &Genome) -> Result<Self, NeatError> {
        let ids: Vec<u32> = genome.nodes.iter().map(|node| node.id).collect();
        let slot_of = |id: u32| ids.iter().position(|&candidate| candidate == id);

        for gene in genome.connections.iter().filter(|gene| gene.enabled) {
            if slot_of(gene.from).is_none() || slot_of(gene.to).is_none() {
                return Err(NeatError::InvalidGenome(
                    "connection references a missing node",
                ));
            }
        }

        // Kahn's ordering over enabled edges only.
        let mut in_degree = vec![0usize; genome.nodes.len()];
        for gene in genome.connections.iter().filter(|gene| gene.enabled) {
            if let Some(slot) = slot_of(gene.to) {
                in_degree[slot] += 1;
            }
        }
        let mut ready: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(slot, _)| slot)
            .collect();
        let mut order = Vec::with_capacity(genome.nodes.len());
        while let Some(slot) = ready.pop() {
            order.push(slot);
            for gene in genome.connections.iter().filter(|gene| gene.enabled) {
                if slot_of(gene.from) == Some(slot)
                    && let Some(target) = slot_of(gene.to)
                {
                    in_degree[target] -= 1;
                    if in_degree[target] == 0 {
                        ready.push(target);
                    }
                }
            }
        }
        if order.len() != genome.nodes.len() {
            return Err(NeatError::InvalidGenome("network topology is cyclic"));
        }

        let mut steps = Vec::new();
        for &slot in &order {
            let node = &genome.nodes[slot];
            if node.kind == NodeKind::Input {
                continue;
            }
            let incoming = genome
                .connections
                .iter()
                .filter(|gene| gene.enabled && gene.to == node.id)
                .filter_map(|gene| slot_of(gene.from).map(|source| (source, gene.weight)))
                .collect();
            steps.push(EvalStep {
                slot,
                bias: node.bias,
                incoming,
            });
        }

        let mut output_slots = [0usize; OUTPUT_SIZE];
        let mut outputs_found = 0usize;
        for (slot, node) in genome.nodes.iter().enumerate() {
            if node.kind == NodeKind::Output {
                if outputs_found == OUTPUT_SIZE {
                    return Err(NeatError::InvalidGenome("too many output nodes"));
                }
                output_slots[outputs_found] = slot;
                outputs_found += 1;
            }
        }
        if outputs_found != OUTPUT_SIZE {
            return Err(NeatError::InvalidGenome("missing output node"));
        }
        let input_count = genome
            .nodes
            .iter()
            .take_while(|node| node.kind == NodeKind::Input)
            .count();
        if input_count != INPUT_SIZE {
            return Err(NeatError::InvalidGenome(
                "input nodes must lead the genome",
            ));
        }

        Ok(Self {
            values: vec![0.0; genome.nodes.len()],
            steps,
            output_slots,
        })
    }

    /// Evaluate one sensor vector.
    pub fn activate(&mut self, inputs: &[f32; INPUT_SIZE]) -> [f32; OUTPUT_SIZE] {
        self.values[..INPUT_SIZE].copy_from_slice(inputs);
        for step in &self.steps {
            let mut sum = step.bias;
            for (source, weight) in &step.incoming {
                sum += self.values[*source] * weight;
            }
            self.values[step.slot] = sum.tanh();
        }
        let mut outputs = [0.0; OUTPUT_SIZE];
        for (output, slot) in outputs.iter_mut().zip(self.output_slots) {
            *output = self.values[slot];
        }
        outputs
    }
}

/// [`BrainRunner`] adapter wrapping a compiled network.
#[derive(Debug, Clone)]
pub struct NeatBrain {
    network: FeedForwardNetwork,
}

impl NeatBrain {
    /// Compile `genome` into a runnable brain.
    pub fn from_genome(genome: &Genome) -> Result<Self, NeatError> {
        Ok(Self {
            network: FeedForwardNetwork::compile(genome)?,
        })
    }
}

impl BrainRunner for NeatBrain {
    fn kind(&self) -> &'static str {
        "neat"
    }

    fn tick(&mut self, inputs: &[f32; INPUT_SIZE]) -> [f32; OUTPUT_SIZE] {
        self.network.activate(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::{ConnectionGene, NodeGene, connection_innovation};

    fn node(id: u32, kind: NodeKind, bias: f32) -> NodeGene {
        NodeGene { id, kind, bias }
    }

    fn edge(from: u32, to: u32, weight: f32, enabled: bool) -> ConnectionGene {
        ConnectionGene {
            innovation: connection_innovation(from, to),
            from,
            to,
            weight,
            enabled,
        }
    }

    fn hand_built(hidden_weight_out: f32) -> Genome {
        // 0,1,2 -> hidden 4 -> output 3, plus a direct 2 -> 3 edge.
        Genome {
            nodes: vec![
                node(0, NodeKind::Input, 0.0),
                node(1, NodeKind::Input, 0.0),
                node(2, NodeKind::Input, 0.0),
                node(3, NodeKind::Output, 0.5),
                node(4, NodeKind::Hidden, 0.0),
            ],
            connections: vec![
                edge(0, 4, 1.0, true),
                edge(1, 4, -1.0, true),
                edge(4, 3, hidden_weight_out, true),
                edge(2, 3, 0.25, true),
            ],
            fitness: 0.0,
        }
    }

    #[test]
    fn activation_matches_hand_computed_tanh() {
        let mut network = FeedForwardNetwork::compile(&hand_built(2.0)).expect("compile");
        let inputs = [0.5, 0.25, -1.0];
        let [output] = network.activate(&inputs);

        let hidden = (0.5 - 0.25f32).tanh();
        let expected = (0.5 + 2.0 * hidden + 0.25 * -1.0).tanh();
        assert!((output - expected).abs() < 1e-6, "{output} != {expected}");
    }

    #[test]
    fn disabled_edges_are_not_evaluated() {
        let mut genome = hand_built(2.0);
        for gene in &mut genome.connections {
            if gene.from == 4 {
                gene.enabled = false;
            }
        }
        let mut network = FeedForwardNetwork::compile(&genome).expect("compile");
        let [output] = network.activate(&[0.5, 0.25, -1.0]);
        let expected = (0.5 + 0.25 * -1.0f32).tanh();
        assert!((output - expected).abs() < 1e-6);
    }

    #[test]
    fn repeated_activation_is_stateless() {
        let mut network = FeedForwardNetwork::compile(&hand_built(-1.5)).expect("compile");
        let first = network.activate(&[1.0, 2.0, 3.0]);
        network.activate(&[-5.0, 0.0, 9.0]);
        let third = network.activate(&[1.0, 2.0, 3.0]);
        assert_eq!(first, third);
    }

    #[test]
    fn cyclic_topology_is_rejected() {
        let mut genome = hand_built(1.0);
        genome.connections.push(edge(3, 4, 1.0, true));
        assert!(matches!(
            FeedForwardNetwork::compile(&genome),
            Err(NeatError::InvalidGenome(_))
        ));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut genome = hand_built(1.0);
        genome.connections.push(edge(0, 99, 1.0, true));
        assert!(matches!(
            FeedForwardNetwork::compile(&genome),
            Err(NeatError::InvalidGenome(_))
        ));
    }
}
