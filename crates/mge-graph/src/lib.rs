//! Producer Graph Builder (spec §4.H): collapses the flat, dimension-resolved
//! DAG produced by `mge-expand` into one [`JobDescriptor`] per concrete
//! producer, deduplicating repeated producer-to-producer edges into a single
//! dependency entry the planner can layer.
#![deny(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use mge_core::{CanonicalId, IdKind, JobDescriptor, ProducerJobContext};
use mge_expand::ExpandedBlueprint;

/// One producer job plus the set of other jobs it directly depends on
/// (derived from its input bindings' producing jobs).
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub job: JobDescriptor,
    pub depends_on: BTreeSet<String>,
}

/// The full producer job graph: every concrete producer collapsed to one
/// job, keyed by `job_id` (the producer's canonical `Producer:` id string).
#[derive(Debug, Clone, Default)]
pub struct ProducerGraph {
    pub nodes: BTreeMap<String, GraphNode>,
}

impl ProducerGraph {
    /// Jobs with no unresolved dependencies — candidates for the first
    /// planner layer.
    #[must_use]
    pub fn roots(&self) -> Vec<&GraphNode> {
        self.nodes
            .values()
            .filter(|n| n.depends_on.is_empty())
            .collect()
    }
}

/// Build a [`ProducerGraph`] from an expanded blueprint.
///
/// For each concrete producer, its `inputs` are every `Input:` id reachable
/// by an edge whose `to` qualifies under that producer's namespace at its
/// own index tuple (spec §4.H step 1). `produces` is filtered down from the
/// producer's full declared output set to only the outputs some edge or
/// fan-in descriptor actually consumes, plus any output at root-level
/// namespace (no dot in the producer's `namespace_path`, i.e. a movie's
/// terminal/top-level producer) — a producer-declared artifact with no
/// consumer and no root-level visibility is elided from scheduling, though
/// it remains visible wherever the expanded tree itself is inspected. An
/// edge whose producing side is itself a producer's output introduces a
/// dependency on that producer's job id; an edge feeding a fan-in aggregate
/// depends on every member's producing job.
pub fn build(expanded: &ExpandedBlueprint) -> ProducerGraph {
    // Map each concrete Artifact id to the producer job id that produces it.
    let mut producer_by_output: BTreeMap<CanonicalId, String> = BTreeMap::new();
    for producer in &expanded.producers {
        for output in &producer.outputs {
            producer_by_output.insert(output.clone(), producer.id.to_string());
        }
    }

    // Every artifact id consumed by some edge or fan-in member, across the
    // whole blueprint — used below to elide unconsumed, non-root outputs
    // from each job's `produces` (spec §4.H).
    let mut consumed: BTreeSet<&CanonicalId> = BTreeSet::new();
    for edge in &expanded.edges {
        if edge.from.kind() == IdKind::Artifact {
            consumed.insert(&edge.from);
        }
    }
    for descriptor in expanded.fan_in.values() {
        for member in &descriptor.members {
            consumed.insert(&member.id);
        }
    }

    // Map each concrete producer's own (namespace, indices) to its edges'
    // targets that fall within its own field namespace.
    let mut nodes = BTreeMap::new();
    for producer in &expanded.producers {
        let field_prefix = format!("{}.", producer.namespace_path);
        let mut input_bindings: BTreeMap<String, CanonicalId> = BTreeMap::new();
        let mut depends_on = BTreeSet::new();
        let mut conditions = BTreeMap::new();

        for edge in &expanded.edges {
            if edge.to.kind() != IdKind::Input {
                continue;
            }
            let belongs_to_this_producer = edge.to.qname().starts_with(&field_prefix)
                && edge.to.dims() == producer.id.dims();
            if !belongs_to_this_producer {
                continue;
            }
            let field_name = edge.to.qname()[field_prefix.len()..].to_string();
            input_bindings.insert(field_name.clone(), edge.from.clone());
            if let Some(cond) = &edge.condition {
                conditions.insert(field_name, cond.clone());
            }
            if let Some(dep_job) = producer_by_output.get(&edge.from) {
                depends_on.insert(dep_job.clone());
            }
        }

        for (target, descriptor) in &expanded.fan_in {
            let belongs_to_this_producer = target.qname().starts_with(&field_prefix)
                && target.dims() == producer.id.dims();
            if !belongs_to_this_producer {
                continue;
            }
            let field_name = target.qname()[field_prefix.len()..].to_string();
            for member in &descriptor.members {
                if let Some(dep_job) = producer_by_output.get(&member.id) {
                    depends_on.insert(dep_job.clone());
                }
            }
            input_bindings.entry(field_name).or_insert_with(|| target.clone());
        }

        let fan_in: BTreeMap<String, mge_core::FanInDescriptor> = expanded
            .fan_in
            .iter()
            .filter(|(target, _)| {
                target.qname().starts_with(&field_prefix) && target.dims() == producer.id.dims()
            })
            .map(|(target, descriptor)| {
                (target.qname()[field_prefix.len()..].to_string(), descriptor.clone())
            })
            .collect();

        let context = ProducerJobContext {
            namespace_path: producer.namespace_path.clone(),
            indices: producer.indices.clone(),
            input_bindings: input_bindings.clone(),
            fan_in,
            conditions,
            provider_mapping: None,
            declared_outputs: producer.outputs.clone(),
            extras: BTreeMap::new(),
        };

        let is_root_level = !producer.namespace_path.contains('.');
        let produces: Vec<CanonicalId> = producer
            .outputs
            .iter()
            .filter(|output| is_root_level || consumed.contains(output))
            .cloned()
            .collect();

        let job = JobDescriptor {
            job_id: producer.id.to_string(),
            producer: producer.namespace_path.clone(),
            inputs: input_bindings.values().cloned().collect(),
            produces,
            context,
        };

        nodes.insert(producer.id.to_string(), GraphNode { job, depends_on });
    }

    ProducerGraph { nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mge_expand::{CanonicalEdge, ExpandedProducer};
    use mge_core::Dimension;

    fn id(kind: IdKind, qname: &str, dims: Vec<i64>) -> CanonicalId {
        CanonicalId::new(kind, qname, dims.into_iter().map(Dimension::Concrete).collect())
    }

    #[test]
    fn builds_dependency_between_two_producers() {
        let script = ExpandedProducer {
            id: id(IdKind::Producer, "Script", vec![]),
            namespace_path: "Script".to_string(),
            alias: "Script".to_string(),
            indices: vec![],
            outputs: vec![id(IdKind::Artifact, "Script.NarrationScript", vec![])],
            declared_input_fields: vec!["Prompt".to_string()],
        };
        let audio = ExpandedProducer {
            id: id(IdKind::Producer, "Audio", vec![]),
            namespace_path: "Audio".to_string(),
            alias: "Audio".to_string(),
            indices: vec![],
            outputs: vec![id(IdKind::Artifact, "Audio.GeneratedAudio", vec![])],
            declared_input_fields: vec!["Text".to_string()],
        };
        let edge = CanonicalEdge {
            from: id(IdKind::Artifact, "Script.NarrationScript", vec![]),
            to: id(IdKind::Input, "Audio.Text", vec![]),
            condition: None,
        };
        let expanded = ExpandedBlueprint {
            producers: vec![script, audio],
            edges: vec![edge],
            free_standing_inputs: vec![],
            fan_in: BTreeMap::new(),
        };

        let graph = build(&expanded);
        assert_eq!(graph.nodes.len(), 2);
        let audio_node = &graph.nodes["Producer:Audio"];
        assert!(audio_node.depends_on.contains("Producer:Script"));
        assert_eq!(graph.roots().len(), 1);
        assert_eq!(graph.roots()[0].job.job_id, "Producer:Script");
    }

    #[test]
    fn fan_in_target_depends_on_every_member_producer() {
        let seg0 = ExpandedProducer {
            id: id(IdKind::Producer, "Segment", vec![0]),
            namespace_path: "Segment".to_string(),
            alias: "Segment".to_string(),
            indices: vec![0],
            outputs: vec![id(IdKind::Artifact, "Segment.Line", vec![0])],
            declared_input_fields: vec![],
        };
        let seg1 = ExpandedProducer {
            id: id(IdKind::Producer, "Segment", vec![1]),
            namespace_path: "Segment".to_string(),
            alias: "Segment".to_string(),
            indices: vec![1],
            outputs: vec![id(IdKind::Artifact, "Segment.Line", vec![1])],
            declared_input_fields: vec![],
        };
        let compositor = ExpandedProducer {
            id: id(IdKind::Producer, "Compositor", vec![]),
            namespace_path: "Compositor".to_string(),
            alias: "Compositor".to_string(),
            indices: vec![],
            outputs: vec![],
            declared_input_fields: vec!["Lines".to_string()],
        };
        let target = id(IdKind::Input, "Compositor.Lines", vec![]);
        let fan_in = BTreeMap::from([(
            target,
            mge_core::FanInDescriptor {
                group_by: "index".to_string(),
                order_by: None,
                members: vec![
                    mge_core::FanInMember {
                        id: id(IdKind::Artifact, "Segment.Line", vec![0]),
                        group_index: 0,
                        order: Some(0),
                    },
                    mge_core::FanInMember {
                        id: id(IdKind::Artifact, "Segment.Line", vec![1]),
                        group_index: 1,
                        order: Some(1),
                    },
                ],
            },
        )]);
        let expanded = ExpandedBlueprint {
            producers: vec![seg0, seg1, compositor],
            edges: vec![],
            free_standing_inputs: vec![],
            fan_in,
        };

        let graph = build(&expanded);
        let compositor_node = &graph.nodes["Producer:Compositor"];
        assert!(compositor_node.depends_on.contains("Producer:Segment[0]"));
        assert!(compositor_node.depends_on.contains("Producer:Segment[1]"));
    }

    #[test]
    fn root_level_producer_keeps_unconsumed_outputs() {
        let script = ExpandedProducer {
            id: id(IdKind::Producer, "Script", vec![]),
            namespace_path: "Script".to_string(),
            alias: "Script".to_string(),
            indices: vec![],
            outputs: vec![
                id(IdKind::Artifact, "Script.NarrationScript", vec![]),
                id(IdKind::Artifact, "Script.DebugTrace", vec![]),
            ],
            declared_input_fields: vec![],
        };
        let expanded = ExpandedBlueprint {
            producers: vec![script],
            edges: vec![],
            free_standing_inputs: vec![],
            fan_in: BTreeMap::new(),
        };

        let graph = build(&expanded);
        let produces = &graph.nodes["Producer:Script"].job.produces;
        assert_eq!(produces.len(), 2, "root-level outputs survive even with no consumer");
    }

    #[test]
    fn non_root_producer_elides_unconsumed_outputs() {
        let inner = ExpandedProducer {
            id: id(IdKind::Producer, "Outer.Inner", vec![]),
            namespace_path: "Outer.Inner".to_string(),
            alias: "Inner".to_string(),
            indices: vec![],
            outputs: vec![
                id(IdKind::Artifact, "Outer.Inner.Used", vec![]),
                id(IdKind::Artifact, "Outer.Inner.Unused", vec![]),
            ],
            declared_input_fields: vec![],
        };
        let consumer = ExpandedProducer {
            id: id(IdKind::Producer, "Consumer", vec![]),
            namespace_path: "Consumer".to_string(),
            alias: "Consumer".to_string(),
            indices: vec![],
            outputs: vec![],
            declared_input_fields: vec!["Text".to_string()],
        };
        let edge = CanonicalEdge {
            from: id(IdKind::Artifact, "Outer.Inner.Used", vec![]),
            to: id(IdKind::Input, "Consumer.Text", vec![]),
            condition: None,
        };
        let expanded = ExpandedBlueprint {
            producers: vec![inner, consumer],
            edges: vec![edge],
            free_standing_inputs: vec![],
            fan_in: BTreeMap::new(),
        };

        let graph = build(&expanded);
        let produces = &graph.nodes["Producer:Outer.Inner"].job.produces;
        assert_eq!(produces.len(), 1);
        assert_eq!(produces[0].qname(), "Outer.Inner.Used");
    }
}
