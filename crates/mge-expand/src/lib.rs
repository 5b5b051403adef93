//! Canonical Expander (spec §4.G): expands a dimensional [`BlueprintNode`]
//! tree plus resolved input values into a flat DAG of concretely-indexed
//! `Producer`/`Input`/`Artifact` nodes, fan-in descriptors, and
//! dimension-substituted edges.
#![deny(unsafe_code)]

use std::collections::BTreeMap;

use mge_blueprint::BlueprintNode;
use mge_core::{CanonicalId, Dimension, FanInDescriptor, FanInMember, IdKind};
use serde_json::Value;

/// Errors raised while expanding a blueprint tree.
#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    /// A loop's `count_input` was not present in the resolved input map.
    #[error("loop '{loop_name}' references unresolved count input '{count_input}'")]
    UnresolvedLoopCount {
        loop_name: String,
        count_input: String,
    },
    /// A loop's resolved count input value was not a non-negative integer.
    #[error("loop '{loop_name}' count input '{count_input}' did not resolve to a non-negative integer")]
    InvalidLoopCount {
        loop_name: String,
        count_input: String,
    },
    /// A connection endpoint referenced a child alias the current node does
    /// not declare as a producer import.
    #[error("connection endpoint '{endpoint}' in {path} references unknown alias '{alias}'")]
    UnknownAlias {
        path: String,
        endpoint: String,
        alias: String,
    },
    /// A `[...]` dimension token could not be parsed.
    #[error("malformed dimension token '{token}' in endpoint '{endpoint}'")]
    MalformedDimension { endpoint: String, token: String },
}

/// One fully concrete producer job emitted by expansion.
#[derive(Debug, Clone)]
pub struct ExpandedProducer {
    /// `Producer:<namespace>[i0][i1]…`.
    pub id: CanonicalId,
    /// The producer's qualified namespace path, without indices.
    pub namespace_path: String,
    /// The alias this producer was imported under.
    pub alias: String,
    /// Concrete index tuple, in declaration order of its enclosing loops.
    pub indices: Vec<i64>,
    /// `Artifact:` ids this producer declares as outputs, at this index
    /// tuple.
    pub outputs: Vec<CanonicalId>,
    /// Declared input field names (unqualified), for binding resolution.
    pub declared_input_fields: Vec<String>,
}

/// A fully dimension-resolved edge between two canonical IDs, with its
/// condition tree (if any) carried along unresolved — `mge-condition` owns
/// interpretation.
#[derive(Debug, Clone)]
pub struct CanonicalEdge {
    pub from: CanonicalId,
    pub to: CanonicalId,
    pub condition: Option<Value>,
}

/// The full output of canonical expansion (spec §4.G).
#[derive(Debug, Clone, Default)]
pub struct ExpandedBlueprint {
    pub producers: Vec<ExpandedProducer>,
    pub edges: Vec<CanonicalEdge>,
    /// Free-standing `Input:<name>` ids declared at the blueprint root.
    pub free_standing_inputs: Vec<CanonicalId>,
    /// Fan-in descriptors keyed by the aggregated target `Input:` id.
    pub fan_in: BTreeMap<CanonicalId, FanInDescriptor>,
}

impl ExpandedBlueprint {
    /// All `Input:` ids referenced anywhere as an edge target or fan-in
    /// target — i.e. every input binding a producer can see.
    #[must_use]
    pub fn all_bound_input_ids(&self) -> Vec<CanonicalId> {
        let mut ids: Vec<CanonicalId> = self
            .edges
            .iter()
            .filter(|e| e.to.kind() == IdKind::Input)
            .map(|e| e.to.clone())
            .collect();
        ids.extend(self.fan_in.keys().cloned());
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopInfo {
    cardinality: i64,
}

/// Expand `root` against `resolved_inputs` (free-standing input name ->
/// resolved JSON value).
pub fn expand(
    root: &BlueprintNode,
    resolved_inputs: &BTreeMap<String, Value>,
) -> Result<ExpandedBlueprint, ExpandError> {
    let loops = collect_loops(root, resolved_inputs)?;

    let free_standing_inputs = root
        .document
        .inputs
        .iter()
        .map(|decl| CanonicalId::new(IdKind::Input, decl.name.clone(), vec![]))
        .collect();

    let mut producers = Vec::new();
    collect_producers(root, &loops, &mut producers);

    let mut edges = Vec::new();
    collect_edges(root, &loops, &mut edges)?;
    collect_collector_fanin_edges(root, &loops, &mut edges)?;

    let fan_in = synthesize_fan_in(&edges);

    Ok(ExpandedBlueprint {
        producers,
        edges,
        free_standing_inputs,
        fan_in,
    })
}

fn collect_loops(
    root: &BlueprintNode,
    resolved_inputs: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, LoopInfo>, ExpandError> {
    let mut loops = BTreeMap::new();
    for node in root.walk() {
        for decl in &node.document.loops {
            let raw = resolved_inputs.get(&decl.count_input).ok_or_else(|| {
                ExpandError::UnresolvedLoopCount {
                    loop_name: decl.name.clone(),
                    count_input: decl.count_input.clone(),
                }
            })?;
            let count = raw.as_i64().ok_or_else(|| ExpandError::InvalidLoopCount {
                loop_name: decl.name.clone(),
                count_input: decl.count_input.clone(),
            })?;
            let offset = decl.count_input_offset.unwrap_or(0);
            let cardinality = count + offset;
            if cardinality < 0 {
                return Err(ExpandError::InvalidLoopCount {
                    loop_name: decl.name.clone(),
                    count_input: decl.count_input.clone(),
                });
            }
            loops.insert(decl.name.clone(), LoopInfo { cardinality });
        }
    }
    Ok(loops)
}

fn cartesian_indices(names: &[String], loops: &BTreeMap<String, LoopInfo>) -> Vec<Vec<i64>> {
    if names.is_empty() {
        return vec![vec![]];
    }
    let mut combos = vec![vec![]];
    for name in names {
        let card = loops.get(name).map_or(0, |l| l.cardinality);
        let mut next = Vec::with_capacity(combos.len() * card.max(0) as usize);
        for combo in &combos {
            for i in 0..card {
                let mut c = combo.clone();
                c.push(i);
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

fn collect_producers(
    node: &BlueprintNode,
    loops: &BTreeMap<String, LoopInfo>,
    out: &mut Vec<ExpandedProducer>,
) {
    for child in &node.children {
        let within = &child.within;
        let combos = cartesian_indices(within, loops);
        for indices in combos {
            let outputs = child
                .document
                .artifacts
                .iter()
                .map(|a| CanonicalId::new(IdKind::Artifact, format!("{}.{}", child.id(), a.name), dims(&indices)))
                .collect();
            let declared_input_fields = child.document.inputs.iter().map(|i| i.name.clone()).collect();
            out.push(ExpandedProducer {
                id: CanonicalId::new(IdKind::Producer, child.id(), dims(&indices)),
                namespace_path: child.id(),
                alias: child.alias.clone(),
                indices,
                outputs,
                declared_input_fields,
            });
        }
        collect_producers(child, loops, out);
    }
}

fn dims(indices: &[i64]) -> Vec<Dimension> {
    indices.iter().map(|i| Dimension::Concrete(*i)).collect()
}

/// One `[...]`-bearing qualified-name endpoint, parsed but not yet resolved
/// against a namespace.
struct ParsedEndpoint {
    alias: String,
    remainder: String,
    dim_tokens: Vec<String>,
}

fn parse_endpoint(endpoint: &str) -> Result<ParsedEndpoint, ExpandError> {
    let bracket_start = endpoint.find('[');
    let (head, dims_str) = match bracket_start {
        Some(idx) => (&endpoint[..idx], &endpoint[idx..]),
        None => (endpoint, ""),
    };
    let mut dim_tokens = Vec::new();
    let mut rest = dims_str;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let close = after.find(']').ok_or_else(|| ExpandError::MalformedDimension {
            endpoint: endpoint.to_string(),
            token: rest.to_string(),
        })?;
        dim_tokens.push(after[..close].to_string());
        rest = &after[close + 1..];
    }
    let mut parts = head.splitn(2, '.');
    let alias = parts.next().unwrap_or_default().to_string();
    let remainder = parts.next().unwrap_or_default().to_string();
    Ok(ParsedEndpoint {
        alias,
        remainder,
        dim_tokens,
    })
}

fn token_to_dimension(token: &str, endpoint: &str) -> Result<Dimension, ExpandError> {
    if token.bytes().all(|b| b.is_ascii_digit()) && !token.is_empty() {
        return token
            .parse::<i64>()
            .map(Dimension::Concrete)
            .map_err(|_| ExpandError::MalformedDimension {
                endpoint: endpoint.to_string(),
                token: token.to_string(),
            });
    }
    if let Some(split) = token.find(['+', '-']) {
        let (name, sign_digits) = token.split_at(split);
        let sign: i32 = if sign_digits.starts_with('-') { -1 } else { 1 };
        let magnitude: i32 = sign_digits[1..]
            .parse()
            .map_err(|_| ExpandError::MalformedDimension {
                endpoint: endpoint.to_string(),
                token: token.to_string(),
            })?;
        return Ok(Dimension::Symbolic {
            name: name.to_string(),
            offset: sign * magnitude,
        });
    }
    Ok(Dimension::symbolic(token))
}

/// Symbol names (loop names) referenced by a dimension list.
fn symbols_of(dims: &[Dimension]) -> Vec<String> {
    dims.iter()
        .filter_map(|d| match d {
            Dimension::Symbolic { name, .. } => Some(name.clone()),
            Dimension::Concrete(_) => None,
        })
        .collect()
}

fn substitute(dims: &[Dimension], values: &BTreeMap<String, i64>, loops: &BTreeMap<String, LoopInfo>) -> Option<Vec<Dimension>> {
    let mut out = Vec::with_capacity(dims.len());
    for d in dims {
        match d {
            Dimension::Concrete(i) => out.push(Dimension::Concrete(*i)),
            Dimension::Symbolic { name, offset } => {
                let base = *values.get(name)?;
                let resolved = base + i64::from(*offset);
                let card = loops.get(name).map_or(i64::MAX, |l| l.cardinality);
                if resolved < 0 || resolved >= card {
                    return None;
                }
                out.push(Dimension::Concrete(resolved));
            }
        }
    }
    Some(out)
}

fn resolve_endpoint_in(
    node: &BlueprintNode,
    endpoint: &str,
    is_target_side: bool,
) -> Result<(CanonicalId, IdKind), ExpandError> {
    let parsed = parse_endpoint(endpoint)?;
    let dims_raw: Vec<Dimension> = parsed
        .dim_tokens
        .iter()
        .map(|t| token_to_dimension(t, endpoint))
        .collect::<Result<_, _>>()?;

    if parsed.alias == "Inputs" {
        let name = parsed.remainder;
        return Ok((CanonicalId::new(IdKind::Input, name, dims_raw), IdKind::Input));
    }

    if parsed.alias == node.alias && !node.alias.is_empty() {
        // Self-reference: another index of the same producer family.
        let is_artifact = node.document.artifacts.iter().any(|a| a.name == parsed.remainder);
        let kind = if is_artifact { IdKind::Artifact } else { IdKind::Input };
        let qname = format!("{}.{}", node.id(), parsed.remainder);
        return Ok((CanonicalId::new(kind, qname, dims_raw), kind));
    }

    let child = node
        .children
        .iter()
        .find(|c| c.alias == parsed.alias)
        .ok_or_else(|| ExpandError::UnknownAlias {
            path: node.id(),
            endpoint: endpoint.to_string(),
            alias: parsed.alias.clone(),
        })?;

    let is_artifact_name = child.document.artifacts.iter().any(|a| a.name == parsed.remainder);
    let is_input_name = child.document.inputs.iter().any(|i| i.name == parsed.remainder);
    let kind = if is_target_side {
        if is_artifact_name { IdKind::Artifact } else { IdKind::Input }
    } else if is_input_name {
        IdKind::Input
    } else {
        IdKind::Artifact
    };
    let qname = format!("{}.{}", child.id(), parsed.remainder);
    Ok((CanonicalId::new(kind, qname, dims_raw), kind))
}

fn collect_edges(
    node: &BlueprintNode,
    loops: &BTreeMap<String, LoopInfo>,
    out: &mut Vec<CanonicalEdge>,
) -> Result<(), ExpandError> {
    for connection in &node.document.connections {
        let (from_id, _) = resolve_endpoint_in(node, &connection.from, false)?;
        let (to_id, _) = resolve_endpoint_in(node, &connection.to, true)?;

        let mut symbols: Vec<String> = symbols_of(from_id.dims());
        symbols.extend(symbols_of(to_id.dims()));
        symbols.sort();
        symbols.dedup();

        for combo in cartesian_indices(&symbols, loops) {
            let values: BTreeMap<String, i64> =
                symbols.iter().cloned().zip(combo.iter().copied()).collect();
            let Some(from_dims) = substitute(from_id.dims(), &values, loops) else {
                continue;
            };
            let Some(to_dims) = substitute(to_id.dims(), &values, loops) else {
                continue;
            };
            out.push(CanonicalEdge {
                from: from_id.with_dims(from_dims),
                to: to_id.with_dims(to_dims),
                condition: connection.condition.as_ref().map(yaml_to_json),
            });
        }
    }
    for child in &node.children {
        collect_edges(child, loops, out)?;
    }
    Ok(())
}

fn collect_collector_fanin_edges(
    node: &BlueprintNode,
    loops: &BTreeMap<String, LoopInfo>,
    out: &mut Vec<CanonicalEdge>,
) -> Result<(), ExpandError> {
    for collector in &node.document.collectors {
        let (source_id, _) = resolve_endpoint_in(node, &collector.source, false)?;
        let (target_id, _) = resolve_endpoint_in(node, &collector.target, true)?;
        let group_card = loops.get(&collector.group_by).map_or(0, |l| l.cardinality);
        for i in 0..group_card {
            let mut values = BTreeMap::new();
            values.insert(collector.group_by.clone(), i);
            let Some(source_dims) = substitute(source_id.dims(), &values, loops) else {
                continue;
            };
            out.push(CanonicalEdge {
                from: source_id.with_dims(source_dims),
                to: target_id.clone(),
                condition: None,
            });
        }
    }
    for child in &node.children {
        collect_collector_fanin_edges(child, loops, out)?;
    }
    Ok(())
}

fn yaml_to_json(value: &serde_yaml::Value) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Detect fan-in: among edges sharing the same concrete `to` id, group by
/// that id. When more than one distinct `from` maps to the same `to`, the
/// set is a fan-in collapse (spec §4.G step 5); the members are ordered by
/// the index of the varying source dimension.
fn synthesize_fan_in(edges: &[CanonicalEdge]) -> BTreeMap<CanonicalId, FanInDescriptor> {
    let mut by_target: BTreeMap<CanonicalId, Vec<&CanonicalEdge>> = BTreeMap::new();
    for edge in edges {
        if edge.to.kind() == IdKind::Input {
            by_target.entry(edge.to.clone()).or_default().push(edge);
        }
    }

    let mut fan_in = BTreeMap::new();
    for (target, sources) in by_target {
        if sources.len() < 2 {
            continue;
        }
        let members: Vec<FanInMember> = sources
            .iter()
            .enumerate()
            .map(|(order, edge)| {
                let group_index = edge
                    .from
                    .dims()
                    .last()
                    .and_then(|d| if let Dimension::Concrete(i) = d { Some(*i) } else { None })
                    .unwrap_or(order as i64);
                FanInMember {
                    id: edge.from.clone(),
                    group_index,
                    order: Some(group_index),
                }
            })
            .collect();
        fan_in.insert(
            target,
            FanInDescriptor {
                group_by: "index".to_string(),
                order_by: None,
                members,
            },
        );
    }
    fan_in
}
