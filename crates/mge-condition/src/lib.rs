//! Condition Engine (spec §4.I): evaluates the clause/group trees attached
//! to edges and producer inputs against resolved artifact payloads.
#![deny(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while evaluating a condition tree.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    /// A node was neither a recognised clause nor a recognised group.
    #[error("condition node is neither a clause nor a group: {0}")]
    MalformedNode(String),
    /// A `matches` clause's pattern did not compile as a regex.
    #[error("invalid regex '{pattern}' in matches clause: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One clause operator (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClauseOp {
    Is,
    IsNot,
    Contains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Exists,
    Matches,
}

/// A parsed condition tree node: either a leaf clause or a short-circuiting
/// `all`/`any` group.
#[derive(Debug, Clone)]
pub enum ConditionNode {
    Clause { when: String, op: ClauseOp, value: Option<Value> },
    All(Vec<ConditionNode>),
    Any(Vec<ConditionNode>),
}

impl ConditionNode {
    /// Parse a condition tree from its raw JSON form (as carried by
    /// `ProducerJobContext::conditions`).
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::MalformedNode`] if `raw` matches neither
    /// clause nor group shape.
    pub fn parse(raw: &Value) -> Result<Self, ConditionError> {
        let Value::Object(map) = raw else {
            return Err(ConditionError::MalformedNode(raw.to_string()));
        };

        if let Some(Value::Array(items)) = map.get("all") {
            return Ok(Self::All(
                items.iter().map(Self::parse).collect::<Result<_, _>>()?,
            ));
        }
        if let Some(Value::Array(items)) = map.get("any") {
            return Ok(Self::Any(
                items.iter().map(Self::parse).collect::<Result<_, _>>()?,
            ));
        }

        let Some(Value::String(when)) = map.get("when") else {
            return Err(ConditionError::MalformedNode(raw.to_string()));
        };

        for (key, op) in [
            ("is", ClauseOp::Is),
            ("isNot", ClauseOp::IsNot),
            ("contains", ClauseOp::Contains),
            ("greaterThan", ClauseOp::GreaterThan),
            ("lessThan", ClauseOp::LessThan),
            ("greaterOrEqual", ClauseOp::GreaterOrEqual),
            ("lessOrEqual", ClauseOp::LessOrEqual),
            ("exists", ClauseOp::Exists),
            ("matches", ClauseOp::Matches),
        ] {
            if let Some(value) = map.get(key) {
                return Ok(Self::Clause {
                    when: when.clone(),
                    op,
                    value: Some(value.clone()),
                });
            }
        }

        Err(ConditionError::MalformedNode(raw.to_string()))
    }

    /// Collect every `when` path referenced anywhere in this tree, so the
    /// caller can resolve the needed artifacts up front.
    #[must_use]
    pub fn referenced_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        match self {
            Self::Clause { when, .. } => out.push(when.clone()),
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect_paths(out);
                }
            }
        }
    }

    /// Evaluate this node against resolved artifact payloads, keyed by the
    /// same dimension-substituted path strings produced by [`Self::referenced_paths`].
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::InvalidRegex`] if a `matches` clause's
    /// pattern fails to compile.
    pub fn evaluate(&self, resolved: &BTreeMap<String, Value>) -> Result<bool, ConditionError> {
        match self {
            Self::Clause { when, op, value } => evaluate_clause(when, *op, value.as_ref(), resolved),
            Self::All(children) => {
                for child in children {
                    if !child.evaluate(resolved)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(children) => {
                for child in children {
                    if child.evaluate(resolved)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn evaluate_clause(
    when: &str,
    op: ClauseOp,
    operand: Option<&Value>,
    resolved: &BTreeMap<String, Value>,
) -> Result<bool, ConditionError> {
    let actual = resolved.get(when);

    if op == ClauseOp::Exists {
        return Ok(actual.is_some_and(|v| !v.is_null()));
    }

    let Some(actual) = actual else {
        return Ok(false);
    };

    match op {
        ClauseOp::Exists => unreachable!("handled above"),
        ClauseOp::Is => Ok(operand == Some(actual)),
        ClauseOp::IsNot => Ok(operand != Some(actual)),
        ClauseOp::Contains => Ok(contains(actual, operand)),
        ClauseOp::GreaterThan => compare(actual, operand, |a, b| a > b),
        ClauseOp::LessThan => compare(actual, operand, |a, b| a < b),
        ClauseOp::GreaterOrEqual => compare(actual, operand, |a, b| a >= b),
        ClauseOp::LessOrEqual => compare(actual, operand, |a, b| a <= b),
        ClauseOp::Matches => {
            let Some(Value::String(pattern)) = operand else {
                return Ok(false);
            };
            let re = regex::Regex::new(pattern).map_err(|source| ConditionError::InvalidRegex {
                pattern: pattern.clone(),
                source,
            })?;
            Ok(actual.as_str().is_some_and(|s| re.is_match(s)))
        }
    }
}

fn contains(actual: &Value, operand: Option<&Value>) -> bool {
    match actual {
        Value::Array(items) => operand.is_some_and(|op| items.contains(op)),
        Value::String(s) => operand
            .and_then(Value::as_str)
            .is_some_and(|needle| s.contains(needle)),
        _ => false,
    }
}

fn compare(actual: &Value, operand: Option<&Value>, f: impl Fn(f64, f64) -> bool) -> Result<bool, ConditionError> {
    let (Some(a), Some(b)) = (actual.as_f64(), operand.and_then(Value::as_f64)) else {
        return Ok(false);
    };
    Ok(f(a, b))
}
