//! Canonical ID grammar for `Input:`/`Artifact:`/`Producer:` nodes.
//!
//! ```text
//! id    = ("Input:" | "Artifact:" | "Producer:") qname dims?
//! qname = name *("." name)
//! name  = ALPHA *(ALPHA / DIGIT / "_")
//! dims  = 1*("[" index "]")
//! index = 1*DIGIT / name ("+" / "-") 1*DIGIT   ; only during parsing
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The three node kinds a canonical ID can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdKind {
    /// A blueprint input binding.
    Input,
    /// A producer output.
    Artifact,
    /// A concrete producer job.
    Producer,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Artifact => "Artifact",
            Self::Producer => "Producer",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One `[dim]` segment of a canonical ID.
///
/// Only [`Dimension::Concrete`] is legal once a blueprint has passed through
/// canonical expansion; [`Dimension::Symbolic`] exists solely to represent
/// loop-indexed dimensions as they appear in an unresolved, parsed blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    /// A resolved integer index, e.g. `[2]`.
    Concrete(i64),
    /// An unresolved loop-name reference, optionally offset: `[segment]`,
    /// `[segment+1]`, `[segment-1]`.
    Symbolic {
        /// The loop name this dimension iterates over.
        name: String,
        /// Signed offset applied to the loop index (`0` for a bare reference).
        offset: i32,
    },
}

impl Dimension {
    /// Build a bare symbolic dimension with no offset.
    #[must_use]
    pub fn symbolic(name: impl Into<String>) -> Self {
        Self::Symbolic {
            name: name.into(),
            offset: 0,
        }
    }

    /// `true` for [`Dimension::Concrete`].
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::Concrete(_))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(i) => write!(f, "{i}"),
            Self::Symbolic { name, offset } => match offset.cmp(&0) {
                std::cmp::Ordering::Equal => write!(f, "{name}"),
                std::cmp::Ordering::Greater => write!(f, "{name}+{offset}"),
                std::cmp::Ordering::Less => write!(f, "{name}{offset}"),
            },
        }
    }
}

/// Errors raised while parsing a canonical ID string.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IdParseError {
    /// The string did not start with a recognised `Kind:` prefix.
    #[error("unrecognised id prefix in {raw:?}")]
    UnknownPrefix {
        /// The offending input.
        raw: String,
    },
    /// The qualified name segment was empty or contained an invalid name.
    #[error("invalid qualified name in {raw:?}")]
    InvalidQualifiedName {
        /// The offending input.
        raw: String,
    },
    /// A `[...]` dimension segment could not be parsed.
    #[error("invalid dimension {segment:?} in {raw:?}")]
    InvalidDimension {
        /// The offending input.
        raw: String,
        /// The specific `[...]` segment that failed to parse.
        segment: String,
    },
}

/// A fully-formed `Input:`/`Artifact:`/`Producer:` canonical identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CanonicalId {
    kind: IdKind,
    qname: String,
    dims: Vec<Dimension>,
}

impl CanonicalId {
    /// Construct a canonical ID directly from its parts.
    #[must_use]
    pub fn new(kind: IdKind, qname: impl Into<String>, dims: Vec<Dimension>) -> Self {
        Self {
            kind,
            qname: qname.into(),
            dims,
        }
    }

    /// The node kind.
    #[must_use]
    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// The dot-separated qualified name, without dimensions.
    #[must_use]
    pub fn qname(&self) -> &str {
        &self.qname
    }

    /// The dimension list, in declaration order.
    #[must_use]
    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// `true` once every dimension has been resolved to an integer literal.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        self.dims.iter().all(Dimension::is_concrete)
    }

    /// Return a copy with `dims` replaced, for substituting symbolic
    /// dimensions with concrete indices during canonical expansion.
    #[must_use]
    pub fn with_dims(&self, dims: Vec<Dimension>) -> Self {
        Self {
            kind: self.kind,
            qname: self.qname.clone(),
            dims,
        }
    }

    /// Return a copy of this ID re-tagged as a different [`IdKind`].
    ///
    /// Used by the canonical expander when re-attributing artifact chains
    /// (`Artifact:A -> Artifact:B`) onto a producer's own job identity.
    #[must_use]
    pub fn with_kind(&self, kind: IdKind) -> Self {
        Self {
            kind,
            qname: self.qname.clone(),
            dims: self.dims.clone(),
        }
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.qname)?;
        for dim in &self.dims {
            write!(f, "[{dim}]")?;
        }
        Ok(())
    }
}

impl FromStr for CanonicalId {
    type Err = IdParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = if let Some(r) = raw.strip_prefix("Input:") {
            (IdKind::Input, r)
        } else if let Some(r) = raw.strip_prefix("Artifact:") {
            (IdKind::Artifact, r)
        } else if let Some(r) = raw.strip_prefix("Producer:") {
            (IdKind::Producer, r)
        } else {
            return Err(IdParseError::UnknownPrefix {
                raw: raw.to_string(),
            });
        };

        let bracket_start = rest.find('[');
        let (qname, dims_str) = match bracket_start {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        if qname.is_empty() || !is_valid_qname(qname) {
            return Err(IdParseError::InvalidQualifiedName {
                raw: raw.to_string(),
            });
        }

        let dims = parse_dims(dims_str).map_err(|segment| IdParseError::InvalidDimension {
            raw: raw.to_string(),
            segment,
        })?;

        Ok(Self {
            kind,
            qname: qname.to_string(),
            dims,
        })
    }
}

impl From<CanonicalId> for String {
    fn from(id: CanonicalId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn is_valid_qname(qname: &str) -> bool {
    qname.split('.').all(is_valid_name)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_dims(s: &str) -> Result<Vec<Dimension>, String> {
    let mut dims = Vec::new();
    let mut remaining = s;
    while !remaining.is_empty() {
        let close = remaining
            .strip_prefix('[')
            .and_then(|r| r.find(']').map(|idx| (r, idx)));
        let Some((inner_and_rest, idx)) = close else {
            return Err(remaining.to_string());
        };
        let segment = &inner_and_rest[..idx];
        dims.push(parse_index(segment).ok_or_else(|| format!("[{segment}]"))?);
        remaining = &inner_and_rest[idx + 1..];
    }
    Ok(dims)
}

fn parse_index(segment: &str) -> Option<Dimension> {
    if segment.is_empty() {
        return None;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return segment.parse::<i64>().ok().map(Dimension::Concrete);
    }
    // Symbolic, optionally offset: `<name>('+' | '-') <digits>`.
    if let Some(split) = segment.find(['+', '-']) {
        let (name, sign_and_digits) = segment.split_at(split);
        if !is_valid_name(name) {
            return None;
        }
        let sign = if sign_and_digits.starts_with('-') { -1 } else { 1 };
        let digits = &sign_and_digits[1..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let magnitude: i32 = digits.parse().ok()?;
        return Some(Dimension::Symbolic {
            name: name.to_string(),
            offset: sign * magnitude,
        });
    }
    if is_valid_name(segment) {
        return Some(Dimension::symbolic(segment));
    }
    None
}
