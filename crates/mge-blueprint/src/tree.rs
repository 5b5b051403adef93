//! Producer import resolution, cycle detection, and structural validation
//! over a parsed [`BlueprintDocument`] tree (spec §4.F).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::document::BlueprintDocument;

/// Errors raised while resolving a blueprint tree.
#[derive(Debug, thiserror::Error)]
pub enum BlueprintError {
    /// The root or an imported file could not be read.
    #[error("failed to read blueprint file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A file failed to parse as a [`BlueprintDocument`].
    #[error("failed to parse blueprint {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    /// An import named neither `path` nor `producer`, or both.
    #[error("producer import '{alias}' in {path} must set exactly one of path/producer")]
    AmbiguousImport { path: String, alias: String },
    /// A catalog-qualified import could not be resolved because no catalog
    /// root was supplied.
    #[error("producer import '{alias}' in {path} references catalog producer '{producer}' but no catalog root was configured")]
    NoCatalogConfigured {
        path: String,
        alias: String,
        producer: String,
    },
    /// A catalog-qualified import's target file does not exist.
    #[error("catalog producer '{producer}' not found at {expected}")]
    MissingCatalogEntry { producer: String, expected: String },
    /// Importing this file would revisit a file already on the import
    /// stack — a cycle.
    #[error("circular import detected: {cycle}")]
    CircularImport { cycle: String },
    /// A document declared both `producers` imports and its own `models`
    /// list (spec §4.F: mutually exclusive).
    #[error("{path} declares both producer imports and a models list, which are mutually exclusive")]
    ProducersAndModelsConflict { path: String },
    /// A `[dim]` token referenced a loop name not declared by any ancestor.
    #[error("connection '{edge}' in {path} references undeclared loop dimension '{dim}'")]
    UnknownDimension {
        path: String,
        edge: String,
        dim: String,
    },
}

/// One resolved node of the blueprint import tree.
#[derive(Debug, Clone)]
pub struct BlueprintNode {
    /// Dot-separated namespace path from the root (empty for the root).
    pub namespace_path: String,
    /// The alias this node was imported under (empty for the root).
    pub alias: String,
    /// The loop names (declared by an ancestor) this node iterates over, in
    /// nesting order — copied from the [`crate::document::ProducerImport`]
    /// that spawned this node (empty for the root).
    pub within: Vec<String>,
    /// The absolute path the document was read from.
    pub source_path: PathBuf,
    /// The parsed document itself.
    pub document: BlueprintDocument,
    /// Resolved child imports, in declaration order.
    pub children: Vec<BlueprintNode>,
}

impl BlueprintNode {
    /// Every loop name visible at this node: its own `loops` plus everything
    /// declared by ancestors, accumulated during resolution.
    #[must_use]
    pub fn id(&self) -> String {
        if self.namespace_path.is_empty() {
            self.alias.clone()
        } else {
            format!("{}.{}", self.namespace_path, self.alias)
        }
    }

    /// Walk this node and every descendant, depth-first.
    pub fn walk(&self) -> Vec<&BlueprintNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// Parses a blueprint tree starting at `root_path`, resolving producer
/// imports against `catalog_root` (if any), detecting cycles, and running
/// structural validation.
pub struct BlueprintParser {
    catalog_root: Option<PathBuf>,
}

impl BlueprintParser {
    /// Build a parser with an optional catalog root for `producer:`-style
    /// imports.
    #[must_use]
    pub fn new(catalog_root: Option<PathBuf>) -> Self {
        Self { catalog_root }
    }

    /// Parse and fully resolve the blueprint tree rooted at `root_path`.
    pub fn parse(&self, root_path: &Path) -> Result<BlueprintNode, BlueprintError> {
        let mut stack = BTreeSet::new();
        self.parse_node(root_path, "", "", &[], &mut stack)
    }

    fn parse_node(
        &self,
        path: &Path,
        namespace_path: &str,
        alias: &str,
        within: &[String],
        stack: &mut BTreeSet<PathBuf>,
    ) -> Result<BlueprintNode, BlueprintError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if stack.contains(&canonical) {
            return Err(BlueprintError::CircularImport {
                cycle: canonical.display().to_string(),
            });
        }
        stack.insert(canonical.clone());

        let raw = std::fs::read_to_string(path).map_err(|source| BlueprintError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let document = BlueprintDocument::from_yaml(&raw).map_err(|source| BlueprintError::Yaml {
            path: path.display().to_string(),
            source,
        })?;

        if !document.producers.is_empty() && document.models.is_some() {
            return Err(BlueprintError::ProducersAndModelsConflict {
                path: path.display().to_string(),
            });
        }

        validate_dimensions(&document, path)?;

        let child_namespace = if namespace_path.is_empty() {
            alias.to_string()
        } else if alias.is_empty() {
            namespace_path.to_string()
        } else {
            format!("{namespace_path}.{alias}")
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut children = Vec::with_capacity(document.producers.len());
        for import in &document.producers {
            let import_path = self.resolve_import_path(path, base_dir, import)?;
            let child = self.parse_node(
                &import_path,
                &child_namespace,
                &import.alias,
                &import.within,
                stack,
            )?;
            children.push(child);
        }

        stack.remove(&canonical);

        Ok(BlueprintNode {
            namespace_path: namespace_path.to_string(),
            alias: alias.to_string(),
            within: within.to_vec(),
            source_path: canonical,
            document,
            children,
        })
    }

    fn resolve_import_path(
        &self,
        doc_path: &Path,
        base_dir: &Path,
        import: &crate::document::ProducerImport,
    ) -> Result<PathBuf, BlueprintError> {
        match (&import.path, &import.producer) {
            (Some(rel), None) => Ok(base_dir.join(rel)),
            (None, Some(producer)) => {
                let Some(catalog) = &self.catalog_root else {
                    return Err(BlueprintError::NoCatalogConfigured {
                        path: doc_path.display().to_string(),
                        alias: import.alias.clone(),
                        producer: producer.clone(),
                    });
                };
                let candidate = catalog
                    .join("producers")
                    .join(format!("{}.yaml", producer.replace('.', "/")));
                if !candidate.exists() {
                    return Err(BlueprintError::MissingCatalogEntry {
                        producer: producer.clone(),
                        expected: candidate.display().to_string(),
                    });
                }
                Ok(candidate)
            }
            _ => Err(BlueprintError::AmbiguousImport {
                path: doc_path.display().to_string(),
                alias: import.alias.clone(),
            }),
        }
    }
}

fn validate_dimensions(document: &BlueprintDocument, path: &Path) -> Result<(), BlueprintError> {
    let declared: BTreeSet<&str> = document.loops.iter().map(|l| l.name.as_str()).collect();
    for connection in &document.connections {
        for endpoint in [&connection.from, &connection.to] {
            for dim in extract_dims(endpoint) {
                let name = dim.trim_start_matches(|c: char| c.is_ascii_digit());
                if name.is_empty() {
                    continue; // a plain integer literal, always valid
                }
                let bare_name: String = name
                    .chars()
                    .take_while(|c| *c != '+' && *c != '-')
                    .collect();
                if !declared.contains(bare_name.as_str()) {
                    return Err(BlueprintError::UnknownDimension {
                        path: path.display().to_string(),
                        edge: format!("{} -> {}", connection.from, connection.to),
                        dim: bare_name,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Extract every `[...]` token's inner contents from a qualified-name
/// string such as `Script.Line[segment]`.
fn extract_dims(qualified: &str) -> Vec<String> {
    let mut dims = Vec::new();
    let mut rest = qualified;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };
        dims.push(after[..close].to_string());
        rest = &after[close + 1..];
    }
    dims
}
