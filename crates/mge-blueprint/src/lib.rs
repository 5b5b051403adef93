//! Blueprint Parser (spec §4.F): parses a tree of YAML blueprint files into
//! a structurally validated [`BlueprintNode`] tree, resolving producer
//! imports and detecting cycles before anything downstream sees them.
#![deny(unsafe_code)]

mod document;
mod tree;

pub use document::{
    ArtifactDecl, BlueprintDocument, CollectorDecl, ConnectionDecl, InputDecl, LoopDecl,
    MappingDecl, Meta, ModelDecl, ProducerImport,
};
pub use tree::{BlueprintError, BlueprintNode, BlueprintParser};
