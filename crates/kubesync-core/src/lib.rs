//! kubesync core - building blocks that never talk to a cluster
//!
//! This crate provides:
//! - `ManifestFilter`: streaming keep/drop filter over multi-document YAML
//! - `DocumentMeta`: the `apiVersion`/`kind` header of a manifest document
//! - `DocumentFilter`: predicate builder matching documents by group, version or kind

pub mod error;
pub mod manifest;

pub use error::{CoreError, Result};
pub use manifest::{
    DEFAULT_BUFFER_SIZE, DocumentFilter, DocumentMeta, ManifestFilter, filter_manifest,
    is_blank_document, split_documents,
};
