//! Patch strategy engine
//!
//! Client-side updates send the difference between the desired object and
//! what is already applied:
//!
//! - kinds served by a built-in API group get a three-way strategic merge
//!   patch, whether or not this crate decodes them
//! - custom resources get a three-way JSON merge patch with identity
//!   preconditions, or a plain two-way JSON merge patch
//!
//! A computed patch of `{}` means there is nothing to write.

pub mod merge;
pub mod strategic;

use kube::core::GroupVersionKind;
use serde_json::Value;

use crate::error::Result;
use crate::kinds::is_custom_group;

/// Wire format of a computed patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// `application/strategic-merge-patch+json`
    StrategicMerge,
    /// `application/merge-patch+json`
    JsonMerge,
}

impl PatchType {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchType::StrategicMerge => "application/strategic-merge-patch+json",
            PatchType::JsonMerge => "application/merge-patch+json",
        }
    }
}

/// A patch ready to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedPatch {
    pub patch_type: PatchType,
    pub data: Value,
}

impl ComputedPatch {
    /// True when the patch would not change anything
    pub fn is_empty(&self) -> bool {
        self.data.as_object().is_some_and(|m| m.is_empty())
    }
}

/// Compute the client-side patch from `original` to `target`
///
/// `live` is the object currently stored by the server; it drives additions
/// and changes of three-way patches.
pub fn create_patch(
    original: &Value,
    live: &Value,
    target: &Value,
    gvk: &GroupVersionKind,
    three_way_unstructured: bool,
) -> Result<ComputedPatch> {
    if !is_custom_group(&gvk.group) {
        return Ok(ComputedPatch {
            patch_type: PatchType::StrategicMerge,
            data: strategic::create_three_way_patch(original, target, live),
        });
    }

    let data = if three_way_unstructured {
        merge::create_three_way_merge_patch(original, target, live)?
    } else {
        merge::create_merge_patch(original, target)
    };

    Ok(ComputedPatch {
        patch_type: PatchType::JsonMerge,
        data,
    })
}

/// Apply a computed patch to a document in place
pub fn apply_patch(document: &mut Value, patch: &Value, patch_type: PatchType) {
    match patch_type {
        PatchType::StrategicMerge => strategic::apply(document, patch),
        PatchType::JsonMerge => merge::apply(document, patch),
    }
}
