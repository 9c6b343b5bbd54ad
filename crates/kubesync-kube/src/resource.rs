//! Resource descriptors and ordered resource lists
//!
//! A [`ResourceInfo`] is one API object under management together with the
//! REST mapping resolved for its type. A [`ResourceList`] keeps manifest order
//! and offers set operations keyed on (kind, namespace, name) only; object
//! content and resource versions never affect membership.

use std::fmt;
use std::ops::Range;

use kube::{
    api::DynamicObject,
    core::{GroupVersionKind, TypeMeta},
    discovery::ApiResource,
};

use crate::error::{KubeError, Result};

/// How a type is served by the API server
#[derive(Debug, Clone, PartialEq)]
pub struct RestMapping {
    pub resource: ApiResource,
    /// False for cluster-scoped types
    pub namespaced: bool,
}

impl RestMapping {
    pub fn namespaced(resource: ApiResource) -> Self {
        Self {
            resource,
            namespaced: true,
        }
    }

    pub fn cluster(resource: ApiResource) -> Self {
        Self {
            resource,
            namespaced: false,
        }
    }
}

/// Identity of an object within one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// One API object under management
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub name: String,
    /// None for cluster-scoped objects
    pub namespace: Option<String>,
    pub gvk: GroupVersionKind,
    pub mapping: RestMapping,
    pub object: DynamicObject,
    /// Version from the last successful read or write
    pub resource_version: Option<String>,
}

impl ResourceInfo {
    /// Wrap an object whose type has already been resolved
    pub fn new(object: DynamicObject, mapping: RestMapping) -> Result<Self> {
        let types = object.types.as_ref().ok_or_else(|| {
            KubeError::InvalidManifest("resource missing apiVersion or kind".to_string())
        })?;
        let gvk = gvk_from_type_meta(types);

        let name = object
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                KubeError::InvalidManifest(format!("{} is missing metadata.name", gvk.kind))
            })?;

        let namespace = if mapping.namespaced {
            object.metadata.namespace.clone()
        } else {
            None
        };
        let resource_version = object.metadata.resource_version.clone();

        Ok(Self {
            name,
            namespace,
            gvk,
            mapping,
            object,
            resource_version,
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.gvk.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn api_version(&self) -> String {
        api_version(&self.gvk)
    }

    /// Display name for logging
    pub fn display_name(&self) -> String {
        self.key().to_string()
    }

    /// Replace the in-memory object with the server's representation
    pub fn refresh(&mut self, object: DynamicObject) {
        self.resource_version = object.metadata.resource_version.clone();
        self.object = object;
        if self.object.types.is_none() {
            self.object.types = Some(TypeMeta {
                api_version: api_version(&self.gvk),
                kind: self.gvk.kind.clone(),
            });
        }
    }
}

/// Ordered collection of resources
#[derive(Debug, Clone, Default)]
pub struct ResourceList(Vec<ResourceInfo>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, info: ResourceInfo) {
        self.0.push(info);
    }

    pub fn append(&mut self, other: ResourceList) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceInfo> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ResourceInfo> {
        self.0.iter_mut()
    }

    pub fn as_slice(&self) -> &[ResourceInfo] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [ResourceInfo] {
        &mut self.0
    }

    /// Call `f` on every resource in order, stopping at the first error
    pub fn visit<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&ResourceInfo) -> Result<()>,
    {
        self.0.iter().try_for_each(|info| f(info))
    }

    /// Resources matching a predicate, in order
    pub fn filter<F>(&self, mut f: F) -> ResourceList
    where
        F: FnMut(&ResourceInfo) -> bool,
    {
        self.0.iter().filter(|info| f(info)).cloned().collect()
    }

    /// First resource with the same identity
    pub fn get(&self, key: &ObjectKey) -> Option<&ResourceInfo> {
        self.0.iter().find(|info| info.key() == *key)
    }

    pub fn contains(&self, info: &ResourceInfo) -> bool {
        self.contains_key(&info.key())
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.get(key).is_some()
    }

    /// Resources of `self` whose identity is absent from `other`
    pub fn difference(&self, other: &ResourceList) -> ResourceList {
        self.filter(|info| !other.contains(info))
    }

    /// Resources of `self` whose identity is present in `other`
    pub fn intersect(&self, other: &ResourceList) -> ResourceList {
        self.filter(|info| other.contains(info))
    }

    /// Index ranges of consecutive resources sharing a kind
    pub fn kind_batches(&self) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        for i in 1..=self.0.len() {
            if i == self.0.len() || self.0[i].gvk.kind != self.0[start].gvk.kind {
                batches.push(start..i);
                start = i;
            }
        }
        batches
    }
}

impl FromIterator<ResourceInfo> for ResourceList {
    fn from_iter<T: IntoIterator<Item = ResourceInfo>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<ResourceInfo>> for ResourceList {
    fn from(v: Vec<ResourceInfo>) -> Self {
        Self(v)
    }
}

impl IntoIterator for ResourceList {
    type Item = ResourceInfo;
    type IntoIter = std::vec::IntoIter<ResourceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResourceList {
    type Item = &'a ResourceInfo;
    type IntoIter = std::slice::Iter<'a, ResourceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Extend<ResourceInfo> for ResourceList {
    fn extend<T: IntoIterator<Item = ResourceInfo>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

/// Outcome of a Create, Update or Delete call
#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub created: ResourceList,
    pub updated: ResourceList,
    pub deleted: ResourceList,
}

impl ReconcileResult {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} created, {} updated, {} deleted",
            self.created.len(),
            self.updated.len(),
            self.deleted.len()
        )
    }
}

/// Convert TypeMeta to GroupVersionKind
///
/// - "apps/v1" -> group="apps", version="v1"
/// - "v1" -> group="", version="v1" (core API)
pub fn gvk_from_type_meta(tm: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match tm.api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), tm.api_version.clone()),
    };

    GroupVersionKind {
        group,
        version,
        kind: tm.kind.clone(),
    }
}

/// apiVersion string of a GroupVersionKind
pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}
