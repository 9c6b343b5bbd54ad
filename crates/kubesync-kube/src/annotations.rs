//! Annotation lookups with Helm compatibility
//!
//! Objects may carry either `kubesync.io/*` or `helm.sh/*` annotations; the
//! native key wins when both are present.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// kubesync-native annotations
pub mod kubesync {
    /// Resource policy ("keep" protects the object from deletion)
    pub const RESOURCE_POLICY: &str = "kubesync.io/resource-policy";
    /// Hook phase annotation
    pub const HOOK: &str = "kubesync.io/hook";
}

/// Helm-compatible annotations
pub mod helm {
    /// Resource policy (keep on uninstall and upgrade)
    pub const RESOURCE_POLICY: &str = "helm.sh/resource-policy";
    /// Hook phase annotation
    pub const HOOK: &str = "helm.sh/hook";
}

/// Value of the resource policy that keeps an object
pub const KEEP_POLICY: &str = "keep";

/// Get annotation value, preferring kubesync over Helm
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    kubesync_key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(kubesync_key)
        .or_else(|| annotations.get(helm_key))
        .map(|s| s.as_str())
}

/// True when the object asks never to be deleted
pub fn has_keep_policy(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| get_annotation(a, kubesync::RESOURCE_POLICY, helm::RESOURCE_POLICY))
        .is_some_and(|policy| policy.trim() == KEEP_POLICY)
}

/// Hook phases declared on the object (empty when it is not a hook)
pub fn hook_phases(meta: &ObjectMeta) -> Vec<String> {
    meta.annotations
        .as_ref()
        .and_then(|a| get_annotation(a, kubesync::HOOK, helm::HOOK))
        .map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_hook(meta: &ObjectMeta) -> bool {
    !hook_phases(meta).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            annotations: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_keep_policy() {
        assert!(has_keep_policy(&meta(&[(helm::RESOURCE_POLICY, "keep")])));
        assert!(has_keep_policy(&meta(&[(kubesync::RESOURCE_POLICY, " keep ")])));
        assert!(!has_keep_policy(&meta(&[(helm::RESOURCE_POLICY, "delete")])));
        assert!(!has_keep_policy(&ObjectMeta::default()));
    }

    #[test]
    fn test_native_key_wins() {
        let m = meta(&[
            (kubesync::RESOURCE_POLICY, "delete"),
            (helm::RESOURCE_POLICY, "keep"),
        ]);
        assert!(!has_keep_policy(&m));
    }

    #[test]
    fn test_hook_phases() {
        let m = meta(&[(helm::HOOK, "pre-install, post-upgrade,")]);
        assert_eq!(hook_phases(&m), vec!["pre-install", "post-upgrade"]);
        assert!(is_hook(&m));
        assert!(!is_hook(&ObjectMeta::default()));
    }
}
