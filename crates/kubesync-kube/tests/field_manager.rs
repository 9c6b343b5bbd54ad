//! Process-wide field manager override
//!
//! Lives in its own test binary so the override cannot leak into other tests.

use kubesync_kube::field_manager::init_field_manager;
use kubesync_kube::{ClientConfig, MockCluster, ResourceClient, resolve_field_manager};

#[test]
fn test_process_override_applies_to_new_clients() {
    assert!(init_field_manager("ci-pipeline"));
    assert!(!init_field_manager("too-late"));

    assert_eq!(resolve_field_manager(None), "ci-pipeline");
    assert_eq!(resolve_field_manager(Some("")), "ci-pipeline");
    assert_eq!(resolve_field_manager(Some("operator")), "operator");

    let client = ResourceClient::new(MockCluster::new());
    assert_eq!(client.field_manager(), "ci-pipeline");

    let client = ResourceClient::with_config(
        MockCluster::new(),
        ClientConfig {
            field_manager: Some("operator".to_string()),
            ..Default::default()
        },
    );
    assert_eq!(client.field_manager(), "operator");
}
