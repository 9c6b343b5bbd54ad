//! A release lifecycle against the in-memory cluster

use std::time::Duration;

use kube::api::PropagationPolicy;
use kubesync_kube::{
    CreateOptions, KubeError, MockCluster, ResourceClient, ResourceList, UpdateOptions,
    WaitOptions, WaitStrategy,
};

const RELEASE_V1: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: blue
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: ledger
  annotations:
    helm.sh/resource-policy: keep
data:
  entries: "0"
---
apiVersion: v1
kind: Secret
metadata:
  name: token
stringData:
  value: abc
"#;

const RELEASE_V2: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: green
---
apiVersion: v1
kind: Service
metadata:
  name: api
spec:
  ports:
    - port: 80
"#;

fn names(list: &ResourceList) -> Vec<&str> {
    list.iter().map(|info| info.name.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_install_upgrade_uninstall() {
    let client = ResourceClient::new(MockCluster::new());

    let mut installed = client.build(RELEASE_V1.as_bytes(), true).unwrap();
    let result = client
        .create(&mut installed, &CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&result.created), ["settings", "ledger", "token"]);
    assert!(installed.iter().all(|info| info.resource_version.is_some()));

    let mut upgraded = client.build(RELEASE_V2.as_bytes(), true).unwrap();
    let result = client
        .update(&installed, &mut upgraded, &UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&result.created), ["api"]);
    assert_eq!(names(&result.updated), ["settings"]);
    assert_eq!(names(&result.deleted), ["token"]);

    let cluster = client.cluster();
    let settings = cluster.object("ConfigMap", Some("default"), "settings").unwrap();
    assert_eq!(settings.data["data"]["mode"], "green");
    assert!(cluster.object("ConfigMap", Some("default"), "ledger").is_some());
    assert!(cluster.object("Secret", Some("default"), "token").is_none());

    let waiter = client.waiter(WaitStrategy::Watcher, WaitOptions::default());
    waiter.wait(&upgraded, Duration::from_secs(30)).await.unwrap();

    let (result, errors) = client.delete(&upgraded, PropagationPolicy::Background).await;
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(result.deleted.len(), 2);
    waiter
        .wait_for_delete(&upgraded, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(cluster.object("ConfigMap", Some("default"), "ledger").is_some());
}

#[tokio::test]
async fn test_noop_upgrade_writes_nothing() {
    let client = ResourceClient::new(MockCluster::new());
    let mut installed = client.build(RELEASE_V2.as_bytes(), false).unwrap();
    client
        .create(&mut installed, &CreateOptions::default())
        .await
        .unwrap();
    client.cluster().reset_counts();

    let mut again = client.build(RELEASE_V2.as_bytes(), false).unwrap();
    let result = client
        .update(&installed, &mut again, &UpdateOptions::default())
        .await
        .unwrap();
    assert!(result.created.is_empty());
    assert!(result.deleted.is_empty());
    assert_eq!(client.cluster().operation_counts().writes(), 0);
}

#[tokio::test]
async fn test_set_operations_ignore_content() {
    let client = ResourceClient::new(MockCluster::new());
    let v1 = client.build(RELEASE_V1.as_bytes(), false).unwrap();
    let v2 = client.build(RELEASE_V2.as_bytes(), false).unwrap();

    // settings differs in content between the two releases but is the same object
    assert_eq!(names(&v1.difference(&v2)), ["ledger", "token"]);
    assert_eq!(names(&v2.difference(&v1)), ["api"]);
    assert_eq!(names(&v1.intersect(&v2)), ["settings"]);
    for info in v1.difference(&v2).iter() {
        assert!(v1.contains(info) && !v2.contains(info));
    }
}

#[tokio::test]
async fn test_empty_delete_reports_no_objects() {
    let client = ResourceClient::new(MockCluster::new());
    let (result, errors) = client
        .delete(&ResourceList::new(), PropagationPolicy::Background)
        .await;
    assert!(result.is_empty());
    assert!(matches!(errors.as_slice(), [KubeError::NoObjectsVisited]));
}
