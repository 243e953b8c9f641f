//! CRD generation tests.

use dpmock_api::{NodeResource, NodeResourceConfiguration};
use kube::CustomResourceExt;

#[test]
fn test_node_resource_crd() {
    let crd = NodeResource::crd();
    assert_eq!(crd.spec.group, "dpmock.volcano.sh");
    assert_eq!(crd.spec.names.kind, "NodeResource");
    assert_eq!(crd.spec.scope, "Cluster");
    assert_eq!(crd.spec.names.short_names, Some(vec!["nr".to_string()]));
    assert_eq!(crd.spec.versions[0].name, "v1alpha1");
}

#[test]
fn test_configuration_crd_has_status() {
    let crd = NodeResourceConfiguration::crd();
    assert_eq!(crd.spec.names.plural, "noderesourceconfigurations");
    let version = &crd.spec.versions[0];
    assert!(
        version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some()
    );

    let yaml = serde_yaml::to_string(&crd).unwrap();
    assert!(yaml.contains("resourceDescriptions"));
    assert!(yaml.contains("deviceIDFormat"));
}
