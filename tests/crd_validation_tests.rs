//! # CRD Validation Tests
//!
//! Deserialization tests over full Component manifests, to catch schema
//! drift early: every sourceRef variant, defaults for omitted fields, and
//! the generated CRD metadata.

use component_controller::crd::{Component, SourceReference};
use kube::core::CustomResourceExt;

#[test]
fn test_full_component_with_http_source() {
    let yaml = r#"
apiVersion: component-management.microscaler.io/v1
kind: Component
metadata:
  name: billing
  namespace: services
spec:
  sourceRef:
    httpRepository:
      url: https://artifacts.example.com/charts/billing.tgz
      digestHeader: x-checksum
      revisionHeader: x-revision
  revision: "1.4.2"
  sticky: true
  path: charts/billing
  values:
    replicas: 2
    image:
      tag: v1.4.2
  valuesFrom:
    - name: billing-values
      key: values.yaml
    - name: shared-values
      namespace: platform
  decryption:
    provider: sops
    secretRef:
      name: sops-keys
  postBuild:
    substitute:
      REGION: eu-west-1
    substituteFrom:
      - name: cluster-vars
  dependencies:
    - name: database
    - name: dns
      namespace: infra
  requeueIntervalSeconds: 600
  timeoutSeconds: 300
"#;

    let component: Component = serde_yaml::from_str(yaml).expect("full component deserializes");

    match &component.spec.source_ref {
        SourceReference::HttpRepository(repository) => {
            assert_eq!(
                repository.url,
                "https://artifacts.example.com/charts/billing.tgz"
            );
            assert_eq!(repository.digest_header.as_deref(), Some("x-checksum"));
            assert_eq!(repository.revision_header.as_deref(), Some("x-revision"));
        }
        other => panic!("unexpected source variant: {other:?}"),
    }
    assert_eq!(component.spec.revision.as_deref(), Some("1.4.2"));
    assert!(component.spec.sticky);
    assert_eq!(component.spec.path.as_deref(), Some("charts/billing"));
    assert_eq!(component.spec.values_from.len(), 2);
    assert_eq!(
        component.spec.values_from[1].namespace.as_deref(),
        Some("platform")
    );
    let decryption = component.spec.decryption.as_ref().unwrap();
    assert_eq!(decryption.provider.as_deref(), Some("sops"));
    assert_eq!(decryption.secret_ref.name, "sops-keys");
    let post_build = component.spec.post_build.as_ref().unwrap();
    assert_eq!(post_build.substitute.as_ref().unwrap()["REGION"], "eu-west-1");
    assert_eq!(post_build.substitute_from[0].name, "cluster-vars");
    assert_eq!(component.spec.dependencies.len(), 2);
    assert_eq!(
        component.spec.dependencies[1].name.namespace.as_deref(),
        Some("infra")
    );
    assert_eq!(component.spec.requeue_interval_seconds, Some(600));
    assert_eq!(component.spec.timeout_seconds, Some(300));
}

#[test]
fn test_minimal_component_defaults() {
    let yaml = r#"
apiVersion: component-management.microscaler.io/v1
kind: Component
metadata:
  name: minimal
spec:
  sourceRef:
    fluxGitRepository:
      name: deployments
      namespace: flux-system
"#;

    let component: Component = serde_yaml::from_str(yaml).expect("minimal component deserializes");
    assert!(matches!(
        component.spec.source_ref,
        SourceReference::FluxGitRepository(_)
    ));
    assert!(!component.spec.sticky);
    assert!(component.spec.revision.is_none());
    assert!(component.spec.path.is_none());
    assert!(component.spec.values.is_none());
    assert!(component.spec.values_from.is_empty());
    assert!(component.spec.decryption.is_none());
    assert!(component.spec.post_build.is_none());
    assert!(component.spec.dependencies.is_empty());
    assert!(component.spec.requeue_interval_seconds.is_none());
    assert!(component.spec.timeout_seconds.is_none());
}

#[test]
fn test_every_flux_source_variant_deserializes() {
    for (variant, expected) in [
        ("fluxGitRepository", "git"),
        ("fluxOciRepository", "oci"),
        ("fluxBucket", "bucket"),
        ("fluxHelmChart", "chart"),
    ] {
        let yaml = format!(
            r#"
apiVersion: component-management.microscaler.io/v1
kind: Component
metadata:
  name: variant-check
spec:
  sourceRef:
    {variant}:
      name: {expected}
      namespace: flux-system
"#
        );
        let component: Component = serde_yaml::from_str(&yaml).expect("variant deserializes");
        let name = match &component.spec.source_ref {
            SourceReference::FluxGitRepository(n)
            | SourceReference::FluxOciRepository(n)
            | SourceReference::FluxBucket(n)
            | SourceReference::FluxHelmChart(n) => &n.name,
            SourceReference::HttpRepository(_) => panic!("unexpected http variant"),
        };
        assert_eq!(name, expected);
    }
}

#[test]
fn test_source_ref_wire_shape_is_untagged_in_yaml_and_json() {
    let yaml = r#"
apiVersion: component-management.microscaler.io/v1
kind: Component
metadata:
  name: roundtrip
spec:
  sourceRef:
    httpRepository:
      url: https://artifacts.example.com/app.tgz
"#;
    let component: Component = serde_yaml::from_str(yaml).expect("manifest deserializes");

    // YAML serialization keeps the plain `variant: { ... }` map form.
    let rendered = serde_yaml::to_string(&component.spec).unwrap();
    assert!(rendered.contains("httpRepository:"));
    assert!(!rendered.contains('!'));

    // The JSON wire format is the same map shape.
    let json = serde_json::to_value(&component.spec).unwrap();
    assert!(json["sourceRef"]["httpRepository"]["url"].is_string());
}

#[test]
fn test_component_without_source_ref_is_rejected() {
    let yaml = r#"
apiVersion: component-management.microscaler.io/v1
kind: Component
metadata:
  name: broken
spec: {}
"#;
    assert!(serde_yaml::from_str::<Component>(yaml).is_err());
}

#[test]
fn test_generated_crd_metadata() {
    let crd = Component::crd();
    assert_eq!(crd.spec.group, "component-management.microscaler.io");
    assert_eq!(crd.spec.names.kind, "Component");
    assert_eq!(crd.spec.names.plural, "components");
    assert_eq!(crd.spec.versions.len(), 1);
    assert_eq!(crd.spec.versions[0].name, "v1");
    assert!(crd.spec.versions[0].subresources.as_ref().unwrap().status.is_some());
}
