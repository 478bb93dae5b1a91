//! CRD manifest tests: the five custom resource definitions must carry the
//! right group, scope, and status subresources, since every reconciler and
//! the allocator depend on them.
//!
//! Run with: cargo test --test crd_manifest_test

use kube::CustomResourceExt;

use llmsafespace::types::{RuntimeEnvironment, Sandbox, SandboxProfile, WarmPod, WarmPool};

#[test]
fn test_all_kinds_share_the_api_group() {
    assert_eq!(Sandbox::crd().spec.group, "llmsafespace.dev");
    assert_eq!(SandboxProfile::crd().spec.group, "llmsafespace.dev");
    assert_eq!(RuntimeEnvironment::crd().spec.group, "llmsafespace.dev");
    assert_eq!(WarmPool::crd().spec.group, "llmsafespace.dev");
    assert_eq!(WarmPod::crd().spec.group, "llmsafespace.dev");
}

#[test]
fn test_version_is_v1() {
    for crd in [
        Sandbox::crd(),
        SandboxProfile::crd(),
        RuntimeEnvironment::crd(),
        WarmPool::crd(),
        WarmPod::crd(),
    ] {
        assert_eq!(crd.spec.versions.len(), 1);
        assert_eq!(crd.spec.versions[0].name, "v1");
        assert!(crd.spec.versions[0].served);
        assert!(crd.spec.versions[0].storage);
    }
}

#[test]
fn test_runtime_environment_is_cluster_scoped() {
    assert_eq!(RuntimeEnvironment::crd().spec.scope, "Cluster");
    assert_eq!(Sandbox::crd().spec.scope, "Namespaced");
    assert_eq!(WarmPool::crd().spec.scope, "Namespaced");
    assert_eq!(WarmPod::crd().spec.scope, "Namespaced");
}

#[test]
fn test_status_subresources_present() {
    for crd in [
        Sandbox::crd(),
        RuntimeEnvironment::crd(),
        WarmPool::crd(),
        WarmPod::crd(),
    ] {
        let version = &crd.spec.versions[0];
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some(),
            "missing status subresource on {}",
            crd.spec.names.kind
        );
    }
}

#[test]
fn test_plural_names() {
    assert_eq!(Sandbox::crd().spec.names.plural, "sandboxes");
    assert_eq!(SandboxProfile::crd().spec.names.plural, "sandboxprofiles");
    assert_eq!(
        RuntimeEnvironment::crd().spec.names.plural,
        "runtimeenvironments"
    );
    assert_eq!(WarmPool::crd().spec.names.plural, "warmpools");
    assert_eq!(WarmPod::crd().spec.names.plural, "warmpods");
}

#[test]
fn test_manifests_serialize_to_yaml() {
    for crd in [
        Sandbox::crd(),
        SandboxProfile::crd(),
        RuntimeEnvironment::crd(),
        WarmPool::crd(),
        WarmPod::crd(),
    ] {
        let yaml = serde_yaml::to_string(&crd).expect("CRD must serialize");
        assert!(yaml.contains("llmsafespace.dev"));
    }
}
