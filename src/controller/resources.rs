//! Builders for the cluster objects a sandbox owns: workload pod, service,
//! network policies, and persistent volume claim.
//!
//! Pure functions from the declarative records to k8s-openapi objects, so
//! the materialization rules are testable without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, Pod, PodSpec, SeccompProfile, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::types::sandbox::{FilesystemConfig, SandboxSecurityContext};
use crate::types::{
    LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_POOL, LABEL_RUNTIME, LABEL_SANDBOX, MANAGER_NAME,
    RuntimeEnvironment, Sandbox, SandboxProfile, WarmPool,
};
use crate::validation::sanitize_runtime_label;

/// Port the in-sandbox agent listens on.
pub const SANDBOX_PORT: i32 = 8080;

/// Private ranges excluded from declared-egress policies.
const RFC1918_BLOCKS: &[&str] = &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

const DEFAULT_CPU: &str = "500m";
const DEFAULT_MEMORY: &str = "512Mi";

/// Labels for a sandbox-owned pod.
pub fn sandbox_labels(sandbox_name: &str, runtime: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), "sandbox".to_string());
    labels.insert(LABEL_SANDBOX.to_string(), sandbox_name.to_string());
    labels.insert(LABEL_RUNTIME.to_string(), sanitize_runtime_label(runtime));
    labels
}

/// Labels for a WarmPool record itself; the allocator selects pools by the
/// runtime label.
pub fn warm_pool_labels(runtime: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_RUNTIME.to_string(), sanitize_runtime_label(runtime));
    labels
}

/// Labels for a warm-pool member pod.
pub fn warm_pod_labels(pool_name: &str, runtime: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), "warmpod".to_string());
    labels.insert(LABEL_POOL.to_string(), pool_name.to_string());
    labels.insert(LABEL_RUNTIME.to_string(), sanitize_runtime_label(runtime));
    labels
}

pub fn workload_name(sandbox_name: &str) -> String {
    format!("sandbox-{sandbox_name}")
}

pub fn service_name(sandbox_name: &str) -> String {
    format!("sandbox-{sandbox_name}")
}

pub fn pvc_name(sandbox_name: &str) -> String {
    format!("sandbox-{sandbox_name}-data")
}

/// In-cluster DNS name clients reach the sandbox service at.
pub fn service_endpoint(sandbox_name: &str, namespace: &str) -> String {
    format!("{}.{namespace}.svc.cluster.local", service_name(sandbox_name))
}

fn quantity_limits(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
    limits.insert("memory".to_string(), Quantity(memory.to_string()));
    limits
}

fn container_security_context(sandbox: &Sandbox) -> SecurityContext {
    let security = sandbox.spec.security_context.clone().unwrap_or_default();
    let read_only_root = sandbox
        .spec
        .filesystem
        .as_ref()
        .map(|f| f.read_only_root)
        .unwrap_or(true);

    // Explicit profile wins; the high level gets the runtime default
    // profile, standard runs unconfined by seccomp.
    let seccomp = match security.seccomp_profile {
        Some(profile) => Some(SeccompProfile {
            type_: "Localhost".to_string(),
            localhost_profile: Some(profile),
        }),
        None if sandbox.spec.security_level == "high" => Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        None => None,
    };

    SecurityContext {
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(read_only_root),
        run_as_non_root: Some(true),
        run_as_user: Some(security.run_as_user),
        run_as_group: Some(security.run_as_group),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        seccomp_profile: seccomp,
        ..Default::default()
    }
}

/// Fold a profile's defaults into the fields the sandbox left unset. The
/// sandbox's own declarations always win; profiles are immutable inputs to
/// materialization.
pub fn apply_profile(sandbox: &Sandbox, profile: Option<&SandboxProfile>) -> Sandbox {
    let Some(profile) = profile else {
        return sandbox.clone();
    };
    let mut effective = sandbox.clone();

    if effective.spec.resources.is_none() {
        effective.spec.resources = profile.spec.resource_defaults.clone();
    }
    if effective.spec.security_context.is_none()
        && let Some(seccomp) = &profile.spec.seccomp_profile
    {
        effective.spec.security_context = Some(SandboxSecurityContext {
            seccomp_profile: Some(seccomp.clone()),
            ..Default::default()
        });
    }
    if effective.spec.filesystem.is_none()
        && let Some(filesystem) = &profile.spec.filesystem_config
        && !filesystem.writable_paths.is_empty()
    {
        effective.spec.filesystem = Some(FilesystemConfig {
            read_only_root: true,
            writable_paths: filesystem.writable_paths.clone(),
        });
    }
    effective
}

/// Build the workload pod for a sandbox. Writable paths become emptyDir
/// mounts so the root filesystem can stay read-only.
pub fn sandbox_pod(sandbox: &Sandbox, runtime: &RuntimeEnvironment, namespace: &str) -> Pod {
    let name = sandbox.name_any();
    let pod_name = workload_name(&name);
    let labels = sandbox_labels(&name, &sandbox.spec.runtime);

    let resources = sandbox.spec.resources.clone().unwrap_or_default();
    let cpu = resources.cpu.as_deref().unwrap_or(DEFAULT_CPU);
    let memory = resources.memory.as_deref().unwrap_or(DEFAULT_MEMORY);
    let mut limits = quantity_limits(cpu, memory);
    if let Some(ephemeral) = &resources.ephemeral_storage {
        limits.insert(
            "ephemeral-storage".to_string(),
            Quantity(ephemeral.clone()),
        );
    }

    let writable_paths = sandbox
        .spec
        .filesystem
        .clone()
        .unwrap_or_default()
        .writable_paths;

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (index, path) in writable_paths.iter().enumerate() {
        let volume_name = format!("writable-{index}");
        volumes.push(Volume {
            name: volume_name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: path.clone(),
            ..Default::default()
        });
    }

    if sandbox
        .spec
        .storage
        .as_ref()
        .map(|s| s.persistent)
        .unwrap_or(false)
    {
        volumes.push(Volume {
            name: "persistent-data".to_string(),
            persistent_volume_claim: Some(
                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(&name),
                    ..Default::default()
                },
            ),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "persistent-data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        });
    }

    // CPU pinning relies on Guaranteed QoS: requests must equal limits.
    let requests = if resources.cpu_pinning {
        Some(limits.clone())
    } else {
        None
    };

    let container = Container {
        name: "sandbox".to_string(),
        image: Some(runtime.spec.image.clone()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep infinity".to_string(),
        ]),
        security_context: Some(container_security_context(sandbox)),
        resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
            limits: Some(limits),
            requests,
            ..Default::default()
        }),
        volume_mounts: if mounts.is_empty() {
            None
        } else {
            Some(mounts)
        },
        stdin: Some(true),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: owner_refs(sandbox),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            volumes: if volumes.is_empty() {
                None
            } else {
                Some(volumes)
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the workload pod for a warm-pool member.
pub fn warm_pod_workload(
    pool: &WarmPool,
    owner: &crate::types::WarmPod,
    pod_name: &str,
    namespace: &str,
    image: &str,
) -> Pod {
    let pool_name = pool.name_any();
    let labels = warm_pod_labels(&pool_name, &pool.spec.runtime);

    let resources = pool.spec.resources.clone().unwrap_or_default();
    let cpu = resources.cpu.as_deref().unwrap_or(DEFAULT_CPU);
    let memory = resources.memory.as_deref().unwrap_or(DEFAULT_MEMORY);

    let container = Container {
        name: "sandbox".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep infinity".to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
            limits: Some(quantity_limits(cpu, memory)),
            ..Default::default()
        }),
        stdin: Some(true),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: owner_refs(owner),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ClusterIP service fronting a sandbox.
pub fn sandbox_service(sandbox: &Sandbox, namespace: &str) -> Service {
    let name = sandbox.name_any();
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_SANDBOX.to_string(), name.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&name)),
            namespace: Some(namespace.to_string()),
            labels: Some(sandbox_labels(&name, &sandbox.spec.runtime)),
            owner_references: owner_refs(sandbox),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("agent".to_string()),
                port: SANDBOX_PORT,
                target_port: Some(IntOrString::Int(SANDBOX_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the PVC for a sandbox that asked for persistent storage.
pub fn sandbox_pvc(sandbox: &Sandbox, namespace: &str) -> PersistentVolumeClaim {
    let name = sandbox.name_any();
    let size = sandbox
        .spec
        .storage
        .as_ref()
        .and_then(|s| s.volume_size.clone())
        .unwrap_or_else(|| "1Gi".to_string());

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(&name)),
            namespace: Some(namespace.to_string()),
            labels: Some(sandbox_labels(&name, &sandbox.spec.runtime)),
            owner_references: owner_refs(sandbox),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the network policies for a sandbox:
///
/// 1. default-deny on ingress and egress for this sandbox's pods;
/// 2. allow ingress from the gateway namespace on the sandbox port, and
///    egress back to the gateway;
/// 3. if egress rules are declared, allow egress to the public internet on
///    the declared ports only (RFC 1918 ranges stay blocked).
pub fn network_policies(sandbox: &Sandbox, namespace: &str, gateway_namespace: &str) -> Vec<NetworkPolicy> {
    let name = sandbox.name_any();
    let mut pod_selector_labels = BTreeMap::new();
    pod_selector_labels.insert(LABEL_SANDBOX.to_string(), name.clone());
    let pod_selector = LabelSelector {
        match_labels: Some(pod_selector_labels),
        ..Default::default()
    };

    let mut gateway_ns_labels = BTreeMap::new();
    gateway_ns_labels.insert(
        "kubernetes.io/metadata.name".to_string(),
        gateway_namespace.to_string(),
    );
    let gateway_peer = NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(gateway_ns_labels),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut policies = vec![
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(format!("sandbox-{name}-deny-all")),
                namespace: Some(namespace.to_string()),
                owner_references: owner_refs(sandbox),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: pod_selector.clone(),
                ingress: Some(vec![]),
                egress: Some(vec![]),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            }),
        },
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(format!("sandbox-{name}-gateway")),
                namespace: Some(namespace.to_string()),
                owner_references: owner_refs(sandbox),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: pod_selector.clone(),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![gateway_peer.clone()]),
                    ports: Some(vec![NetworkPolicyPort {
                        port: Some(IntOrString::Int(SANDBOX_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                }]),
                egress: Some(vec![NetworkPolicyEgressRule {
                    to: Some(vec![gateway_peer]),
                    ports: None,
                }]),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            }),
        },
    ];

    let egress_rules = sandbox
        .spec
        .network_access
        .as_ref()
        .map(|n| n.egress.clone())
        .unwrap_or_default();

    if !egress_rules.is_empty() {
        let ports: Vec<NetworkPolicyPort> = egress_rules
            .iter()
            .flat_map(|rule| rule.ports.iter())
            .map(|rule| NetworkPolicyPort {
                port: Some(IntOrString::Int(rule.port)),
                protocol: Some(rule.protocol.clone()),
                ..Default::default()
            })
            .collect();

        policies.push(NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(format!("sandbox-{name}-egress")),
                namespace: Some(namespace.to_string()),
                owner_references: owner_refs(sandbox),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector,
                ingress: None,
                egress: Some(vec![NetworkPolicyEgressRule {
                    to: Some(vec![NetworkPolicyPeer {
                        ip_block: Some(IPBlock {
                            cidr: "0.0.0.0/0".to_string(),
                            except: Some(
                                RFC1918_BLOCKS.iter().map(|b| b.to_string()).collect(),
                            ),
                        }),
                        ..Default::default()
                    }]),
                    ports: Some(ports),
                }]),
                policy_types: Some(vec!["Egress".to_string()]),
            }),
        });
    }

    policies
}

fn owner_refs<K>(owner: &K) -> Option<Vec<OwnerReference>>
where
    K: kube::Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).map(|r| vec![r])
}
