//! Status documents written for virtual nodes: conditions, allocatable and leases

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use nodesim_core::{Lease, ObjectMeta, Pod, ResourceQuantity, SimConfig};
use std::collections::BTreeMap;
use tracing::warn;

/// (type, status, reason, message) of every condition a healthy node reports
const CANONICAL_CONDITIONS: [(&str, &str, &str, &str); 5] = [
    ("Ready", "True", "KubeletReady", "kubelet is ready."),
    (
        "OutOfDisk",
        "False",
        "KubeletHasSufficientDisk",
        "kubelet has sufficient disk space available",
    ),
    (
        "MemoryPressure",
        "False",
        "KubeletHasSufficientMemory",
        "kubelet has sufficient memory available",
    ),
    (
        "DiskPressure",
        "False",
        "KubeletHasNoDiskPressure",
        "kubelet has no disk pressure",
    ),
    (
        "NetworkUnavailable",
        "False",
        "RouteCreated",
        "RouteController created a route",
    ),
];

/// The ready, no-pressure condition set, stamped with `now`
pub fn canonical_conditions(now: DateTime<Utc>) -> Vec<NodeCondition> {
    CANONICAL_CONDITIONS
        .iter()
        .map(|(type_, status, reason, message)| NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_heartbeat_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
        })
        .collect()
}

/// Capacity minus what the bound workloads consume
///
/// Every container limit of every workload is subtracted from the matching
/// capacity entry, and one pod slot is taken per workload when capacity
/// advertises `pods`. Limits for resources the node does not advertise, and
/// negative or malformed limits, are ignored. Capacity entries that do not
/// parse are copied through unchanged.
pub fn compute_allocatable(
    node_name: &str,
    capacity: &BTreeMap<String, Quantity>,
    workloads: &[Pod],
) -> BTreeMap<String, Quantity> {
    let mut remaining: BTreeMap<&str, ResourceQuantity> = BTreeMap::new();
    let mut allocatable = BTreeMap::new();

    for (name, quantity) in capacity {
        match ResourceQuantity::try_from(quantity) {
            Ok(parsed) => {
                remaining.insert(name.as_str(), parsed);
            }
            Err(e) => {
                warn!(node = node_name, resource = %name, "Unparsable capacity: {}", e);
                allocatable.insert(name.clone(), quantity.clone());
            }
        }
    }

    let limits = workloads
        .iter()
        .filter_map(|pod| pod.spec.as_ref())
        .flat_map(|spec| spec.containers.iter())
        .filter_map(|container| container.resources.as_ref())
        .filter_map(|resources| resources.limits.as_ref())
        .flat_map(|limits| limits.iter());

    for (name, limit) in limits {
        let Some(left) = remaining.get_mut(name.as_str()) else {
            continue;
        };
        let limit = match ResourceQuantity::try_from(limit) {
            Ok(limit) if !limit.is_negative() => limit,
            Ok(_) | Err(_) => {
                warn!(node = node_name, resource = %name, "Ignoring invalid limit {}", limit.0);
                continue;
            }
        };
        match left.checked_sub(&limit) {
            Ok(value) => *left = value,
            Err(e) => warn!(node = node_name, resource = %name, "{}", e),
        }
    }

    if let Some(pods) = remaining.get_mut("pods") {
        let count = ResourceQuantity::from_units(
            i64::try_from(workloads.len()).unwrap_or(i64::MAX),
            pods.format(),
        );
        if let Ok(value) = pods.checked_sub(&count) {
            *pods = value;
        }
    }

    allocatable.extend(
        remaining
            .into_iter()
            .map(|(name, quantity)| (name.to_string(), quantity.to_quantity())),
    );
    allocatable
}

/// Lease spec renewed on every heartbeat
pub fn lease_spec(node_name: &str, config: &SimConfig, now: DateTime<Utc>) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(node_name.to_string()),
        lease_duration_seconds: Some(config.lease_duration_secs),
        renew_time: Some(MicroTime(now)),
        ..Default::default()
    }
}

/// A fresh liveness lease for `node_name`
pub fn new_lease(node_name: &str, config: &SimConfig, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(node_name.to_string()),
            namespace: Some(config.lease_namespace.clone()),
            ..Default::default()
        },
        spec: Some(lease_spec(node_name, config, now)),
    }
}
