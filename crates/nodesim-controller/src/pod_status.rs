//! Marks workloads bound to virtual nodes as running
//!
//! Nothing actually runs on a virtual node, so this loop plays the part of
//! the kubelet for managed workloads: it reports them running and finishes
//! their deletion.

use crate::error::{ControllerError, Result};
use crate::fleet_controller::MIN_INTERVAL;
use crate::store::{delete_if_exists, list_resources, patch_resource};
use crate::traits::{ListParams, ObjectStore};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use nodesim_core::{JsonPatch, Pod, Resource, SimConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Prefix of the image id reported for every simulated container
pub const IMAGE_ID_PREFIX: &str = "docker://sim.k8s.io/image/";

const RUNNING: &str = "Running";

const POD_CONDITIONS: [&str; 4] = ["Initialized", "Ready", "ContainersReady", "PodScheduled"];

/// Pod status faker configuration
#[derive(Debug, Clone)]
pub struct PodStatusFakerConfig {
    pub interval: Duration,
    /// Host IP reported for every workload
    pub host_ip: String,
    /// Pod IP reported for every workload
    pub pod_ip: String,
}

impl Default for PodStatusFakerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            host_ip: "10.0.0.1".to_string(),
            pod_ip: "10.224.0.1".to_string(),
        }
    }
}

/// The status of a workload that started at `now` with every container ready
pub fn running_status(pod: &Pod, config: &PodStatusFakerConfig, now: DateTime<Utc>) -> PodStatus {
    let container_statuses = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .map(|container| {
            let image = container.image.clone().unwrap_or_default();
            ContainerStatus {
                name: container.name.clone(),
                image_id: format!("{}{}", IMAGE_ID_PREFIX, image),
                image,
                ready: true,
                started: Some(true),
                restart_count: 0,
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(Time(now)),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    let conditions = POD_CONDITIONS
        .iter()
        .map(|type_| PodCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            last_probe_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
            ..Default::default()
        })
        .collect();

    PodStatus {
        phase: Some(RUNNING.to_string()),
        qos_class: Some("Burstable".to_string()),
        host_ip: Some(config.host_ip.clone()),
        pod_ip: Some(config.pod_ip.clone()),
        start_time: Some(Time(now)),
        conditions: Some(conditions),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

/// Reports managed workloads as running
pub struct PodStatusFaker {
    store: Arc<dyn ObjectStore>,
    config: PodStatusFakerConfig,
    sim: Arc<SimConfig>,
}

impl PodStatusFaker {
    pub fn new(store: Arc<dyn ObjectStore>, config: PodStatusFakerConfig, sim: SimConfig) -> Self {
        Self {
            store,
            config,
            sim: Arc::new(sim),
        }
    }

    /// Run the faker until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("Starting pod status faker (interval: {:?})", self.config.interval);

        let mut interval = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod status faker shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!("Pod status sync failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass over every managed, bound workload
    pub async fn sync_once(&self) -> Result<()> {
        let pods: Vec<Pod> = list_resources(
            &*self.store,
            None,
            &ListParams::labels(self.sim.managed_selector()),
        )
        .await?;

        let bound = pods.iter().filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|spec| spec.node_name.as_deref())
                .is_some_and(|node| !node.is_empty())
        });

        for pod in bound {
            let name = pod.name().unwrap_or_default();
            if let Err(e) = self.sync_pod(pod).await {
                warn!(pod = name, "Failed to sync pod status: {}", e);
            }
        }
        Ok(())
    }

    async fn sync_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod
            .resource_key()
            .map_err(|e| ControllerError::internal_error(e.to_string()))?;

        if pod.is_being_deleted() {
            if delete_if_exists(&*self.store, &key).await? {
                debug!(pod = %key, "Deleted terminating pod");
            }
            return Ok(());
        }

        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase == Some(RUNNING) {
            return Ok(());
        }

        let status = nodesim_core::to_value(&running_status(pod, &self.config, Utc::now()))?;
        let patch = JsonPatch::new().set("/status", status, pod.status.is_some());
        patch_resource::<Pod>(&*self.store, &key, &patch).await?;
        debug!(pod = %key, "Marked pod running");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockObjectStore;
    use crate::store::{create_resource, get_resource};
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use nodesim_core::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, node: Option<&str>, managed: bool) -> Pod {
        let labels = managed.then(|| {
            BTreeMap::from([("sim.k8s.io/managed".to_string(), "true".to_string())])
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels,
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        image: Some("nginx:1.27".to_string()),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        image: Some("envoy".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn faker(store: Arc<MockObjectStore>) -> PodStatusFaker {
        PodStatusFaker::new(store, PodStatusFakerConfig::default(), SimConfig::default())
    }

    async fn phase(store: &MockObjectStore, name: &str) -> Option<String> {
        let pod: Pod = get_resource(store, &Pod::key("default", name)).await.unwrap();
        pod.status.and_then(|s| s.phase)
    }

    #[test]
    fn test_running_status_shape() {
        let now = Utc::now();
        let status = running_status(
            &pod("web", Some("n0"), true),
            &PodStatusFakerConfig::default(),
            now,
        );

        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.qos_class.as_deref(), Some("Burstable"));
        assert_eq!(status.host_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(status.pod_ip.as_deref(), Some("10.224.0.1"));
        assert_eq!(status.start_time, Some(Time(now)));

        let conditions = status.conditions.unwrap();
        assert_eq!(conditions.len(), 4);
        assert!(conditions.iter().all(|c| c.status == "True"));

        let containers = status.container_statuses.unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "app");
        assert_eq!(containers[0].image_id, "docker://sim.k8s.io/image/nginx:1.27");
        assert!(containers.iter().all(|c| c.ready && c.started == Some(true)));
    }

    #[tokio::test]
    async fn test_only_managed_bound_pods_are_started() {
        let store = Arc::new(MockObjectStore::new());
        for p in [
            pod("bound", Some("n0"), true),
            pod("pending", None, true),
            pod("foreign", Some("n0"), false),
        ] {
            create_resource(&*store, &p).await.unwrap();
        }

        faker(store.clone()).sync_once().await.unwrap();

        assert_eq!(phase(&store, "bound").await.as_deref(), Some("Running"));
        assert_eq!(phase(&store, "pending").await, None);
        assert_eq!(phase(&store, "foreign").await, None);
    }

    #[tokio::test]
    async fn test_running_pods_are_left_alone() {
        let store = Arc::new(MockObjectStore::new());
        create_resource(&*store, &pod("bound", Some("n0"), true))
            .await
            .unwrap();
        let faker = faker(store.clone());

        faker.sync_once().await.unwrap();
        let before = store.mutation_count();
        faker.sync_once().await.unwrap();
        assert_eq!(store.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_terminating_pod_is_not_started() {
        let store = Arc::new(MockObjectStore::new());
        let mut terminating = pod("leaving", Some("n0"), true);
        terminating.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        create_resource(&*store, &terminating).await.unwrap();
        let key = Pod::key("default", "leaving");
        store.delete(&key).await.unwrap();

        faker(store.clone()).sync_once().await.unwrap();

        let pod: Pod = get_resource(&*store, &key).await.unwrap();
        assert!(pod.is_being_deleted());
        assert_eq!(pod.status.and_then(|s| s.phase), None);
    }

    #[tokio::test]
    async fn test_run_with_zero_interval() {
        let store = Arc::new(MockObjectStore::new());
        create_resource(&*store, &pod("bound", Some("n0"), true))
            .await
            .unwrap();
        let faker = PodStatusFaker::new(
            store.clone(),
            PodStatusFakerConfig {
                interval: Duration::ZERO,
                ..Default::default()
            },
            SimConfig::default(),
        );

        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { faker.run(token).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while phase(&store, "bound").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_failure_is_reported() {
        let store = Arc::new(MockObjectStore::new());
        store.fail_next_lists(1);
        assert!(faker(store).sync_once().await.is_err());
    }
}
