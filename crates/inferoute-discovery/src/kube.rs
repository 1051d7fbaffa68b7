use std::collections::HashMap;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use inferoute_types::{EndpointInfo, RouterError, RouterResult};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::registry::EndpointRegistry;

/// Annotation carrying the comma-separated model list an engine pod serves.
pub const MODELS_ANNOTATION: &str = "inferoute.ai/models";
/// Annotation overriding the engine port (default 8000).
pub const PORT_ANNOTATION: &str = "inferoute.ai/port";
/// Fallback label when the models annotation is absent.
const MODEL_LABEL: &str = "model";

const DEFAULT_ENGINE_PORT: u16 = 8000;

/// Watches engine pods matching a label selector and mirrors every Ready pod
/// with an IP into the endpoint registry.
///
/// The watcher re-lists on reconnect (a `Restarted` event carries the full
/// set), so a dropped watch converges back to the true state instead of
/// accumulating stale endpoints.
pub struct PodDiscovery {
    registry: Arc<EndpointRegistry>,
    label_selector: String,
    namespace: Option<String>,
}

impl PodDiscovery {
    pub fn new(registry: Arc<EndpointRegistry>, label_selector: impl Into<String>) -> Self {
        Self {
            registry,
            label_selector: label_selector.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub async fn spawn(self) -> RouterResult<tokio::task::JoinHandle<()>> {
        let client = Client::try_default().await.map_err(|e| {
            RouterError::config_invalid(format!("cannot build kubernetes client: {e}"))
        })?;
        let pods: Api<Pod> = match &self.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        };

        info!(selector = %self.label_selector, "starting pod discovery");
        let config = watcher::Config::default().labels(&self.label_selector);
        let registry = self.registry;

        Ok(tokio::spawn(async move {
            let mut known: HashMap<String, EndpointInfo> = HashMap::new();
            let mut stream = watcher(pods, config).default_backoff().boxed();

            loop {
                match stream.try_next().await {
                    Ok(Some(watcher::Event::Applied(pod))) => {
                        let name = pod.name_any();
                        match endpoint_from_pod(&pod) {
                            Some(ep) => {
                                known.insert(name, ep);
                            }
                            None => {
                                // Not Ready (yet) or no IP: treat as absent.
                                known.remove(&name);
                            }
                        }
                        registry.replace(known.values().cloned().collect());
                    }
                    Ok(Some(watcher::Event::Deleted(pod))) => {
                        known.remove(&pod.name_any());
                        registry.replace(known.values().cloned().collect());
                    }
                    Ok(Some(watcher::Event::Restarted(pods))) => {
                        known.clear();
                        for pod in &pods {
                            if let Some(ep) = endpoint_from_pod(pod) {
                                known.insert(pod.name_any(), ep);
                            }
                        }
                        info!(endpoints = known.len(), "pod watch re-listed");
                        registry.replace(known.values().cloned().collect());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "pod watch error, backing off");
                    }
                }
            }
        }))
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn endpoint_from_pod(pod: &Pod) -> Option<EndpointInfo> {
    if !pod_is_ready(pod) {
        return None;
    }
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;

    let annotations = pod.annotations();
    let labels = pod.labels();

    let port = annotations
        .get(PORT_ANNOTATION)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_ENGINE_PORT);

    let models: Vec<String> = annotations
        .get(MODELS_ANNOTATION)
        .map(|m| {
            m.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .or_else(|| labels.get(MODEL_LABEL).map(|m| vec![m.clone()]))
        .unwrap_or_default();
    let model_label = models.first().cloned().unwrap_or_default();

    let mut ep = EndpointInfo::new(format!("http://{ip}:{port}"), model_label)
        .with_models(models)
        .with_metadata("pod", pod.name_any());
    if let Some(ns) = pod.namespace() {
        ep = ep.with_metadata("namespace", ns);
    }
    // Surface pod labels as routing tags (e.g. role=prefill).
    if let Some(role) = labels.get("role") {
        ep = ep.with_tags([role.as_str()]);
    }
    Some(ep)
}
