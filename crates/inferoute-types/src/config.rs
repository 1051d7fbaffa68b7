use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointInfo;
use crate::error::{RouterError, RouterResult};

/// Service discovery variant selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    /// Comma-separated URL/model lists, resolved once at startup.
    Static,
    /// File-watched dynamic configuration document.
    Dynamic,
    /// Kubernetes pod watcher.
    Cluster,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Cluster => "cluster",
        }
    }
}

impl std::str::FromStr for DiscoveryKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "cluster" => Ok(Self::Cluster),
            other => Err(RouterError::config_invalid(format!(
                "unknown service_discovery {other:?}"
            ))),
        }
    }
}

/// Routing strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingLogic {
    #[serde(rename = "roundrobin")]
    RoundRobin,
    #[serde(rename = "session")]
    Session,
    #[serde(rename = "kvaware")]
    KvAware,
    #[serde(rename = "prefixaware")]
    PrefixAware,
    #[serde(rename = "disaggregated_prefill")]
    DisaggregatedPrefill,
    #[serde(rename = "workflow_aware")]
    WorkflowAware,
    #[serde(rename = "qoe_centric")]
    QoeCentric,
    #[serde(rename = "disaggregated_qoe")]
    DisaggregatedQoe,
    #[serde(rename = "time_tracking")]
    TimeTracking,
}

impl RoutingLogic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "roundrobin",
            Self::Session => "session",
            Self::KvAware => "kvaware",
            Self::PrefixAware => "prefixaware",
            Self::DisaggregatedPrefill => "disaggregated_prefill",
            Self::WorkflowAware => "workflow_aware",
            Self::QoeCentric => "qoe_centric",
            Self::DisaggregatedQoe => "disaggregated_qoe",
            Self::TimeTracking => "time_tracking",
        }
    }
}

impl std::str::FromStr for RoutingLogic {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roundrobin" => Ok(Self::RoundRobin),
            "session" => Ok(Self::Session),
            "kvaware" => Ok(Self::KvAware),
            "prefixaware" => Ok(Self::PrefixAware),
            "disaggregated_prefill" => Ok(Self::DisaggregatedPrefill),
            "workflow_aware" => Ok(Self::WorkflowAware),
            "qoe_centric" => Ok(Self::QoeCentric),
            "disaggregated_qoe" => Ok(Self::DisaggregatedQoe),
            "time_tracking" => Ok(Self::TimeTracking),
            other => Err(RouterError::config_invalid(format!(
                "unknown routing_logic {other:?}"
            ))),
        }
    }
}

fn default_session_key() -> String {
    "x-user-id".to_string()
}
fn default_kv_aware_threshold() -> usize {
    2000
}
fn default_workflow_ttl() -> u64 {
    3600
}
fn default_max_workflows() -> usize {
    1000
}
fn default_batching_preference() -> f64 {
    0.8
}
fn default_max_message_queue_size() -> usize {
    1000
}
fn default_max_message_size() -> usize {
    1_048_576
}
fn default_priority_header() -> String {
    crate::headers::PRIORITY.to_string()
}
fn default_expected_output_len_header() -> String {
    crate::headers::EXPECTED_OUTPUT_TOKENS.to_string()
}
fn default_sla_header() -> String {
    crate::headers::SLA_TARGET_MS.to_string()
}
fn default_prefill_tag() -> String {
    "prefill".to_string()
}
fn default_decoding_tag() -> String {
    "decoding".to_string()
}

/// The dynamic configuration document.
///
/// Consumed from the file watched by dynamic discovery or from
/// `POST /reconfigure`; also assembled from CLI flags at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub service_discovery: DiscoveryKind,
    pub routing_logic: RoutingLogic,

    /// Comma-separated URL list for static discovery.
    pub static_backends: Option<String>,
    /// Parallel comma-separated model-label list.
    pub static_models: Option<String>,
    /// Parallel comma-separated model-type list, stored as endpoint tags.
    pub static_model_types: Option<String>,

    #[serde(default = "default_session_key")]
    pub session_key: String,
    #[serde(default = "default_kv_aware_threshold")]
    pub kv_aware_threshold: usize,
    /// Base URL of the KV-cache oracle; KV-aware degrades to consistent
    /// hashing when unset.
    pub kv_oracle_url: Option<String>,

    #[serde(default = "default_workflow_ttl")]
    pub workflow_ttl: u64,
    #[serde(default = "default_max_workflows")]
    pub max_workflows: usize,
    #[serde(default = "default_batching_preference")]
    pub batching_preference: f64,

    #[serde(default = "default_max_message_queue_size")]
    pub max_message_queue_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_priority_header")]
    pub priority_header: String,
    #[serde(default = "default_expected_output_len_header")]
    pub expected_output_len_header: String,
    #[serde(default = "default_sla_header")]
    pub sla_header: String,

    #[serde(default = "default_prefill_tag")]
    pub prefill_tag: String,
    #[serde(default = "default_decoding_tag")]
    pub decoding_tag: String,

    /// Label selector for cluster discovery.
    pub pod_label_selector: Option<String>,

    pub api_key: Option<String>,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            service_discovery: DiscoveryKind::Static,
            routing_logic: RoutingLogic::RoundRobin,
            static_backends: None,
            static_models: None,
            static_model_types: None,
            session_key: default_session_key(),
            kv_aware_threshold: default_kv_aware_threshold(),
            kv_oracle_url: None,
            workflow_ttl: default_workflow_ttl(),
            max_workflows: default_max_workflows(),
            batching_preference: default_batching_preference(),
            max_message_queue_size: default_max_message_queue_size(),
            max_message_size: default_max_message_size(),
            priority_header: default_priority_header(),
            expected_output_len_header: default_expected_output_len_header(),
            sla_header: default_sla_header(),
            prefill_tag: default_prefill_tag(),
            decoding_tag: default_decoding_tag(),
            pod_label_selector: None,
            api_key: None,
        }
    }
}

impl DynamicConfig {
    pub fn parse(bytes: &[u8]) -> RouterResult<Self> {
        let config: DynamicConfig = serde_json::from_slice(bytes)
            .map_err(|e| RouterError::config_invalid(format!("malformed document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RouterResult<()> {
        if self.service_discovery == DiscoveryKind::Static && self.static_backends.is_none() {
            return Err(RouterError::config_invalid(
                "static discovery requires static_backends",
            ));
        }
        if !(0.0..=1.0).contains(&self.batching_preference) {
            return Err(RouterError::config_invalid(format!(
                "batching_preference {} outside [0, 1]",
                self.batching_preference
            )));
        }
        if self.max_workflows == 0 {
            return Err(RouterError::config_invalid("max_workflows must be > 0"));
        }
        if self.max_message_queue_size == 0 {
            return Err(RouterError::config_invalid(
                "max_message_queue_size must be > 0",
            ));
        }
        // Endpoint list consistency is checked here so a bad document is
        // rejected before any state is swapped.
        if self.static_backends.is_some() {
            self.static_endpoints()?;
        }
        Ok(())
    }

    /// Materialize the static backend lists into endpoint descriptors.
    pub fn static_endpoints(&self) -> RouterResult<Vec<EndpointInfo>> {
        let backends = self
            .static_backends
            .as_deref()
            .ok_or_else(|| RouterError::config_invalid("static_backends missing"))?;

        let urls: Vec<&str> = backends
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(RouterError::config_invalid("static_backends is empty"));
        }

        let models: Vec<&str> = match self.static_models.as_deref() {
            Some(m) => m.split(',').map(str::trim).collect(),
            None => vec![""; urls.len()],
        };
        if models.len() != urls.len() {
            return Err(RouterError::config_invalid(format!(
                "static_models has {} entries for {} backends",
                models.len(),
                urls.len()
            )));
        }

        let types: Option<Vec<&str>> = self
            .static_model_types
            .as_deref()
            .map(|t| t.split(',').map(str::trim).collect());
        if let Some(types) = &types {
            if types.len() != urls.len() {
                return Err(RouterError::config_invalid(format!(
                    "static_model_types has {} entries for {} backends",
                    types.len(),
                    urls.len()
                )));
            }
        }

        let endpoints = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let mut ep = EndpointInfo::new(*url, models[i]);
                if let Some(types) = &types {
                    if !types[i].is_empty() {
                        ep = ep.with_tags([types[i]]);
                    }
                }
                ep
            })
            .collect();
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let config = DynamicConfig::parse(
            br#"{"service_discovery":"static","routing_logic":"roundrobin",
                 "static_backends":"http://a:8000,http://b:8000",
                 "static_models":"llama,llama"}"#,
        )
        .unwrap();
        assert_eq!(config.service_discovery, DiscoveryKind::Static);
        assert_eq!(config.session_key, "x-user-id");
        assert_eq!(config.kv_aware_threshold, 2000);
        assert_eq!(config.static_endpoints().unwrap().len(), 2);
    }

    #[test]
    fn rejects_unknown_routing_logic() {
        let err = DynamicConfig::parse(
            br#"{"service_discovery":"static","routing_logic":"bogus","static_backends":"http://a:8000"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn rejects_mismatched_model_list() {
        let err = DynamicConfig::parse(
            br#"{"service_discovery":"static","routing_logic":"roundrobin",
                 "static_backends":"http://a:8000,http://b:8000","static_models":"llama"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn rejects_out_of_range_batching_preference() {
        let mut config = DynamicConfig {
            static_backends: Some("http://a:8000".into()),
            static_models: Some("llama".into()),
            ..DynamicConfig::default()
        };
        config.batching_preference = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn model_types_become_tags() {
        let config = DynamicConfig {
            static_backends: Some("http://a:8000,http://b:8000".into()),
            static_models: Some("whisper,llama".into()),
            static_model_types: Some("transcription,chat".into()),
            ..DynamicConfig::default()
        };
        let endpoints = config.static_endpoints().unwrap();
        assert!(endpoints[0].has_tag("transcription"));
        assert!(endpoints[1].has_tag("chat"));
    }
}
