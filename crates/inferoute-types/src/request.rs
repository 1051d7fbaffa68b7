use serde::Deserialize;
use serde_json::Value;

/// Workflow metadata carried in the request body.
///
/// Accepted equivalently to the `x-workflow-id` / `x-agent-id` /
/// `x-parent-request-id` headers; the header wins when both are present.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct WorkflowMetadata {
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub parent_request_id: Option<String>,
    pub context_sharing_strategy: Option<String>,
}

/// One turn of a chat `messages` array. Only the fields routing needs.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MessageTurn {
    #[serde(default)]
    pub role: String,
    /// Either a plain string or an array of content parts; kept opaque and
    /// only walked for token estimation.
    #[serde(default)]
    pub content: Value,
}

/// Inference phase of a request under disaggregated prefill/decode routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Prefill,
    Decode,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefill => "prefill",
            Self::Decode => "decode",
        }
    }
}

/// Minimal typed projection of an inference request body.
///
/// Only what routing needs is parsed; the original body bytes are forwarded
/// upstream untouched. Unknown fields are ignored, and an unparsable body
/// projects to `RequestView::default()` so phase detection can still run.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RequestView {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessageTurn>,
    /// `/v1/completions` prompt: string or array of strings.
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub stream: bool,
    pub workflow_metadata: Option<WorkflowMetadata>,
    pub parent_id: Option<String>,
    pub previous_message_id: Option<String>,
}

impl RequestView {
    /// Strict parse for endpoints that require a JSON body (400 on failure).
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Lossy parse for passthrough paths: an unparsable body projects to the
    /// default view, which classifies as prefill.
    pub fn parse_lossy(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    /// A request is in the prefill phase iff its messages array carries no
    /// assistant turn and it references no prior message.
    pub fn is_prefill(&self) -> bool {
        let has_assistant = self.messages.iter().any(|m| m.role == "assistant");
        !has_assistant && self.parent_id.is_none() && self.previous_message_id.is_none()
    }

    pub fn phase(&self) -> RequestPhase {
        if self.is_prefill() {
            RequestPhase::Prefill
        } else {
            RequestPhase::Decode
        }
    }

    /// Approximate prompt token count as whitespace-separated words across
    /// the prompt and all message contents. This overcounts long words and
    /// undercounts languages without spaces, which is acceptable: the count
    /// only gates the KV-oracle bypass threshold.
    pub fn approx_prompt_tokens(&self) -> usize {
        let mut count = count_value_words(&self.prompt);
        for turn in &self.messages {
            count += count_value_words(&turn.content);
        }
        count
    }
}

fn count_value_words(value: &Value) -> usize {
    match value {
        Value::String(s) => s.split_whitespace().count(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.split_whitespace().count(),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|s| s.split_whitespace().count())
                    .unwrap_or(0),
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}
