use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type SessionKey = String;
pub type RunId = String;
pub type RelayMessageId = String;

/// A unit of work posted by the backend. `messageId` is the backend's sole identity
/// for this message; the relay mints its own [`RelayMessageId`] at processor entry to
/// disambiguate redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "sentAtMs")]
    pub sent_at_ms: Option<i64>,
    pub input: TaskInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    Chat {
        #[serde(rename = "sessionKey")]
        session_key: SessionKey,
        #[serde(rename = "messageText")]
        message_text: String,
        #[serde(default)]
        media: Vec<MediaItem>,
    },
    Handshake {
        nonce: String,
    },
    SessionNew {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaItem {
    Audio { path: String },
    File { path: String },
}

/// A single file or transcribed-audio attachment returned to the backend, collected
/// from `MEDIA:` directives in the latest assistant transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub path: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "base64Data")]
    pub base64_data: String,
}

/// `{queueLength, inFlight, accepting, maxQueue}`, observed atomically by `getState`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueState {
    #[serde(rename = "queueLength")]
    pub queue_length: usize,
    #[serde(rename = "inFlight")]
    pub in_flight: usize,
    pub accepting: bool,
    #[serde(rename = "maxQueue")]
    pub max_queue: usize,
}

/// An opaque `sessions.usage` response, treated as a numeric map with well-known keys
/// plus common snake_case aliases.
pub type UsageSnapshot = BTreeMap<String, serde_json::Value>;

/// Canonical per-message usage, computed as element-wise `max(0, out - in)` of two
/// raw snapshots. The relay never interprets model names beyond this composition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "cacheReadTokens")]
    pub cache_read_tokens: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChatRunResult {
    Reply {
        message: serde_json::Value,
        #[serde(rename = "runId")]
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<MediaAttachment>,
    },
    NoReply {
        #[serde(rename = "runId")]
        run_id: RunId,
    },
    Error {
        code: String,
        message: String,
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
}

/// Opaque, passed-through-to-backend metadata with a `trace` field the processor
/// always fills in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenClawMeta {
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub trace: TraceInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceInfo {
    #[serde(rename = "backendMessageId")]
    pub backend_message_id: String,
    #[serde(rename = "relayMessageId")]
    pub relay_message_id: RelayMessageId,
    #[serde(rename = "relayInstanceId")]
    pub relay_instance_id: String,
    #[serde(rename = "openclawRunId", skip_serializing_if = "Option::is_none")]
    pub openclaw_run_id: Option<RunId>,
}

/// The backend callback envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RelayCallback {
    #[serde(rename = "relayInstanceId")]
    pub relay_instance_id: String,
    #[serde(rename = "relayMessageId")]
    pub relay_message_id: RelayMessageId,
    #[serde(rename = "finishedAtMs")]
    pub finished_at_ms: i64,
    pub outcome: CallbackOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<CallbackReply>,
    #[serde(rename = "noReply", skip_serializing_if = "Option::is_none")]
    pub no_reply: Option<CallbackNoReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallbackError>,
    #[serde(rename = "openclawMeta", skip_serializing_if = "Option::is_none")]
    pub openclaw_meta: Option<OpenClawMeta>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Reply,
    NoReply,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackReply {
    pub message: serde_json::Value,
    #[serde(rename = "runId")]
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackNoReply {
    #[serde(rename = "runId")]
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackError {
    pub code: String,
    pub message: String,
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}
