use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire frame exchanged over the duplex transport. Strictly tagged and rejects
/// unknown fields so a malformed peer is caught at the parse boundary rather than
/// silently accepted with defaulted fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case", deny_unknown_fields)]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    Event {
        event: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", default)]
    pub retry_after_ms: Option<u64>,
}

/// Parses one incoming text frame. Malformed text is never fatal to the
/// connection -- callers log at debug and continue.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(text)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub policy: HelloPolicy,
    #[serde(default)]
    pub features: Option<HelloFeatures>,
    #[serde(default)]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPolicy {
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloFeatures {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAuth {
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectClient {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectDevice {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "signedAt")]
    pub signed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Params for the `connect` request.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ConnectClient,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    pub device: ConnectDevice,
}

/// The canonical payload an identity collaborator signs:
/// `v2|deviceId|clientId|clientMode|role|sortedScopesCsv|signedAtMs|token|nonce`.
/// Scopes are sorted and deduplicated; empty token/nonce serialize as empty
/// segments, never omitted, so the pipe-delimited shape stays stable.
pub fn canonical_connect_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: i64,
    token: Option<&str>,
    nonce: Option<&str>,
) -> String {
    let mut sorted_scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
    sorted_scopes.sort_unstable();
    sorted_scopes.dedup();
    let scopes_csv = sorted_scopes.join(",");
    format!(
        "v2|{device_id}|{client_id}|{client_mode}|{role}|{scopes_csv}|{signed_at_ms}|{token}|{nonce}",
        token = token.unwrap_or(""),
        nonce = nonce.unwrap_or(""),
    )
}

/// Terminal chat state carried by `event: chat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventState {
    Delta,
    Final,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(default)]
    pub seq: Option<u64>,
    pub state: ChatEventState,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
    #[serde(rename = "stopReason", default)]
    pub stop_reason: Option<String>,
}

impl ChatEventState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChatEventState::Delta)
    }
}
