use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::chat::ChatRunner;
use crate::gateway::GatewayClient;
use crate::time_source::now_ms;
use crate::types::{
    CallbackError, CallbackNoReply, CallbackOutcome, CallbackReply, ChatRunResult, InboundMessage, OpenClawMeta,
    RelayCallback, SessionKey, TaskInput, TraceInfo,
};

/// Emits one `message_flow` debug event per lifecycle transition when
/// `message_flow_log` is enabled, so an operator can grep a single message's
/// path through the system without enabling debug logging globally.
/// `relay_message_id` is `None` for stages reached before it's minted
/// (`enqueued`, `chat_send`).
pub fn log_message_flow(enabled: bool, message_id: &str, relay_message_id: Option<&str>, stage: &str) {
    if enabled {
        tracing::debug!(target: "message_flow", message_id, relay_message_id, stage, "message lifecycle");
    }
}

/// Wires a dequeued [`InboundMessage`] through the chat runner (or handshake /
/// session-new handling) to the backend client, attaching `openclawMeta`.
pub struct Processor {
    pub runner: ChatRunner,
    pub gateway: GatewayClient,
    pub backend: Arc<BackendClient>,
    pub relay_instance_id: String,
    pub task_timeout_ms: u64,
    pub state_dir: PathBuf,
    pub message_flow_log: bool,
}

impl Processor {
    pub async fn process(&self, message: InboundMessage) {
        let relay_message_id = Uuid::new_v4().to_string();
        self.flow_log(&message, &relay_message_id, "dispatched");

        let callback = match std::panic::AssertUnwindSafe(self.build_callback(&message, &relay_message_id))
            .catch_unwind()
            .await
        {
            Ok(callback) => callback,
            Err(_) => self.error_callback(&message, &relay_message_id, "RELAY_INTERNAL_ERROR", "processor panicked", None),
        };

        self.flow_log(&message, &relay_message_id, "terminal");
        if let Err(e) = self.backend.post_callback(&callback).await {
            // A failing backend callback is logged and dropped -- no retry storm,
            // no local durability.
            tracing::error!(error = %e, relay_message_id = %relay_message_id, message_id = %message.message_id, "backend callback failed, dropping");
        } else {
            self.flow_log(&message, &relay_message_id, "callback_sent");
        }
    }

    fn flow_log(&self, message: &InboundMessage, relay_message_id: &str, stage: &str) {
        log_message_flow(self.message_flow_log, &message.message_id, Some(relay_message_id), stage);
    }

    async fn build_callback(&self, message: &InboundMessage, relay_message_id: &str) -> RelayCallback {
        match &message.input {
            TaskInput::Chat { session_key, message_text, media } => {
                let outcome = self
                    .runner
                    .run_chat_task(&message.message_id, session_key, message_text, media, self.task_timeout_ms)
                    .await;
                self.callback_from_chat_result(message, relay_message_id, outcome.result, outcome.usage)
            }
            TaskInput::Handshake { nonce } => self.handshake_callback(message, relay_message_id, nonce),
            TaskInput::SessionNew {} => self.session_new_callback(message, relay_message_id).await,
        }
    }

    fn callback_from_chat_result(
        &self,
        message: &InboundMessage,
        relay_message_id: &str,
        result: ChatRunResult,
        usage: Option<crate::types::UsageTotals>,
    ) -> RelayCallback {
        match result {
            ChatRunResult::Reply { message: reply_message, run_id, media } => self.success_callback(
                message,
                relay_message_id,
                CallbackOutcome::Reply,
                Some(CallbackReply { message: reply_message, run_id: run_id.clone(), media, usage }),
                None,
                Some(run_id),
            ),
            ChatRunResult::NoReply { run_id } => self.success_callback(
                message,
                relay_message_id,
                CallbackOutcome::NoReply,
                None,
                Some(CallbackNoReply { run_id: run_id.clone(), usage }),
                Some(run_id),
            ),
            ChatRunResult::Error { code, message: err_message, run_id } => {
                self.error_callback(message, relay_message_id, &code, &err_message, run_id)
            }
        }
    }

    fn success_callback(
        &self,
        message: &InboundMessage,
        relay_message_id: &str,
        outcome: CallbackOutcome,
        reply: Option<CallbackReply>,
        no_reply: Option<CallbackNoReply>,
        run_id: Option<String>,
    ) -> RelayCallback {
        RelayCallback {
            relay_instance_id: self.relay_instance_id.clone(),
            relay_message_id: relay_message_id.to_owned(),
            finished_at_ms: now_ms(),
            outcome,
            reply,
            no_reply,
            error: None,
            openclaw_meta: Some(self.trace_meta(message, relay_message_id, run_id)),
        }
    }

    fn error_callback(
        &self,
        message: &InboundMessage,
        relay_message_id: &str,
        code: &str,
        err_message: &str,
        run_id: Option<String>,
    ) -> RelayCallback {
        RelayCallback {
            relay_instance_id: self.relay_instance_id.clone(),
            relay_message_id: relay_message_id.to_owned(),
            finished_at_ms: now_ms(),
            outcome: CallbackOutcome::Error,
            reply: None,
            no_reply: None,
            error: Some(CallbackError { code: code.to_owned(), message: err_message.to_owned(), run_id: run_id.clone() }),
            openclaw_meta: Some(self.trace_meta(message, relay_message_id, run_id)),
        }
    }

    fn trace_meta(&self, message: &InboundMessage, relay_message_id: &str, run_id: Option<String>) -> OpenClawMeta {
        OpenClawMeta {
            extra: BTreeMap::new(),
            trace: TraceInfo {
                backend_message_id: message.message_id.clone(),
                relay_message_id: relay_message_id.to_owned(),
                relay_instance_id: self.relay_instance_id.clone(),
                openclaw_run_id: run_id,
            },
        }
    }

    fn handshake_callback(&self, message: &InboundMessage, relay_message_id: &str, nonce: &str) -> RelayCallback {
        let Some(hello) = self.gateway.get_hello() else {
            return self.error_callback(message, relay_message_id, "GATEWAY_ERROR", "gateway is not connected", None);
        };
        let features = hello.features.unwrap_or_default();
        let auth = hello.auth;
        let reply_message = json!({
            "nonce": nonce,
            "helloType": "HelloOk",
            "protocol": hello.protocol,
            "policy": { "tickIntervalMs": hello.policy.tick_interval_ms },
            "features": { "methodsCount": features.methods.len(), "eventsCount": features.events.len() },
            "auth": auth.map(|a| json!({ "role": a.role, "scopes": a.scopes })).unwrap_or(Value::Null),
        });
        self.success_callback(
            message,
            relay_message_id,
            CallbackOutcome::Reply,
            Some(CallbackReply { message: reply_message, run_id: "handshake".to_owned(), media: vec![], usage: None }),
            None,
            None,
        )
    }

    async fn session_new_callback(&self, message: &InboundMessage, relay_message_id: &str) -> RelayCallback {
        let session_keys = read_known_session_keys(&self.state_dir).unwrap_or_default();
        let report = self.runner.start_new_session_for_all(&session_keys).await;
        let reply_message = json!({ "rotated": report.rotated, "failed": report.failed });
        self.success_callback(
            message,
            relay_message_id,
            CallbackOutcome::Reply,
            Some(CallbackReply { message: reply_message, run_id: "session-new".to_owned(), media: vec![], usage: None }),
            None,
            None,
        )
    }
}

/// Reads the Gateway's `agents/main/sessions/sessions.json`, mapping
/// `"agent:main:<sessionKey>" -> {sessionFile}`. Absence of the file is not an
/// error -- it just means no sessions exist yet.
fn read_known_session_keys(state_dir: &Path) -> Option<Vec<SessionKey>> {
    let path = state_dir.join("agents/main/sessions/sessions.json");
    let contents = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&contents).ok()?;
    let object = parsed.as_object()?;
    const PREFIX: &str = "agent:main:";
    Some(
        object
            .keys()
            .filter_map(|key| key.strip_prefix(PREFIX).map(str::to_owned))
            .collect(),
    )
}
