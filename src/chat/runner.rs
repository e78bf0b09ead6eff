use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::error::{RelayError, RelayResult};
use crate::gateway::{ChatEvent, ChatEventState, GatewayClient};
use crate::processor::log_message_flow;
use crate::resilience::{retry, BackoffSchedule};
use crate::time_source::clamp_timeout_ms;
use crate::transcription::TranscriptionProvider;
use crate::types::{ChatRunResult, MediaItem, RunId, SessionKey, UsageSnapshot, UsageTotals};

use super::media::{collect_transcript_media, latest_assistant_transcript_line, stage_file_media};
use super::usage::diff_usage;

/// Minimum slack an attempt needs before it's worth sending at all.
const MIN_SLACK_MS: u64 = 500;
const TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(20);
const USAGE_SNAPSHOT_TIMEOUT_MS: u64 = 5_000;

/// The outcome of one `run_chat_task` call, paired with the usage this call
/// consumed (when both snapshots were obtainable along a successful path).
pub struct RunOutcome {
    pub result: ChatRunResult,
    pub usage: Option<UsageTotals>,
}

/// A completed `startNewSessionForAll` sweep.
pub struct SessionRotationReport {
    pub rotated: usize,
    pub failed: usize,
}

struct Waiter {
    resolver: oneshot::Sender<ChatEvent>,
    session_key: SessionKey,
}

struct Inner {
    gateway: GatewayClient,
    backoff: BackoffSchedule,
    attempts: usize,
    state_dir: PathBuf,
    transcription: Option<Box<dyn TranscriptionProvider>>,
    waiters: Mutex<HashMap<RunId, Waiter>>,
    session_maintenance: tokio::sync::Mutex<()>,
    error_classifier: Regex,
    message_flow_log: bool,
}

/// The per-message stateful protocol. `Clone` is cheap (an `Arc` bump); the
/// Gateway client holds only a [`Weak`] back-reference via the event sink closure
/// to avoid a strong reference cycle.
#[derive(Clone)]
pub struct ChatRunner {
    inner: Arc<Inner>,
}

impl ChatRunner {
    pub fn new(
        gateway: GatewayClient,
        backoff: BackoffSchedule,
        attempts: usize,
        state_dir: PathBuf,
        transcription: Option<Box<dyn TranscriptionProvider>>,
        message_flow_log: bool,
    ) -> Self {
        let inner = Arc::new(Inner {
            gateway: gateway.clone(),
            backoff,
            attempts,
            state_dir,
            transcription,
            waiters: Mutex::new(HashMap::new()),
            session_maintenance: tokio::sync::Mutex::new(()),
            error_classifier: Regex::new(r#""status"\s*:\s*"INTERNAL".*"code"\s*:\s*5\d\d|"code"\s*:\s*5\d\d.*"status"\s*:\s*"INTERNAL""#)
                .expect("static regex is valid"),
            message_flow_log,
        });
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        gateway.set_event_sink(Arc::new(move |event: ChatEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_chat_event(event);
            }
        }));
        Self { inner }
    }

    pub async fn run_chat_task(
        &self,
        task_id: &str,
        session_key: &SessionKey,
        message_text: &str,
        media: &[MediaItem],
        timeout_ms: u64,
    ) -> RunOutcome {
        self.inner.run_chat_task(task_id, session_key, message_text, media, timeout_ms).await
    }

    pub async fn start_new_session_for_all(&self, session_keys: &[SessionKey]) -> SessionRotationReport {
        self.inner.start_new_session_for_all(session_keys).await
    }
}

impl Inner {
    fn on_chat_event(&self, event: ChatEvent) {
        if !event.state.is_terminal() {
            return;
        }
        let mut waiters = self.waiters.lock().expect("waiters lock poisoned");
        // Invariant 2: a terminal event for an unknown runId is dropped silently.
        if let Some(waiter) = waiters.remove(&event.run_id) {
            if waiter.session_key == event.session_key {
                let _ = waiter.resolver.send(event);
            }
        }
    }

    async fn run_chat_task(
        &self,
        task_id: &str,
        session_key: &SessionKey,
        message_text: &str,
        media: &[MediaItem],
        timeout_ms: u64,
    ) -> RunOutcome {
        // The session-maintenance lock's single-slot semantics mean a chat task
        // briefly blocks here if startNewSessionForAll is in flight.
        {
            let _guard = self.session_maintenance.lock().await;
        }

        let timeout_ms = clamp_timeout_ms(timeout_ms);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let mut outgoing_message = message_text.to_owned();
        if media.iter().any(|m| matches!(m, MediaItem::Audio { .. })) {
            if let Some(provider) = &self.transcription {
                for item in media {
                    if let MediaItem::Audio { path } = item {
                        if let Ok(transcript) = provider.transcribe(path, TRANSCRIPTION_TIMEOUT).await {
                            outgoing_message = format!("{transcript}\n{outgoing_message}");
                        }
                    }
                }
            }
        }
        match stage_file_media(media, session_key, &self.state_dir) {
            Ok(lines) => {
                for line in lines {
                    outgoing_message.push('\n');
                    outgoing_message.push_str(&line);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "file media staging failed, continuing without attachments");
            }
        }

        let usage_incoming = match self.take_usage_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                return RunOutcome {
                    result: ChatRunResult::Error {
                        code: RelayError::UsageRequired.code().to_string(),
                        message: "failed to obtain pre-send usage snapshot".into(),
                        run_id: None,
                    },
                    usage: None,
                }
            }
        };

        let send_result = self
            .send_with_retries(task_id, session_key, &outgoing_message, deadline)
            .await;

        match send_result {
            Ok(event) => self.finish_from_terminal_event(event, session_key, &usage_incoming).await,
            Err(err) => RunOutcome { result: error_result(&err, None), usage: None },
        }
    }

    async fn send_with_retries(
        &self,
        task_id: &str,
        session_key: &SessionKey,
        outgoing_message: &str,
        deadline: Instant,
    ) -> RelayResult<ChatEvent> {
        retry(
            self.attempts,
            &self.backoff,
            Some(deadline),
            |err: &RelayError, _attempt| err.retryable(),
            |err, attempt, sleep_ms| {
                tracing::debug!(attempt, sleep_ms, error = %err, "retrying chat send");
            },
            |_attempt| self.send_once(task_id, session_key, outgoing_message, deadline),
        )
        .await
    }

    async fn send_once(
        &self,
        task_id: &str,
        session_key: &SessionKey,
        outgoing_message: &str,
        deadline: Instant,
    ) -> RelayResult<ChatEvent> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < Duration::from_millis(MIN_SLACK_MS) {
            return Err(RelayError::GatewayTimeout);
        }
        let remaining_ms = remaining.as_millis() as u64;

        log_message_flow(self.message_flow_log, task_id, None, "chat_send");
        let response = self
            .gateway
            .request(
                "chat.send",
                json!({
                    "sessionKey": session_key,
                    "message": outgoing_message,
                    // Stable across retries so the Gateway can dedupe.
                    "idempotencyKey": task_id,
                    "timeoutMs": remaining_ms,
                }),
                remaining_ms,
            )
            .await?;

        let run_id = response
            .get("runId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(RelayError::NoRunId)?;

        let (resolver, waiter_rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiters lock poisoned")
            .insert(run_id.clone(), Waiter { resolver, session_key: session_key.clone() });

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, waiter_rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(RelayError::Internal("waiter channel dropped".into())),
            Err(_) => {
                self.waiters.lock().expect("waiters lock poisoned").remove(&run_id);
                let _ = self
                    .gateway
                    .request("chat.abort", json!({ "sessionKey": session_key, "runId": run_id }), 2_000)
                    .await;
                Err(RelayError::GatewayTimeout)
            }
        }
    }

    async fn finish_from_terminal_event(
        &self,
        event: ChatEvent,
        session_key: &SessionKey,
        usage_incoming: &UsageSnapshot,
    ) -> RunOutcome {
        match event.state {
            ChatEventState::Final => {
                let usage_outgoing = self.take_usage_snapshot().await.ok();
                let usage = usage_outgoing.as_ref().map(|out| diff_usage(usage_incoming, out));
                match event.message {
                    Some(message) => {
                        let media = latest_assistant_transcript_line(session_key, &self.state_dir)
                            .map(|line| collect_transcript_media(&line, &self.state_dir).unwrap_or_default())
                            .unwrap_or_default();
                        RunOutcome {
                            result: ChatRunResult::Reply { message, run_id: event.run_id, media },
                            usage,
                        }
                    }
                    None => RunOutcome { result: ChatRunResult::NoReply { run_id: event.run_id }, usage },
                }
            }
            ChatEventState::Aborted => RunOutcome {
                result: error_result(&RelayError::Aborted, Some(event.run_id)),
                usage: None,
            },
            ChatEventState::Error => {
                let message = event.error_message.unwrap_or_default();
                let retryable = self.classify_retryable(&message);
                let err = RelayError::GatewayRequest { message, retryable, source: None };
                RunOutcome { result: error_result(&err, Some(event.run_id)), usage: None }
            }
            ChatEventState::Delta => {
                // Invariant: only terminal states reach here via on_chat_event.
                RunOutcome {
                    result: error_result(&RelayError::Internal("unexpected delta at terminal stage".into()), Some(event.run_id)),
                    usage: None,
                }
            }
        }
    }

    fn classify_retryable(&self, error_message: &str) -> bool {
        if let Some(json_start) = error_message.find('{') {
            if let Ok(parsed) = serde_json::from_str::<Value>(&error_message[json_start..]) {
                if let Some(error) = parsed.get("error") {
                    let code_retryable = error
                        .get("code")
                        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
                        .map(|code| (500..=599).contains(&code) || code == 429)
                        .unwrap_or(false);
                    let status_internal = error.get("status").and_then(Value::as_str) == Some("INTERNAL");
                    if code_retryable || status_internal {
                        return true;
                    }
                }
            }
        }
        self.error_classifier.is_match(error_message)
    }

    async fn take_usage_snapshot(&self) -> RelayResult<UsageSnapshot> {
        let payload = self.gateway.request("sessions.usage", json!({}), USAGE_SNAPSHOT_TIMEOUT_MS).await?;
        serde_json::from_value(payload).map_err(|e| RelayError::Internal(format!("invalid usage snapshot: {e}")))
    }

    async fn start_new_session_for_all(&self, session_keys: &[SessionKey]) -> SessionRotationReport {
        let _guard = self.session_maintenance.lock().await;

        let in_flight_run_ids: Vec<String> = {
            let waiters = self.waiters.lock().expect("waiters lock poisoned");
            waiters
                .iter()
                .filter(|(_, w)| session_keys.contains(&w.session_key))
                .map(|(run_id, _)| run_id.clone())
                .collect()
        };
        for run_id in in_flight_run_ids {
            let session_key = {
                let waiters = self.waiters.lock().expect("waiters lock poisoned");
                waiters.get(&run_id).map(|w| w.session_key.clone())
            };
            if let Some(session_key) = session_key {
                let _ = self
                    .gateway
                    .request("chat.abort", json!({ "sessionKey": session_key, "runId": run_id }), 2_000)
                    .await;
            }
        }

        let mut rotated = 0;
        let mut failed = 0;
        for session_key in session_keys {
            let result = self
                .gateway
                .request(
                    "chat.send",
                    json!({
                        "sessionKey": session_key,
                        "message": "/new",
                        "idempotencyKey": format!("session-new-{session_key}"),
                        "timeoutMs": 10_000,
                    }),
                    10_000,
                )
                .await;
            match result {
                Ok(_) => rotated += 1,
                Err(_) => failed += 1,
            }
        }
        SessionRotationReport { rotated, failed }
    }
}

fn error_result(err: &RelayError, run_id: Option<RunId>) -> ChatRunResult {
    ChatRunResult::Error { code: err.code().to_string(), message: err.to_string(), run_id }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_like_5xx_payload_as_retryable() {
        let inner_classifier =
            Regex::new(r#""status"\s*:\s*"INTERNAL".*"code"\s*:\s*5\d\d|"code"\s*:\s*5\d\d.*"status"\s*:\s*"INTERNAL""#).unwrap();
        assert!(inner_classifier.is_match(r#"boom {"error":{"code":500,"status":"INTERNAL"}}"#));
    }

    #[test]
    fn non_matching_message_is_not_retryable_by_heuristic() {
        let inner_classifier =
            Regex::new(r#""status"\s*:\s*"INTERNAL".*"code"\s*:\s*5\d\d|"code"\s*:\s*5\d\d.*"status"\s*:\s*"INTERNAL""#).unwrap();
        assert!(!inner_classifier.is_match("plain validation error"));
    }
}
