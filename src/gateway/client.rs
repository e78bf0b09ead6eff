use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{GatewaySourceError, RelayError};
use crate::identity::DeviceIdentity;

use super::protocol::{
    canonical_connect_payload, ChatEvent, ChatEventState, ConnectAuth, ConnectClient, ConnectDevice,
    ConnectParams, Frame, FrameError, HelloOk,
};
use super::transport::{Transport, TransportError};

const MIN_PROTOCOL: u32 = 1;
const MAX_PROTOCOL: u32 = 2;
const CHALLENGE_GRACE: Duration = Duration::from_millis(50);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const RECONNECT_FACTOR: f64 = 1.5;

/// Identity of this relay process presented during the handshake.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub token: Option<String>,
    pub password: Option<String>,
}

/// Non-handshake, non-tick event delivered to the caller-registered sink. Owned
/// exclusively by whoever calls [`GatewayClient::set_event_sink`] -- today that is
/// the chat runner, which routes by `run_id`. The Gateway never stores a strong
/// reference back to the runner, only this closure.
pub type EventSink = Arc<dyn Fn(ChatEvent) + Send + Sync>;

enum Command {
    Request {
        method: String,
        params: Value,
        timeout: Duration,
        resp_tx: oneshot::Sender<Result<Value, RelayError>>,
    },
    Stop,
}

struct PendingRequest {
    resp_tx: oneshot::Sender<Result<Value, RelayError>>,
    deadline: Instant,
}

/// Public handle to the duplex Gateway connection. Cloning shares
/// the same background actor; `start`/`stop` are idempotent from any clone.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<SharedState>,
}

struct SharedState {
    url: String,
    identity: ClientIdentity,
    device: Arc<dyn DeviceIdentity>,
    hello: RwLock<Option<HelloOk>>,
    ready: AtomicBool,
    event_sink: RwLock<Option<EventSink>>,
    command_tx: RwLock<Option<mpsc::Sender<Command>>>,
    shutdown: Notify,
    started: AtomicBool,
}

impl GatewayClient {
    pub fn new(url: String, identity: ClientIdentity, device: Arc<dyn DeviceIdentity>) -> Self {
        Self {
            inner: Arc::new(SharedState {
                url,
                identity,
                device,
                hello: RwLock::new(None),
                ready: AtomicBool::new(false),
                event_sink: RwLock::new(None),
                command_tx: RwLock::new(None),
                shutdown: Notify::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.inner.event_sink.write().expect("event sink lock poisoned") = Some(sink);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub fn get_hello(&self) -> Option<HelloOk> {
        self.inner.hello.read().expect("hello lock poisoned").clone()
    }

    /// Idempotent: a second call while already started is a no-op. Blocks until the
    /// first `HelloOk` is validated or the initial connect attempt fails.
    pub async fn start(&self) -> Result<(), RelayError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (command_tx, command_rx) = mpsc::channel(64);
        *self.inner.command_tx.write().expect("command tx lock poisoned") = Some(command_tx);

        let (ready_tx, ready_rx) = oneshot::channel();
        let state = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_actor(state, command_rx, Some(ready_tx)).await;
        });
        ready_rx.await.map_err(|_| RelayError::Internal("gateway actor exited before hello".into()))?
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.inner.command_tx.read().expect("command tx lock poisoned").clone() {
            let _ = tx.send(Command::Stop).await;
        }
        self.inner.shutdown.notify_waiters();
        self.inner.started.store(false, Ordering::Release);
    }

    pub async fn request(&self, method: &str, params: Value, timeout_ms: u64) -> Result<Value, RelayError> {
        let tx = self
            .inner
            .command_tx
            .read()
            .expect("command tx lock poisoned")
            .clone()
            .ok_or_else(|| RelayError::Internal("gateway not started".into()))?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Command::Request {
            method: method.to_owned(),
            params,
            timeout: Duration::from_millis(timeout_ms),
            resp_tx,
        })
        .await
        .map_err(|_| RelayError::GatewayClosed { code: 1006, reason: "actor stopped".into() })?;
        resp_rx
            .await
            .map_err(|_| RelayError::GatewayClosed { code: 1006, reason: "actor dropped request".into() })?
    }
}

async fn run_actor(
    state: Arc<SharedState>,
    mut command_rx: mpsc::Receiver<Command>,
    mut ready_tx: Option<oneshot::Sender<Result<(), RelayError>>>,
) {
    let mut reconnect_delay = RECONNECT_BASE;
    let mut first_attempt = true;

    'connect: loop {
        let transport = match Transport::connect(&state.url, Duration::from_secs(10)).await {
            Ok(t) => t,
            Err(e) => {
                if first_attempt {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(RelayError::Internal(format!("connect failed: {e}"))));
                    }
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    _ = state.shutdown.notified() => return,
                }
                reconnect_delay = next_backoff(reconnect_delay);
                continue 'connect;
            }
        };

        match handshake_and_run(&state, transport, &mut command_rx).await {
            HandshakeOutcome::ReadyThenClosed => {
                reconnect_delay = RECONNECT_BASE;
            }
            HandshakeOutcome::NeverReady(err) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
            }
            HandshakeOutcome::Stopped => return,
        }

        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        first_attempt = false;

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = state.shutdown.notified() => return,
        }
        reconnect_delay = next_backoff(reconnect_delay);
    }
}

fn next_backoff(current: Duration) -> Duration {
    let scaled = current.mul_f64(RECONNECT_FACTOR);
    scaled.min(RECONNECT_MAX)
}

enum HandshakeOutcome {
    ReadyThenClosed,
    NeverReady(RelayError),
    Stopped,
}

async fn handshake_and_run(
    state: &Arc<SharedState>,
    mut transport: Transport,
    command_rx: &mut mpsc::Receiver<Command>,
) -> HandshakeOutcome {
    state.ready.store(false, Ordering::Release);
    *state.hello.write().expect("hello lock poisoned") = None;

    let mut challenge_nonce: Option<String> = None;
    let connect_req_id = Uuid::new_v4().to_string();
    let connect_deadline = tokio::time::sleep(CHALLENGE_GRACE);
    tokio::pin!(connect_deadline);

    // Step 2: wait briefly for an unsolicited connect.challenge before sending connect,
    // so gateways that challenge aren't racing an immediate connect request.
    loop {
        tokio::select! {
            frame = transport.recv() => {
                match frame {
                    Ok(Some(Frame::Event { event, payload, .. })) if event == "connect.challenge" => {
                        challenge_nonce = payload.get("nonce").and_then(|v| v.as_str()).map(str::to_owned);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {}
                    Err(TransportError::Decode(_)) => {}
                    Err(_) => return HandshakeOutcome::NeverReady(RelayError::GatewayClosed { code: 1006, reason: "closed before hello".into() }),
                }
            }
            () = &mut connect_deadline => break,
        }
    }

    if let Err(e) = send_connect(state, &mut transport, &connect_req_id, challenge_nonce.as_deref()).await {
        return HandshakeOutcome::NeverReady(e);
    }

    let hello = match await_connect_response(&mut transport, &connect_req_id).await {
        Ok(hello) => hello,
        Err(e) => {
            transport.close(1008, "handshake rejected").await;
            return HandshakeOutcome::NeverReady(e);
        }
    };

    *state.hello.write().expect("hello lock poisoned") = Some(hello.clone());
    state.ready.store(true, Ordering::Release);

    run_connected(state, transport, command_rx, hello).await
}

async fn send_connect(
    state: &Arc<SharedState>,
    transport: &mut Transport,
    req_id: &str,
    nonce: Option<&str>,
) -> Result<(), RelayError> {
    let identity = &state.identity;
    let signed_at_ms = crate::time_source::now_ms();
    let canonical = canonical_connect_payload(
        &state.device.device_id(),
        &identity.client_id,
        &identity.mode,
        &identity.role,
        &identity.scopes,
        signed_at_ms,
        identity.token.as_deref(),
        nonce,
    );
    let signature = state
        .device
        .sign(canonical.as_bytes())
        .map_err(|e| RelayError::Internal(format!("device signature failed: {e}")))?;

    let params = ConnectParams {
        min_protocol: MIN_PROTOCOL,
        max_protocol: MAX_PROTOCOL,
        client: ConnectClient {
            id: identity.client_id.clone(),
            version: identity.version.clone(),
            platform: identity.platform.clone(),
            mode: identity.mode.clone(),
            instance_id: identity.instance_id.clone(),
        },
        role: identity.role.clone(),
        scopes: identity.scopes.clone(),
        caps: identity.caps.clone(),
        auth: if identity.token.is_some() || identity.password.is_some() {
            Some(ConnectAuth {
                token: identity.token.clone(),
                password: identity.password.clone(),
            })
        } else {
            None
        },
        device: ConnectDevice {
            id: state.device.device_id(),
            public_key: state.device.public_key(),
            signature,
            signed_at: signed_at_ms,
            nonce: nonce.map(str::to_owned),
        },
    };

    let frame = Frame::Req {
        id: req_id.to_owned(),
        method: "connect".to_owned(),
        params: serde_json::to_value(params).expect("ConnectParams always serializes"),
    };
    transport
        .send(&frame)
        .await
        .map_err(|e| RelayError::Internal(format!("connect send failed: {e}")))
}

async fn await_connect_response(transport: &mut Transport, req_id: &str) -> Result<HelloOk, RelayError> {
    loop {
        match transport.recv().await {
            Ok(Some(Frame::Res { id, ok, payload, error })) if id == req_id => {
                if !ok {
                    let message = error.map(|e| e.message).unwrap_or_else(|| "connect rejected".into());
                    return Err(RelayError::GatewayRequest { message, retryable: false, source: None });
                }
                let payload = payload.ok_or_else(|| RelayError::Internal("connect ok without payload".into()))?;
                return serde_json::from_value(payload)
                    .map_err(|e| RelayError::Internal(format!("invalid HelloOk payload: {e}")));
            }
            Ok(Some(_)) => continue,
            Ok(None) => continue,
            Err(TransportError::Decode(_)) => continue,
            Err(e) => return Err(RelayError::GatewayClosed { code: 1006, reason: e.to_string() }),
        }
    }
}

async fn run_connected(
    state: &Arc<SharedState>,
    mut transport: Transport,
    command_rx: &mut mpsc::Receiver<Command>,
    hello: HelloOk,
) -> HandshakeOutcome {
    let mut pending: HashMap<String, PendingRequest> = HashMap::new();
    let poll_interval = Duration::from_millis(std::cmp::max(1000, hello.policy.tick_interval_ms / 2));
    let dead_peer_threshold = Duration::from_millis(hello.policy.tick_interval_ms.saturating_mul(2));
    let mut last_tick = Instant::now();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        let sweep_deadline = pending.values().map(|p| p.deadline).min();
        let sweep = async {
            match sweep_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            frame = transport.recv() => {
                match frame {
                    Ok(Some(Frame::Res { id, ok, payload, error })) => {
                        if let Some(p) = pending.remove(&id) {
                            let result = if ok {
                                Ok(payload.unwrap_or(Value::Null))
                            } else {
                                Err(frame_error_to_relay_error(error))
                            };
                            let _ = p.resp_tx.send(result);
                        }
                    }
                    Ok(Some(Frame::Event { event, payload, .. })) => {
                        match event.as_str() {
                            "tick" => last_tick = Instant::now(),
                            "connect.challenge" => {}
                            "chat" => {
                                if let Ok(chat_event) = serde_json::from_value::<ChatEvent>(payload) {
                                    if let Some(sink) = state.event_sink.read().expect("event sink lock poisoned").clone() {
                                        sink(chat_event);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    Ok(Some(Frame::Req { .. })) => {}
                    Ok(None) => {}
                    Err(TransportError::Decode(_)) => {}
                    Err(_) => break close_with_error(&mut pending, 1006, "socket closed"),
                }
            }
            _ = ticker.tick() => {
                if last_tick.elapsed() > dead_peer_threshold {
                    transport.close(4000, "tick watchdog expired").await;
                    break close_with_error(&mut pending, 4000, "tick watchdog expired");
                }
            }
            () = sweep => {
                let now = Instant::now();
                let timed_out: Vec<String> = pending.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| id.clone()).collect();
                for id in timed_out {
                    if let Some(p) = pending.remove(&id) {
                        let _ = p.resp_tx.send(Err(RelayError::GatewayTimeout));
                    }
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Request { method, params, timeout, resp_tx }) => {
                        let id = Uuid::new_v4().to_string();
                        let frame = Frame::Req { id: id.clone(), method, params };
                        if let Err(e) = transport.send(&frame).await {
                            let _ = resp_tx.send(Err(RelayError::Internal(format!("send failed: {e}"))));
                        } else {
                            pending.insert(id, PendingRequest { resp_tx, deadline: Instant::now() + timeout });
                        }
                    }
                    Some(Command::Stop) | None => {
                        transport.close(1000, "client stop").await;
                        break close_with_error(&mut pending, 1000, "client stop")
                            .map_stopped();
                    }
                }
            }
        }
    };

    state.ready.store(false, Ordering::Release);
    *state.hello.write().expect("hello lock poisoned") = None;
    outcome
}

fn close_with_error(pending: &mut HashMap<String, PendingRequest>, code: u16, reason: &str) -> HandshakeOutcome {
    for (_, p) in pending.drain() {
        let _ = p.resp_tx.send(Err(RelayError::GatewayClosed { code, reason: reason.to_owned() }));
    }
    HandshakeOutcome::ReadyThenClosed
}

impl HandshakeOutcome {
    fn map_stopped(self) -> Self {
        match self {
            HandshakeOutcome::ReadyThenClosed => HandshakeOutcome::Stopped,
            other => other,
        }
    }
}

fn frame_error_to_relay_error(error: Option<FrameError>) -> RelayError {
    match error {
        Some(e) => RelayError::GatewayRequest {
            message: e.message,
            retryable: e.retryable.unwrap_or(false),
            source: Some(GatewaySourceError(e.code)),
        },
        None => RelayError::GatewayRequest { message: "unknown gateway error".into(), retryable: false, source: None },
    }
}

/// `event: chat` terminal-state check used by the chat runner to decide whether to
/// resolve a waiter; re-exported so `chat::runner` doesn't reach into `protocol`.
pub fn is_terminal_chat_state(state: ChatEventState) -> bool {
    state.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        let mut delay = RECONNECT_BASE;
        for _ in 0..20 {
            delay = next_backoff(delay);
        }
        assert!(delay <= RECONNECT_MAX);
    }

    #[test]
    fn backoff_grows_by_factor() {
        let next = next_backoff(Duration::from_secs(1));
        assert_eq!(next, Duration::from_millis(1500));
    }
}
