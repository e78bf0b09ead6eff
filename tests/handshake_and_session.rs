mod support;

use std::sync::Arc;

use serde_json::json;

use gateway_relay::backend::BackendClient;
use gateway_relay::chat::ChatRunner;
use gateway_relay::gateway::{ClientIdentity, GatewayClient};
use gateway_relay::identity::{DeviceIdentity, FileDeviceIdentity};
use gateway_relay::processor::Processor;
use gateway_relay::resilience::BackoffSchedule;
use gateway_relay::types::{InboundMessage, TaskInput};

use support::{FakeBackend, FakeGateway, TempStateDir};

async fn build_processor(gateway_url: &str, backend_base_url: &str, state_dir: &TempStateDir) -> Processor {
    let device = Arc::new(FileDeviceIdentity::load_or_create(state_dir.path()).expect("device identity"));
    let identity = ClientIdentity {
        client_id: device.device_id(),
        version: "test".to_string(),
        platform: "test".to_string(),
        mode: "relay".to_string(),
        instance_id: "relay-test-2".to_string(),
        role: "agent".to_string(),
        scopes: vec!["operator.admin".to_string(), "agent.read".to_string()],
        caps: vec!["chat.send".to_string()],
        token: None,
        password: None,
    };

    let gateway = GatewayClient::new(gateway_url.to_string(), identity, device);
    gateway.start().await.expect("gateway handshake should succeed against the fake gateway");

    let runner = ChatRunner::new(gateway.clone(), BackoffSchedule::default_chat(), 3, state_dir.path().to_path_buf(), None, false);
    let backend = Arc::new(BackendClient::new(backend_base_url.to_string(), "test-token".to_string()));

    Processor {
        runner,
        gateway,
        backend,
        relay_instance_id: "relay-test-2".to_string(),
        task_timeout_ms: 5_000,
        state_dir: state_dir.path().to_path_buf(),
        message_flow_log: false,
    }
}

#[tokio::test]
async fn handshake_probe_echoes_the_hello_terms() {
    let gateway = FakeGateway::start(4_000).await;
    let mut backend = FakeBackend::start().await;
    let state_dir = TempStateDir::new("handshake");
    let processor = build_processor(&gateway.url, &backend.base_url, &state_dir).await;

    processor
        .process(InboundMessage {
            message_id: "m2".to_string(),
            sent_at_ms: None,
            input: TaskInput::Handshake { nonce: "n1".to_string() },
        })
        .await;

    let callback = backend.next_callback().await;
    assert_eq!(callback["outcome"], "reply");
    assert_eq!(callback["reply"]["message"]["nonce"], "n1");
    assert_eq!(callback["reply"]["message"]["helloType"], "HelloOk");
    assert_eq!(callback["reply"]["message"]["protocol"], 2);
    assert_eq!(callback["reply"]["message"]["auth"]["role"], "agent");
    assert_eq!(callback["reply"]["message"]["features"]["methodsCount"], 3);
}

#[tokio::test]
async fn session_new_rotates_every_known_session() {
    let mut gateway = FakeGateway::start(4_000).await;
    let mut backend = FakeBackend::start().await;
    let state_dir = TempStateDir::new("session-new");

    let sessions_dir = state_dir.path().join("agents/main/sessions");
    std::fs::create_dir_all(&sessions_dir).expect("sessions dir");
    std::fs::write(
        sessions_dir.join("sessions.json"),
        r#"{"agent:main:alice":{"sessionFile":"alice.jsonl"},"agent:main:bob":{"sessionFile":"bob.jsonl"}}"#,
    )
    .expect("sessions.json");

    let processor = build_processor(&gateway.url, &backend.base_url, &state_dir).await;

    let drive = tokio::spawn(async move {
        for _ in 0..2 {
            let (id, method, params) = gateway.next_request().await;
            assert_eq!(method, "chat.send");
            assert_eq!(params["message"], "/new");
            gateway.reply_ok(&id, json!({ "runId": format!("rotate-{}", params["sessionKey"]) })).await;
        }
    });

    processor
        .process(InboundMessage { message_id: "m5".to_string(), sent_at_ms: None, input: TaskInput::SessionNew {} })
        .await;
    drive.await.expect("drive task should not panic");

    let callback = backend.next_callback().await;
    assert_eq!(callback["outcome"], "reply");
    assert_eq!(callback["reply"]["message"]["rotated"], 2);
    assert_eq!(callback["reply"]["message"]["failed"], 0);
}
