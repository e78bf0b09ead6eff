mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use gateway_relay::backend::BackendClient;
use gateway_relay::chat::ChatRunner;
use gateway_relay::gateway::{ClientIdentity, GatewayClient};
use gateway_relay::identity::{DeviceIdentity, FileDeviceIdentity};
use gateway_relay::processor::Processor;
use gateway_relay::resilience::BackoffSchedule;
use gateway_relay::types::{InboundMessage, MediaItem, TaskInput};

use support::{FakeBackend, FakeGateway, TempStateDir};

async fn build_processor(gateway_url: &str, backend_base_url: &str) -> (Processor, TempStateDir) {
    let state_dir = TempStateDir::new("chat-e2e");
    let device = Arc::new(FileDeviceIdentity::load_or_create(state_dir.path()).expect("device identity"));
    let identity = ClientIdentity {
        client_id: device.device_id(),
        version: "test".to_string(),
        platform: "test".to_string(),
        mode: "relay".to_string(),
        instance_id: "relay-test-1".to_string(),
        role: "agent".to_string(),
        scopes: vec!["operator.admin".to_string()],
        caps: vec!["chat.send".to_string(), "chat.abort".to_string()],
        token: None,
        password: None,
    };

    let gateway = GatewayClient::new(gateway_url.to_string(), identity, device);
    gateway.start().await.expect("gateway handshake should succeed against the fake gateway");

    let runner = ChatRunner::new(gateway.clone(), BackoffSchedule::default_chat(), 3, state_dir.path().to_path_buf(), None, false);
    let backend = Arc::new(BackendClient::new(backend_base_url.to_string(), "test-token".to_string()));

    let processor = Processor {
        runner,
        gateway,
        backend,
        relay_instance_id: "relay-test-1".to_string(),
        task_timeout_ms: 5_000,
        state_dir: state_dir.path().to_path_buf(),
        message_flow_log: false,
    };
    (processor, state_dir)
}

fn chat_message(message_id: &str, session_key: &str, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: message_id.to_string(),
        sent_at_ms: None,
        input: TaskInput::Chat {
            session_key: session_key.to_string(),
            message_text: text.to_string(),
            media: Vec::<MediaItem>::new(),
        },
    }
}

#[tokio::test]
async fn happy_chat_resolves_to_a_reply_callback() {
    let mut gateway = FakeGateway::start(2_000).await;
    let mut backend = FakeBackend::start().await;
    let (processor, _state_dir) = build_processor(&gateway.url, &backend.base_url).await;

    let drive = tokio::spawn(async move {
        let (id, method, _params) = gateway.next_request().await;
        assert_eq!(method, "chat.send");
        gateway.reply_ok(&id, json!({ "runId": "r1" })).await;
        gateway.emit_chat(json!({ "runId": "r1", "sessionKey": "s1", "state": "final", "message": { "text": "ok" } })).await;
    });

    processor.process(chat_message("m1", "s1", "hi")).await;
    drive.await.expect("drive task should not panic");

    let callback = backend.next_callback().await;
    assert_eq!(callback["outcome"], "reply");
    assert_eq!(callback["reply"]["runId"], "r1");
    assert_eq!(callback["reply"]["message"]["text"], "ok");
}

#[tokio::test]
async fn retryable_upstream_error_is_retried_to_a_fresh_run_id() {
    let mut gateway = FakeGateway::start(2_000).await;
    let mut backend = FakeBackend::start().await;
    let (processor, _state_dir) = build_processor(&gateway.url, &backend.base_url).await;

    let drive = tokio::spawn(async move {
        let (first_id, method, _) = gateway.next_request().await;
        assert_eq!(method, "chat.send");
        gateway.reply_ok(&first_id, json!({ "runId": "r2" })).await;
        gateway
            .emit_chat(json!({
                "runId": "r2",
                "sessionKey": "s1",
                "state": "error",
                "errorMessage": "JSON error injected into SSE stream\n{\"error\":{\"code\":500,\"status\":\"INTERNAL\"}}",
            }))
            .await;

        let (second_id, method, _) = gateway.next_request().await;
        assert_eq!(method, "chat.send");
        gateway.reply_ok(&second_id, json!({ "runId": "r3" })).await;
        gateway.emit_chat(json!({ "runId": "r3", "sessionKey": "s1", "state": "final", "message": { "text": "recovered" } })).await;
    });

    processor.process(chat_message("m3", "s1", "hi again")).await;
    drive.await.expect("drive task should not panic");

    let callback = backend.next_callback().await;
    assert_eq!(callback["outcome"], "reply");
    assert_eq!(callback["reply"]["runId"], "r3");
}

#[tokio::test]
async fn timeout_without_a_terminal_event_issues_an_abort_and_errors() {
    let mut gateway = FakeGateway::start(2_000).await;
    let mut backend = FakeBackend::start().await;
    let (mut processor, _state_dir) = build_processor(&gateway.url, &backend.base_url).await;
    processor.task_timeout_ms = 1_500;

    let drive = tokio::spawn(async move {
        let (id, method, _) = gateway.next_request().await;
        assert_eq!(method, "chat.send");
        gateway.reply_ok(&id, json!({ "runId": "r4" })).await;

        let (abort_id, abort_method, abort_params) = gateway.next_request().await;
        assert_eq!(abort_method, "chat.abort");
        assert_eq!(abort_params["runId"], "r4");
        gateway.reply_ok(&abort_id, json!({})).await;
    });

    processor.process(chat_message("m4", "s1", "slow")).await;
    drive.await.expect("drive task should not panic");

    let callback = tokio::time::timeout(Duration::from_secs(5), backend.next_callback())
        .await
        .expect("backend should still receive a terminal error callback");
    assert_eq!(callback["outcome"], "error");
    assert_eq!(callback["error"]["code"], "GATEWAY_TIMEOUT");
}
