use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::client::HttpBackend;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::message::Role;
use crate::session::{ChatSession, SessionState, TurnOutcome};

fn config_for(server: &MockServer) -> ChatConfig {
    ChatConfig {
        endpoint: format!("{}/api/chat", server.uri()),
        conversations_endpoint: format!("{}/api/chats", server.uri()),
        ..ChatConfig::default()
    }
}

#[tokio::test]
async fn test_session_over_http_event_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({
            "message": "What is a caveat petition?",
            "saveChatHistory": true
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    concat!(
                        "data: {\"content\":\"A caveat is filed under \"}\n\n",
                        "data: {oops}\n\n",
                        "data: {\"content\":\"Section 148A CPC.\"}\n\n",
                        "data: [DONE]\n\n"
                    ),
                    "text/event-stream",
                ),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server);
    let session = ChatSession::new(HttpBackend::from_config(&config).unwrap(), config);

    let outcome = session.send("What is a caveat petition?").await;
    assert_eq!(
        outcome.message().map(|m| m.content.as_str()),
        Some("A caveat is filed under Section 148A CPC.")
    );
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_session_over_http_server_error_then_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/c-5"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(serde_json::json!({ "error": "Internal server error" })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat/c-5"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("Whole answer after retry.", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let config = ChatConfig {
        chat_id: Some("c-5".to_string()),
        ..config_for(&server)
    };
    let session = ChatSession::new(HttpBackend::from_config(&config).unwrap(), config);

    let outcome = session.send("q").await;
    assert_eq!(
        outcome,
        TurnOutcome::Failed(ChatError::http(500, "Internal server error"))
    );
    assert_eq!(session.messages().len(), 1);

    let outcome = session.retry().await;
    assert!(outcome.is_completed());
    let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_hydrate_session_from_persisted_conversation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chat/c-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "c-9",
            "messages": [
                { "id": "m1", "content": "What is RTI?", "role": "user" },
                { "id": "m2", "content": "The Right to Information Act, 2005.", "role": "assistant" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat/c-9"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    "data: {\"content\":\"Within 30 days.\"}\n\n",
                    "text/event-stream",
                ),
        )
        .mount(&server)
        .await;

    let config = ChatConfig {
        chat_id: Some("c-9".to_string()),
        ..config_for(&server)
    };
    let backend = HttpBackend::from_config(&config).unwrap();
    let conversation = backend.load_conversation("c-9").await.unwrap();
    let session = ChatSession::with_transcript(backend, config, conversation.messages);

    let outcome = session.send("How soon must they reply?").await;
    assert!(outcome.is_completed());

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].id.as_str(), "m1");
    assert_eq!(messages[3].content, "Within 30 days.");

    let received = server.received_requests().await.unwrap();
    let post = received
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .expect("chat request");
    let body: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["sessionId"], "c-9");
}
