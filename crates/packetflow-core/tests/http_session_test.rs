// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end session tests against a mock HTTP endpoint using the real
//! pagination client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use packetflow_core::persistence::SessionStatus;
use packetflow_core::session_handlers::{StartSessionRequest, handle_start_session};
use packetflow_http::{PaginationClient, PaginationClientConfig, RetryPolicy};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> Arc<PaginationClient> {
    let config = PaginationClientConfig {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy::new(2, Duration::from_millis(10), 1.5, Duration::from_millis(50)),
        client_id: "packetflow-test".to_string(),
    };
    Arc::new(PaginationClient::new(config).expect("client builds"))
}

fn records(range: std::ops::Range<u64>) -> Vec<Value> {
    range.map(|n| json!({"recordId": format!("ord-{n}")})).collect()
}

async fn mount_page(server: &MockServer, offset: &str, body: Value, has_more: &str) {
    Mock::given(method("GET"))
        .and(path("/records"))
        .and(query_param("offset", offset))
        .and(query_param("limit", "10"))
        .and(header("x-packet-client", "packetflow-test"))
        .and(header("x-api-key", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Total-Records", "23")
                .insert_header("X-Has-More-Records", has_more)
                .set_body_json(body),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_session_runs_against_http_endpoint() {
    let server = MockServer::start().await;
    mount_page(&server, "0", json!({"data": records(0..10)}), "true").await;
    mount_page(&server, "10", json!({"records": records(10..20)}), "true").await;
    mount_page(&server, "20", json!(records(20..23)), "false").await;

    let state = test_state(client(), Arc::new(SelectiveProcessor::accepting())).await;
    let key = session_key("HTTP-1");

    let mut request = StartSessionRequest::new(
        format!("{}/records", server.uri()),
        "HTTP-1",
        application_date(),
    );
    request.packet_size = 10;
    request
        .headers
        .insert("X-Api-Key".to_string(), "secret".to_string());
    handle_start_session(&state, request).await.unwrap();

    let session = wait_for_settled(&state, &key, SessionStatus::Completed).await;
    assert_eq!(session.processed_records, 23);
    assert_eq!(session.total_records, 23);
    assert_eq!(session.current_offset, 23);
    assert_eq!(session.last_processed_record_id.as_deref(), Some("ord-22"));

    let records = state.persistence.list_records(&key).await.unwrap();
    assert_eq!(records[0].record_id, "ord-0");
    assert_eq!(records[12].record_id, "ord-12");
}

#[tokio::test]
async fn test_client_error_fails_session_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .expect(1)
        .mount(&server)
        .await;

    let state = test_state(client(), Arc::new(SelectiveProcessor::accepting())).await;
    let key = session_key("HTTP-2");

    handle_start_session(
        &state,
        StartSessionRequest::new(format!("{}/records", server.uri()), "HTTP-2", application_date()),
    )
    .await
    .unwrap();

    let session = wait_for_settled(&state, &key, SessionStatus::Failed).await;
    assert_eq!(session.error_category.as_deref(), Some("CLIENT_ERROR"));
    assert_eq!(session.http_status_code, Some(401));
    let message = session.error_message.unwrap();
    assert!(message.starts_with("Client error: 401"), "{message}");
    assert!(message.contains("bad token"), "{message}");
    assert_eq!(session.current_offset, 0);
}

#[tokio::test]
async fn test_undecodable_body_fails_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let state = test_state(client(), Arc::new(SelectiveProcessor::accepting())).await;
    let key = session_key("HTTP-3");

    handle_start_session(
        &state,
        StartSessionRequest::new(format!("{}/records", server.uri()), "HTTP-3", application_date()),
    )
    .await
    .unwrap();

    let session = wait_for_settled(&state, &key, SessionStatus::Failed).await;
    assert_eq!(
        session.error_category.as_deref(),
        Some("RESPONSE_PROCESSING_ERROR")
    );
    // The response itself was a 200
    assert_eq!(session.http_status_code, Some(200));
}

#[tokio::test]
async fn test_server_errors_exhaust_retries_then_fail_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let state = test_state(client(), Arc::new(SelectiveProcessor::accepting())).await;
    let key = session_key("HTTP-4");

    handle_start_session(
        &state,
        StartSessionRequest::new(format!("{}/records", server.uri()), "HTTP-4", application_date()),
    )
    .await
    .unwrap();

    let session = wait_for_settled(&state, &key, SessionStatus::Failed).await;
    assert_eq!(session.error_category.as_deref(), Some("SERVER_ERROR"));
    assert_eq!(session.http_status_code, Some(502));
}
