use callgate_core::{CallError, ErrorKind, RequestSpec};
use callgate_transport::{HttpTransport, ReqwestTransport, TransportConfig, TransportErrorKind};
use mockito::Matcher;
use serde_json::json;
use std::collections::BTreeMap;

// ============================================================================
// REQUEST SHAPING
// ============================================================================

#[tokio::test]
async fn test_get_sends_sorted_query_and_parses_json() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/items")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("page".into(), "2".into()),
            Matcher::UrlEncoded("q".into(), "rust".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"id":1},{"id":2}]"#)
        .create_async()
        .await;

    let transport = ReqwestTransport::new_with_base_url(&server.url()).unwrap();
    let request = RequestSpec::get("/items").with_params(json!({"q": "rust", "page": 2, "skip": null}));
    let response = transport.request(&request).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.data, json!([{"id": 1}, {"id": 2}]));
    assert_eq!(response.config, request);
}

#[tokio::test]
async fn test_post_sends_json_body_and_headers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/items")
        .match_header("authorization", "Bearer secret")
        .match_header("x-client", "callgate")
        .match_body(Matcher::Json(json!({"title": "first"})))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":10,"title":"first"}"#)
        .create_async()
        .await;

    let mut default_headers = BTreeMap::new();
    default_headers.insert("x-client".to_string(), "callgate".to_string());
    let transport = ReqwestTransport::new(TransportConfig {
        base_url: Some(server.url()),
        default_headers,
        ..Default::default()
    })
    .unwrap();

    let request = RequestSpec::post("/items")
        .with_data(json!({"title": "first"}))
        .with_header("authorization", "Bearer secret");
    let response = transport.request(&request).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.status, 201);
    assert_eq!(response.data["id"], 10);
    assert_eq!(
        response.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
}

// ============================================================================
// FAILURE MAPPING
// ============================================================================

#[tokio::test]
async fn test_error_status_is_returned_as_response() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/busy")
        .with_status(503)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"try later"}"#)
        .create_async()
        .await;

    let transport = ReqwestTransport::new_with_base_url(&server.url()).unwrap();
    let response = transport.request(&RequestSpec::get("/busy")).await.unwrap();

    assert_eq!(response.status, 503);
    assert!(!response.is_success());
    assert_eq!(response.data, json!({"error": "try later"}));
}

#[tokio::test]
async fn test_malformed_json_is_parse_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/broken")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("{not json")
        .create_async()
        .await;

    let transport = ReqwestTransport::new_with_base_url(&server.url()).unwrap();
    let err = transport.request(&RequestSpec::get("/broken")).await.unwrap_err();
    assert_eq!(err.kind, TransportErrorKind::Parse);

    let call_err: CallError = err.into();
    assert_eq!(call_err.kind, ErrorKind::Parse);
    assert!(!call_err.is_retryable());
}

#[tokio::test]
async fn test_text_body_falls_back_to_string() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/health")
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_body("ok")
        .create_async()
        .await;

    let transport = ReqwestTransport::new_with_base_url(&server.url()).unwrap();
    let response = transport.request(&RequestSpec::get("/health")).await.unwrap();
    assert_eq!(response.data, json!("ok"));
}

#[tokio::test]
async fn test_connection_refused_is_retryable_network_error() {
    // Bind then drop a listener so the port is known to be closed
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = ReqwestTransport::new_with_base_url(&format!("http://{}", addr)).unwrap();
    let err = transport.request(&RequestSpec::get("/items")).await.unwrap_err();
    assert_eq!(err.kind, TransportErrorKind::Network);

    let call_err: CallError = err.into();
    assert!(call_err.is_retryable());
}
