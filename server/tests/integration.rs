//! Integration tests for the synthesis server

mod common;

use std::collections::BTreeMap;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use server::config::ServerConfig;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tower::ServiceExt;

use common::*;

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn spawn_server(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_health_check() {
    for path in ["/health", "/healthz"] {
        let response = create_test_app().oneshot(get(path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "ok");
    }
}

#[tokio::test]
async fn test_list_speakers() {
    let response = create_test_app().oneshot(get("/api/v1/speakers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let speakers: BTreeMap<String, i64> = serde_json::from_slice(&body).unwrap();
    assert_eq!(speakers.get("alto"), Some(&0));
    assert_eq!(speakers.get("bass"), Some(&1));
}

#[tokio::test]
async fn test_synthesise_wav() {
    let response = create_test_app()
        .oneshot(post_json("/api/v1/synthesise", json!({ "text": "hello there." })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/wav");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[0..4], b"RIFF");
    assert_eq!(&body[8..12], b"WAVE");
    // 44-byte header, 2 bytes per sample.
    assert_eq!(body.len(), 44 + 2 * samples_for("hello there."));
}

#[tokio::test]
async fn test_synthesise_pcm_uses_speaker() {
    let response = create_test_app()
        .oneshot(post_json(
            "/api/v1/synthesise",
            json!({ "text": "hi", "speaker": "bass", "audio_format": "pcm" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/raw");
    assert_eq!(response.headers()["x-sample-rate"], SAMPLE_RATE.to_string().as_str());
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    // "hi" is normalised to "hi,".
    assert_eq!(body.len(), 2 * samples_for("hi,"));
    let first = i16::from_le_bytes([body[0], body[1]]);
    assert_eq!(first, 200);
}

#[tokio::test]
async fn test_synthesise_json_payload() {
    let response = create_test_app()
        .oneshot(post_json(
            "/api/v1/synthesise",
            json!({ "text": "ok.", "audio_format": "json", "length_scale": 1.2 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(payload["audio_base64"].is_string());
    assert_eq!(payload["sample_rate"], SAMPLE_RATE);
    let expected_ms = samples_for("ok.") as u64 * 1000 / SAMPLE_RATE as u64;
    assert_eq!(payload["duration_ms"], expected_ms);
}

#[tokio::test]
async fn test_synthesise_validation_errors() {
    let cases = [
        json!({ "text": "" }),
        json!({ "text": "a".repeat(6000) }),
        json!({ "text": "hi", "speaker_id": 7 }),
        json!({ "text": "hi", "speaker": "tenor" }),
        json!({ "text": "hi", "noise_scale": -1.0 }),
        json!({ "text": "hi", "audio_format": "opus" }),
    ];
    for case in cases {
        let response = create_test_app()
            .oneshot(post_json("/api/v1/synthesise", case.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{case}");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(error["error"].is_string());
        assert_eq!(error["code"], 400);
    }
}

#[tokio::test]
async fn test_synthesise_engine_failure_is_opaque() {
    let response = create_test_app()
        .oneshot(post_json("/api/v1/synthesise", json!({ "text": "box." })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "Failed to synthesise");
}

#[tokio::test]
async fn test_bearer_token_required_when_configured() {
    let config = ServerConfig {
        auth_token: Some("secret".into()),
        ..Default::default()
    };
    let app = create_app_with(config);

    let response = app.clone().oneshot(get("/api/v1/speakers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/v1/speakers")
        .header("authorization", "Bearer secret")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Health stays open.
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_track_synthesis() {
    let state = test_state(ServerConfig::default());
    let app = server::app(state.clone()).unwrap();

    app.clone()
        .oneshot(post_json("/api/v1/synthesise", json!({ "text": "one." })))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json("/api/v1/synthesise", json!({ "text": "xx." })))
        .await
        .unwrap();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let metrics: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics["system"]["request_count"], 2);
    assert_eq!(metrics["endpoints"]["synthesise"]["request_count"], 2);
    assert_eq!(metrics["endpoints"]["synthesise"]["error_count"], 1);
    assert_eq!(metrics["synthesis"]["synthesis_count"], 1);
    assert_eq!(metrics["synthesis"]["failure_count"], 1);
    assert!(metrics["synthesis"]["total_audio_seconds"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_not_found_endpoint() {
    let response = create_test_app().oneshot(get("/nonexistent")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_sends_pcm_frames() {
    let addr = spawn_server(create_test_app()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/v1/stream"))
        .await
        .unwrap();

    ws.send(Message::Text(json!({ "text": "ab. cd." }).to_string().into()))
        .await
        .unwrap();

    let expected = samples_for("ab.") + samples_for("cd.");
    let mut received = Vec::new();
    while received.len() < expected * 2 {
        match ws.next().await.unwrap().unwrap() {
            Message::Binary(bytes) => received.extend_from_slice(&bytes),
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(received.len(), expected * 2);

    // Errors come back as text and the connection stays usable.
    ws.send(Message::Text("box.".to_string().into())).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text.as_str(), "ERROR: Failed to synthesise"),
        other => panic!("unexpected message: {other:?}"),
    }

    ws.send(Message::Text(json!({ "text": "" }).to_string().into()))
        .await
        .unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => assert!(text.as_str().starts_with("ERROR: ")),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_requires_token() {
    let config = ServerConfig {
        auth_token: Some("secret".into()),
        ..Default::default()
    };
    let addr = spawn_server(create_app_with(config)).await;
    let url = format!("ws://{addr}/api/v1/stream");

    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());

    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", "Bearer secret".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());
}
