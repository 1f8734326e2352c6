#![allow(clippy::panic, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use tunnelsync_daemon::{DiscoveryError, TunnelDiscoverer, TunnelEndpoints};

async fn discoverer_for(router: Router) -> TunnelDiscoverer {
    let addr = common::spawn_stub(router).await;
    TunnelDiscoverer::new(
        tunnelsync_daemon::http::build_client().unwrap(),
        format!("http://{addr}/api/tunnels"),
        3000,
        5000,
        Duration::from_secs(5),
    )
}

fn tunnels(body: Value) -> Router {
    Router::new().route(
        "/api/tunnels",
        get(move || {
            let body = body.clone();
            async move { Json(body) }
        }),
    )
}

#[tokio::test]
async fn resolves_both_roles_from_broker() {
    let discoverer = discoverer_for(tunnels(json!({
        "tunnels": [
            {"name": "backend", "public_url": "https://b.ngrok.io", "config": {"addr": "http://localhost:5000"}},
            {"name": "frontend", "public_url": "https://a.ngrok.io", "config": {"addr": "http://localhost:3000"}}
        ],
        "uri": "/api/tunnels"
    })))
    .await;

    let endpoints = discoverer.discover().await.unwrap();
    assert_eq!(
        endpoints,
        TunnelEndpoints::new("https://a.ngrok.io", "https://b.ngrok.io")
    );
}

#[tokio::test]
async fn insecure_tunnel_fails_discovery() {
    let discoverer = discoverer_for(tunnels(json!({
        "tunnels": [
            {"public_url": "http://a.ngrok.io", "config": {"addr": "http://localhost:3000"}},
            {"public_url": "https://b.ngrok.io", "config": {"addr": "http://localhost:5000"}}
        ]
    })))
    .await;

    assert!(matches!(
        discoverer.discover().await,
        Err(DiscoveryError::InsecureUrl(_))
    ));
}

#[tokio::test]
async fn missing_backend_tunnel_fails_discovery() {
    let discoverer = discoverer_for(tunnels(json!({
        "tunnels": [
            {"public_url": "https://a.ngrok.io", "config": {"addr": "http://localhost:3000"}}
        ]
    })))
    .await;

    match discoverer.discover().await {
        Err(DiscoveryError::MissingRole { missing }) => assert_eq!(missing, vec!["backend"]),
        other => panic!("expected MissingRole, got {other:?}"),
    }
}

#[tokio::test]
async fn broker_error_status_is_reported() {
    let router = Router::new().route(
        "/api/tunnels",
        get(|| async { (StatusCode::BAD_GATEWAY, "starting") }),
    );
    let discoverer = discoverer_for(router).await;

    assert!(matches!(
        discoverer.discover().await,
        Err(DiscoveryError::BrokerStatus { status: 502 })
    ));
}

#[tokio::test]
async fn malformed_body_is_invalid_response() {
    let router = Router::new().route("/api/tunnels", get(|| async { "not json" }));
    let discoverer = discoverer_for(router).await;

    assert!(matches!(
        discoverer.discover().await,
        Err(DiscoveryError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn unreachable_broker_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let discoverer = TunnelDiscoverer::new(
        tunnelsync_daemon::http::build_client().unwrap(),
        format!("http://{addr}/api/tunnels"),
        3000,
        5000,
        Duration::from_secs(2),
    );

    match discoverer.discover().await {
        Err(DiscoveryError::Unreachable { url, .. }) => assert!(url.ends_with("/api/tunnels")),
        other => panic!("expected Unreachable, got {other:?}"),
    }
}
