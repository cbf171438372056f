//! Integration tests for the shared HTTP router, driven through the public
//! `build_router`/`TunnelGate` surface the same way both the local and
//! remote pipelines serve it.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use tunnel_agent::{build_router, Configuration, CurrentChannel, ExposedUpstream, TunnelGate};

fn config_with_upstreams(exposed_http_servers: Vec<ExposedUpstream>) -> Configuration {
    Configuration {
        server_host: "relay.example.com".into(),
        server_port: 22,
        server_public_key: None,
        server_public_key_type: None,
        ssh_username: "agent".into(),
        ssh_listen_port: 9000,
        ssh_private_key: String::new(),
        local_server_addr: "127.0.0.1:0".into(),
        http_get_on_close: None,
        exposed_http_servers,
    }
}

#[tokio::test]
async fn close_without_a_prior_open_returns_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let gate = TunnelGate::from_sentinel_at(&dir.path().join("tunnelactive.flag"));
    let config = config_with_upstreams(vec![]);
    let router = build_router(gate, CurrentChannel::new(), &config);

    let response = router
        .oneshot(Request::builder().uri("/close").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn control_routes_take_precedence_over_same_named_upstream_prefixes() {
    // Registering upstreams literally named "open"/"close" must not shadow
    // the control routes.
    let upstreams = vec![
        ExposedUpstream {
            prefix: "open".into(),
            url: "http://127.0.0.1:9101".into(),
        },
        ExposedUpstream {
            prefix: "close".into(),
            url: "http://127.0.0.1:9102".into(),
        },
    ];
    let dir = tempfile::tempdir().unwrap();
    let gate = TunnelGate::from_sentinel_at(&dir.path().join("tunnelactive.flag"));
    let config = config_with_upstreams(upstreams);
    let router = build_router(gate, CurrentChannel::new(), &config);

    let response = router
        .oneshot(Request::builder().uri("/open").body(Body::empty()).unwrap())
        .await
        .unwrap();

    // A 200 here means the control handler ran (it returns 200 the first
    // time); if the upstream prefix had shadowed it, the unreachable
    // upstream would instead yield a 500 from the proxy handler.
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unmatched_path_yields_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let gate = TunnelGate::from_sentinel_at(&dir.path().join("tunnelactive.flag"));
    let config = config_with_upstreams(vec![]);
    let router = build_router(gate, CurrentChannel::new(), &config);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/no-such-route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
