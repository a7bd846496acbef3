use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use bytes::Bytes;
use chrono::NaiveDateTime;
use lambda_fanout::{
    config::FanoutConfig, invoke_batch, invoke_batch_with_client, BatchError, Credentials,
    DispatchOptions, Dispatcher, ErrorKind, InvocationRequest, InvocationType, Invoker, Signer,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

const DOMAIN: &str = "fanout.test";

#[derive(Debug, Clone)]
struct Received {
    function: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone, Default)]
struct UpstreamState {
    received: Arc<Mutex<Vec<Received>>>,
}

async fn invoke(
    State(state): State<UpstreamState>,
    Path(function): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.received.lock().await.push(Received {
        function: function.clone(),
        headers: headers.clone(),
        body: body.clone(),
    });

    match function.as_str() {
        "denied" => (
            StatusCode::FORBIDDEN,
            r#"{"message":"The security token included in the request is invalid."}"#,
        )
            .into_response(),
        "queued" => StatusCode::ACCEPTED.into_response(),
        _ => {
            let payload: Value = serde_json::from_slice(&body).unwrap();
            axum::Json(json!({ "function": function, "payload": payload })).into_response()
        }
    }
}

struct Upstream {
    addr: SocketAddr,
    state: UpstreamState,
    shutdown: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<()>,
}

async fn start_upstream() -> Upstream {
    let state = UpstreamState::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/2015-03-31/functions/:function/invocations", post(invoke))
        .with_state(state.clone());

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    Upstream {
        addr,
        state,
        shutdown,
        server,
    }
}

fn credentials() -> Arc<Credentials> {
    Arc::new(Credentials::new(
        "AKIDEXAMPLE",
        "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
        Some("session-token".to_string()),
    ))
}

/// A client whose regional hosts all resolve to the loopback upstream.
fn loopback_client(addr: SocketAddr, regions: &[&str]) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    for region in regions {
        builder = builder.resolve(&format!("lambda.{region}.{DOMAIN}"), addr);
    }
    builder.build().unwrap()
}

fn loopback_endpoint(addr: SocketAddr) -> String {
    format!("http://lambda.{{region}}.{DOMAIN}:{}", addr.port())
}

fn dispatcher(addr: SocketAddr, regions: &[&str]) -> Dispatcher {
    Dispatcher::new(
        Invoker::new(
            Signer::new(credentials()),
            Arc::new(loopback_client(addr, regions)),
        ),
        DispatchOptions {
            endpoint: loopback_endpoint(addr),
            max_concurrency: None,
        },
    )
}

fn batch_config(addr: SocketAddr) -> FanoutConfig {
    FanoutConfig {
        default_region: Some("us-east-1".to_string()),
        endpoint: loopback_endpoint(addr),
        max_concurrency: Some(2),
        ..FanoutConfig::default()
    }
}

#[tokio::test]
async fn signed_body_arrives_byte_identical_and_verifies() {
    let upstream = start_upstream().await;
    let d = dispatcher(upstream.addr, &["us-east-1", "eu-west-1"]);

    let out = d
        .invoke_all(
            &[
                InvocationRequest::new("alpha", json!({"a": 1, "b": [1, 2, 3]})),
                InvocationRequest::new("beta", json!({"n": 2})).with_region("eu-west-1"),
                InvocationRequest::new("queued", json!({}))
                    .with_invocation_type(InvocationType::Event),
            ],
            Some("us-east-1"),
        )
        .await
        .unwrap();

    assert_eq!(
        out,
        vec![
            json!({"function": "alpha", "payload": {"a": 1, "b": [1, 2, 3]}}),
            json!({"function": "beta", "payload": {"n": 2}}),
            Value::Null,
        ]
    );

    let received = upstream.state.received.lock().await.clone();
    assert_eq!(received.len(), 3);

    let alpha = received.iter().find(|r| r.function == "alpha").unwrap();
    assert_eq!(alpha.body.as_ref(), br#"{"a":1,"b":[1,2,3]}"#);
    assert_eq!(alpha.headers["content-type"], "application/json");
    assert_eq!(alpha.headers["x-amz-invocation-type"], "RequestResponse");
    assert_eq!(alpha.headers["x-amz-security-token"], "session-token");
    assert_eq!(
        alpha.headers["host"],
        format!("lambda.us-east-1.{DOMAIN}:{}", upstream.addr.port()).as_str()
    );

    // Re-sign what the server saw at the advertised timestamp: it must reproduce the signature.
    let amz_date = alpha.headers["x-amz-date"].to_str().unwrap();
    let at = NaiveDateTime::parse_from_str(amz_date, "%Y%m%dT%H%M%SZ")
        .unwrap()
        .and_utc();
    let url = format!(
        "http://lambda.us-east-1.{DOMAIN}:{}/2015-03-31/functions/alpha/invocations",
        upstream.addr.port()
    );
    let payload: Value = serde_json::from_slice(&alpha.body).unwrap();
    let expected = Signer::new(credentials())
        .sign_at(&url, &payload, InvocationType::RequestResponse, at)
        .unwrap();
    assert_eq!(
        alpha.headers["authorization"],
        expected.headers["authorization"]
    );
    assert!(alpha.headers["authorization"]
        .to_str()
        .unwrap()
        .contains("/us-east-1/lambda/aws4_request"));

    let beta = received.iter().find(|r| r.function == "beta").unwrap();
    assert!(beta.headers["authorization"]
        .to_str()
        .unwrap()
        .contains("/eu-west-1/lambda/aws4_request"));

    let queued = received.iter().find(|r| r.function == "queued").unwrap();
    assert_eq!(queued.headers["x-amz-invocation-type"], "Event");

    drop(d);
    let _ = upstream.shutdown.send(());
    upstream.server.await.unwrap();
}

#[tokio::test]
async fn rejected_signature_fails_the_whole_batch() {
    let upstream = start_upstream().await;
    let d = dispatcher(upstream.addr, &["us-east-1"]);

    let err = d
        .invoke_all(
            &[
                InvocationRequest::new("alpha", json!({})),
                InvocationRequest::new("denied", json!({})),
            ],
            Some("us-east-1"),
        )
        .await
        .unwrap_err();

    match err {
        BatchError::Invocation {
            index,
            function_name,
            source,
        } => {
            assert_eq!(index, 1);
            assert_eq!(function_name, "denied");
            assert_eq!(source.kind(), ErrorKind::Authentication);
            assert!(source.to_string().contains("security token"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    drop(d);
    let _ = upstream.shutdown.send(());
    upstream.server.await.unwrap();
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = dispatcher(addr, &["us-east-1"])
        .invoke_all(&[InvocationRequest::new("alpha", json!({}))], Some("us-east-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn batch_entry_point_runs_over_its_own_client() {
    let upstream = start_upstream().await;
    let config = batch_config(upstream.addr);

    let out = invoke_batch_with_client(
        credentials(),
        loopback_client(upstream.addr, &["us-east-1", "eu-west-1"]),
        &[
            InvocationRequest::new("alpha", json!({"a": 1})),
            InvocationRequest::new("beta", json!({"b": 2})).with_region("eu-west-1"),
            InvocationRequest::new("gamma", json!({"c": 3})),
        ],
        &config,
    )
    .await
    .unwrap();

    assert_eq!(
        out,
        vec![
            json!({"function": "alpha", "payload": {"a": 1}}),
            json!({"function": "beta", "payload": {"b": 2}}),
            json!({"function": "gamma", "payload": {"c": 3}}),
        ]
    );

    let received = upstream.state.received.lock().await.clone();
    assert_eq!(received.len(), 3);
    let beta = received.iter().find(|r| r.function == "beta").unwrap();
    assert!(beta.headers["authorization"]
        .to_str()
        .unwrap()
        .contains("/eu-west-1/lambda/aws4_request"));

    let _ = upstream.shutdown.send(());
    upstream.server.await.unwrap();
}

#[tokio::test]
async fn batch_entry_point_surfaces_rejected_signature() {
    let upstream = start_upstream().await;
    let config = batch_config(upstream.addr);

    let err = invoke_batch_with_client(
        credentials(),
        loopback_client(upstream.addr, &["us-east-1"]),
        &[
            InvocationRequest::new("alpha", json!({})),
            InvocationRequest::new("denied", json!({})),
        ],
        &config,
    )
    .await
    .unwrap_err();

    let batch = err.downcast_ref::<BatchError>().unwrap();
    assert_eq!(batch.kind(), ErrorKind::Authentication);
    assert!(matches!(batch, BatchError::Invocation { index: 1, .. }));

    let _ = upstream.shutdown.send(());
    upstream.server.await.unwrap();
}

#[tokio::test]
async fn batch_without_any_region_never_leaves_the_process() {
    let upstream = start_upstream().await;
    let config = FanoutConfig {
        default_region: None,
        ..batch_config(upstream.addr)
    };

    let err = invoke_batch(
        credentials(),
        &[
            InvocationRequest::new("alpha", json!({})).with_region("us-east-1"),
            InvocationRequest::new("beta", json!({})),
        ],
        &config,
    )
    .await
    .unwrap_err();

    let batch = err.downcast_ref::<BatchError>().unwrap();
    assert_eq!(batch.kind(), ErrorKind::Configuration);
    assert_eq!(batch.missing_region_indices(), vec![1]);
    assert!(upstream.state.received.lock().await.is_empty());

    let _ = upstream.shutdown.send(());
    upstream.server.await.unwrap();
}
