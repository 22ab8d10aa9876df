//! Integration tests for the reqwest-backed Status Client.
//!
//! A small axum server stands in for the proxy server. It is mounted under
//! a context path to exercise relative URL resolution and records every
//! request body and query it receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use proxy_session::client::http::HttpStatusClient;
use proxy_session::client::{is_alive, Liveness, StartRequest, StartResponse, StatusApi};
use proxy_session::config::ClientConfig;
use proxy_session::models::instance::{DesiredStatus, InstanceStatus};
use proxy_session::models::response::TerminationSignal;
use proxy_session::AppError;

#[derive(Default)]
struct Recorded {
    start_bodies: Vec<(String, String, Value)>,
    status_bodies: Vec<(String, Value)>,
    queries: Vec<HashMap<String, String>>,
}

type Shared = Arc<Mutex<Recorded>>;

fn instance_json(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "status": status,
        "specId": "demo",
        "displayName": "Demo",
        "runtimeValues": { "SHINYPROXY_PUBLIC_PATH": format!("/app_proxy/{id}/") },
        "startupTimestamp": 0
    })
}

fn success(data: Value) -> Response {
    (StatusCode::OK, Json(json!({ "status": "success", "data": data }))).into_response()
}

fn fail(code: StatusCode, reason: &str) -> Response {
    (code, Json(json!({ "status": "fail", "data": reason }))).into_response()
}

fn legacy_error(code: StatusCode, reason: &str) -> Response {
    (code, Json(json!({ "status": "error", "message": reason }))).into_response()
}

async fn start(
    State(rec): State<Shared>,
    Path((app, instance)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    rec.lock().unwrap().start_bodies.push((app.clone(), instance, body));
    match app.as_str() {
        "demo" => success(instance_json("p1", "New")),
        "expired" => legacy_error(StatusCode::UNAUTHORIZED, "shinyproxy_authentication_required"),
        _ => fail(StatusCode::BAD_REQUEST, "Maximum number of instances reached"),
    }
}

async fn proxy_status(
    State(rec): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    rec.lock().unwrap().queries.push(query);
    match id.as_str() {
        "p1" => success(instance_json("p1", "Up")),
        "expired" => legacy_error(StatusCode::UNAUTHORIZED, "shinyproxy_authentication_required"),
        _ => fail(StatusCode::NOT_FOUND, "app_stopped_or_non_existent"),
    }
}

async fn watch_status(
    State(rec): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    rec.lock().unwrap().queries.push(query);
    match id.as_str() {
        "p1" => success(instance_json("p1", "Paused")),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            success(instance_json("slow", "Up"))
        }
        _ => fail(StatusCode::GONE, "app_stopped_or_non_existent"),
    }
}

async fn put_status(
    State(rec): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    rec.lock().unwrap().status_bodies.push((id.clone(), body));
    match id.as_str() {
        "p1" => success(Value::Null),
        _ => fail(StatusCode::GONE, "app_stopped_or_non_existent"),
    }
}

async fn heartbeat(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "p1" => StatusCode::OK.into_response(),
        "gone" => fail(StatusCode::GONE, "app_stopped_or_non_existent"),
        "crashed" => fail(StatusCode::SERVICE_UNAVAILABLE, "app_crashed"),
        "expired" => legacy_error(StatusCode::UNAUTHORIZED, "shinyproxy_authentication_required"),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK.into_response()
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn app_root(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "crashed" => fail(StatusCode::SERVICE_UNAVAILABLE, "app_crashed"),
        "gone" => legacy_error(StatusCode::GONE, "app_stopped_or_non_existent"),
        _ => (StatusCode::OK, "<html>app</html>").into_response(),
    }
}

/// Start the fake proxy server; returns its context-path URL and recorder.
async fn serve() -> (String, Shared) {
    let recorded: Shared = Arc::default();
    let router = Router::new()
        .route("/ctx/app_i/{app}/{instance}", post(start))
        .route("/ctx/api/proxy/{id}", get(proxy_status))
        .route("/ctx/api/{id}/status", get(watch_status).put(put_status))
        .route("/ctx/heartbeat/{id}", post(heartbeat))
        .route("/app_proxy/{id}/", get(app_root))
        .with_state(Arc::clone(&recorded));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("fake server");
    });
    // No trailing slash: the config layer adds it.
    (format!("http://{addr}/ctx"), recorded)
}

fn client(base: &str, instance_override: Option<&str>) -> HttpStatusClient {
    let mut raw = format!("server_url = \"{base}\"\napp_name = \"demo\"\n");
    if let Some(server) = instance_override {
        raw.push_str(&format!("instance_override = \"{server}\"\n"));
    }
    let config = ClientConfig::from_toml_str(&raw).expect("valid config");
    HttpStatusClient::new(&config).expect("client")
}

// ── start ────────────────────────────────────────────────

#[tokio::test]
async fn start_posts_parameters_and_timezone() {
    let (base, recorded) = serve().await;
    let client = client(&base, None);
    let request = StartRequest {
        parameters: HashMap::from([("dataset".to_owned(), "iris".to_owned())]),
        timezone: "Europe/Brussels".into(),
    };

    let response = client.start_instance("demo", "_", &request).await.expect("start");

    let StartResponse::Started(instance) = response else {
        panic!("expected a started instance, got {response:?}");
    };
    assert_eq!(instance.id, "p1");
    assert_eq!(instance.status, InstanceStatus::New);
    assert_eq!(instance.runtime_values.public_path(), Some("/app_proxy/p1/"));

    let rec = recorded.lock().unwrap();
    let (app, app_instance, body) = &rec.start_bodies[0];
    assert_eq!((app.as_str(), app_instance.as_str()), ("demo", "_"));
    assert_eq!(
        *body,
        json!({ "parameters": { "dataset": "iris" }, "timezone": "Europe/Brussels" })
    );
}

#[tokio::test]
async fn refused_start_carries_the_server_message() {
    let (base, _recorded) = serve().await;
    let response = client(&base, None)
        .start_instance("busy", "_", &StartRequest::default())
        .await
        .expect("start");

    assert_eq!(
        response,
        StartResponse::Rejected(Some("Maximum number of instances reached".into()))
    );
}

#[tokio::test]
async fn start_with_expired_login_is_unauthorized() {
    let (base, _recorded) = serve().await;
    let err = client(&base, None)
        .start_instance("expired", "_", &StartRequest::default())
        .await
        .expect_err("must fail");

    assert!(matches!(err, AppError::Unauthorized(_)), "{err}");
}

// ── status ───────────────────────────────────────────────

#[tokio::test]
async fn get_status_returns_the_instance_or_none() {
    let (base, _recorded) = serve().await;
    let client = client(&base, None);

    let found = client.get_status("p1").await.expect("status");
    assert_eq!(found.map(|i| i.status), Some(InstanceStatus::Up));

    let missing = client.get_status("nope").await.expect("status");
    assert!(missing.is_none());

    let err = client.get_status("expired").await.expect_err("must fail");
    assert!(matches!(err, AppError::Unauthorized(_)), "{err}");
}

#[tokio::test]
async fn desired_status_is_sent_as_a_put_body() {
    let (base, recorded) = serve().await;
    let client = client(&base, None);
    let parameters = HashMap::from([("size".to_owned(), "large".to_owned())]);

    client
        .set_desired_status("p1", DesiredStatus::Stopping, None)
        .await
        .expect("stop");
    client
        .set_desired_status("p1", DesiredStatus::Resuming, Some(&parameters))
        .await
        .expect("resume");
    let err = client
        .set_desired_status("gone", DesiredStatus::Pausing, None)
        .await
        .expect_err("must fail");

    assert!(matches!(err, AppError::NotFound(_)), "{err}");
    let rec = recorded.lock().unwrap();
    assert_eq!(
        rec.status_bodies[0],
        ("p1".to_owned(), json!({ "desiredState": "Stopping", "parameters": null }))
    );
    assert_eq!(
        rec.status_bodies[1],
        (
            "p1".to_owned(),
            json!({ "desiredState": "Resuming", "parameters": { "size": "large" } })
        )
    );
}

#[tokio::test]
async fn watch_sends_the_long_poll_window() {
    let (base, recorded) = serve().await;
    let client = client(&base, None);

    let settled = client.watch_status("p1", 10).await.expect("watch");
    assert_eq!(settled.map(|i| i.status), Some(InstanceStatus::Paused));

    let gone = client.watch_status("gone", 10).await.expect("watch");
    assert!(gone.is_none());

    let rec = recorded.lock().unwrap();
    assert_eq!(rec.queries[0].get("watch").map(String::as_str), Some("true"));
    assert_eq!(rec.queries[0].get("timeout").map(String::as_str), Some("10"));
}

#[tokio::test]
async fn hung_long_poll_is_abandoned_after_window_and_margin() {
    let (base, _recorded) = serve().await;
    let raw = format!(
        "server_url = \"{base}\"\napp_name = \"demo\"\n[long_poll]\nrequest_margin_ms = 200\n"
    );
    let config = ClientConfig::from_toml_str(&raw).expect("valid config");
    let client = HttpStatusClient::new(&config).expect("client");

    let started = std::time::Instant::now();
    let err = client.watch_status("slow", 0).await.expect_err("must time out");

    assert!(matches!(err, AppError::Http(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn instance_override_is_added_to_every_request() {
    let (base, recorded) = serve().await;
    let client = client(&base, Some("server-2"));

    client.get_status("p1").await.expect("status");
    client.watch_status("p1", 5).await.expect("watch");

    let rec = recorded.lock().unwrap();
    assert_eq!(rec.queries.len(), 2);
    for query in &rec.queries {
        assert_eq!(
            query.get("sp_instance_override").map(String::as_str),
            Some("server-2")
        );
    }
    assert_eq!(rec.queries[1].get("watch").map(String::as_str), Some("true"));
}

// ── heartbeat ────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_answers_map_to_liveness() {
    let (base, _recorded) = serve().await;
    let client = client(&base, None);

    let cases = [
        ("p1", Liveness::Alive),
        ("gone", Liveness::Terminated(TerminationSignal::InstanceGone)),
        ("crashed", Liveness::Terminated(TerminationSignal::AppCrashed)),
        (
            "expired",
            Liveness::Terminated(TerminationSignal::AuthenticationRequired),
        ),
        ("flaky", Liveness::Unknown),
    ];
    for (id, expected) in cases {
        let liveness = client.heartbeat(id, None).await.expect("heartbeat");
        assert_eq!(liveness, expected, "{id}");
    }
}

#[tokio::test]
async fn liveness_probe_times_out_as_unknown() {
    let (base, _recorded) = serve().await;
    let client = client(&base, None);

    let err = client
        .heartbeat("slow", Some(Duration::from_millis(100)))
        .await
        .expect_err("must time out");
    assert!(err.is_transient(), "{err}");

    let liveness = is_alive(&client, "slow", Duration::from_millis(100)).await;
    assert_eq!(liveness, Liveness::Unknown);
}

#[tokio::test]
async fn unreachable_server_is_a_transient_error() {
    let client = client("http://127.0.0.1:1/ctx", None);
    let err = client.heartbeat("p1", None).await.expect_err("must fail");
    assert!(matches!(err, AppError::Http(_)), "{err}");
}

// ── crash probe ──────────────────────────────────────────

#[tokio::test]
async fn probe_detects_crashed_and_gone_apps() {
    let (base, _recorded) = serve().await;
    let client = client(&base, None);

    assert_eq!(client.probe_app("/app_proxy/p1/").await.expect("probe"), None);
    assert_eq!(
        client.probe_app("/app_proxy/crashed/").await.expect("probe"),
        Some(TerminationSignal::AppCrashed)
    );
    assert_eq!(
        client.probe_app("/app_proxy/gone/").await.expect("probe"),
        Some(TerminationSignal::InstanceGone)
    );
}

#[test]
fn relative_locations_resolve_under_the_context_path() {
    let plain = client("http://proxy.example/ctx", None);
    let url = plain.build_url("api/proxy/p1").expect("url");
    assert_eq!(url.as_str(), "http://proxy.example/ctx/api/proxy/p1");

    let pinned = client("http://proxy.example/ctx/", Some("blue"));
    let url = pinned.build_url("heartbeat/p1").expect("url");
    assert_eq!(
        url.as_str(),
        "http://proxy.example/ctx/heartbeat/p1?sp_instance_override=blue"
    );
}
