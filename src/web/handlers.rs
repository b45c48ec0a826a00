//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, Host, HostStatus, RecordKind, RecordTier};
use crate::hub::{render_config_yaml, VERSION};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// API: Fleet
// ============================================================================

/// The public key agents must allow, plus the hub version.
pub async fn handle_get_key(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "key": state.public_key, "v": VERSION }))
}

#[derive(Debug, Deserialize)]
pub struct TestNotificationRequest {
    pub url: String,
}

pub async fn handle_test_notification(
    State(state): State<AppState>,
    Json(req): Json<TestNotificationRequest>,
) -> impl IntoResponse {
    if req.url.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "err": "url is required" })));
    }

    match state.alerts.send_test_notification(&state.notifier, &req.url).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "err": false }))),
        Err(e) => {
            tracing::warn!("Test notification to {} failed: {}", req.url, e);
            (StatusCode::OK, Json(json!({ "err": e.to_string() })))
        }
    }
}

pub async fn handle_config_yaml(State(state): State<AppState>) -> impl IntoResponse {
    match render_config_yaml(&state.store) {
        Ok(yaml) => ([(header::CONTENT_TYPE, "text/yaml")], yaml).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Hosts
// ============================================================================

pub async fn handle_get_hosts(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_hosts() {
        Ok(hosts) => Json(hosts).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateHostRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
}

pub async fn handle_create_host(
    State(state): State<AppState>,
    Json(req): Json<CreateHostRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    let address = req.address.trim();
    if name.is_empty() || address.is_empty() {
        return (StatusCode::BAD_REQUEST, "name and address are required").into_response();
    }

    match state.store.get_host_by_name(name) {
        Ok(Some(_)) => return (StatusCode::CONFLICT, "Host name already in use").into_response(),
        Ok(None) => {}
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    let mut host = Host {
        name: name.to_string(),
        address: address.to_string(),
        ..Default::default()
    };
    if let Some(port) = req.port.filter(|p| *p > 0) {
        host.port = port;
    }

    // Polling starts at the SystemManager's next reconcile.
    match state.store.add_host(&mut host) {
        Ok(_) => (StatusCode::CREATED, Json(host)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateHostRequest {
    pub paused: bool,
}

/// Pause or resume a host. A resumed host starts over as pending.
pub async fn handle_update_host(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateHostRequest>,
) -> impl IntoResponse {
    let host = match state.store.get_host(id) {
        Ok(h) => h,
        Err(DbError::NotFound) => return (StatusCode::NOT_FOUND, "Host not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let status = match (req.paused, host.status) {
        (true, _) => HostStatus::Paused,
        (false, HostStatus::Paused) => HostStatus::Pending,
        (false, current) => current,
    };

    if status != host.status {
        if let Err(e) = state.store.set_host_status(id, status) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        tracing::info!("Host {} is now {}", host.name, status);
    }

    match state.store.get_host(id) {
        Ok(h) => Json(h).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_delete_host(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_host(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Host not found").into_response(),
        Err(e @ DbError::InUse(_)) => (StatusCode::CONFLICT, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Records
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub host_id: i64,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiRecord {
    pub time: DateTime<Utc>,
    pub tier: &'static str,
    pub stats: serde_json::Value,
}

pub async fn handle_get_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> impl IntoResponse {
    let tier = match query.tier.as_deref().unwrap_or("1m").parse::<RecordTier>() {
        Ok(t) => t,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let kind = match query.kind.as_deref().unwrap_or("system").parse::<RecordKind>() {
        Ok(k) => k,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    // Default range: everything the tier still retains.
    let end = parse_time(query.end.as_deref())
        .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(1));
    let start = parse_time(query.start.as_deref()).unwrap_or_else(|| end - tier.default_retention());

    let records = match state.store.get_records(query.host_id, kind, tier, start, end) {
        Ok(r) => r,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let records: Vec<ApiRecord> = records
        .into_iter()
        .filter_map(|r| {
            let stats = serde_json::from_str(&r.payload).ok()?;
            Some(ApiRecord {
                time: r.time,
                tier: r.tier.as_str(),
                stats,
            })
        })
        .collect();

    Json(records).into_response()
}

fn parse_time(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::super::Server;
    use super::*;
    use crate::alerts::{AlertManager, WebhookNotifier};
    use crate::config::ServerConfig;
    use crate::db::{AlertRule, StatsRecord, Store, User};

    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    struct TestApi {
        _file: NamedTempFile,
        store: Arc<Store>,
        base: String,
        http: reqwest::Client,
    }

    async fn serve() -> TestApi {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let notifier = Arc::new(WebhookNotifier::new(store.clone()));
        let alerts = Arc::new(AlertManager::new(store.clone(), notifier.clone(), "http://hub"));

        let server = Server::new(AppState {
            config: ServerConfig::default(),
            store: store.clone(),
            public_key: "ssh-ed25519 AAAAtest".to_string(),
            alerts,
            notifier,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let router = server.routes();
        tokio::spawn(async move { axum::serve(listener, router).await });

        TestApi {
            _file: file,
            store,
            base,
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn test_get_key() {
        let api = serve().await;
        let body: serde_json::Value = api
            .http
            .get(format!("{}/api/fleet/getkey", api.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["key"], "ssh-ed25519 AAAAtest");
        assert_eq!(body["v"], VERSION);
    }

    #[tokio::test]
    async fn test_host_lifecycle() {
        let api = serve().await;

        let resp = api
            .http
            .post(format!("{}/api/hosts", api.base))
            .json(&json!({ "name": "web-1", "address": "10.0.0.5" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let host: Host = resp.json().await.unwrap();
        assert_eq!(host.port, crate::db::DEFAULT_AGENT_PORT);

        let dup = api
            .http
            .post(format!("{}/api/hosts", api.base))
            .json(&json!({ "name": "web-1", "address": "10.0.0.6" }))
            .send()
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let paused: Host = api
            .http
            .patch(format!("{}/api/hosts/{}", api.base, host.id))
            .json(&json!({ "paused": true }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(paused.status, HostStatus::Paused);

        let resumed: Host = api
            .http
            .patch(format!("{}/api/hosts/{}", api.base, host.id))
            .json(&json!({ "paused": false }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resumed.status, HostStatus::Pending);

        // Alert rules pin the host.
        let mut user = User {
            email: "ops@example.com".to_string(),
            ..Default::default()
        };
        api.store.add_user(&mut user).unwrap();
        let mut rule = AlertRule {
            host_id: host.id,
            user_id: user.id,
            ..Default::default()
        };
        api.store.add_alert_rule(&mut rule).unwrap();

        let url = format!("{}/api/hosts/{}", api.base, host.id);
        assert_eq!(api.http.delete(&url).send().await.unwrap().status(), StatusCode::CONFLICT);

        api.store.delete_alert_rule(rule.id).unwrap();
        assert_eq!(api.http.delete(&url).send().await.unwrap().status(), StatusCode::NO_CONTENT);
        assert_eq!(api.http.delete(&url).send().await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_records() {
        let api = serve().await;
        let now = Utc::now();
        api.store
            .upsert_records(
                RecordKind::System,
                &[StatsRecord {
                    host_id: 1,
                    tier: RecordTier::Raw,
                    time: now - ChronoDuration::minutes(5),
                    payload: r#"{"cpu":12.5}"#.to_string(),
                }],
            )
            .unwrap();

        let records: Vec<serde_json::Value> = api
            .http
            .get(format!("{}/api/records?host_id=1", api.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tier"], "1m");
        assert_eq!(records[0]["stats"]["cpu"], 12.5);

        let bad = api
            .http
            .get(format!("{}/api/records?host_id=1&tier=5m", api.base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_yaml() {
        let api = serve().await;
        let mut host = Host {
            name: "db-1".to_string(),
            address: "10.0.0.9".to_string(),
            ..Default::default()
        };
        api.store.add_host(&mut host).unwrap();

        let text = api
            .http
            .get(format!("{}/api/fleet/config-yaml", api.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("name: db-1"));
        assert!(text.contains("host: 10.0.0.9"));
    }

    #[tokio::test]
    async fn test_test_notification_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let receiver = axum::Router::new().route(
            "/hook",
            axum::routing::post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hook = format!("http://{}/hook", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, receiver).await });

        let api = serve().await;
        let body: serde_json::Value = api
            .http
            .post(format!("{}/api/fleet/test-notification", api.base))
            .json(&json!({ "url": hook }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["err"], false);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered["title"], "Test Alert");
        assert_eq!(delivered["link"], "http://hub/settings/notifications");
    }

    #[tokio::test]
    async fn test_test_notification_failure_is_reported() {
        let api = serve().await;
        let body: serde_json::Value = api
            .http
            .post(format!("{}/api/fleet/test-notification", api.base))
            .json(&json!({ "url": "http://127.0.0.1:1/hook" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["err"].is_string());
    }
}
