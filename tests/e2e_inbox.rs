//! E2E tests for the inbound wire contract
//!
//! Boots the full axum surface over scratch storage and verifies the
//! status-code mapping of the inbox endpoint and the audit surface.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{INSTANCE_ACTOR, StubIngest, test_config};
use tempfile::TempDir;
use tidecast::data::{Actor, Database, EntityId};
use tidecast::{AppState, build_router};

/// Test server instance
struct TestServer {
    addr: String,
    state: AppState,
    client: reqwest::Client,
    _temp_dir: TempDir,
}

impl TestServer {
    /// Boot a server on an ephemeral port
    ///
    /// The instance actor is seeded with a small key pair first so state
    /// initialization does not spend time generating a production-sized
    /// key.
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let config = test_config(&db_path);

        {
            let db = Database::connect(&db_path).await.unwrap();
            let (private_pem, public_pem) = common::generate_keypair();
            db.insert_actor(&Actor {
                id: EntityId::new().0,
                identity: INSTANCE_ACTOR.to_string(),
                key_id: format!("{}#main-key", INSTANCE_ACTOR),
                private_key_pem: private_pem,
                public_key_pem: public_pem,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let state = AppState::new(
            config,
            Arc::new(StubIngest::accepting()),
            Arc::new(common::ApproveAll),
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr,
            state,
            client,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn unsigned_inbox_post_maps_to_401() {
    let server = TestServer::new().await;

    let body = serde_json::json!({
        "type": "Like",
        "id": "https://remote.example/activities/1",
        "actor": "https://remote.example/users/alice",
        "object": "https://local.example/videos/1",
    });

    let response = server
        .client
        .post(server.url("/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Nothing was persisted.
    assert!(
        server
            .state
            .db
            .get_activity_by_uri("https://remote.example/activities/1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn garbage_signature_header_maps_to_401() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/inbox"))
        .header("Content-Type", "application/activity+json")
        .header("Signature", "not-a-signature")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn audit_deliveries_requires_a_filter() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/audit/deliveries"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn audit_surface_lists_activities_by_actor() {
    let server = TestServer::new().await;

    let activity = tidecast::data::Activity {
        id: EntityId::new().0,
        uri: "https://local.example/activities/audit-1".to_string(),
        kind: "Create".to_string(),
        actor: INSTANCE_ACTOR.to_string(),
        target: None,
        body: "{}".to_string(),
        origin_local: true,
        created_at: Utc::now(),
    };
    server.state.db.insert_activity(&activity).await.unwrap();

    let response = server
        .client
        .get(server.url(&format!("/audit/activities?actor={}", INSTANCE_ACTOR)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json: serde_json::Value = response.json().await.unwrap();
    let activities = json["activities"].as_array().unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0]["uri"], "https://local.example/activities/audit-1");

    let response = server
        .client
        .get(server.url(&format!(
            "/audit/deliveries?activity={}",
            activity.id
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json: serde_json::Value = response.json().await.unwrap();
    assert!(json["deliveries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_endpoint_is_exposed() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
