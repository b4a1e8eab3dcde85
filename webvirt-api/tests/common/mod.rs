//! Common test utilities and helpers for webvirt-api tests
//!
//! Builds the router over the orchestrator's in-memory backends so handlers
//! run the real workflows without Proxmox or LDAP.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use tower::ServiceExt;
use webvirt_api::{create_app, AppState, Config};
use webvirt_orchestrator::test_utils::TestEnv;
use webvirt_orchestrator::VmSpec;

pub const ADMIN: &str = "trcadmin";

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub env: TestEnv,
}

impl TestClient {
    pub async fn new() -> Self {
        let env = TestEnv::new().await;
        let config = Config {
            admin_user: ADMIN.to_string(),
            password_length: 8,
            home_prefix: "/home".to_string(),
            ..Config::from_lookup(|_| None)
        };
        let app = create_app(AppState::new(env.orchestrator.clone(), &config));

        Self { app, env }
    }

    /// Send a request to the API
    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-webvirt-user", user);
        }

        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send_request(request).await
    }

    pub async fn get(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        self.send("GET", uri, user, None).await
    }

    pub async fn post(&self, uri: &str, user: Option<&str>, body: serde_json::Value) -> Response<Body> {
        self.send("POST", uri, user, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, user: Option<&str>, body: serde_json::Value) -> Response<Body> {
        self.send("PATCH", uri, user, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        self.send("DELETE", uri, user, None).await
    }
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

pub fn vm_spec(name: &str) -> VmSpec {
    VmSpec {
        name: name.to_string(),
        core_count: 2,
        memory: 2048,
        duration: 60,
    }
}

pub fn spec_json(name: &str) -> serde_json::Value {
    serde_json::to_value(vm_spec(name)).expect("Failed to serialize spec")
}
