mod common;

use axum::extract::Form;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{eventually, spawn_gateway, write_config};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const ADMIN_TOKEN: &str = "it-admin-token-upstream";

const CONFIG: &str = r"
mode: enterprise
users:
  - username: admin
    accessToken: it-admin-token-upstream
";

struct MockUpstream {
    base: String,
    token_requests: Arc<AtomicU32>,
}

/// A minimal upstream MCP server + authorization server pair on one origin:
/// RFC 9728 + RFC 8414 discovery, RFC 7591 registration, and a token
/// endpoint accepting the authorization-code and refresh grants.
async fn spawn_mock_upstream(expires_in: i64) -> MockUpstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock addr");
    let base = format!("http://{addr}");

    let token_requests = Arc::new(AtomicU32::new(0));
    let counter = token_requests.clone();
    let origin = base.clone();

    let app = Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get({
                let origin = origin.clone();
                move || {
                    let origin = origin.clone();
                    async move {
                        Json(serde_json::json!({
                            "resource": origin,
                            "authorization_servers": [origin],
                            "bearer_methods_supported": ["header"],
                        }))
                    }
                }
            }),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get({
                let origin = origin.clone();
                move || {
                    let origin = origin.clone();
                    async move {
                        Json(serde_json::json!({
                            "issuer": origin,
                            "authorization_endpoint": format!("{origin}/authorize"),
                            "token_endpoint": format!("{origin}/token"),
                            "registration_endpoint": format!("{origin}/register"),
                        }))
                    }
                }
            }),
        )
        .route(
            "/register",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["grant_types"][0], "authorization_code");
                (
                    axum::http::StatusCode::CREATED,
                    Json(serde_json::json!({
                        "client_id": "upstream-client-id",
                        "client_secret": "upstream-client-secret",
                    })),
                )
            }),
        )
        .route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    match form["grant_type"].as_str() {
                        "authorization_code" => {
                            assert_eq!(form["code"], "XYZ");
                            assert_eq!(form["code_verifier"].len(), 43);
                            assert!(form.contains_key("resource"));
                            Json(serde_json::json!({
                                "access_token": format!("up-at-{n}"),
                                "token_type": "Bearer",
                                "expires_in": expires_in,
                                "refresh_token": "up-rt-1",
                                "scope": "mcp:read",
                            }))
                        }
                        "refresh_token" => {
                            assert_eq!(form["refresh_token"], "up-rt-1");
                            Json(serde_json::json!({
                                "access_token": format!("up-at-{n}"),
                                "token_type": "Bearer",
                                "expires_in": 3600,
                                "refresh_token": "up-rt-2",
                            }))
                        }
                        other => panic!("unexpected grant_type {other}"),
                    }
                }
            }),
        );

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        base,
        token_requests,
    }
}

async fn initiate(
    gateway_base: &str,
    http: &reqwest::Client,
    upstream_base: &str,
) -> anyhow::Result<(String, String)> {
    let resp = http
        .post(format!("{gateway_base}/api/v0/oauth/upstream/initiate"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({
            "server_name": "up",
            "server_url": upstream_base,
            "client_name": "canopy-gateway",
            "redirect_uri": format!("{gateway_base}/api/v0/oauth/upstream/callback"),
            "scopes": ["mcp:read"],
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await?;
    Ok((
        body["authorization_url"].as_str().expect("url").to_string(),
        body["state"].as_str().expect("state").to_string(),
    ))
}

#[tokio::test]
async fn upstream_oauth_end_to_end() -> anyhow::Result<()> {
    // Short expiry so the completed session immediately needs a refresh.
    let upstream = spawn_mock_upstream(120).await;
    let config = write_config(CONFIG)?;
    let gw = spawn_gateway(&config)?;
    let base = &gw.base;
    let http = reqwest::Client::new();

    let (authorization_url, state) = initiate(base, &http, &upstream.base).await?;
    assert!(authorization_url.starts_with(&format!("{}/authorize", upstream.base)));
    assert!(authorization_url.contains("code_challenge_method=S256"));
    assert!(authorization_url.contains("response_type=code"));
    // The RFC 8707 resource parameter is the upstream's canonical URI.
    let parsed = url::Url::parse(&authorization_url)?;
    let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
    assert_eq!(params["resource"], upstream.base);
    assert_eq!(params["state"], state);

    // A tampered state is rejected before any token exchange.
    let resp = http
        .get(format!("{base}/api/v0/oauth/upstream/callback"))
        .query(&[("server_name", "up"), ("code", "XYZ"), ("state", "wrong")])
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    assert_eq!(upstream.token_requests.load(Ordering::SeqCst), 0);

    // The real callback completes the flow.
    let resp = http
        .get(format!("{base}/api/v0/oauth/upstream/callback"))
        .query(&[
            ("server_name", "up"),
            ("code", "XYZ"),
            ("state", state.as_str()),
        ])
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(upstream.token_requests.load(Ordering::SeqCst), 1);

    // Status snapshot: metadata only, never the tokens.
    let status: serde_json::Value = http
        .get(format!("{base}/api/v0/oauth/upstream/status/up"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["server_name"], "up");
    assert_eq!(status["client_id"], "upstream-client-id");
    assert_eq!(status["has_refresh"], true);
    assert_eq!(status["token_type"], "Bearer");
    // 120 s to expiry is inside the 5-minute refresh window.
    assert_eq!(status["needs_refresh"], true);
    assert!(status.get("access_token").is_none());
    assert!(status.get("refresh_token").is_none());

    // The audit trail saw the session creation (as the admin) and the
    // callback completion (as system).
    eventually(Duration::from_secs(3), || {
        let http = http.clone();
        let base = base.clone();
        async move {
            let logs: serde_json::Value = http
                .get(format!(
                    "{base}/api/v0/audit-logs/oauth_upstream_session/up"
                ))
                .bearer_auth(ADMIN_TOKEN)
                .send()
                .await?
                .json()
                .await?;
            let logs = logs.as_array().expect("log array").clone();
            Ok(logs.iter().any(|l| l["operation"] == "CREATE" && l["actor_id"] == "admin")
                && logs.iter().any(|l| l["operation"] == "UPDATE" && l["actor_type"] == "system"))
        }
    })
    .await?;

    // Revoke the session.
    let resp = http
        .delete(format!("{base}/api/v0/oauth/upstream/up"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await?;
    assert_eq!(resp.status(), 200);

    let resp = http
        .get(format!("{base}/api/v0/oauth/upstream/status/up"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}

#[tokio::test]
async fn upstream_without_registration_endpoint_requires_manual_setup() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let origin = format!("http://{addr}");
    let origin_for_app = origin.clone();

    let app = Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get({
                let origin = origin_for_app.clone();
                move || {
                    let origin = origin.clone();
                    async move {
                        Json(serde_json::json!({
                            "resource": origin,
                            "authorization_servers": [origin],
                        }))
                    }
                }
            }),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get({
                let origin = origin_for_app.clone();
                move || {
                    let origin = origin.clone();
                    async move {
                        Json(serde_json::json!({
                            "issuer": origin,
                            "authorization_endpoint": format!("{origin}/authorize"),
                            "token_endpoint": format!("{origin}/token"),
                        }))
                    }
                }
            }),
        );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let config = write_config(CONFIG)?;
    let gw = spawn_gateway(&config)?;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{}/api/v0/oauth/upstream/initiate", gw.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({
            "server_name": "manual",
            "server_url": origin,
            "client_name": "canopy-gateway",
            "redirect_uri": "http://gw/cb",
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await?;
    assert!(
        body["error"]
            .as_str()
            .expect("error")
            .contains("manual client configuration required")
    );
    Ok(())
}

#[tokio::test]
async fn discovery_failure_maps_to_bad_gateway() -> anyhow::Result<()> {
    let config = write_config(CONFIG)?;
    let gw = spawn_gateway(&config)?;
    let http = reqwest::Client::new();

    // Nothing is listening at this origin.
    let resp = http
        .post(format!("{}/api/v0/oauth/upstream/initiate", gw.base))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({
            "server_name": "ghost",
            "server_url": "http://127.0.0.1:9",
            "client_name": "canopy-gateway",
            "redirect_uri": "http://gw/cb",
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await?;
    assert!(
        body["error"]
            .as_str()
            .expect("error")
            .contains("failed to discover OAuth endpoints")
    );
    Ok(())
}

#[tokio::test]
async fn upstream_management_requires_user_auth() -> anyhow::Result<()> {
    let config = write_config(CONFIG)?;
    let gw = spawn_gateway(&config)?;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{}/api/v0/oauth/upstream/initiate", gw.base))
        .json(&serde_json::json!({}))
        .send()
        .await?;
    assert_eq!(resp.status(), 401);

    let resp = http
        .get(format!("{}/api/v0/oauth/upstream/status/up", gw.base))
        .send()
        .await?;
    assert_eq!(resp.status(), 401);
    Ok(())
}
