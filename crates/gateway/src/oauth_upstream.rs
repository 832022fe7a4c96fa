use crate::secrets;
use crate::store::{UpstreamSessionRecord, UpstreamSessionStore};
use anyhow::Context as _;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use url::Url;

/// All consumer-side outbound calls share these bounds.
const OUTBOUND_TIMEOUT: StdDuration = StdDuration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// RFC 9728 protected resource metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

/// RFC 8414 authorization server metadata (the fields we consume).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct DynamicRegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: &'a [String],
    grant_types: [&'static str; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicRegistrationResponse {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub scope: String,
}

/// Shared outbound HTTP client for discovery, registration, token exchange
/// and refresh.
pub fn build_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(OUTBOUND_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .context("build upstream OAuth HTTP client")
}

/// `scheme://host[:port]` of a URL, for well-known path construction.
fn origin_of(raw: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(raw).with_context(|| format!("invalid URL: {raw}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL has no host: {raw}"))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}

/// OAuth client side: this gateway authenticating to upstream MCP servers.
#[derive(Clone)]
pub struct UpstreamOAuth {
    store: Arc<dyn UpstreamSessionStore>,
    http: reqwest::Client,
}

impl UpstreamOAuth {
    pub fn new(store: Arc<dyn UpstreamSessionStore>, http: reqwest::Client) -> Self {
        Self { store, http }
    }

    /// RFC 9728 discovery against the MCP server's origin.
    pub async fn discover_protected_resource(
        &self,
        server_url: &str,
    ) -> anyhow::Result<ProtectedResourceMetadata> {
        let well_known = format!(
            "{}/.well-known/oauth-protected-resource",
            origin_of(server_url)?
        );
        let resp = self
            .http
            .get(&well_known)
            .send()
            .await
            .context("fetch protected resource metadata")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("server returned status {}: {body}", status.as_u16());
        }
        resp.json().await.context("decode protected resource metadata")
    }

    /// RFC 8414 discovery against the authorization server's origin.
    pub async fn discover_authorization_server(
        &self,
        auth_server_url: &str,
    ) -> anyhow::Result<AuthorizationServerMetadata> {
        let well_known = format!(
            "{}/.well-known/oauth-authorization-server",
            origin_of(auth_server_url)?
        );
        let resp = self
            .http
            .get(&well_known)
            .send()
            .await
            .context("fetch authorization server metadata")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("server returned status {}: {body}", status.as_u16());
        }
        resp.json()
            .await
            .context("decode authorization server metadata")
    }

    /// RFC 7591 dynamic registration.
    pub async fn register_dynamic_client(
        &self,
        registration_endpoint: &str,
        client_name: &str,
        redirect_uris: &[String],
    ) -> anyhow::Result<DynamicRegistrationResponse> {
        if registration_endpoint.is_empty() {
            anyhow::bail!("registration endpoint not provided by authorization server");
        }

        let resp = self
            .http
            .post(registration_endpoint)
            .json(&DynamicRegistrationRequest {
                client_name,
                redirect_uris,
                grant_types: ["authorization_code", "refresh_token"],
            })
            .send()
            .await
            .context("register client")?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("registration failed with status {}: {body}", status.as_u16());
        }
        resp.json().await.context("decode registration response")
    }

    /// Build the PKCE authorization URL. Returns the URL and the fresh code
    /// verifier to stash on the session until the callback.
    pub fn authorization_url(
        auth_endpoint: &str,
        client_id: &str,
        redirect_uri: &str,
        resource: &str,
        state: &str,
    ) -> anyhow::Result<(String, String)> {
        let code_verifier = secrets::new_pkce_verifier()?;
        let code_challenge = secrets::pkce_challenge(&code_verifier);

        let mut auth_url = Url::parse(auth_endpoint)
            .with_context(|| format!("invalid authorization endpoint: {auth_endpoint}"))?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", secrets::PKCE_METHOD_S256)
            .append_pair("resource", resource);
        if !state.is_empty() {
            auth_url.query_pairs_mut().append_pair("state", state);
        }

        Ok((auth_url.to_string(), code_verifier))
    }

    /// Exchange an authorization code. Basic auth is attached when the
    /// upstream issued us a secret.
    #[allow(clippy::too_many_arguments)]
    pub async fn exchange_authorization_code(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
        resource: &str,
    ) -> anyhow::Result<UpstreamTokenResponse> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
            ("resource", resource),
            ("client_id", client_id),
        ];

        let mut req = self.http.post(token_endpoint).form(&form);
        if !client_secret.is_empty() {
            req = req.basic_auth(client_id, Some(client_secret));
        }

        let resp = req.send().await.context("exchange authorization code")?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token exchange failed with status {}: {body}", status.as_u16());
        }
        resp.json().await.context("decode token response")
    }

    pub async fn refresh_access_token(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        resource: &str,
    ) -> anyhow::Result<UpstreamTokenResponse> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("resource", resource),
            ("client_id", client_id),
        ];

        let mut req = self.http.post(token_endpoint).form(&form);
        if !client_secret.is_empty() {
            req = req.basic_auth(client_id, Some(client_secret));
        }

        let resp = req.send().await.context("refresh access token")?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed with status {}: {body}", status.as_u16());
        }
        resp.json().await.context("decode token response")
    }

    /// Apply an exchange result: store the tokens, clear the transient PKCE
    /// verifier and pending state, persist.
    pub async fn store_exchanged_tokens(
        &self,
        mut session: UpstreamSessionRecord,
        resp: &UpstreamTokenResponse,
    ) -> anyhow::Result<UpstreamSessionRecord> {
        session.access_token = resp.access_token.clone();
        session.refresh_token = resp.refresh_token.clone();
        session.token_type = resp.token_type.clone();
        if !resp.scope.is_empty() {
            session.scope = resp.scope.clone();
        }
        session.expires_at = if resp.expires_in > 0 {
            Some(Utc::now() + Duration::seconds(resp.expires_in))
        } else {
            None
        };
        session.code_verifier = String::new();
        session.pending_state = String::new();

        self.store.upsert_upstream_session(&session).await?;
        Ok(session)
    }

    /// Single entry point for the MCP session builder: return a currently
    /// valid bearer for the upstream, refreshing when inside the skew window.
    ///
    /// Concurrent callers may both refresh; either token stays valid and the
    /// stored refresh token converges (last-writer-wins).
    pub async fn get_or_refresh(&self, server_name: &str) -> anyhow::Result<String> {
        let mut session = self
            .store
            .get_upstream_session(server_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no OAuth session found for server {server_name}"))?;

        if !session.needs_refresh() {
            if session.refresh_token.is_empty() && session.is_access_token_expired() {
                anyhow::bail!("access token expired and no refresh token available");
            }
            return Ok(session.access_token);
        }

        let resp = self
            .refresh_access_token(
                &session.token_endpoint,
                &session.client_id,
                &session.client_secret,
                &session.refresh_token,
                &session.resource_uri,
            )
            .await
            .context("failed to refresh access token")?;

        session.access_token = resp.access_token.clone();
        session.token_type = resp.token_type.clone();
        session.expires_at = if resp.expires_in > 0 {
            Some(Utc::now() + Duration::seconds(resp.expires_in))
        } else {
            None
        };
        // Honor rotation: only overwrite when the upstream sent a new value.
        if !resp.refresh_token.is_empty() {
            session.refresh_token = resp.refresh_token.clone();
        }

        self.store.upsert_upstream_session(&session).await?;
        Ok(session.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::extract::Form;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn service_with(store: Arc<MemoryStore>) -> UpstreamOAuth {
        UpstreamOAuth::new(store, build_http_client().expect("http client"))
    }

    fn seeded_session(token_endpoint: &str, expires_at: Option<chrono::DateTime<Utc>>) -> UpstreamSessionRecord {
        UpstreamSessionRecord {
            mcp_server_name: "up".into(),
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            access_token: "old-token".into(),
            refresh_token: "rt-1".into(),
            token_type: "Bearer".into(),
            expires_at,
            scope: "mcp:read".into(),
            authorization_endpoint: "http://up/authorize".into(),
            token_endpoint: token_endpoint.into(),
            resource_uri: "http://up".into(),
            code_verifier: String::new(),
            redirect_uri: "http://gw/cb".into(),
            pending_state: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn origin_keeps_explicit_port() {
        assert_eq!(origin_of("http://up.example:8081/mcp").expect("origin"), "http://up.example:8081");
        assert_eq!(origin_of("https://up.example/mcp").expect("origin"), "https://up.example");
        assert!(origin_of("not a url").is_err());
    }

    #[test]
    fn authorization_url_carries_pkce_and_resource() -> anyhow::Result<()> {
        let (url, verifier) = UpstreamOAuth::authorization_url(
            "http://up/authorize",
            "cid",
            "http://gw/cb",
            "http://up",
            "st-123",
        )?;

        let parsed = Url::parse(&url)?;
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["redirect_uri"], "http://gw/cb");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["resource"], "http://up");
        assert_eq!(params["state"], "st-123");
        // The returned verifier matches the embedded challenge.
        assert_eq!(params["code_challenge"], secrets::pkce_challenge(&verifier));
        Ok(())
    }

    #[test]
    fn authorization_url_generates_fresh_verifier_per_call() -> anyhow::Result<()> {
        let (_, v1) =
            UpstreamOAuth::authorization_url("http://up/a", "c", "http://g/cb", "http://up", "")?;
        let (_, v2) =
            UpstreamOAuth::authorization_url("http://up/a", "c", "http://g/cb", "http://up", "")?;
        assert_ne!(v1, v2);
        Ok(())
    }

    #[tokio::test]
    async fn discovery_follows_both_well_known_documents() -> anyhow::Result<()> {
        let base = spawn_mock(Router::new().route(
            "/.well-known/oauth-protected-resource",
            get(|| async {
                Json(serde_json::json!({
                    "resource": "http://up.internal",
                    "authorization_servers": ["http://as.internal"],
                    "bearer_methods_supported": ["header"]
                }))
            }),
        ))
        .await;

        let svc = service_with(Arc::new(MemoryStore::new()));
        let meta = svc
            .discover_protected_resource(&format!("{base}/mcp"))
            .await?;
        assert_eq!(meta.resource, "http://up.internal");
        assert_eq!(meta.authorization_servers, vec!["http://as.internal"]);

        let as_base = spawn_mock(Router::new().route(
            "/.well-known/oauth-authorization-server",
            get(|| async {
                Json(serde_json::json!({
                    "issuer": "http://as.internal",
                    "authorization_endpoint": "http://as.internal/authorize",
                    "token_endpoint": "http://as.internal/token",
                    "registration_endpoint": "http://as.internal/register"
                }))
            }),
        ))
        .await;
        let as_meta = svc.discover_authorization_server(&as_base).await?;
        assert_eq!(as_meta.token_endpoint, "http://as.internal/token");
        assert_eq!(
            as_meta.registration_endpoint.as_deref(),
            Some("http://as.internal/register")
        );
        Ok(())
    }

    #[tokio::test]
    async fn discovery_failure_carries_upstream_status() {
        let base = spawn_mock(Router::new()).await; // no routes -> 404
        let svc = service_with(Arc::new(MemoryStore::new()));
        let err = svc
            .discover_protected_resource(&base)
            .await
            .expect_err("404 must fail discovery");
        assert!(err.to_string().contains("status 404"));
    }

    #[tokio::test]
    async fn dynamic_registration_posts_standard_grant_types() -> anyhow::Result<()> {
        let base = spawn_mock(Router::new().route(
            "/register",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["client_name"], "canopy");
                assert_eq!(body["grant_types"][0], "authorization_code");
                assert_eq!(body["grant_types"][1], "refresh_token");
                (
                    axum::http::StatusCode::CREATED,
                    Json(serde_json::json!({
                        "client_id": "issued-id",
                        "client_secret": "issued-secret"
                    })),
                )
            }),
        ))
        .await;

        let svc = service_with(Arc::new(MemoryStore::new()));
        let reg = svc
            .register_dynamic_client(
                &format!("{base}/register"),
                "canopy",
                &["http://gw/cb".to_string()],
            )
            .await?;
        assert_eq!(reg.client_id, "issued-id");
        assert_eq!(reg.client_secret.as_deref(), Some("issued-secret"));
        Ok(())
    }

    #[tokio::test]
    async fn registration_requires_an_endpoint() {
        let svc = service_with(Arc::new(MemoryStore::new()));
        let err = svc
            .register_dynamic_client("", "canopy", &[])
            .await
            .expect_err("empty endpoint must fail");
        assert!(err.to_string().contains("registration endpoint not provided"));
    }

    #[tokio::test]
    async fn code_exchange_sends_verifier_resource_and_basic_auth() -> anyhow::Result<()> {
        let base = spawn_mock(Router::new().route(
            "/token",
            post(
                |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| async move {
                    assert_eq!(form["grant_type"], "authorization_code");
                    assert_eq!(form["code"], "K");
                    assert_eq!(form["code_verifier"], "V");
                    assert_eq!(form["resource"], "http://up");
                    assert_eq!(form["client_id"], "cid");
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    assert!(auth.starts_with("Basic "));
                    Json(serde_json::json!({
                        "access_token": "at-1",
                        "token_type": "Bearer",
                        "expires_in": 3600,
                        "refresh_token": "rt-1",
                        "scope": "mcp:read"
                    }))
                },
            ),
        ))
        .await;

        let svc = service_with(Arc::new(MemoryStore::new()));
        let resp = svc
            .exchange_authorization_code(
                &format!("{base}/token"),
                "cid",
                "csecret",
                "K",
                "V",
                "http://gw/cb",
                "http://up",
            )
            .await?;
        assert_eq!(resp.access_token, "at-1");
        assert_eq!(resp.expires_in, 3600);
        Ok(())
    }

    #[tokio::test]
    async fn stored_exchange_clears_verifier_and_state() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let svc = service_with(store.clone());

        let mut session = seeded_session("http://unused/token", None);
        session.access_token = String::new();
        session.refresh_token = String::new();
        session.code_verifier = "pending-verifier".into();
        session.pending_state = "pending-state".into();

        let resp = UpstreamTokenResponse {
            access_token: "at-new".into(),
            token_type: "Bearer".into(),
            expires_in: 3600,
            refresh_token: "rt-new".into(),
            scope: "mcp:read".into(),
        };
        let session = svc.store_exchanged_tokens(session, &resp).await?;
        assert_eq!(session.access_token, "at-new");
        assert!(session.code_verifier.is_empty());
        assert!(session.pending_state.is_empty());
        assert!(session.expires_at.is_some());

        use crate::store::UpstreamSessionStore as _;
        let stored = store.get_upstream_session("up").await?.expect("session");
        assert!(stored.code_verifier.is_empty());
        assert!(!stored.access_token.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn get_or_refresh_without_session_fails() {
        let svc = service_with(Arc::new(MemoryStore::new()));
        let err = svc.get_or_refresh("missing").await.expect_err("no session");
        assert_eq!(
            err.to_string(),
            "no OAuth session found for server missing"
        );
    }

    #[tokio::test]
    async fn get_or_refresh_returns_stored_token_when_fresh() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        use crate::store::UpstreamSessionStore as _;
        store
            .upsert_upstream_session(&seeded_session(
                "http://unused/token",
                Some(Utc::now() + Duration::hours(1)),
            ))
            .await?;

        let svc = service_with(store);
        assert_eq!(svc.get_or_refresh("up").await?, "old-token");
        // No interleaving mutation: the same token again.
        assert_eq!(svc.get_or_refresh("up").await?, "old-token");
        Ok(())
    }

    #[tokio::test]
    async fn get_or_refresh_fails_when_expired_without_refresh_token() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        use crate::store::UpstreamSessionStore as _;
        let mut session = seeded_session("http://unused/token", Some(Utc::now() - Duration::minutes(1)));
        session.refresh_token = String::new();
        store.upsert_upstream_session(&session).await?;

        let svc = service_with(store);
        let err = svc.get_or_refresh("up").await.expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "access token expired and no refresh token available"
        );
        Ok(())
    }

    #[tokio::test]
    async fn get_or_refresh_rotates_and_persists() -> anyhow::Result<()> {
        let token_base = spawn_mock(Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["grant_type"], "refresh_token");
                assert_eq!(form["refresh_token"], "rt-1");
                assert_eq!(form["resource"], "http://up");
                Json(serde_json::json!({
                    "access_token": "at-refreshed",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "refresh_token": "rt-2"
                }))
            }),
        ))
        .await;

        let store = Arc::new(MemoryStore::new());
        use crate::store::UpstreamSessionStore as _;
        // Two minutes to expiry: inside the refresh window.
        store
            .upsert_upstream_session(&seeded_session(
                &format!("{token_base}/token"),
                Some(Utc::now() + Duration::minutes(2)),
            ))
            .await?;

        let svc = service_with(store.clone());
        assert_eq!(svc.get_or_refresh("up").await?, "at-refreshed");

        let stored = store.get_upstream_session("up").await?.expect("session");
        assert_eq!(stored.access_token, "at-refreshed");
        assert_eq!(stored.refresh_token, "rt-2");
        let expires_at = stored.expires_at.expect("expiry recorded");
        assert!(Utc::now() < expires_at - crate::store::UPSTREAM_REFRESH_SKEW);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_keeps_old_token_when_upstream_does_not_rotate() -> anyhow::Result<()> {
        let token_base = spawn_mock(Router::new().route(
            "/token",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "at-refreshed",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }))
            }),
        ))
        .await;

        let store = Arc::new(MemoryStore::new());
        use crate::store::UpstreamSessionStore as _;
        store
            .upsert_upstream_session(&seeded_session(
                &format!("{token_base}/token"),
                Some(Utc::now() + Duration::minutes(1)),
            ))
            .await?;

        let svc = service_with(store.clone());
        svc.get_or_refresh("up").await?;
        let stored = store.get_upstream_session("up").await?.expect("session");
        assert_eq!(stored.refresh_token, "rt-1");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_failure_surfaces_upstream_status() -> anyhow::Result<()> {
        let token_base = spawn_mock(Router::new().route(
            "/token",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "invalid_grant"})),
                )
            }),
        ))
        .await;

        let store = Arc::new(MemoryStore::new());
        use crate::store::UpstreamSessionStore as _;
        store
            .upsert_upstream_session(&seeded_session(
                &format!("{token_base}/token"),
                Some(Utc::now() - Duration::minutes(1)),
            ))
            .await?;

        let svc = service_with(store);
        let err = svc.get_or_refresh("up").await.expect_err("refresh must fail");
        assert!(format!("{err:#}").contains("status 400"));
        Ok(())
    }
}
