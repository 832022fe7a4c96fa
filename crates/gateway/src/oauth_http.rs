use crate::AppState;
use crate::auth_middleware::AuthedUser;
use crate::oauth_issuer::{ACCESS_TOKEN_TTL, OAuthIssuer};
use crate::secrets;
use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// OAuth error kinds carried on the wire as `{error, error_description}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    InvalidScope,
    UnsupportedGrantType,
    UnsupportedResponseType,
    AccessDenied,
    ServerError,
}

impl OAuthErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::InvalidClient => StatusCode::UNAUTHORIZED,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug)]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub description: String,
    status_override: Option<StatusCode>,
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            status_override: None,
        }
    }

    /// `invalid_client` with 400 (missing rather than wrong credentials).
    fn missing_client_auth() -> Self {
        Self {
            kind: OAuthErrorKind::InvalidClient,
            description: "Client authentication required".to_string(),
            status_override: Some(StatusCode::BAD_REQUEST),
        }
    }

    fn server_error(err: &anyhow::Error, public_description: &str) -> Self {
        tracing::error!(error = %err, "oauth endpoint internal failure");
        Self::new(OAuthErrorKind::ServerError, public_description)
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status_override.unwrap_or_else(|| self.kind.status());
        (
            status,
            Json(serde_json::json!({
                "error": self.kind.as_str(),
                "error_description": self.description,
            })),
        )
            .into_response()
    }
}

/// Externally visible base URL: configured override, else forwarded proto +
/// Host header.
pub fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(public_url) = &state.public_url {
        return public_url.trim_end_matches('/').to_string();
    }
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

/// Client credentials from HTTP Basic auth, falling back to the form body
/// (`client_secret_basic` preferred, `client_secret_post` accepted).
fn extract_client_credentials(
    headers: &HeaderMap,
    body_client_id: &str,
    body_client_secret: &str,
) -> (String, String) {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(encoded) = auth.strip_prefix("Basic ")
        && let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim())
        && let Ok(text) = String::from_utf8(decoded)
        && let Some((id, secret)) = text.split_once(':')
    {
        return (id.to_string(), secret.to_string());
    }
    (body_client_id.to_string(), body_client_secret.to_string())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route(
            "/.well-known/openid-configuration",
            get(authorization_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route("/oauth/register", post(register_client))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(revoke))
        .route("/oauth/introspect", post(introspect))
        .with_state(state)
}

/// The authorize endpoint runs behind the API-access middleware so a user
/// identity can be bound to the request.
pub fn authorize_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/oauth/authorize", get(authorize))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth_middleware::require_api_auth,
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AuthorizationServerMetadataDoc {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    revocation_endpoint: String,
    grant_types_supported: [&'static str; 3],
    response_types_supported: [&'static str; 1],
    code_challenge_methods_supported: [&'static str; 1],
    token_endpoint_auth_methods_supported: [&'static str; 3],
    revocation_endpoint_auth_methods_supported: [&'static str; 2],
    resource_indicators_supported: bool,
}

async fn authorization_server_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<AuthorizationServerMetadataDoc> {
    let base = base_url(&state, &headers);
    Json(AuthorizationServerMetadataDoc {
        issuer: base.clone(),
        authorization_endpoint: format!("{base}/oauth/authorize"),
        token_endpoint: format!("{base}/oauth/token"),
        revocation_endpoint: format!("{base}/oauth/revoke"),
        grant_types_supported: ["authorization_code", "refresh_token", "client_credentials"],
        response_types_supported: ["code"],
        code_challenge_methods_supported: [secrets::PKCE_METHOD_S256],
        token_endpoint_auth_methods_supported: [
            "client_secret_basic",
            "client_secret_post",
            "none",
        ],
        revocation_endpoint_auth_methods_supported: ["client_secret_basic", "client_secret_post"],
        resource_indicators_supported: true,
    })
}

async fn protected_resource_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let base = base_url(&state, &headers);
    Json(serde_json::json!({
        "resource": base,
        "authorization_servers": [base],
        "bearer_methods_supported": ["header"],
    }))
}

// ---------------------------------------------------------------------------
// Dynamic client registration (RFC 7591)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    client_name: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    grant_types: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    client_name: String,
    redirect_uris: Vec<String>,
    grant_types: Vec<String>,
}

async fn register_client(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, OAuthError> {
    if req.client_name.trim().is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "client_name is required",
        ));
    }
    if req.redirect_uris.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "At least one redirect_uri is required",
        ));
    }

    // Clients registered through the public endpoint are confidential.
    let registered = state
        .issuer
        .register_client(
            req.client_name.trim(),
            req.redirect_uris,
            req.grant_types,
            req.scopes,
            true,
        )
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to register client"))?;

    state.audit.log_create(
        None,
        crate::audit::ENTITY_OAUTH_CLIENT,
        &registered.record.client_id,
        &registered.record.client_name,
        serde_json::json!({
            "client_name": registered.record.client_name,
            "redirect_uris": registered.record.redirect_uris,
            "grant_types": registered.record.grant_types,
        }),
    );

    // The plaintext secret is visible here and nowhere else.
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            client_id: registered.record.client_id.clone(),
            client_secret: registered.client_secret,
            client_name: registered.record.client_name.clone(),
            redirect_uris: registered.record.redirect_uris.clone(),
            grant_types: registered.record.grant_types.clone(),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Authorization endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    redirect_uri: String,
    #[serde(default)]
    response_type: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    code_challenge: String,
    #[serde(default)]
    code_challenge_method: String,
}

/// 302 back to the client's redirect URI.
fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn redirect_error(redirect_uri: &str, state: &str, kind: OAuthErrorKind, description: &str) -> Response {
    let Ok(mut url) = Url::parse(redirect_uri) else {
        return OAuthError::new(OAuthErrorKind::InvalidRequest, "Invalid redirect_uri")
            .into_response();
    };
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("error", kind.as_str());
        if !description.is_empty() {
            pairs.append_pair("error_description", description);
        }
        if !state.is_empty() {
            pairs.append_pair("state", state);
        }
    }
    found(url.to_string())
}

async fn authorize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizeParams>,
    user: Option<axum::Extension<AuthedUser>>,
) -> Response {
    // Parameter omissions are reported as JSON; a redirect URI we have not
    // yet validated is not a safe place to send errors.
    if params.client_id.is_empty() || params.redirect_uri.is_empty() || params.response_type.is_empty()
    {
        return OAuthError::new(OAuthErrorKind::InvalidRequest, "Missing required parameters")
            .into_response();
    }

    let client = match state.issuer.get_client(&params.client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return OAuthError::new(OAuthErrorKind::InvalidClient, "Client not found")
                .into_response();
        }
        Err(e) => {
            return OAuthError::server_error(&e, "Failed to load client").into_response();
        }
    };

    if !OAuthIssuer::validate_redirect_uri(&client, &params.redirect_uri) {
        return OAuthError::new(OAuthErrorKind::InvalidRequest, "Invalid redirect_uri")
            .into_response();
    }

    // Client and redirect URI are validated: policy errors redirect.
    if params.response_type != "code" {
        return redirect_error(
            &params.redirect_uri,
            &params.state,
            OAuthErrorKind::UnsupportedResponseType,
            "Only authorization_code flow is supported",
        );
    }
    if params.code_challenge.is_empty() || params.code_challenge_method.is_empty() {
        return redirect_error(
            &params.redirect_uri,
            &params.state,
            OAuthErrorKind::InvalidRequest,
            "PKCE is required: code_challenge and code_challenge_method must be provided",
        );
    }
    if params.code_challenge_method != secrets::PKCE_METHOD_S256 {
        return redirect_error(
            &params.redirect_uri,
            &params.state,
            OAuthErrorKind::InvalidRequest,
            "Only S256 code_challenge_method is supported",
        );
    }

    let scope = match OAuthIssuer::validate_scopes(&client, &params.scope) {
        Ok(scope) => scope,
        Err(e) => {
            return redirect_error(
                &params.redirect_uri,
                &params.state,
                OAuthErrorKind::InvalidScope,
                &e.to_string(),
            );
        }
    };

    // Consent UI is out of scope: without an already-bound user identity the
    // request is denied.
    let Some(axum::Extension(user)) = user else {
        return redirect_error(
            &params.redirect_uri,
            &params.state,
            OAuthErrorKind::AccessDenied,
            "User authentication required",
        );
    };

    let code = match state
        .issuer
        .create_authorization_code(
            &params.client_id,
            user.0.id,
            &params.redirect_uri,
            &scope,
            &params.code_challenge,
            &params.code_challenge_method,
        )
        .await
    {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "failed to create authorization code");
            return redirect_error(
                &params.redirect_uri,
                &params.state,
                OAuthErrorKind::ServerError,
                "Failed to generate authorization code",
            );
        }
    };

    let mut url = match Url::parse(&params.redirect_uri) {
        Ok(url) => url,
        Err(_) => {
            return OAuthError::new(OAuthErrorKind::InvalidRequest, "Invalid redirect_uri")
                .into_response();
        }
    };
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", &code);
        if !params.state.is_empty() {
            pairs.append_pair("state", &params.state);
        }
    }
    found(url.to_string())
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenRequest {
    #[serde(default)]
    grant_type: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    redirect_uri: String,
    #[serde(default)]
    code_verifier: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    scope: String,
    /// RFC 8707 resource indicator.
    #[serde(default)]
    resource: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    scope: String,
}

async fn token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, OAuthError> {
    if req.grant_type.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "grant_type is required",
        ));
    }

    let (client_id, client_secret) =
        extract_client_credentials(&headers, &req.client_id, &req.client_secret);
    if client_id.is_empty() {
        return Err(OAuthError::missing_client_auth());
    }

    let client = state
        .issuer
        .get_client(&client_id)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to load client"))?
        .ok_or_else(|| OAuthError::new(OAuthErrorKind::InvalidClient, "Client not found"))?;

    if client.is_confidential {
        state
            .issuer
            .validate_client_credentials(&client_id, &client_secret)
            .await
            .map_err(|_| {
                OAuthError::new(OAuthErrorKind::InvalidClient, "Invalid client credentials")
            })?;
    }

    let audience = if req.resource.is_empty() {
        base_url(&state, &headers)
    } else {
        req.resource.clone()
    };

    match req.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, &client, &req, &audience).await,
        "refresh_token" => refresh_token_grant(&state, &client, &req, &audience).await,
        "client_credentials" => client_credentials_grant(&state, &client, &req, &audience).await,
        _ => Err(OAuthError::new(
            OAuthErrorKind::UnsupportedGrantType,
            "Grant type not supported",
        )),
    }
}

async fn authorization_code_grant(
    state: &AppState,
    client: &crate::store::OAuthClientRecord,
    req: &TokenRequest,
    audience: &str,
) -> Result<Json<TokenResponse>, OAuthError> {
    if req.code.is_empty() || req.redirect_uri.is_empty() || req.code_verifier.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "code, redirect_uri, and code_verifier are required",
        ));
    }

    let auth_code = state
        .issuer
        .get_authorization_code(&req.code)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to load authorization code"))?
        .ok_or_else(|| {
            OAuthError::new(OAuthErrorKind::InvalidGrant, "Invalid authorization code")
        })?;

    if !auth_code.is_valid() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidGrant,
            "Authorization code expired or already used",
        ));
    }
    if auth_code.client_id != client.client_id {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidGrant,
            "Authorization code was issued to a different client",
        ));
    }
    if auth_code.redirect_uri != req.redirect_uri {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidGrant,
            "redirect_uri does not match",
        ));
    }
    if !secrets::verify_pkce(
        &req.code_verifier,
        &auth_code.code_challenge,
        &auth_code.code_challenge_method,
    ) {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidGrant,
            "Invalid code_verifier",
        ));
    }

    // Single-use enforcement: losing the consume race is a replay.
    let consumed = state
        .issuer
        .consume_authorization_code(&req.code)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to consume authorization code"))?;
    if !consumed {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidGrant,
            "Authorization code expired or already used",
        ));
    }

    let refresh = state
        .issuer
        .issue_refresh_token(&client.client_id, auth_code.user_id, &auth_code.scope)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to issue tokens"))?;
    let access = state
        .issuer
        .issue_access_token(
            &client.client_id,
            Some(auth_code.user_id),
            &auth_code.scope,
            audience,
            Some(refresh.id),
        )
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to issue tokens"))?;

    Ok(Json(TokenResponse {
        access_token: access.access_token,
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL.num_seconds(),
        refresh_token: Some(refresh.refresh_token),
        scope: access.scope,
    }))
}

async fn refresh_token_grant(
    state: &AppState,
    client: &crate::store::OAuthClientRecord,
    req: &TokenRequest,
    audience: &str,
) -> Result<Json<TokenResponse>, OAuthError> {
    if req.refresh_token.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "refresh_token is required",
        ));
    }

    let refresh = state
        .issuer
        .validate_refresh_token(&req.refresh_token)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to load refresh token"))?
        .ok_or_else(|| OAuthError::new(OAuthErrorKind::InvalidGrant, "Invalid refresh token"))?;

    if refresh.client_id != client.client_id {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidGrant,
            "Refresh token was issued to a different client",
        ));
    }

    // A narrower scope may be requested on refresh.
    let scope = if req.scope.is_empty() {
        refresh.scope.clone()
    } else {
        OAuthIssuer::validate_scopes(client, &req.scope)
            .map_err(|e| OAuthError::new(OAuthErrorKind::InvalidScope, e.to_string()))?
    };

    let access = state
        .issuer
        .issue_access_token(
            &client.client_id,
            Some(refresh.user_id),
            &scope,
            audience,
            Some(refresh.id),
        )
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to issue token"))?;

    if let Err(e) = state.issuer.increment_refresh_rotation(refresh.id).await {
        tracing::warn!(error = %e, "failed to increment refresh token rotation count");
    }

    // Rotation policy: the refresh token value is re-returned, not rotated;
    // the rotation counter records each use.
    Ok(Json(TokenResponse {
        access_token: access.access_token,
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL.num_seconds(),
        refresh_token: Some(refresh.refresh_token),
        scope: access.scope,
    }))
}

async fn client_credentials_grant(
    state: &AppState,
    client: &crate::store::OAuthClientRecord,
    req: &TokenRequest,
    audience: &str,
) -> Result<Json<TokenResponse>, OAuthError> {
    let scope = if req.scope.is_empty() {
        client.scopes.join(" ")
    } else {
        OAuthIssuer::validate_scopes(client, &req.scope)
            .map_err(|e| OAuthError::new(OAuthErrorKind::InvalidScope, e.to_string()))?
    };

    // No user is bound and no refresh token is issued for this grant.
    let access = state
        .issuer
        .issue_access_token(&client.client_id, None, &scope, audience, None)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to issue token"))?;

    Ok(Json(TokenResponse {
        access_token: access.access_token,
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_TTL.num_seconds(),
        refresh_token: None,
        scope: access.scope,
    }))
}

// ---------------------------------------------------------------------------
// Revocation (RFC 7009)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type_hint: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(req): Form<RevokeRequest>,
) -> Result<StatusCode, OAuthError> {
    if req.token.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "token parameter is required",
        ));
    }

    let (client_id, client_secret) =
        extract_client_credentials(&headers, &req.client_id, &req.client_secret);
    if client_id.is_empty() {
        return Err(OAuthError::missing_client_auth());
    }
    state
        .issuer
        .validate_client_credentials(&client_id, &client_secret)
        .await
        .map_err(|_| OAuthError::new(OAuthErrorKind::InvalidClient, "Invalid client credentials"))?;

    // Access tokens first, refresh tokens second; unknown tokens are fine.
    let revoked = state
        .issuer
        .revoke_access_token(&req.token)
        .await
        .unwrap_or(false)
        || state
            .issuer
            .revoke_refresh_token(&req.token)
            .await
            .unwrap_or(false);
    if !revoked {
        tracing::debug!("token revocation attempted for non-existent token");
    }

    // RFC 7009: 200 regardless of whether the token existed.
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Introspection (RFC 7662)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IntrospectRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
}

async fn introspect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(req): Form<IntrospectRequest>,
) -> Result<Json<serde_json::Value>, OAuthError> {
    if req.token.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidRequest,
            "token parameter is required",
        ));
    }

    let (client_id, client_secret) =
        extract_client_credentials(&headers, &req.client_id, &req.client_secret);
    if client_id.is_empty() {
        return Err(OAuthError::new(
            OAuthErrorKind::InvalidClient,
            "Client authentication required",
        ));
    }
    state
        .issuer
        .validate_client_credentials(&client_id, &client_secret)
        .await
        .map_err(|_| OAuthError::new(OAuthErrorKind::InvalidClient, "Invalid client credentials"))?;

    let Some(access) = state
        .issuer
        .validate_access_token(&req.token)
        .await
        .map_err(|e| OAuthError::server_error(&e, "Failed to load token"))?
    else {
        // Unknown, expired and revoked tokens all introspect as inactive.
        return Ok(Json(serde_json::json!({ "active": false })));
    };

    let mut response = serde_json::json!({
        "active": true,
        "client_id": access.client_id,
        "scope": access.scope,
        "exp": access.expires_at.timestamp(),
        "aud": access.audience,
    });
    if let Some(user_id) = access.user_id {
        response["sub"] = serde_json::Value::String(user_id.to_string());
    }
    Ok(Json(response))
}
