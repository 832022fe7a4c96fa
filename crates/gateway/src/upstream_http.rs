use crate::AppState;
use crate::audit::{AuditContext, ENTITY_UPSTREAM_SESSION};
use crate::oauth_upstream::UpstreamOAuth;
use crate::secrets;
use crate::store::UpstreamSessionRecord;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Authenticated upstream OAuth management routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v0/oauth/upstream/initiate", post(initiate))
        .route("/api/v0/oauth/upstream/status/{server_name}", get(status))
        .route("/api/v0/oauth/upstream/{server_name}", delete(revoke_session))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth_middleware::require_api_auth,
        ))
        .with_state(state)
}

/// The callback is reached by browser redirect from the upstream
/// authorization server and therefore carries no bearer; the state binding
/// on the session is what authenticates it.
pub fn callback_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v0/oauth/upstream/callback", get(callback))
        .with_state(state)
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn bad_gateway(err: &anyhow::Error, prefix: &str) -> Response {
    error_json(StatusCode::BAD_GATEWAY, format!("{prefix}: {err:#}"))
}

#[derive(Debug, Deserialize)]
struct InitiateRequest {
    server_name: String,
    server_url: String,
    client_name: String,
    redirect_uri: String,
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InitiateResponse {
    authorization_url: String,
    state: String,
}

async fn initiate(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<AuditContext>>,
    Json(req): Json<InitiateRequest>,
) -> Response {
    if req.server_name.is_empty()
        || req.server_url.is_empty()
        || req.client_name.is_empty()
        || req.redirect_uri.is_empty()
    {
        return error_json(
            StatusCode::BAD_REQUEST,
            "server_name, server_url, client_name and redirect_uri are required",
        );
    }

    tracing::info!(server = %req.server_name, url = %req.server_url, "discovering upstream OAuth metadata");
    let resource_meta = match state.upstream.discover_protected_resource(&req.server_url).await {
        Ok(meta) => meta,
        Err(e) => return bad_gateway(&e, "failed to discover OAuth endpoints"),
    };
    let Some(auth_server_url) = resource_meta.authorization_servers.first() else {
        return error_json(
            StatusCode::BAD_GATEWAY,
            "no authorization servers found in resource metadata",
        );
    };

    let as_meta = match state
        .upstream
        .discover_authorization_server(auth_server_url)
        .await
    {
        Ok(meta) => meta,
        Err(e) => return bad_gateway(&e, "failed to discover authorization server metadata"),
    };

    let Some(registration_endpoint) = as_meta
        .registration_endpoint
        .as_deref()
        .filter(|e| !e.is_empty())
    else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "server does not support dynamic client registration - manual client configuration required",
        );
    };

    let redirect_uris = vec![req.redirect_uri.clone()];
    let registration = match state
        .upstream
        .register_dynamic_client(registration_endpoint, &req.client_name, &redirect_uris)
        .await
    {
        Ok(reg) => reg,
        Err(e) => return bad_gateway(&e, "failed to register OAuth client"),
    };
    tracing::info!(server = %req.server_name, client_id = %registration.client_id, "registered with upstream authorization server");

    let oauth_state = match secrets::random_token(32) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to generate state parameter");
            return error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to generate state parameter",
            );
        }
    };

    let (authorization_url, code_verifier) = match UpstreamOAuth::authorization_url(
        &as_meta.authorization_endpoint,
        &registration.client_id,
        &req.redirect_uri,
        &resource_meta.resource,
        &oauth_state,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "failed to generate authorization URL");
            return error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to generate authorization URL: {e:#}"),
            );
        }
    };

    // The verifier and state live on the session until the callback; an
    // existing session for the same server is replaced.
    let session = UpstreamSessionRecord {
        mcp_server_name: req.server_name.clone(),
        client_id: registration.client_id.clone(),
        client_secret: registration.client_secret.clone().unwrap_or_default(),
        authorization_endpoint: as_meta.authorization_endpoint.clone(),
        token_endpoint: as_meta.token_endpoint.clone(),
        resource_uri: resource_meta.resource.clone(),
        code_verifier,
        redirect_uri: req.redirect_uri.clone(),
        pending_state: oauth_state.clone(),
        scope: req.scopes.join(" "),
        updated_at: Utc::now(),
        ..UpstreamSessionRecord::default()
    };
    if let Err(e) = state.upstream_sessions.upsert_upstream_session(&session).await {
        tracing::error!(error = %e, "failed to store OAuth session");
        return error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to store OAuth session: {e:#}"),
        );
    }

    state.audit.log_create(
        ctx.as_ref().map(|Extension(c)| c),
        ENTITY_UPSTREAM_SESSION,
        &req.server_name,
        &req.server_name,
        serde_json::json!({
            "server_name": req.server_name,
            "client_id": registration.client_id,
            "authorization_endpoint": as_meta.authorization_endpoint,
            "token_endpoint": as_meta.token_endpoint,
            "resource_uri": resource_meta.resource,
        }),
    );

    tracing::info!(server = %req.server_name, "upstream OAuth flow initiated");
    Json(InitiateResponse {
        authorization_url,
        state: oauth_state,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    success: bool,
    message: String,
}

async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if params.server_name.is_empty() || params.code.is_empty() || params.state.is_empty() {
        return error_json(
            StatusCode::BAD_REQUEST,
            "server_name, code and state are required",
        );
    }

    let session = match state
        .upstream_sessions
        .get_upstream_session(&params.server_name)
        .await
    {
        Ok(Some(session)) => session,
        Ok(None) => {
            return error_json(
                StatusCode::BAD_REQUEST,
                "no OAuth session found for this server",
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load OAuth session");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to load OAuth session");
        }
    };

    // The state issued at initiation must round-trip exactly.
    if session.pending_state.is_empty() || session.pending_state != params.state {
        return error_json(StatusCode::BAD_REQUEST, "state parameter mismatch");
    }

    let token_resp = match state
        .upstream
        .exchange_authorization_code(
            &session.token_endpoint,
            &session.client_id,
            &session.client_secret,
            &params.code,
            &session.code_verifier,
            &session.redirect_uri,
            &session.resource_uri,
        )
        .await
    {
        Ok(resp) => resp,
        Err(e) => return bad_gateway(&e, "failed to exchange authorization code"),
    };

    let server_name = session.mcp_server_name.clone();
    if let Err(e) = state.upstream.store_exchanged_tokens(session, &token_resp).await {
        tracing::error!(error = %e, "failed to store OAuth tokens");
        return error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to store OAuth tokens: {e:#}"),
        );
    }

    state.audit.log_update(
        None,
        ENTITY_UPSTREAM_SESSION,
        &server_name,
        &server_name,
        serde_json::json!({ "authorization_completed": true }),
    );

    tracing::info!(server = %server_name, "upstream OAuth flow completed");
    Json(CallbackResponse {
        success: true,
        message: format!("Successfully authenticated with {server_name}"),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    server_name: String,
    client_id: String,
    scope: String,
    expires_at: Option<chrono::DateTime<Utc>>,
    has_refresh: bool,
    token_type: String,
    is_expired: bool,
    needs_refresh: bool,
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(server_name): Path<String>,
) -> Response {
    match state.upstream_sessions.get_upstream_session(&server_name).await {
        Ok(Some(session)) => Json(StatusResponse {
            server_name: session.mcp_server_name.clone(),
            client_id: session.client_id.clone(),
            scope: session.scope.clone(),
            expires_at: session.expires_at,
            has_refresh: !session.refresh_token.is_empty(),
            token_type: session.token_type.clone(),
            is_expired: session.is_access_token_expired(),
            needs_refresh: session.needs_refresh(),
        })
        .into_response(),
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            "no OAuth session found for this server",
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to load OAuth session");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to load OAuth session")
        }
    }
}

async fn revoke_session(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<AuditContext>>,
    Path(server_name): Path<String>,
) -> Response {
    match state
        .upstream_sessions
        .delete_upstream_session(&server_name)
        .await
    {
        Ok(deleted) => {
            if deleted {
                state.audit.log_delete(
                    ctx.as_ref().map(|Extension(c)| c),
                    ENTITY_UPSTREAM_SESSION,
                    &server_name,
                    &server_name,
                );
                tracing::info!(server = %server_name, "upstream OAuth session revoked");
            }
            Json(serde_json::json!({
                "success": true,
                "message": format!("OAuth session revoked for {server_name}"),
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to revoke OAuth session");
            error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to revoke OAuth session",
            )
        }
    }
}
