use crate::AppState;
use crate::audit::{ACTOR_MCP_CLIENT, ACTOR_USER, AuditContext};
use crate::store::{McpClientRecord, UserRecord};
use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// User identity bound by the API-access middleware.
#[derive(Clone)]
pub struct AuthedUser(pub UserRecord);

/// Downstream MCP client identity bound by the proxy middleware. OAuth-backed
/// callers carry their granted scopes.
#[derive(Clone)]
pub struct AuthedMcpClient {
    pub client: McpClientRecord,
    pub oauth_scopes: Option<Vec<String>>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// API-plane authentication: binds a *user* identity.
///
/// Accepts OAuth access tokens (user-bound only) and legacy opaque user
/// tokens. Development mode short-circuits to allow-all.
pub async fn require_api_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let cfg = state.runtime_config();
    if !cfg.initialized {
        return json_error(StatusCode::FORBIDDEN, "server is not initialized");
    }
    if !cfg.mode.enforces_auth() {
        return next.run(req).await;
    }

    let Some(token) = bearer_token(req.headers()) else {
        return json_error(StatusCode::UNAUTHORIZED, "missing access token");
    };

    // OAuth validation first, legacy opaque tokens as fallback.
    match state.issuer.validate_access_token(&token).await {
        Ok(Some(oauth_token)) => {
            let Some(user_id) = oauth_token.user_id else {
                // Client-credentials tokens carry no user.
                return json_error(StatusCode::FORBIDDEN, "user access required");
            };
            return match state.users.get_user(user_id).await {
                Ok(Some(user)) => {
                    bind_user(&mut req, user);
                    next.run(req).await
                }
                _ => json_error(StatusCode::UNAUTHORIZED, "user not found"),
            };
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(error = %e, "oauth token validation failed; trying legacy token");
        }
    }

    match state.users.get_user_by_token(&token).await {
        Ok(Some(user)) => {
            bind_user(&mut req, user);
            next.run(req).await
        }
        _ => json_error(StatusCode::UNAUTHORIZED, "invalid access token"),
    }
}

fn bind_user(req: &mut Request, user: UserRecord) {
    let ctx = AuditContext {
        actor_type: ACTOR_USER.to_string(),
        actor_id: user.username.clone(),
        ip_address: client_ip(req),
        user_agent: user_agent(req.headers()),
    };
    req.extensions_mut().insert(AuthedUser(user));
    req.extensions_mut().insert(ctx);
}

/// MCP-proxy-plane authentication: binds a downstream *MCP client* identity
/// plus the tool-group resolver handle the proxy consults for ACL decisions.
pub async fn require_mcp_proxy_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let cfg = state.runtime_config();
    if !cfg.initialized {
        return json_error(StatusCode::FORBIDDEN, "server is not initialized");
    }
    if !cfg.mode.enforces_auth() {
        return next.run(req).await;
    }

    let Some(token) = bearer_token(req.headers()) else {
        return json_error(StatusCode::UNAUTHORIZED, "missing MCP client access token");
    };

    match state.issuer.validate_access_token(&token).await {
        Ok(Some(oauth_token)) => {
            let oauth_client = match state.issuer.get_client(&oauth_token.client_id).await {
                Ok(Some(client)) => client,
                _ => return json_error(StatusCode::UNAUTHORIZED, "OAuth client not found"),
            };

            // Synthesize a downstream identity for context compatibility.
            // The empty allow-list means server-level fallback denies; tool
            // groups may still grant through scopes-to-groups mapping.
            let pseudo = McpClientRecord {
                name: oauth_client.client_name.clone(),
                description: format!("OAuth client: {}", oauth_client.client_id),
                access_token: token,
                allow_list: Vec::new(),
                allowed_tool_groups: Vec::new(),
            };
            let scopes: Vec<String> = if oauth_token.scope.is_empty() {
                Vec::new()
            } else {
                oauth_token.scope.split(' ').map(ToString::to_string).collect()
            };
            bind_mcp_client(&mut req, &state, pseudo, Some(scopes));
            return next.run(req).await;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(error = %e, "oauth token validation failed; trying MCP client token");
        }
    }

    match state.mcp_clients.get_mcp_client_by_token(&token).await {
        Ok(Some(client)) => {
            bind_mcp_client(&mut req, &state, client, None);
            next.run(req).await
        }
        _ => json_error(StatusCode::UNAUTHORIZED, "invalid MCP client token"),
    }
}

fn bind_mcp_client(
    req: &mut Request,
    state: &AppState,
    client: McpClientRecord,
    oauth_scopes: Option<Vec<String>>,
) {
    let ctx = AuditContext {
        actor_type: ACTOR_MCP_CLIENT.to_string(),
        actor_id: client.name.clone(),
        ip_address: client_ip(req),
        user_agent: user_agent(req.headers()),
    };
    req.extensions_mut().insert(AuthedMcpClient {
        client,
        oauth_scopes,
    });
    // The proxy pipeline consults this handle for tool-level ACL checks.
    req.extensions_mut().insert(state.acl.clone());
    req.extensions_mut().insert(ctx);
}
