use crate::AppState;
use crate::acl::{resolve_effective_prompts, resolve_effective_tools};
use crate::audit::{AuditContext, ENTITY_MCP_CLIENT, ENTITY_TOOL_GROUP};
use crate::secrets;
use crate::store::{AuditLogFilter, McpClientRecord, ToolGroupRecord, null_as_empty};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use std::sync::Arc;

/// Management API for downstream identities, tool groups and the audit
/// trail. Everything here requires an authenticated user outside
/// development mode.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v0/clients", get(list_clients).post(create_client))
        .route(
            "/api/v0/clients/{name}",
            get(get_client).delete(delete_client),
        )
        .route(
            "/api/v0/tool-groups",
            get(list_tool_groups).post(create_tool_group),
        )
        .route(
            "/api/v0/tool-groups/{name}",
            get(get_tool_group).delete(delete_tool_group),
        )
        .route("/api/v0/tool-groups/{name}/tools", get(resolve_tool_group))
        .route("/api/v0/audit-logs", get(list_audit_logs))
        .route(
            "/api/v0/audit-logs/{entity_type}/{entity_id}",
            get(list_audit_logs_by_entity),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth_middleware::require_api_auth,
        ))
        .with_state(state)
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// MCP clients
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateClientRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    allow_list: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    allowed_tool_groups: Vec<String>,
}

async fn create_client(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<AuditContext>>,
    Json(req): Json<CreateClientRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }

    let access_token = match secrets::new_opaque_access_token() {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "failed to generate access token");
            return error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to generate access token",
            );
        }
    };

    let client = McpClientRecord {
        name: req.name.trim().to_string(),
        description: req.description,
        access_token,
        allow_list: req.allow_list,
        allowed_tool_groups: req.allowed_tool_groups,
    };

    if let Err(e) = state.mcp_clients.insert_mcp_client(&client).await {
        if e.to_string().contains("already exists") {
            return error_json(StatusCode::CONFLICT, e.to_string());
        }
        tracing::error!(error = %e, "failed to create mcp client");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to create client");
    }

    state.audit.log_create(
        ctx.as_ref().map(|Extension(c)| c),
        ENTITY_MCP_CLIENT,
        &client.name,
        &client.name,
        serde_json::json!({
            "description": client.description,
            "allow_list": client.allow_list,
            "allowed_tool_groups": client.allowed_tool_groups,
        }),
    );

    // The access token is part of the response; operators hand it to the
    // downstream client out of band.
    (StatusCode::CREATED, Json(client)).into_response()
}

async fn list_clients(State(state): State<Arc<AppState>>) -> Response {
    match state.mcp_clients.list_mcp_clients().await {
        Ok(clients) => Json(clients).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list mcp clients");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to list clients")
        }
    }
}

async fn get_client(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.mcp_clients.get_mcp_client(&name).await {
        Ok(Some(client)) => Json(client).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "mcp client not found"),
        Err(e) => {
            tracing::error!(error = %e, "failed to load mcp client");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to load client")
        }
    }
}

/// Deleting a client immediately revokes its access. Idempotent.
async fn delete_client(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<AuditContext>>,
    Path(name): Path<String>,
) -> Response {
    match state.mcp_clients.delete_mcp_client(&name).await {
        Ok(deleted) => {
            if deleted {
                state.audit.log_delete(
                    ctx.as_ref().map(|Extension(c)| c),
                    ENTITY_MCP_CLIENT,
                    &name,
                    &name,
                );
            }
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to delete mcp client");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete client")
        }
    }
}

// ---------------------------------------------------------------------------
// Tool groups
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateToolGroupRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    included_tools: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    included_servers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    excluded_tools: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    included_prompts: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    excluded_prompts: Vec<String>,
}

async fn create_tool_group(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<AuditContext>>,
    Json(req): Json<CreateToolGroupRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "name is required");
    }

    let group = ToolGroupRecord {
        name: req.name.trim().to_string(),
        description: req.description,
        included_tools: req.included_tools,
        included_servers: req.included_servers,
        excluded_tools: req.excluded_tools,
        included_prompts: req.included_prompts,
        excluded_prompts: req.excluded_prompts,
    };

    if let Err(e) = state.tool_groups.insert_tool_group(&group).await {
        if e.to_string().contains("already exists") {
            return error_json(StatusCode::CONFLICT, e.to_string());
        }
        tracing::error!(error = %e, "failed to create tool group");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to create tool group");
    }

    state.audit.log_create(
        ctx.as_ref().map(|Extension(c)| c),
        ENTITY_TOOL_GROUP,
        &group.name,
        &group.name,
        serde_json::json!({
            "description": group.description,
            "included_tools": group.included_tools,
            "included_servers": group.included_servers,
            "excluded_tools": group.excluded_tools,
        }),
    );

    (StatusCode::CREATED, Json(group)).into_response()
}

async fn list_tool_groups(State(state): State<Arc<AppState>>) -> Response {
    match state.tool_groups.list_tool_groups().await {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list tool groups");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to list tool groups")
        }
    }
}

async fn get_tool_group(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.tool_groups.get_tool_group(&name).await {
        Ok(Some(group)) => Json(group).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "tool group not found"),
        Err(e) => {
            tracing::error!(error = %e, "failed to load tool group");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to load tool group")
        }
    }
}

async fn delete_tool_group(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<AuditContext>>,
    Path(name): Path<String>,
) -> Response {
    match state.tool_groups.delete_tool_group(&name).await {
        Ok(deleted) => {
            if deleted {
                state.audit.log_delete(
                    ctx.as_ref().map(|Extension(c)| c),
                    ENTITY_TOOL_GROUP,
                    &name,
                    &name,
                );
            }
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to delete tool group");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete tool group")
        }
    }
}

/// Resolved effective tool and prompt sets for a group, after server
/// expansion and exclusions.
async fn resolve_tool_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let group = match state.tool_groups.get_tool_group(&name).await {
        Ok(Some(group)) => group,
        Ok(None) => return error_json(StatusCode::NOT_FOUND, "tool group not found"),
        Err(e) => {
            tracing::error!(error = %e, "failed to load tool group");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to load tool group");
        }
    };

    let tools = match resolve_effective_tools(&group, state.registry.as_ref()).await {
        Ok(tools) => tools,
        Err(e) => {
            tracing::error!(error = %e, group = %name, "failed to resolve tools");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to resolve tools");
        }
    };
    let prompts = match resolve_effective_prompts(&group, state.registry.as_ref()).await {
        Ok(prompts) => prompts,
        Err(e) => {
            tracing::error!(error = %e, group = %name, "failed to resolve prompts");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to resolve prompts");
        }
    };

    Json(serde_json::json!({
        "name": group.name,
        "tools": tools.into_iter().collect::<Vec<_>>(),
        "prompts": prompts.into_iter().collect::<Vec<_>>(),
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Audit log queries
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    actor_type: Option<String>,
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let filter = AuditLogFilter {
        entity_type: query.entity_type.filter(|v| !v.is_empty()),
        operation: query.operation.filter(|v| !v.is_empty()),
        actor_type: query.actor_type.filter(|v| !v.is_empty()),
        actor_id: query.actor_id.filter(|v| !v.is_empty()),
        limit: query.limit.unwrap_or(0),
    };
    match state.audit_store.list_audit(&filter).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list audit logs");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to list audit logs")
        }
    }
}

async fn list_audit_logs_by_entity(
    State(state): State<Arc<AppState>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Query(query): Query<AuditQuery>,
) -> Response {
    match state
        .audit_store
        .list_audit_by_entity(&entity_type, &entity_id, query.limit.unwrap_or(0))
        .await
    {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list audit logs");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to list audit logs")
        }
    }
}
