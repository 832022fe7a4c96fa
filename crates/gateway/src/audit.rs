use crate::store::{AuditLogRecord, AuditStore};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const ENTITY_MCP_CLIENT: &str = "mcp_client";
pub const ENTITY_TOOL_GROUP: &str = "tool_group";
pub const ENTITY_OAUTH_CLIENT: &str = "oauth_client";
pub const ENTITY_UPSTREAM_SESSION: &str = "oauth_upstream_session";

pub const OP_CREATE: &str = "CREATE";
pub const OP_UPDATE: &str = "UPDATE";
pub const OP_DELETE: &str = "DELETE";
pub const OP_ENABLE: &str = "ENABLE";
pub const OP_DISABLE: &str = "DISABLE";

pub const ACTOR_USER: &str = "user";
pub const ACTOR_MCP_CLIENT: &str = "mcp_client";
pub const ACTOR_SYSTEM: &str = "system";

/// Keys whose values are replaced with `[REDACTED]` in audit payloads.
const SENSITIVE_KEYS: [&str; 5] = ["access_token", "bearer_token", "password", "secret", "token"];

/// Who performed the operation. Bound to the request by the auth middleware
/// and threaded explicitly into every audited call.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub actor_type: String,
    pub actor_id: String,
    pub ip_address: String,
    pub user_agent: String,
}

impl AuditContext {
    pub fn system() -> Self {
        Self {
            actor_type: ACTOR_SYSTEM.to_string(),
            actor_id: ACTOR_SYSTEM.to_string(),
            ip_address: String::new(),
            user_agent: String::new(),
        }
    }
}

/// Fire-and-forget audit trail writer.
///
/// Entries go through a bounded channel to a background task; callers never
/// block on the write and never observe its failure. A full channel drops
/// the entry and bumps a counter.
pub struct AuditService {
    sender: mpsc::Sender<AuditLogRecord>,
    dropped: AtomicU64,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditStore>, shutdown: CancellationToken) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<AuditLogRecord>(4096);
        let service = Arc::new(Self {
            sender,
            dropped: AtomicU64::new(0),
        });
        Self::spawn_writer(store, receiver, shutdown);
        service
    }

    fn spawn_writer(
        store: Arc<dyn AuditStore>,
        mut rx: mpsc::Receiver<AuditLogRecord>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        // Best-effort drain before exit.
                        while let Ok(entry) = rx.try_recv() {
                            if let Err(e) = store.insert_audit_log(&entry).await {
                                tracing::warn!(error = %e, "audit write failed during shutdown drain");
                            }
                        }
                        break;
                    }
                    maybe = rx.recv() => {
                        let Some(entry) = maybe else { break };
                        if let Err(e) = store.insert_audit_log(&entry).await {
                            tracing::warn!(error = %e, "audit write failed");
                        }
                    }
                }
            }
        });
    }

    pub fn log_create(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
        data: Value,
    ) {
        self.submit(
            ctx,
            entity_type,
            entity_id,
            entity_name,
            OP_CREATE,
            serde_json::json!({ "created": data }),
            true,
            String::new(),
        );
    }

    /// `changes` should be a structured diff of what changed.
    pub fn log_update(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
        changes: Value,
    ) {
        self.submit(
            ctx,
            entity_type,
            entity_id,
            entity_name,
            OP_UPDATE,
            changes,
            true,
            String::new(),
        );
    }

    pub fn log_delete(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
    ) {
        self.submit(
            ctx,
            entity_type,
            entity_id,
            entity_name,
            OP_DELETE,
            serde_json::json!({}),
            true,
            String::new(),
        );
    }

    pub fn log_enable(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
        details: Value,
    ) {
        self.submit(
            ctx,
            entity_type,
            entity_id,
            entity_name,
            OP_ENABLE,
            details,
            true,
            String::new(),
        );
    }

    pub fn log_disable(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
        details: Value,
    ) {
        self.submit(
            ctx,
            entity_type,
            entity_id,
            entity_name,
            OP_DISABLE,
            details,
            true,
            String::new(),
        );
    }

    /// Failed operations are logged too, for security analysis.
    pub fn log_error(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
        operation: &str,
        err: &anyhow::Error,
    ) {
        self.submit(
            ctx,
            entity_type,
            entity_id,
            entity_name,
            operation,
            serde_json::json!({}),
            false,
            err.to_string(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        ctx: Option<&AuditContext>,
        entity_type: &str,
        entity_id: &str,
        entity_name: &str,
        operation: &str,
        changes: Value,
        success: bool,
        error_msg: String,
    ) {
        let system = AuditContext::system();
        let ctx = ctx.unwrap_or(&system);

        let entry = AuditLogRecord {
            id: 0,
            created_at: Utc::now(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            entity_name: entity_name.to_string(),
            operation: operation.to_string(),
            changes: redact(changes),
            actor_type: ctx.actor_type.clone(),
            actor_id: ctx.actor_id.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            success,
            error_msg,
        };

        if self.sender.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Replace sensitive values with `[REDACTED]`.
///
/// Recurses through nested objects; array elements are left alone.
fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    if SENSITIVE_KEYS.contains(&key.as_str()) {
                        (key, Value::String("[REDACTED]".to_string()))
                    } else {
                        (key, redact(val))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}
