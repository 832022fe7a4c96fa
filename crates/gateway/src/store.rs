use crate::config::GatewayConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Refresh upstream tokens this long before they actually expire.
pub const UPSTREAM_REFRESH_SKEW: Duration = Duration::minutes(5);

/// Deserialize a JSON/YAML list treating `null` (and absence via
/// `#[serde(default)]`) as the empty set.
pub fn null_as_empty<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Vec<String>> = Option::deserialize(de)?;
    Ok(v.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Issuer-side records
// ---------------------------------------------------------------------------

/// A registered OAuth client (issuer side).
///
/// Confidential clients carry a bcrypt hash of their secret; the plaintext
/// secret exists only in the registration response.
#[derive(Debug, Clone, Serialize)]
pub struct OAuthClientRecord {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_hash: Option<String>,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub scopes: Vec<String>,
    pub is_confidential: bool,
    pub token_endpoint_auth_method: String,
    pub user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationCodeRecord {
    pub code: String,
    pub client_id: String,
    pub user_id: i64,
    pub redirect_uri: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl AuthorizationCodeRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        !self.used && !self.is_expired()
    }
}

#[derive(Debug, Clone)]
pub struct AccessTokenRecord {
    pub id: i64,
    pub access_token: String,
    pub client_id: String,
    /// None for client-credentials tokens.
    pub user_id: Option<i64>,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    /// Back-link to the refresh token that can mint this token again.
    pub refresh_token_id: Option<i64>,
    /// Intended resource server (RFC 8707 audience).
    pub audience: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl AccessTokenRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: i64,
    pub refresh_token: String,
    pub client_id: String,
    pub user_id: i64,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub rotation_count: i64,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}

/// Rows removed by one expiry sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub authorization_codes: u64,
    pub access_tokens: u64,
    pub refresh_tokens: u64,
}

impl SweepStats {
    pub fn total(&self) -> u64 {
        self.authorization_codes + self.access_tokens + self.refresh_tokens
    }
}

// ---------------------------------------------------------------------------
// Consumer-side records
// ---------------------------------------------------------------------------

/// OAuth session with one upstream MCP server (consumer side), keyed by
/// server name.
#[derive(Debug, Clone)]
pub struct UpstreamSessionRecord {
    pub mcp_server_name: String,
    /// Our client id at the upstream authorization server.
    pub client_id: String,
    /// Plaintext upstream secret; encryption at rest is deployment work.
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    /// Canonical resource URI (RFC 8707 `resource` parameter).
    pub resource_uri: String,
    /// Transient PKCE verifier; non-empty only between initiate and callback.
    pub code_verifier: String,
    pub redirect_uri: String,
    /// State issued at initiation; verified and cleared on callback.
    pub pending_state: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for UpstreamSessionRecord {
    fn default() -> Self {
        Self {
            mcp_server_name: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            token_type: String::new(),
            expires_at: None,
            scope: String::new(),
            authorization_endpoint: String::new(),
            token_endpoint: String::new(),
            resource_uri: String::new(),
            code_verifier: String::new(),
            redirect_uri: String::new(),
            pending_state: String::new(),
            updated_at: Utc::now(),
        }
    }
}

impl UpstreamSessionRecord {
    /// True when the access token is within the refresh skew of expiry.
    pub fn is_access_token_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + UPSTREAM_REFRESH_SKEW > expires_at,
            None => false,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        !self.refresh_token.is_empty() && self.is_access_token_expired()
    }
}

// ---------------------------------------------------------------------------
// Downstream identities
// ---------------------------------------------------------------------------

/// Downstream MCP client identity with its two-layer ACL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub access_token: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub allow_list: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub allowed_tool_groups: Vec<String>,
}

impl McpClientRecord {
    /// Server-level ACL: is this upstream server on the allow-list?
    pub fn has_server_access(&self, server_name: &str) -> bool {
        self.allow_list.iter().any(|s| s == server_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolGroupRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub included_tools: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub included_servers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub excluded_tools: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub included_prompts: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub excluded_prompts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub access_token: String,
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: String,
    pub operation: String,
    /// Redacted structured change payload.
    pub changes: serde_json::Value,
    pub actor_type: String,
    pub actor_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub success: bool,
    pub error_msg: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditLogFilter {
    pub entity_type: Option<String>,
    pub operation: Option<String>,
    pub actor_type: Option<String>,
    pub actor_id: Option<String>,
    pub limit: i64,
}

pub const AUDIT_DEFAULT_LIMIT: i64 = 100;

// ---------------------------------------------------------------------------
// Store traits (one narrow interface per consumer)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IssuerStore: Send + Sync {
    async fn insert_oauth_client(&self, client: &OAuthClientRecord) -> anyhow::Result<()>;
    async fn get_oauth_client(&self, client_id: &str)
    -> anyhow::Result<Option<OAuthClientRecord>>;

    async fn insert_authorization_code(
        &self,
        code: &AuthorizationCodeRecord,
    ) -> anyhow::Result<()>;
    async fn get_authorization_code(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<AuthorizationCodeRecord>>;
    /// Atomically flip `used` from false to true. Returns false when the code
    /// is unknown or was already consumed (replay).
    async fn consume_authorization_code(&self, code: &str) -> anyhow::Result<bool>;

    /// Insert and return the assigned row id.
    async fn insert_access_token(&self, token: &AccessTokenRecord) -> anyhow::Result<i64>;
    async fn get_access_token(&self, token: &str) -> anyhow::Result<Option<AccessTokenRecord>>;
    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> anyhow::Result<i64>;
    async fn get_refresh_token(&self, token: &str) -> anyhow::Result<Option<RefreshTokenRecord>>;

    /// Returns whether a row was newly revoked.
    async fn revoke_access_token(&self, token: &str) -> anyhow::Result<bool>;
    async fn revoke_refresh_token(&self, token: &str) -> anyhow::Result<bool>;
    async fn increment_refresh_rotation(&self, id: i64) -> anyhow::Result<()>;

    /// Hard-delete expired authorization codes and expired non-revoked
    /// tokens. Revoked rows are retained as evidence.
    async fn delete_expired_credentials(&self, now: DateTime<Utc>) -> anyhow::Result<SweepStats>;
}

#[async_trait]
pub trait UpstreamSessionStore: Send + Sync {
    /// Insert or fully replace the session for `session.mcp_server_name`.
    async fn upsert_upstream_session(&self, session: &UpstreamSessionRecord)
    -> anyhow::Result<()>;
    async fn get_upstream_session(
        &self,
        server_name: &str,
    ) -> anyhow::Result<Option<UpstreamSessionRecord>>;
    async fn delete_upstream_session(&self, server_name: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait McpClientStore: Send + Sync {
    async fn insert_mcp_client(&self, client: &McpClientRecord) -> anyhow::Result<()>;
    async fn get_mcp_client(&self, name: &str) -> anyhow::Result<Option<McpClientRecord>>;
    async fn get_mcp_client_by_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<McpClientRecord>>;
    async fn list_mcp_clients(&self) -> anyhow::Result<Vec<McpClientRecord>>;
    async fn delete_mcp_client(&self, name: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_token(&self, token: &str) -> anyhow::Result<Option<UserRecord>>;
    async fn get_user(&self, id: i64) -> anyhow::Result<Option<UserRecord>>;
    /// Whether any user has been provisioned. An empty user store means the
    /// server has not been initialized yet.
    async fn has_any_user(&self) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ToolGroupStore: Send + Sync {
    async fn insert_tool_group(&self, group: &ToolGroupRecord) -> anyhow::Result<()>;
    async fn get_tool_group(&self, name: &str) -> anyhow::Result<Option<ToolGroupRecord>>;
    async fn list_tool_groups(&self) -> anyhow::Result<Vec<ToolGroupRecord>>;
    async fn delete_tool_group(&self, name: &str) -> anyhow::Result<bool>;
}

/// Read-only view of the tool/prompt registry, by upstream server name.
/// Returned names are canonical (`<server>__<name>`).
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn list_tools_by_server(&self, server_name: &str) -> anyhow::Result<Vec<String>>;
    async fn list_prompts_by_server(&self, server_name: &str) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit_log(&self, entry: &AuditLogRecord) -> anyhow::Result<()>;
    /// Newest first.
    async fn list_audit_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<AuditLogRecord>>;
    /// Newest first, with optional equality filters.
    async fn list_audit(&self, filter: &AuditLogFilter) -> anyhow::Result<Vec<AuditLogRecord>>;
}

// ---------------------------------------------------------------------------
// In-memory store (config-file mode)
// ---------------------------------------------------------------------------

/// In-memory implementation of every store trait, seeded from the config
/// file. Runtime-created records live for the process lifetime only.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    oauth_clients: RwLock<HashMap<String, OAuthClientRecord>>,
    authorization_codes: RwLock<HashMap<String, AuthorizationCodeRecord>>,
    access_tokens: RwLock<HashMap<String, AccessTokenRecord>>,
    refresh_tokens: RwLock<HashMap<String, RefreshTokenRecord>>,
    upstream_sessions: RwLock<HashMap<String, UpstreamSessionRecord>>,
    mcp_clients: RwLock<HashMap<String, McpClientRecord>>,
    users: RwLock<Vec<UserRecord>>,
    tool_groups: RwLock<HashMap<String, ToolGroupRecord>>,
    server_tools: RwLock<HashMap<String, Vec<String>>>,
    server_prompts: RwLock<HashMap<String, Vec<String>>>,
    audit_logs: RwLock<Vec<AuditLogRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let store = Self::new();

        {
            let mut users = store.users.write();
            for seed in &config.users {
                users.push(UserRecord {
                    id: store.next_id.fetch_add(1, Ordering::Relaxed),
                    username: seed.username.clone(),
                    access_token: seed.access_token.clone(),
                });
            }
        }
        {
            let mut clients = store.mcp_clients.write();
            for seed in &config.mcp_clients {
                clients.insert(
                    seed.name.clone(),
                    McpClientRecord {
                        name: seed.name.clone(),
                        description: seed.description.clone(),
                        access_token: seed.access_token.clone(),
                        allow_list: seed.allow_list.clone(),
                        allowed_tool_groups: seed.allowed_tool_groups.clone(),
                    },
                );
            }
        }
        {
            let mut groups = store.tool_groups.write();
            for seed in &config.tool_groups {
                groups.insert(
                    seed.name.clone(),
                    ToolGroupRecord {
                        name: seed.name.clone(),
                        description: seed.description.clone(),
                        included_tools: seed.included_tools.clone(),
                        included_servers: seed.included_servers.clone(),
                        excluded_tools: seed.excluded_tools.clone(),
                        included_prompts: seed.included_prompts.clone(),
                        excluded_prompts: seed.excluded_prompts.clone(),
                    },
                );
            }
        }
        {
            let mut tools = store.server_tools.write();
            let mut prompts = store.server_prompts.write();
            for seed in &config.servers {
                tools.insert(seed.name.clone(), seed.tools.clone());
                prompts.insert(seed.name.clone(), seed.prompts.clone());
            }
        }

        store
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl IssuerStore for MemoryStore {
    async fn insert_oauth_client(&self, client: &OAuthClientRecord) -> anyhow::Result<()> {
        let mut clients = self.oauth_clients.write();
        if clients.contains_key(&client.client_id) {
            anyhow::bail!("oauth client '{}' already exists", client.client_id);
        }
        clients.insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn get_oauth_client(
        &self,
        client_id: &str,
    ) -> anyhow::Result<Option<OAuthClientRecord>> {
        Ok(self.oauth_clients.read().get(client_id).cloned())
    }

    async fn insert_authorization_code(
        &self,
        code: &AuthorizationCodeRecord,
    ) -> anyhow::Result<()> {
        self.authorization_codes
            .write()
            .insert(code.code.clone(), code.clone());
        Ok(())
    }

    async fn get_authorization_code(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<AuthorizationCodeRecord>> {
        Ok(self.authorization_codes.read().get(code).cloned())
    }

    async fn consume_authorization_code(&self, code: &str) -> anyhow::Result<bool> {
        // The write lock makes check-and-set atomic, mirroring the
        // conditional UPDATE on the SQL side.
        let mut codes = self.authorization_codes.write();
        match codes.get_mut(code) {
            Some(record) if !record.used => {
                record.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_access_token(&self, token: &AccessTokenRecord) -> anyhow::Result<i64> {
        let id = self.alloc_id();
        let mut record = token.clone();
        record.id = id;
        self.access_tokens
            .write()
            .insert(record.access_token.clone(), record);
        Ok(id)
    }

    async fn get_access_token(&self, token: &str) -> anyhow::Result<Option<AccessTokenRecord>> {
        Ok(self.access_tokens.read().get(token).cloned())
    }

    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> anyhow::Result<i64> {
        let id = self.alloc_id();
        let mut record = token.clone();
        record.id = id;
        self.refresh_tokens
            .write()
            .insert(record.refresh_token.clone(), record);
        Ok(id)
    }

    async fn get_refresh_token(&self, token: &str) -> anyhow::Result<Option<RefreshTokenRecord>> {
        Ok(self.refresh_tokens.read().get(token).cloned())
    }

    async fn revoke_access_token(&self, token: &str) -> anyhow::Result<bool> {
        match self.access_tokens.write().get_mut(token) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_refresh_token(&self, token: &str) -> anyhow::Result<bool> {
        match self.refresh_tokens.write().get_mut(token) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_refresh_rotation(&self, id: i64) -> anyhow::Result<()> {
        let mut tokens = self.refresh_tokens.write();
        if let Some(record) = tokens.values_mut().find(|t| t.id == id) {
            record.rotation_count += 1;
        }
        Ok(())
    }

    async fn delete_expired_credentials(&self, now: DateTime<Utc>) -> anyhow::Result<SweepStats> {
        let mut stats = SweepStats::default();
        {
            let mut codes = self.authorization_codes.write();
            let before = codes.len();
            codes.retain(|_, c| c.expires_at >= now);
            stats.authorization_codes = (before - codes.len()) as u64;
        }
        {
            let mut tokens = self.access_tokens.write();
            let before = tokens.len();
            tokens.retain(|_, t| t.revoked || t.expires_at >= now);
            stats.access_tokens = (before - tokens.len()) as u64;
        }
        {
            let mut tokens = self.refresh_tokens.write();
            let before = tokens.len();
            tokens.retain(|_, t| t.revoked || t.expires_at >= now);
            stats.refresh_tokens = (before - tokens.len()) as u64;
        }
        Ok(stats)
    }
}

#[async_trait]
impl UpstreamSessionStore for MemoryStore {
    async fn upsert_upstream_session(
        &self,
        session: &UpstreamSessionRecord,
    ) -> anyhow::Result<()> {
        self.upstream_sessions
            .write()
            .insert(session.mcp_server_name.clone(), session.clone());
        Ok(())
    }

    async fn get_upstream_session(
        &self,
        server_name: &str,
    ) -> anyhow::Result<Option<UpstreamSessionRecord>> {
        Ok(self.upstream_sessions.read().get(server_name).cloned())
    }

    async fn delete_upstream_session(&self, server_name: &str) -> anyhow::Result<bool> {
        Ok(self.upstream_sessions.write().remove(server_name).is_some())
    }
}

#[async_trait]
impl McpClientStore for MemoryStore {
    async fn insert_mcp_client(&self, client: &McpClientRecord) -> anyhow::Result<()> {
        let mut clients = self.mcp_clients.write();
        if clients.contains_key(&client.name) {
            anyhow::bail!("mcp client '{}' already exists", client.name);
        }
        clients.insert(client.name.clone(), client.clone());
        Ok(())
    }

    async fn get_mcp_client(&self, name: &str) -> anyhow::Result<Option<McpClientRecord>> {
        Ok(self.mcp_clients.read().get(name).cloned())
    }

    async fn get_mcp_client_by_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<McpClientRecord>> {
        Ok(self
            .mcp_clients
            .read()
            .values()
            .find(|c| c.access_token == token)
            .cloned())
    }

    async fn list_mcp_clients(&self) -> anyhow::Result<Vec<McpClientRecord>> {
        let mut clients: Vec<_> = self.mcp_clients.read().values().cloned().collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }

    async fn delete_mcp_client(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.mcp_clients.write().remove(name).is_some())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user_by_token(&self, token: &str) -> anyhow::Result<Option<UserRecord>> {
        Ok(self
            .users
            .read()
            .iter()
            .find(|u| u.access_token == token)
            .cloned())
    }

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<UserRecord>> {
        Ok(self.users.read().iter().find(|u| u.id == id).cloned())
    }

    async fn has_any_user(&self) -> anyhow::Result<bool> {
        Ok(!self.users.read().is_empty())
    }
}

#[async_trait]
impl ToolGroupStore for MemoryStore {
    async fn insert_tool_group(&self, group: &ToolGroupRecord) -> anyhow::Result<()> {
        let mut groups = self.tool_groups.write();
        if groups.contains_key(&group.name) {
            anyhow::bail!("tool group '{}' already exists", group.name);
        }
        groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    async fn get_tool_group(&self, name: &str) -> anyhow::Result<Option<ToolGroupRecord>> {
        Ok(self.tool_groups.read().get(name).cloned())
    }

    async fn list_tool_groups(&self) -> anyhow::Result<Vec<ToolGroupRecord>> {
        let mut groups: Vec<_> = self.tool_groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn delete_tool_group(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.tool_groups.write().remove(name).is_some())
    }
}

#[async_trait]
impl ToolRegistry for MemoryStore {
    async fn list_tools_by_server(&self, server_name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .server_tools
            .read()
            .get(server_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_prompts_by_server(&self, server_name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .server_prompts
            .read()
            .get(server_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit_log(&self, entry: &AuditLogRecord) -> anyhow::Result<()> {
        let mut logs = self.audit_logs.write();
        let mut record = entry.clone();
        record.id = self.alloc_id();
        logs.push(record);
        Ok(())
    }

    async fn list_audit_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<AuditLogRecord>> {
        let limit = effective_limit(limit);
        Ok(self
            .audit_logs
            .read()
            .iter()
            .rev()
            .filter(|l| l.entity_type == entity_type && l.entity_id == entity_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_audit(&self, filter: &AuditLogFilter) -> anyhow::Result<Vec<AuditLogRecord>> {
        let limit = effective_limit(filter.limit);
        Ok(self
            .audit_logs
            .read()
            .iter()
            .rev()
            .filter(|l| {
                filter
                    .entity_type
                    .as_ref()
                    .is_none_or(|v| &l.entity_type == v)
                    && filter.operation.as_ref().is_none_or(|v| &l.operation == v)
                    && filter
                        .actor_type
                        .as_ref()
                        .is_none_or(|v| &l.actor_type == v)
                    && filter.actor_id.as_ref().is_none_or(|v| &l.actor_id == v)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

pub(crate) fn effective_limit(limit: i64) -> usize {
    if limit <= 0 {
        AUDIT_DEFAULT_LIMIT as usize
    } else {
        limit as usize
    }
}
