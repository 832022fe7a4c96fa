use crate::store::{
    AccessTokenRecord, AuditLogFilter, AuditLogRecord, AuditStore, AuthorizationCodeRecord,
    IssuerStore, McpClientRecord, McpClientStore, OAuthClientRecord, RefreshTokenRecord,
    SweepStats, ToolGroupRecord, ToolGroupStore, ToolRegistry, UpstreamSessionRecord,
    UpstreamSessionStore, UserRecord, UserStore, effective_limit,
};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row as _};

/// Decode a jsonb string-array column, treating SQL null and JSON `null` as
/// the empty set.
fn decode_string_set(v: Option<Value>) -> anyhow::Result<Vec<String>> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value).context("decode jsonb string array"),
    }
}

fn encode_string_set(set: &[String]) -> Value {
    Value::Array(set.iter().cloned().map(Value::String).collect())
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Verify the migrations have been applied (they are managed externally,
    /// e.g. via dbmate over `crates/gateway/migrations/`).
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let row = sqlx::query(
            r"
select count(*)::int as n
from information_schema.tables
where table_name in (
  'oauth_clients',
  'oauth_authorization_codes',
  'oauth_access_tokens',
  'oauth_refresh_tokens',
  'oauth_upstream_sessions',
  'mcp_clients',
  'tool_groups',
  'audit_logs'
)
",
        )
        .fetch_one(&self.pool)
        .await
        .context("check gateway schema")?;

        let n: i32 = row.try_get("n")?;
        if n < 8 {
            anyhow::bail!(
                "database schema is incomplete; apply the migrations in crates/gateway/migrations"
            );
        }
        Ok(())
    }

    fn parse_oauth_client(row: &PgRow) -> anyhow::Result<OAuthClientRecord> {
        Ok(OAuthClientRecord {
            client_id: row.try_get("client_id")?,
            client_secret_hash: row.try_get("client_secret_hash")?,
            client_name: row.try_get("client_name")?,
            redirect_uris: decode_string_set(row.try_get("redirect_uris")?)?,
            grant_types: decode_string_set(row.try_get("grant_types")?)?,
            scopes: decode_string_set(row.try_get("scopes")?)?,
            is_confidential: row.try_get("is_confidential")?,
            token_endpoint_auth_method: row.try_get("token_endpoint_auth_method")?,
            user_id: row.try_get("user_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn parse_access_token(row: &PgRow) -> anyhow::Result<AccessTokenRecord> {
        Ok(AccessTokenRecord {
            id: row.try_get("id")?,
            access_token: row.try_get("access_token")?,
            client_id: row.try_get("client_id")?,
            user_id: row.try_get("user_id")?,
            scope: row.try_get("scope")?,
            expires_at: row.try_get("expires_at")?,
            refresh_token_id: row.try_get("refresh_token_id")?,
            audience: row.try_get("audience")?,
            revoked: row.try_get("revoked")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn parse_refresh_token(row: &PgRow) -> anyhow::Result<RefreshTokenRecord> {
        Ok(RefreshTokenRecord {
            id: row.try_get("id")?,
            refresh_token: row.try_get("refresh_token")?,
            client_id: row.try_get("client_id")?,
            user_id: row.try_get("user_id")?,
            scope: row.try_get("scope")?,
            expires_at: row.try_get("expires_at")?,
            revoked: row.try_get("revoked")?,
            rotation_count: row.try_get("rotation_count")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn parse_upstream_session(row: &PgRow) -> anyhow::Result<UpstreamSessionRecord> {
        Ok(UpstreamSessionRecord {
            mcp_server_name: row.try_get("mcp_server_name")?,
            client_id: row.try_get("client_id")?,
            client_secret: row.try_get("client_secret")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_type: row.try_get("token_type")?,
            expires_at: row.try_get("expires_at")?,
            scope: row.try_get("scope")?,
            authorization_endpoint: row.try_get("authorization_endpoint")?,
            token_endpoint: row.try_get("token_endpoint")?,
            resource_uri: row.try_get("resource_uri")?,
            code_verifier: row.try_get("code_verifier")?,
            redirect_uri: row.try_get("redirect_uri")?,
            pending_state: row.try_get("pending_state")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_mcp_client(row: &PgRow) -> anyhow::Result<McpClientRecord> {
        Ok(McpClientRecord {
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            access_token: row.try_get("access_token")?,
            allow_list: decode_string_set(row.try_get("allow_list")?)?,
            allowed_tool_groups: decode_string_set(row.try_get("allowed_tool_groups")?)?,
        })
    }

    fn parse_tool_group(row: &PgRow) -> anyhow::Result<ToolGroupRecord> {
        Ok(ToolGroupRecord {
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            included_tools: decode_string_set(row.try_get("included_tools")?)?,
            included_servers: decode_string_set(row.try_get("included_servers")?)?,
            excluded_tools: decode_string_set(row.try_get("excluded_tools")?)?,
            included_prompts: decode_string_set(row.try_get("included_prompts")?)?,
            excluded_prompts: decode_string_set(row.try_get("excluded_prompts")?)?,
        })
    }

    fn parse_audit_log(row: &PgRow) -> anyhow::Result<AuditLogRecord> {
        Ok(AuditLogRecord {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            entity_name: row.try_get("entity_name")?,
            operation: row.try_get("operation")?,
            changes: row.try_get("changes")?,
            actor_type: row.try_get("actor_type")?,
            actor_id: row.try_get("actor_id")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            success: row.try_get("success")?,
            error_msg: row.try_get("error_msg")?,
        })
    }
}

#[async_trait]
impl IssuerStore for PostgresStore {
    async fn insert_oauth_client(&self, client: &OAuthClientRecord) -> anyhow::Result<()> {
        sqlx::query(
            r"
insert into oauth_clients (
  client_id, client_secret_hash, client_name, redirect_uris, grant_types,
  scopes, is_confidential, token_endpoint_auth_method, user_id
)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
",
        )
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(&client.client_name)
        .bind(encode_string_set(&client.redirect_uris))
        .bind(encode_string_set(&client.grant_types))
        .bind(encode_string_set(&client.scopes))
        .bind(client.is_confidential)
        .bind(&client.token_endpoint_auth_method)
        .bind(client.user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_oauth_client(
        &self,
        client_id: &str,
    ) -> anyhow::Result<Option<OAuthClientRecord>> {
        let row = sqlx::query(
            r"
select client_id, client_secret_hash, client_name, redirect_uris, grant_types,
       scopes, is_confidential, token_endpoint_auth_method, user_id, created_at
from oauth_clients
where client_id = $1
  and deleted_at is null
",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_oauth_client).transpose()
    }

    async fn insert_authorization_code(
        &self,
        code: &AuthorizationCodeRecord,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r"
insert into oauth_authorization_codes (
  code, client_id, user_id, redirect_uri, scope, expires_at,
  code_challenge, code_challenge_method, used
)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
",
        )
        .bind(&code.code)
        .bind(&code.client_id)
        .bind(code.user_id)
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(code.expires_at)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(code.used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_authorization_code(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<AuthorizationCodeRecord>> {
        let row = sqlx::query(
            r"
select code, client_id, user_id, redirect_uri, scope, expires_at,
       code_challenge, code_challenge_method, used, created_at
from oauth_authorization_codes
where code = $1
",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(AuthorizationCodeRecord {
                code: r.try_get("code")?,
                client_id: r.try_get("client_id")?,
                user_id: r.try_get("user_id")?,
                redirect_uri: r.try_get("redirect_uri")?,
                scope: r.try_get("scope")?,
                expires_at: r.try_get("expires_at")?,
                code_challenge: r.try_get("code_challenge")?,
                code_challenge_method: r.try_get("code_challenge_method")?,
                used: r.try_get("used")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn consume_authorization_code(&self, code: &str) -> anyhow::Result<bool> {
        // Conditional update guarded by the unique index; zero rows affected
        // means the code was unknown or already consumed (replay).
        let res = sqlx::query(
            r"
update oauth_authorization_codes
set used = true
where code = $1
  and used = false
",
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_access_token(&self, token: &AccessTokenRecord) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r"
insert into oauth_access_tokens (
  access_token, client_id, user_id, scope, expires_at,
  refresh_token_id, audience, revoked
)
values ($1, $2, $3, $4, $5, $6, $7, $8)
returning id
",
        )
        .bind(&token.access_token)
        .bind(&token.client_id)
        .bind(token.user_id)
        .bind(&token.scope)
        .bind(token.expires_at)
        .bind(token.refresh_token_id)
        .bind(&token.audience)
        .bind(token.revoked)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_access_token(&self, token: &str) -> anyhow::Result<Option<AccessTokenRecord>> {
        let row = sqlx::query(
            r"
select id, access_token, client_id, user_id, scope, expires_at,
       refresh_token_id, audience, revoked, created_at
from oauth_access_tokens
where access_token = $1
  and deleted_at is null
",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_access_token).transpose()
    }

    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r"
insert into oauth_refresh_tokens (
  refresh_token, client_id, user_id, scope, expires_at, revoked, rotation_count
)
values ($1, $2, $3, $4, $5, $6, $7)
returning id
",
        )
        .bind(&token.refresh_token)
        .bind(&token.client_id)
        .bind(token.user_id)
        .bind(&token.scope)
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.rotation_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_refresh_token(&self, token: &str) -> anyhow::Result<Option<RefreshTokenRecord>> {
        let row = sqlx::query(
            r"
select id, refresh_token, client_id, user_id, scope, expires_at,
       revoked, rotation_count, created_at
from oauth_refresh_tokens
where refresh_token = $1
  and deleted_at is null
",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_refresh_token).transpose()
    }

    async fn revoke_access_token(&self, token: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r"
update oauth_access_tokens
set revoked = true
where access_token = $1
  and revoked = false
  and deleted_at is null
",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn revoke_refresh_token(&self, token: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r"
update oauth_refresh_tokens
set revoked = true
where refresh_token = $1
  and revoked = false
  and deleted_at is null
",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn increment_refresh_rotation(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r"
update oauth_refresh_tokens
set rotation_count = rotation_count + 1
where id = $1
",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired_credentials(&self, now: DateTime<Utc>) -> anyhow::Result<SweepStats> {
        let mut stats = SweepStats::default();

        let res = sqlx::query("delete from oauth_authorization_codes where expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        stats.authorization_codes = res.rows_affected();

        let res = sqlx::query(
            "delete from oauth_access_tokens where expires_at < $1 and revoked = false",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        stats.access_tokens = res.rows_affected();

        let res = sqlx::query(
            "delete from oauth_refresh_tokens where expires_at < $1 and revoked = false",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        stats.refresh_tokens = res.rows_affected();

        Ok(stats)
    }
}

#[async_trait]
impl UpstreamSessionStore for PostgresStore {
    async fn upsert_upstream_session(
        &self,
        session: &UpstreamSessionRecord,
    ) -> anyhow::Result<()> {
        // Revive a tombstoned row for the same server name rather than
        // violating the partial unique index.
        sqlx::query(
            r"
delete from oauth_upstream_sessions
where mcp_server_name = $1
  and deleted_at is not null
",
        )
        .bind(&session.mcp_server_name)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
insert into oauth_upstream_sessions (
  mcp_server_name, client_id, client_secret, access_token, refresh_token,
  token_type, expires_at, scope, authorization_endpoint, token_endpoint,
  resource_uri, code_verifier, redirect_uri, pending_state, updated_at
)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now())
on conflict (mcp_server_name) where deleted_at is null do update set
  client_id = excluded.client_id,
  client_secret = excluded.client_secret,
  access_token = excluded.access_token,
  refresh_token = excluded.refresh_token,
  token_type = excluded.token_type,
  expires_at = excluded.expires_at,
  scope = excluded.scope,
  authorization_endpoint = excluded.authorization_endpoint,
  token_endpoint = excluded.token_endpoint,
  resource_uri = excluded.resource_uri,
  code_verifier = excluded.code_verifier,
  redirect_uri = excluded.redirect_uri,
  pending_state = excluded.pending_state,
  updated_at = now()
",
        )
        .bind(&session.mcp_server_name)
        .bind(&session.client_id)
        .bind(&session.client_secret)
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(&session.token_type)
        .bind(session.expires_at)
        .bind(&session.scope)
        .bind(&session.authorization_endpoint)
        .bind(&session.token_endpoint)
        .bind(&session.resource_uri)
        .bind(&session.code_verifier)
        .bind(&session.redirect_uri)
        .bind(&session.pending_state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upstream_session(
        &self,
        server_name: &str,
    ) -> anyhow::Result<Option<UpstreamSessionRecord>> {
        let row = sqlx::query(
            r"
select mcp_server_name, client_id, client_secret, access_token, refresh_token,
       token_type, expires_at, scope, authorization_endpoint, token_endpoint,
       resource_uri, code_verifier, redirect_uri, pending_state, updated_at
from oauth_upstream_sessions
where mcp_server_name = $1
  and deleted_at is null
",
        )
        .bind(server_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_upstream_session).transpose()
    }

    async fn delete_upstream_session(&self, server_name: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r"
update oauth_upstream_sessions
set deleted_at = now()
where mcp_server_name = $1
  and deleted_at is null
",
        )
        .bind(server_name)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl McpClientStore for PostgresStore {
    async fn insert_mcp_client(&self, client: &McpClientRecord) -> anyhow::Result<()> {
        sqlx::query(
            r"
insert into mcp_clients (name, description, access_token, allow_list, allowed_tool_groups)
values ($1, $2, $3, $4, $5)
",
        )
        .bind(&client.name)
        .bind(&client.description)
        .bind(&client.access_token)
        .bind(encode_string_set(&client.allow_list))
        .bind(encode_string_set(&client.allowed_tool_groups))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_mcp_client(&self, name: &str) -> anyhow::Result<Option<McpClientRecord>> {
        let row = sqlx::query(
            r"
select name, description, access_token, allow_list, allowed_tool_groups
from mcp_clients
where name = $1
  and deleted_at is null
",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_mcp_client).transpose()
    }

    async fn get_mcp_client_by_token(
        &self,
        token: &str,
    ) -> anyhow::Result<Option<McpClientRecord>> {
        let row = sqlx::query(
            r"
select name, description, access_token, allow_list, allowed_tool_groups
from mcp_clients
where access_token = $1
  and deleted_at is null
",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_mcp_client).transpose()
    }

    async fn list_mcp_clients(&self) -> anyhow::Result<Vec<McpClientRecord>> {
        let rows = sqlx::query(
            r"
select name, description, access_token, allow_list, allowed_tool_groups
from mcp_clients
where deleted_at is null
order by name asc
",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_mcp_client).collect()
    }

    async fn delete_mcp_client(&self, name: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r"
update mcp_clients
set deleted_at = now()
where name = $1
  and deleted_at is null
",
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn get_user_by_token(&self, token: &str) -> anyhow::Result<Option<UserRecord>> {
        let row = sqlx::query("select id, username, access_token from users where access_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(UserRecord {
                id: r.try_get("id")?,
                username: r.try_get("username")?,
                access_token: r.try_get("access_token")?,
            })
        })
        .transpose()
    }

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<UserRecord>> {
        let row = sqlx::query("select id, username, access_token from users where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(UserRecord {
                id: r.try_get("id")?,
                username: r.try_get("username")?,
                access_token: r.try_get("access_token")?,
            })
        })
        .transpose()
    }

    async fn has_any_user(&self) -> anyhow::Result<bool> {
        let row = sqlx::query("select exists (select 1 from users) as present")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }
}

#[async_trait]
impl ToolGroupStore for PostgresStore {
    async fn insert_tool_group(&self, group: &ToolGroupRecord) -> anyhow::Result<()> {
        sqlx::query(
            r"
insert into tool_groups (
  name, description, included_tools, included_servers, excluded_tools,
  included_prompts, excluded_prompts
)
values ($1, $2, $3, $4, $5, $6, $7)
",
        )
        .bind(&group.name)
        .bind(&group.description)
        .bind(encode_string_set(&group.included_tools))
        .bind(encode_string_set(&group.included_servers))
        .bind(encode_string_set(&group.excluded_tools))
        .bind(encode_string_set(&group.included_prompts))
        .bind(encode_string_set(&group.excluded_prompts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tool_group(&self, name: &str) -> anyhow::Result<Option<ToolGroupRecord>> {
        let row = sqlx::query(
            r"
select name, description, included_tools, included_servers, excluded_tools,
       included_prompts, excluded_prompts
from tool_groups
where name = $1
",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_tool_group).transpose()
    }

    async fn list_tool_groups(&self) -> anyhow::Result<Vec<ToolGroupRecord>> {
        let rows = sqlx::query(
            r"
select name, description, included_tools, included_servers, excluded_tools,
       included_prompts, excluded_prompts
from tool_groups
order by name asc
",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_tool_group).collect()
    }

    async fn delete_tool_group(&self, name: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("delete from tool_groups where name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl ToolRegistry for PostgresStore {
    async fn list_tools_by_server(&self, server_name: &str) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "select tool_name from mcp_server_tools where server_name = $1 order by tool_name",
        )
        .bind(server_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("tool_name").map_err(Into::into))
            .collect()
    }

    async fn list_prompts_by_server(&self, server_name: &str) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "select prompt_name from mcp_server_prompts where server_name = $1 order by prompt_name",
        )
        .bind(server_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("prompt_name").map_err(Into::into))
            .collect()
    }
}

#[async_trait]
impl AuditStore for PostgresStore {
    async fn insert_audit_log(&self, entry: &AuditLogRecord) -> anyhow::Result<()> {
        sqlx::query(
            r"
insert into audit_logs (
  entity_type, entity_id, entity_name, operation, changes,
  actor_type, actor_id, ip_address, user_agent, success, error_msg
)
values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
",
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.entity_name)
        .bind(&entry.operation)
        .bind(&entry.changes)
        .bind(&entry.actor_type)
        .bind(&entry.actor_id)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.success)
        .bind(&entry.error_msg)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<AuditLogRecord>> {
        let rows = sqlx::query(
            r"
select id, created_at, entity_type, entity_id, entity_name, operation, changes,
       actor_type, actor_id, ip_address, user_agent, success, error_msg
from audit_logs
where entity_type = $1
  and entity_id = $2
order by created_at desc
limit $3
",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(effective_limit(limit) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_audit_log).collect()
    }

    async fn list_audit(&self, filter: &AuditLogFilter) -> anyhow::Result<Vec<AuditLogRecord>> {
        let rows = sqlx::query(
            r"
select id, created_at, entity_type, entity_id, entity_name, operation, changes,
       actor_type, actor_id, ip_address, user_agent, success, error_msg
from audit_logs
where ($1::text is null or entity_type = $1)
  and ($2::text is null or operation = $2)
  and ($3::text is null or actor_type = $3)
  and ($4::text is null or actor_id = $4)
order by created_at desc
limit $5
",
        )
        .bind(&filter.entity_type)
        .bind(&filter.operation)
        .bind(&filter.actor_type)
        .bind(&filter.actor_id)
        .bind(effective_limit(filter.limit) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_audit_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_string_set_accepts_null_and_missing() {
        assert!(decode_string_set(None).expect("none").is_empty());
        assert!(
            decode_string_set(Some(Value::Null))
                .expect("null")
                .is_empty()
        );
        assert_eq!(
            decode_string_set(Some(json!(["a", "b"]))).expect("array"),
            vec!["a", "b"]
        );
        assert!(decode_string_set(Some(json!("nope"))).is_err());
    }

    #[test]
    fn encode_string_set_roundtrips() {
        let set = vec!["x".to_string(), "y".to_string()];
        assert_eq!(
            decode_string_set(Some(encode_string_set(&set))).expect("roundtrip"),
            set
        );
    }
}
