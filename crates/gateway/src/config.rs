use serde::Deserialize;

/// Gateway configuration (YAML).
///
/// Config-file mode doubles as the identity seed: users, MCP clients, tool
/// groups and the static server→tool registry are loaded from here into the
/// in-memory store. In Postgres mode only `mode` is honored; identities live
/// in the database.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: ServerMode,
    #[serde(default)]
    pub users: Vec<UserSeed>,
    #[serde(default)]
    pub mcp_clients: Vec<McpClientSeed>,
    #[serde(default)]
    pub tool_groups: Vec<ToolGroupSeed>,
    /// Static registry of upstream servers and the canonical
    /// (`<server>__<tool>`) names of their tools/prompts. Registry population
    /// is owned by the proxy pipeline; this seed stands in for it.
    #[serde(default)]
    pub servers: Vec<ServerSeed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    #[default]
    Development,
    Enterprise,
    /// Kept for compatibility; gated identically to enterprise.
    Production,
}

impl ServerMode {
    /// Whether auth enforcement applies in this mode.
    pub fn enforces_auth(self) -> bool {
        !matches!(self, Self::Development)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSeed {
    pub username: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpClientSeed {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub access_token: String,
    /// Omitted / `null` / `[]` all mean the empty set (deny-all fallback).
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub allow_list: Vec<String>,
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub allowed_tool_groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolGroupSeed {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub included_tools: Vec<String>,
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub included_servers: Vec<String>,
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub excluded_tools: Vec<String>,
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub included_prompts: Vec<String>,
    #[serde(default, deserialize_with = "crate::store::null_as_empty")]
    pub excluded_prompts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSeed {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub prompts: Vec<String>,
}

/// Runtime view of the server configuration, as consumed by middleware.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub initialized: bool,
    pub mode: ServerMode,
}
