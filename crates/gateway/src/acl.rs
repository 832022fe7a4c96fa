use crate::store::{McpClientRecord, ToolGroupRecord, ToolGroupStore, ToolRegistry};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Canonical tool names are `<server_name>__<tool_name>`.
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// Split a canonical name at the first `__`. Everything after it is the
/// tool-local part.
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(TOOL_NAME_SEPARATOR)
}

/// Effective tool set for a group:
/// `(included_tools ∪ tools of included_servers) ∖ excluded_tools`.
///
/// Exclusions win over inclusions.
pub async fn resolve_effective_tools(
    group: &ToolGroupRecord,
    registry: &dyn ToolRegistry,
) -> anyhow::Result<BTreeSet<String>> {
    let mut effective: BTreeSet<String> = group.included_tools.iter().cloned().collect();
    for server_name in &group.included_servers {
        for tool in registry.list_tools_by_server(server_name).await? {
            effective.insert(tool);
        }
    }
    for excluded in &group.excluded_tools {
        effective.remove(excluded);
    }
    Ok(effective)
}

/// Prompt-side twin of [`resolve_effective_tools`]; `included_servers` is
/// shared between the two.
pub async fn resolve_effective_prompts(
    group: &ToolGroupRecord,
    registry: &dyn ToolRegistry,
) -> anyhow::Result<BTreeSet<String>> {
    let mut effective: BTreeSet<String> = group.included_prompts.iter().cloned().collect();
    for server_name in &group.included_servers {
        for prompt in registry.list_prompts_by_server(server_name).await? {
            effective.insert(prompt);
        }
    }
    for excluded in &group.excluded_prompts {
        effective.remove(excluded);
    }
    Ok(effective)
}

/// Two-layer access decision shared by the proxy pipeline.
///
/// A non-empty `allowed_tool_groups` set switches the client to tool-level
/// ACL and disables the server allow-list fallback entirely.
#[derive(Clone)]
pub struct AclResolver {
    groups: Arc<dyn ToolGroupStore>,
    registry: Arc<dyn ToolRegistry>,
}

impl AclResolver {
    pub fn new(groups: Arc<dyn ToolGroupStore>, registry: Arc<dyn ToolRegistry>) -> Self {
        Self { groups, registry }
    }

    pub async fn check_tool_access(
        &self,
        client: &McpClientRecord,
        tool_name: &str,
    ) -> anyhow::Result<bool> {
        if !client.allowed_tool_groups.is_empty() {
            return self
                .tool_in_allowed_groups(&client.allowed_tool_groups, tool_name)
                .await;
        }

        let (server_name, _) = split_tool_name(tool_name)
            .ok_or_else(|| anyhow::anyhow!("invalid tool name format: {tool_name}"))?;
        Ok(client.has_server_access(server_name))
    }

    pub async fn check_prompt_access(
        &self,
        client: &McpClientRecord,
        prompt_name: &str,
    ) -> anyhow::Result<bool> {
        if !client.allowed_tool_groups.is_empty() {
            for group_name in &client.allowed_tool_groups {
                // Missing groups are skipped silently.
                let Some(group) = self.groups.get_tool_group(group_name).await? else {
                    continue;
                };
                if resolve_effective_prompts(&group, self.registry.as_ref())
                    .await?
                    .contains(prompt_name)
                {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let (server_name, _) = split_tool_name(prompt_name)
            .ok_or_else(|| anyhow::anyhow!("invalid prompt name format: {prompt_name}"))?;
        Ok(client.has_server_access(server_name))
    }

    async fn tool_in_allowed_groups(
        &self,
        allowed_groups: &[String],
        tool_name: &str,
    ) -> anyhow::Result<bool> {
        for group_name in allowed_groups {
            // Missing groups are skipped silently.
            let Some(group) = self.groups.get_tool_group(group_name).await? else {
                continue;
            };
            if resolve_effective_tools(&group, self.registry.as_ref())
                .await?
                .contains(tool_name)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
