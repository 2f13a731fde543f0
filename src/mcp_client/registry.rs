//! Capability table: the tools one server instance advertised.
//!
//! Built wholesale from a single `tools/list` response and replaced wholesale
//! on reconnect. If any entry fails to parse the whole table is empty, so a
//! table is always either complete or empty.

use std::collections::HashMap;

use super::errors::McpError;
use super::types::{ListToolsResult, ToolDescriptor};

// ─── CapabilityTable ─────────────────────────────────────────────────────────

/// Snapshot of the tools advertised by the connected server.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    /// `tool_name → descriptor`.
    tools: HashMap<String, ToolDescriptor>,
}

impl CapabilityTable {
    /// A capability-less table.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_tools(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Parse a `tools/list` result payload.
    ///
    /// Fails if the payload or any single tool entry is malformed; callers
    /// fall back to [`CapabilityTable::empty`].
    pub fn from_list_response(result: serde_json::Value) -> Result<Self, McpError> {
        let parsed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol {
                reason: format!("invalid tools/list response: {e}"),
            })?;

        if let Some(unnamed) = parsed.tools.iter().position(|t| t.name.trim().is_empty()) {
            return Err(McpError::Protocol {
                reason: format!("tools/list entry {unnamed} has an empty name"),
            });
        }

        Ok(Self::from_tools(parsed.tools))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Required schema parameters that `arguments` does not supply.
    ///
    /// Empty when the tool is unknown or declares no requirements; the
    /// server remains the authority on argument validity.
    pub fn missing_required(&self, tool_name: &str, arguments: &serde_json::Value) -> Vec<String> {
        let Some(def) = self.get(tool_name) else {
            return Vec::new();
        };
        let args_obj = arguments.as_object();
        def.required_parameters()
            .into_iter()
            .filter(|field| {
                !args_obj
                    .map(|obj| obj.contains_key(field.as_str()))
                    .unwrap_or(false)
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
