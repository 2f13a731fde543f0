//! Intent resolution: abstract operation to concrete tool call.
//!
//! Different builds of the research server expose the same operation under
//! different tool names and parameter names. Discovery tells us which names
//! exist; it never tells us the parameter contract. Both pieces of
//! server-specific knowledge live here as data:
//!
//! - an ordered alias list per [`OperationIntent`] (first present wins)
//! - an override table keyed by exact tool name, each override being an
//!   ordered list of [`ParamRule`]s applied to the logical arguments
//!
//! Supporting a new server build is a configuration change, not a code change.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::registry::CapabilityTable;
use super::types::OperationIntent;

// ─── Logical Argument Names ──────────────────────────────────────────────────

/// Argument names the facade uses before any tool-specific shaping.
pub mod args {
    pub const REPOSITORY: &str = "repository";
    pub const QUERY: &str = "query";
    pub const MAX_RESULTS: &str = "max_results";
    pub const PATTERN: &str = "pattern";
    pub const FILE_TYPE: &str = "file_type";
    pub const FILE_PATH: &str = "file_path";
}

// ─── Built-in Tables ─────────────────────────────────────────────────────────

/// Tool names observed across server builds, most preferred first.
pub fn default_aliases(intent: OperationIntent) -> &'static [&'static str] {
    match intent {
        OperationIntent::Index => &[
            "index_repository",
            "index-repository",
            "create_research_repository",
            "index_repo",
            "index-repo",
            "repository_index",
            "repo_index",
            "clone_and_index",
            "clone-and-index",
        ],
        OperationIntent::SemanticSearch => &[
            "semantic_search",
            "semantic-search",
            "search_research_repository",
            "search",
            "search_repository",
            "search-repository",
            "repo_search",
            "repo-search",
            "query",
            "find",
            "search_code",
            "search-code",
        ],
        OperationIntent::CodeSearch => &[
            "search_code",
            "search-code",
            "code_search",
            "code-search",
            "grep",
            "find_code",
            "find-code",
            "pattern_search",
            "pattern-search",
        ],
        OperationIntent::ReadFile => &[
            "get_file_content",
            "get-file-content",
            "file_content",
            "file-content",
            "read_file",
            "read-file",
            "get_file",
            "get-file",
            "access_file",
        ],
        OperationIntent::GetStructure => &[
            "get_repository_structure",
            "get-repository-structure",
            "repository_structure",
            "repository-structure",
            "repo_structure",
            "repo-structure",
            "list_files",
            "list-files",
            "tree",
            "access_file",
        ],
    }
}

/// Parameter overrides for the tool names whose contract differs from the
/// logical argument names.
pub fn default_overrides() -> HashMap<String, ToolOverride> {
    let mut overrides = HashMap::new();
    overrides.insert(
        "create_research_repository".to_string(),
        ToolOverride::new(vec![ParamRule::rename(args::REPOSITORY, "repository_path")]),
    );
    overrides.insert(
        "search_research_repository".to_string(),
        ToolOverride::new(vec![
            ParamRule::rename(args::REPOSITORY, "index_path"),
            ParamRule::rename(args::MAX_RESULTS, "limit"),
        ]),
    );
    overrides.insert(
        "access_file".to_string(),
        ToolOverride::new(vec![ParamRule::RepositoryPath {
            to: "filepath".to_string(),
            join: Some(args::FILE_PATH.to_string()),
        }]),
    );
    overrides
}

// ─── Override Rules ──────────────────────────────────────────────────────────

/// One argument-shaping step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamRule {
    /// Move the value of `from` to `to`.
    Rename { from: String, to: String },
    /// Replace `repository` (and the optional `join` argument) with a
    /// server-side path: `{short_name}/repository[/{join value}]`.
    RepositoryPath {
        to: String,
        #[serde(default)]
        join: Option<String>,
    },
}

impl ParamRule {
    pub fn rename(from: &str, to: &str) -> Self {
        Self::Rename {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn apply(&self, arguments: &mut serde_json::Map<String, serde_json::Value>) {
        match self {
            Self::Rename { from, to } => {
                if let Some(value) = arguments.remove(from) {
                    arguments.insert(to.clone(), value);
                }
            }
            Self::RepositoryPath { to, join } => {
                let Some(repository) = arguments.remove(args::REPOSITORY) else {
                    return;
                };
                let base = format!(
                    "{}/repository",
                    repo_short_name(repository.as_str().unwrap_or_default())
                );
                let joined = join
                    .as_deref()
                    .and_then(|key| arguments.remove(key))
                    .and_then(|v| v.as_str().map(|s| s.trim_start_matches('/').to_string()))
                    .filter(|s| !s.is_empty());
                let path = match joined {
                    Some(rel) => format!("{base}/{rel}"),
                    None => base,
                };
                arguments.insert(to.clone(), serde_json::Value::String(path));
            }
        }
    }
}

/// Ordered rules for one tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOverride {
    #[serde(default)]
    pub rules: Vec<ParamRule>,
}

impl ToolOverride {
    pub fn new(rules: Vec<ParamRule>) -> Self {
        Self { rules }
    }
}

/// Last path segment of a repository reference, without a `.git` suffix.
///
/// `"org/repo"` → `"repo"`, `"https://github.com/org/repo.git"` → `"repo"`.
pub fn repo_short_name(repository: &str) -> &str {
    let trimmed = repository.trim().trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last)
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Maps intents to tool names and shapes arguments per tool.
#[derive(Debug, Clone)]
pub struct Resolver {
    aliases: BTreeMap<OperationIntent, Vec<String>>,
    overrides: HashMap<String, ToolOverride>,
}

impl Default for Resolver {
    fn default() -> Self {
        let aliases = OperationIntent::ALL
            .iter()
            .map(|&intent| {
                let names = default_aliases(intent).iter().map(|s| s.to_string()).collect();
                (intent, names)
            })
            .collect();
        Self {
            aliases,
            overrides: default_overrides(),
        }
    }
}

impl Resolver {
    /// Prepend aliases for `intent`, ahead of the built-in ones.
    pub fn with_aliases(mut self, intent: OperationIntent, extra: Vec<String>) -> Self {
        let list = self.aliases.entry(intent).or_default();
        let mut merged = extra;
        merged.append(list);
        // Keep the first occurrence of each name.
        let mut seen = HashSet::new();
        merged.retain(|name| seen.insert(name.clone()));
        *list = merged;
        self
    }

    /// Register or replace the override for `tool_name`.
    pub fn with_override(mut self, tool_name: &str, rules: ToolOverride) -> Self {
        self.overrides.insert(tool_name.to_string(), rules);
        self
    }

    /// Aliases tried for `intent`, in order.
    pub fn aliases(&self, intent: OperationIntent) -> &[String] {
        self.aliases.get(&intent).map(Vec::as_slice).unwrap_or_default()
    }

    /// The first alias for `intent` present in `table`.
    pub fn resolve_tool(
        &self,
        intent: OperationIntent,
        table: &CapabilityTable,
    ) -> Result<String, McpError> {
        let aliases = self.aliases(intent);
        aliases
            .iter()
            .find(|name| table.contains(name))
            .cloned()
            .ok_or_else(|| McpError::ToolNotAvailable {
                intent,
                tried: aliases.to_vec(),
            })
    }

    /// Shape logical arguments for `tool_name`.
    ///
    /// Tools without an override receive the logical arguments unchanged.
    pub fn build_arguments(
        &self,
        tool_name: &str,
        intent: OperationIntent,
        mut logical: serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Value {
        if let Some(rules) = self.overrides.get(tool_name) {
            tracing::debug!(
                tool = tool_name,
                intent = %intent,
                rules = rules.rules.len(),
                "applying parameter override"
            );
            for rule in &rules.rules {
                rule.apply(&mut logical);
            }
        }
        serde_json::Value::Object(logical)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::ToolDescriptor;
    use serde_json::json;

    fn table(names: &[&str]) -> CapabilityTable {
        CapabilityTable::from_tools(
            names
                .iter()
                .map(|n| ToolDescriptor {
                    name: n.to_string(),
                    description: String::new(),
                    input_schema: json!({}),
                })
                .collect(),
        )
    }

    fn logical(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_alias_order_wins_over_table_order() {
        let resolver = Resolver::default();
        let t = table(&["search", "semantic_search"]);
        for _ in 0..10 {
            assert_eq!(
                resolver
                    .resolve_tool(OperationIntent::SemanticSearch, &t)
                    .unwrap(),
                "semantic_search"
            );
        }
    }

    #[test]
    fn test_resolve_each_intent() {
        let resolver = Resolver::default();
        let t = table(&[
            "create_research_repository",
            "search_research_repository",
            "grep",
            "access_file",
        ]);
        assert_eq!(
            resolver.resolve_tool(OperationIntent::Index, &t).unwrap(),
            "create_research_repository"
        );
        assert_eq!(
            resolver.resolve_tool(OperationIntent::CodeSearch, &t).unwrap(),
            "grep"
        );
        assert_eq!(
            resolver.resolve_tool(OperationIntent::ReadFile, &t).unwrap(),
            "access_file"
        );
        assert_eq!(
            resolver
                .resolve_tool(OperationIntent::GetStructure, &t)
                .unwrap(),
            "access_file"
        );
    }

    #[test]
    fn test_no_alias_present_lists_tried() {
        let resolver = Resolver::default();
        let err = resolver
            .resolve_tool(OperationIntent::Index, &table(&["search"]))
            .unwrap_err();
        match err {
            McpError::ToolNotAvailable { intent, tried } => {
                assert_eq!(intent, OperationIntent::Index);
                assert_eq!(tried.first().map(String::as_str), Some("index_repository"));
                assert!(tried.contains(&"clone_and_index".to_string()));
            }
            other => panic!("expected ToolNotAvailable, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_table_resolves_nothing() {
        let resolver = Resolver::default();
        for intent in OperationIntent::ALL {
            assert!(resolver
                .resolve_tool(intent, &CapabilityTable::empty())
                .is_err());
        }
    }

    #[test]
    fn test_index_override_renames_repository() {
        let args = Resolver::default().build_arguments(
            "create_research_repository",
            OperationIntent::Index,
            logical(json!({"repository": "org/repo"})),
        );
        assert_eq!(args, json!({"repository_path": "org/repo"}));
    }

    #[test]
    fn test_search_override_renames_repository_and_limit() {
        let args = Resolver::default().build_arguments(
            "search_research_repository",
            OperationIntent::SemanticSearch,
            logical(json!({"repository": "org/repo", "query": "auth", "max_results": 5})),
        );
        assert_eq!(
            args,
            json!({"index_path": "org/repo", "query": "auth", "limit": 5})
        );
    }

    #[test]
    fn test_access_file_builds_filepath() {
        let resolver = Resolver::default();
        let args = resolver.build_arguments(
            "access_file",
            OperationIntent::ReadFile,
            logical(json!({"repository": "org/repo.git", "file_path": "/src/main.rs"})),
        );
        assert_eq!(args, json!({"filepath": "repo/repository/src/main.rs"}));

        let args = resolver.build_arguments(
            "access_file",
            OperationIntent::GetStructure,
            logical(json!({"repository": "https://github.com/org/repo"})),
        );
        assert_eq!(args, json!({"filepath": "repo/repository"}));
    }

    #[test]
    fn test_unknown_tool_passes_arguments_through() {
        let input = json!({"repository": "org/repo", "pattern": "fn main", "file_type": "rs"});
        let args = Resolver::default().build_arguments(
            "grep",
            OperationIntent::CodeSearch,
            logical(input.clone()),
        );
        assert_eq!(args, input);
    }

    #[test]
    fn test_custom_override_is_data() {
        let resolver = Resolver::default().with_override(
            "repo_search",
            ToolOverride::new(vec![ParamRule::rename("repository", "repo")]),
        );
        let args = resolver.build_arguments(
            "repo_search",
            OperationIntent::SemanticSearch,
            logical(json!({"repository": "org/repo", "query": "q"})),
        );
        assert_eq!(args, json!({"repo": "org/repo", "query": "q"}));
    }

    #[test]
    fn test_configured_aliases_take_precedence() {
        let resolver = Resolver::default().with_aliases(
            OperationIntent::SemanticSearch,
            vec!["search".to_string(), "ask_repo".to_string()],
        );
        let aliases = resolver.aliases(OperationIntent::SemanticSearch);
        assert_eq!(aliases[0], "search");
        assert_eq!(aliases[1], "ask_repo");
        assert_eq!(aliases.iter().filter(|a| *a == "search").count(), 1);
        assert_eq!(
            resolver
                .resolve_tool(
                    OperationIntent::SemanticSearch,
                    &table(&["semantic_search", "search"])
                )
                .unwrap(),
            "search"
        );
    }

    #[test]
    fn test_param_rule_deserializes_from_yaml() {
        let yaml = r#"
rules:
  - kind: rename
    from: repository
    to: repo_url
  - kind: repository_path
    to: path
    join: file_path
"#;
        let parsed: ToolOverride = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.rules.len(), 2);
        assert_eq!(parsed.rules[0], ParamRule::rename("repository", "repo_url"));
    }

    #[test]
    fn test_repo_short_name() {
        assert_eq!(repo_short_name("org/repo"), "repo");
        assert_eq!(repo_short_name("https://github.com/org/repo.git"), "repo");
        assert_eq!(repo_short_name("org/repo/"), "repo");
        assert_eq!(repo_short_name("repo"), "repo");
    }
}
