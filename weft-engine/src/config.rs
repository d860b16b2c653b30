//! Engine configuration
//!
//! Loaded from `weft.toml` and overlaid with environment switches:
//! - `WEFT_AUDIT_REQUIRED`: every mutating flow/page must be `audited`
//! - `WEFT_FOREIGN_STRICT`: strict determinism, foreign tools blocked
//! - `WEFT_FOREIGN_ALLOW`: allow foreign tools even in strict mode

use crate::tools::bindings::{PackTool, ToolBinding};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILENAME: &str = "weft.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config {path}: {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub audit_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignPolicyMode {
    Default,
    Strict,
}

impl ForeignPolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForeignPolicyMode::Default => "default",
            ForeignPolicyMode::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForeignConfig {
    pub strict: bool,
    pub allow: bool,
}

impl ForeignConfig {
    pub fn mode(&self) -> ForeignPolicyMode {
        if self.strict {
            ForeignPolicyMode::Strict
        } else {
            ForeignPolicyMode::Default
        }
    }

    /// Foreign calls run unless strict mode is on without an explicit allow.
    pub fn allows_foreign(&self) -> bool {
        !self.strict || self.allow
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub themes: Vec<String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            themes: vec!["dark".to_string(), "light".to_string(), "system".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Project bindings: tool name -> runner entry.
    pub bindings: IndexMap<String, ToolBinding>,
    /// Tools provided by capability packs.
    pub packs: Vec<PackTool>,
    /// Tool name -> pinned pack id.
    pub pinned: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub project_root: Option<PathBuf>,
    pub policy: PolicyConfig,
    pub foreign: ForeignConfig,
    pub ui: UiConfig,
    pub tools: ToolsConfig,
    /// Named secrets; their values are redacted from audit entries.
    pub secrets: IndexMap<String, String>,
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Load `weft.toml` from `dir`. A missing file yields the defaults with
    /// `project_root` set to `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILENAME);
        let mut config = if path.exists() {
            let source = std::fs::read_to_string(&path)?;
            toml::from_str::<EngineConfig>(&source).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            log::debug!("No {} in {}, using defaults", CONFIG_FILENAME, dir.display());
            EngineConfig::default()
        };
        if config.project_root.is_none() {
            config.project_root = Some(dir.to_path_buf());
        }
        Ok(config)
    }

    /// Apply environment switches from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply environment switches from an arbitrary lookup.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEFT_AUDIT_REQUIRED") {
            self.policy.audit_required = is_truthy(&v);
        }
        if let Some(v) = lookup("WEFT_FOREIGN_STRICT") {
            self.foreign.strict = is_truthy(&v);
        }
        if let Some(v) = lookup("WEFT_FOREIGN_ALLOW") {
            self.foreign.allow = is_truthy(&v);
        }
        self
    }

    pub fn secret_values(&self) -> Vec<String> {
        self.secrets
            .values()
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }
}

pub fn is_truthy(raw: &str) -> bool {
    let v = raw.trim().to_lowercase();
    v == "1" || v == "true" || v == "yes" || v == "on"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let config = EngineConfig::from_toml_str(
            r#"
[policy]
audit_required = true

[foreign]
strict = true

[ui]
themes = ["dark", "light"]

[tools.bindings."fetch page"]
kind = "python"
entry = "tools.fetch_page:run"

[[tools.packs]]
pack_id = "web.basic"
tool = "summarize"
verified = true
enabled = true
binding = { kind = "python", entry = "packs.web:summarize" }

[tools.pinned]
summarize = "web.basic"

[secrets]
stripe = "sk_live_123"
"#,
        )
        .unwrap();
        assert!(config.policy.audit_required);
        assert_eq!(config.foreign.mode(), ForeignPolicyMode::Strict);
        assert!(!config.foreign.allows_foreign());
        assert_eq!(config.ui.themes, vec!["dark", "light"]);
        assert_eq!(
            config.tools.bindings["fetch page"].entry,
            "tools.fetch_page:run"
        );
        assert_eq!(config.tools.packs.len(), 1);
        assert_eq!(config.tools.pinned["summarize"], "web.basic");
        assert_eq!(config.secret_values(), vec!["sk_live_123"]);
    }

    #[test]
    fn test_env_overlay() {
        let config = EngineConfig::default().with_env_lookup(|key| match key {
            "WEFT_AUDIT_REQUIRED" => Some("YES".to_string()),
            "WEFT_FOREIGN_STRICT" => Some("1".to_string()),
            "WEFT_FOREIGN_ALLOW" => Some("on".to_string()),
            _ => None,
        });
        assert!(config.policy.audit_required);
        assert!(config.foreign.strict);
        assert!(config.foreign.allows_foreign());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.project_root.as_deref(), Some(dir.path()));
        assert!(!config.policy.audit_required);
        assert_eq!(config.ui.themes.len(), 3);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILENAME), "[policy\naudit_required = ").unwrap();
        assert!(matches!(
            EngineConfig::load_from_dir(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
