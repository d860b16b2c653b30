//! Binding resolution for scripted tools.
//!
//! A python/node tool needs an entry point before it can run. Sources, in
//! priority order: an enabled and verified capability pack, a project binding
//! from `weft.toml`, then a conventional `tools/<slug>.<ext>` file under the
//! project root. Every failure carries a `tool_reason` detail that the gateway
//! turns into the decision reason.

use crate::config::ToolsConfig;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use weft::ir::{Span, ToolKind};
use weft::runtime::error_reporting::build_guidance_message;
use weft::RuntimeError;

lazy_static! {
    static ref SLUG_RE: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

pub const REASON_DETAIL: &str = "tool_reason";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolBinding {
    pub kind: ToolKind,
    pub entry: String,
    #[serde(default)]
    pub runner: Option<String>,
}

impl ToolBinding {
    pub fn new(kind: ToolKind, entry: impl Into<String>) -> Self {
        Self {
            kind,
            entry: entry.into(),
            runner: None,
        }
    }

    /// Runner name, defaulting per kind.
    pub fn runner_name(&self) -> &str {
        match (&self.runner, self.kind) {
            (Some(name), _) => name.as_str(),
            (None, ToolKind::Node) => "node",
            (None, _) => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackTool {
    pub pack_id: String,
    pub tool: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub verified: bool,
    pub binding: ToolBinding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSource {
    Pack(String),
    Project,
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinding {
    pub binding: ToolBinding,
    pub source: BindingSource,
}

pub fn slugify_tool_name(name: &str) -> String {
    SLUG_RE
        .replace_all(&name.trim().to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}

fn binding_failure(reason: &str, message: String, span: Span) -> RuntimeError {
    RuntimeError::domain(message)
        .at(span)
        .with_detail(REASON_DETAIL, reason)
}

pub fn resolve_tool_binding(
    tools: &ToolsConfig,
    project_root: Option<&Path>,
    tool_name: &str,
    kind: ToolKind,
    span: Span,
) -> Result<ResolvedBinding, RuntimeError> {
    let candidates: Vec<&PackTool> = tools.packs.iter().filter(|p| p.tool == tool_name).collect();
    let pinned = tools.pinned.get(tool_name);

    let candidates = match pinned {
        Some(pack_id) => {
            let chosen: Vec<&PackTool> = candidates
                .iter()
                .copied()
                .filter(|p| &p.pack_id == pack_id)
                .collect();
            if chosen.is_empty() && !candidates.is_empty() {
                return Err(binding_failure(
                    "pack_pin_missing",
                    build_guidance_message(
                        &format!("Tool \"{}\" is pinned to pack \"{}\", which does not provide it.", tool_name, pack_id),
                        "Pinned packs must be installed and export the tool.",
                        "Install the pinned pack or update the pin.",
                        &format!("[tools.pinned]\n\"{}\" = \"{}\"", tool_name, candidates[0].pack_id),
                    ),
                    span,
                ));
            }
            chosen
        }
        None if candidates.len() > 1 => {
            let ids: Vec<&str> = candidates.iter().map(|p| p.pack_id.as_str()).collect();
            return Err(binding_failure(
                "pack_collision",
                build_guidance_message(
                    &format!("Tool \"{}\" is provided by several packs: {}.", tool_name, ids.join(", ")),
                    "Only one pack may provide a tool unless it is pinned.",
                    "Pin the tool to one pack.",
                    &format!("[tools.pinned]\n\"{}\" = \"{}\"", tool_name, ids[0]),
                ),
                span,
            ));
        }
        None => candidates,
    };

    if let Some(active) = candidates.iter().find(|p| p.enabled && p.verified) {
        if tools.bindings.contains_key(tool_name) {
            return Err(binding_failure(
                "pack_collision",
                build_guidance_message(
                    &format!("Tool \"{}\" collides with a tool pack.", tool_name),
                    "Pack tools have priority and project bindings with the same name are ignored.",
                    "Rename the tool or disable the pack before binding.",
                    &format!("remove [tools.bindings.\"{}\"]", tool_name),
                ),
                span,
            ));
        }
        return Ok(ResolvedBinding {
            binding: active.binding.clone(),
            source: BindingSource::Pack(active.pack_id.clone()),
        });
    }
    if !candidates.is_empty() {
        let ids: Vec<&str> = candidates.iter().map(|p| p.pack_id.as_str()).collect();
        return Err(binding_failure(
            "pack_unavailable_or_unverified",
            build_guidance_message(
                &format!("Tool \"{}\" comes from a pack that is disabled or unverified: {}.", tool_name, ids.join(", ")),
                "Pack tools run only when the pack is enabled and verified.",
                "Verify and enable the pack.",
                &format!("enabled = true, verified = true for pack \"{}\"", ids[0]),
            ),
            span,
        ));
    }

    if let Some(binding) = tools.bindings.get(tool_name) {
        if binding.entry.trim().is_empty() || binding.kind != kind {
            return Err(binding_failure(
                "binding_error",
                build_guidance_message(
                    &format!("Tool \"{}\" has an invalid binding.", tool_name),
                    &format!("Bindings need a non-empty entry and kind \"{}\".", kind),
                    "Fix the binding in weft.toml.",
                    &bindings_example(tool_name, kind),
                ),
                span,
            ));
        }
        return Ok(ResolvedBinding {
            binding: binding.clone(),
            source: BindingSource::Project,
        });
    }

    if let Some(root) = project_root {
        if let Some(found) = local_tool_file(root, tool_name, kind) {
            let slug = slugify_tool_name(tool_name);
            let mut binding = ToolBinding::new(kind, format!("tools.{}:run", slug));
            if kind == ToolKind::Node {
                binding.runner = Some("node".to_string());
            }
            return Ok(ResolvedBinding {
                binding,
                source: BindingSource::Local(found),
            });
        }
    }

    Err(binding_failure(
        "missing_binding",
        build_guidance_message(
            &format!("Tool \"{}\" is not bound to a {} entry.", tool_name, kind),
            "Scripted tools need a binding that names their entry point.",
            &format!(
                "Add a binding for \"{}\" with entry \"tools.{}:run\".",
                tool_name,
                slugify_tool_name(tool_name)
            ),
            &bindings_example(tool_name, kind),
        ),
        span,
    ))
}

fn local_tool_file(root: &Path, tool_name: &str, kind: ToolKind) -> Option<PathBuf> {
    let slug = slugify_tool_name(tool_name);
    let tools_dir = root.join("tools");
    let candidates: Vec<PathBuf> = match kind {
        ToolKind::Python => vec![
            tools_dir.join(format!("{}.py", slug)),
            tools_dir.join(&slug).join("__init__.py"),
        ],
        ToolKind::Node => ["js", "cjs", "mjs"]
            .iter()
            .map(|ext| tools_dir.join(format!("{}.{}", slug, ext)))
            .collect(),
        _ => Vec::new(),
    };
    candidates.into_iter().find(|p| p.exists())
}

fn bindings_example(tool_name: &str, kind: ToolKind) -> String {
    format!(
        "[tools.bindings.\"{}\"]\nkind = \"{}\"\nentry = \"tools.{}:run\"",
        tool_name,
        kind,
        slugify_tool_name(tool_name)
    )
}
