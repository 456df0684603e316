use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ToolsConfig;
use crate::error::{Error, Result};

pub mod descriptor;
pub mod nmap;
pub mod schema;
pub mod template;

pub use descriptor::{DeclarativeTool, ToolDescriptor};
pub use nmap::NmapTool;
pub use schema::{
    Arguments, FieldViolation, OutputKind, Param, ParamKind, ToolSchema, ViolationKind,
};
pub use template::{Invocation, TemplatePart};

lazy_static! {
    static ref TOOL_NAME: Regex = Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap();
}

/// Descriptors shipped with the binary
const BUILTIN_DESCRIPTORS: &[(&str, &str)] = &[
    ("gobuster", include_str!("builtin/gobuster.json")),
    ("whois", include_str!("builtin/whois.json")),
    ("nslookup", include_str!("builtin/nslookup.json")),
    ("dig", include_str!("builtin/dig.json")),
    ("whatweb", include_str!("builtin/whatweb.json")),
    ("sublist3r", include_str!("builtin/sublist3r.json")),
];

/// Interpreted tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ToolOutput {
    Text(String),
    Structured(serde_json::Value),
}

/// Capability contract shared by declarative and custom tools
pub trait ToolBinding: Send + Sync {
    fn schema(&self) -> &ToolSchema;

    fn name(&self) -> &str {
        &self.schema().name
    }

    /// Checks spanning several parameters, run after per-field validation
    fn cross_check(&self, _args: &Arguments) -> Vec<FieldViolation> {
        Vec::new()
    }

    /// Map validated arguments to an executable invocation
    fn build_command(&self, args: &Arguments) -> std::result::Result<Invocation, String>;

    /// Interpret raw stdout of a finished run
    fn parse_output(&self, raw: &str) -> ToolOutput;
}

pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME.is_match(name)
}

/// Process-wide set of available tools. Populated at startup, read-only after.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn ToolBinding>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: vec![] }
    }

    /// Registry with the packaged descriptors and custom bindings
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(NmapTool::new()))?;
        for (name, json) in BUILTIN_DESCRIPTORS {
            let tool = DeclarativeTool::from_json(json).map_err(|e| match e {
                Error::InvalidDescriptor { reason, .. } => Error::InvalidDescriptor {
                    name: name.to_string(),
                    reason,
                },
                other => other,
            })?;
            registry.register(Arc::new(tool))?;
        }
        Ok(registry)
    }

    /// Build the registry described by configuration. Malformed descriptor
    /// files are rejected and logged; they never reach invocation time.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let mut registry = if config.include_builtin {
            Self::with_builtins()?
        } else {
            Self::new()
        };

        for dir in &config.descriptor_dirs {
            let rejected = registry.load_descriptor_dir(dir)?;
            for (path, err) in rejected {
                tracing::warn!("Rejected tool descriptor {}: {}", path.display(), err);
            }
        }

        tracing::debug!("Tool registry populated with {} tools", registry.len());
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn ToolBinding>) -> Result<()> {
        let name = tool.name().to_string();
        if !is_valid_tool_name(&name) {
            return Err(Error::InvalidDescriptor {
                name,
                reason: "tool names must be lowercase alphanumerics, '-' or '_'".to_string(),
            });
        }
        if self.tools.iter().any(|t| t.name() == name) {
            return Err(Error::DuplicateTool(name));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn register_descriptor(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        let tool = DeclarativeTool::from_descriptor(descriptor)?;
        self.register(Arc::new(tool))
    }

    /// Load every `*.json` descriptor in `dir` (sorted by file name).
    /// Returns the files that were rejected together with the reason.
    pub fn load_descriptor_dir(&mut self, dir: &Path) -> Result<Vec<(PathBuf, Error)>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut rejected = Vec::new();
        for path in paths {
            let outcome = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|json| DeclarativeTool::from_json(&json))
                .and_then(|tool| self.register(Arc::new(tool)));
            if let Err(e) = outcome {
                rejected.push((path, e));
            }
        }
        Ok(rejected)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ToolBinding>> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(name.to_string()))
    }

    /// Validate arguments against a tool's schema, listing every violation
    pub fn validate(&self, name: &str, args: &Arguments) -> Result<()> {
        let tool = self.lookup(name)?;
        let mut violations = match tool.schema().validate(args) {
            Ok(()) => Vec::new(),
            Err(v) => v,
        };
        violations.extend(tool.cross_check(args));

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::SchemaViolation {
                tool: name.to_string(),
                violations,
            })
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get_tools_schema(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.schema().description,
                    "input_schema": tool.schema().to_json_schema()
                })
            })
            .collect()
    }

    /// Plain-text tool documentation for embedding in a planning prompt
    pub fn render_documentation(&self) -> String {
        let mut out = String::new();
        for tool in &self.tools {
            let schema = tool.schema();
            out.push_str(&format!("{}: {}\n", schema.name, schema.description));
            if !schema.args_description.is_empty() {
                out.push_str(&format!("  {}\n", schema.args_description));
            }
            for param in &schema.params {
                out.push_str(&format!(
                    "  - {} ({}{}): {}\n",
                    param.name,
                    param.kind.rule(),
                    if param.required { ", required" } else { "" },
                    param.description
                ));
            }
        }
        out
    }
}
