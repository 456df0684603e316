//! Declarative JSON tool descriptors
//!
//! Descriptors are untrusted input (they are often generated by a model from
//! a tool's man page), so everything is checked when the descriptor is
//! loaded: a descriptor that passes here can always render a command for
//! arguments that pass schema validation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

use super::schema::{Arguments, OutputKind, Param, ParamKind, ToolSchema};
use super::template::{self, placeholders, Invocation, TemplatePart};
use super::{is_valid_tool_name, ToolBinding, ToolOutput};

/// On-disk descriptor format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDescriptor {
    pub name: String,
    pub tool_description: String,
    #[serde(default)]
    pub args_description: String,
    pub command: Vec<TemplatePart>,
    #[serde(default)]
    pub parameters: Vec<Param>,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A tool run by plain argument substitution into a command template
#[derive(Debug, Clone)]
pub struct DeclarativeTool {
    schema: ToolSchema,
    command: Vec<TemplatePart>,
}

impl DeclarativeTool {
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptor: ToolDescriptor =
            serde_json::from_str(json).map_err(|e| Error::InvalidDescriptor {
                name: descriptor_name_hint(json),
                reason: e.to_string(),
            })?;
        Self::from_descriptor(descriptor)
    }

    pub fn from_descriptor(descriptor: ToolDescriptor) -> Result<Self> {
        let name = descriptor.name.clone();
        let invalid = |reason: String| Error::InvalidDescriptor {
            name: name.clone(),
            reason,
        };

        if !is_valid_tool_name(&descriptor.name) {
            return Err(invalid("invalid tool name".to_string()));
        }
        if descriptor.tool_description.trim().is_empty() {
            return Err(invalid("tool_description is empty".to_string()));
        }
        if descriptor.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be positive".to_string()));
        }

        match descriptor.command.first() {
            Some(TemplatePart::Literal(program))
                if !program.trim().is_empty() && placeholders(program).is_empty() => {}
            Some(_) => {
                return Err(invalid(
                    "command must start with a literal program name".to_string(),
                ))
            }
            None => return Err(invalid("command is empty".to_string())),
        }

        let mut schema = ToolSchema {
            name: descriptor.name.clone(),
            description: descriptor.tool_description.clone(),
            args_description: descriptor.args_description.clone(),
            params: descriptor.parameters.clone(),
            output: descriptor.output,
            timeout_secs: descriptor.timeout_secs,
        };
        schema.prepare().map_err(invalid)?;

        let referenced: HashSet<String> = template::referenced_params(&descriptor.command)
            .into_iter()
            .collect();

        for name in &referenced {
            if schema.param(name).is_none() {
                return Err(invalid(format!("template references unknown parameter '{}'", name)));
            }
        }
        for param in &schema.params {
            if !referenced.contains(&param.name) {
                return Err(invalid(format!(
                    "parameter '{}' is not used by the command template",
                    param.name
                )));
            }
        }
        for part in &descriptor.command {
            match part {
                TemplatePart::Flag { when, .. } => {
                    let is_bool = schema
                        .param(when)
                        .map(|p| p.kind == ParamKind::Boolean)
                        .unwrap_or(false);
                    if !is_bool {
                        return Err(invalid(format!(
                            "flag condition '{}' must be a boolean parameter",
                            when
                        )));
                    }
                }
                // A bare token can vanish on its own and strand the option before it
                TemplatePart::Literal(token) => {
                    for name in placeholders(token) {
                        let always_set = schema
                            .param(&name)
                            .map(|p| p.required || p.default.is_some())
                            .unwrap_or(false);
                        if !always_set {
                            return Err(invalid(format!(
                                "optional parameter '{}' has no default; put '{}' in a group",
                                name, token
                            )));
                        }
                    }
                }
                TemplatePart::Group(_) => {}
            }
        }

        Ok(Self {
            schema,
            command: descriptor.command,
        })
    }
}

impl ToolBinding for DeclarativeTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn build_command(&self, args: &Arguments) -> std::result::Result<Invocation, String> {
        template::render(&self.command, &self.schema.resolve(args))
    }

    fn parse_output(&self, raw: &str) -> ToolOutput {
        match self.schema.output {
            OutputKind::Json => serde_json::from_str(raw.trim())
                .map(ToolOutput::Structured)
                .unwrap_or_else(|_| ToolOutput::Text(raw.to_string())),
            OutputKind::Text => ToolOutput::Text(raw.to_string()),
        }
    }
}

/// Best-effort name for error messages about unparseable descriptors
fn descriptor_name_hint(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .ok()
        .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string))
        .unwrap_or_else(|| "<unnamed>".to_string())
}
