//! Command-line templates for declarative tools
//!
//! A template is a list of parts rendered into an argv vector. Arguments are
//! substituted per token and never pass through a shell, so a value with
//! spaces or metacharacters stays a single argument.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::schema::{parse_bool, scalar_text, Arguments};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// One element of a command template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplatePart {
    /// A single token, possibly embedding `{param}` placeholders
    Literal(String),
    /// Tokens emitted together, only when every referenced parameter has a value
    Group(Vec<String>),
    /// Emitted when the boolean parameter `when` is true
    Flag { flag: String, when: String },
}

/// Rendered executable invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Display form, quoting arguments that contain whitespace
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| {
                if s.is_empty() || s.chars().any(char::is_whitespace) {
                    format!("'{}'", s.replace('\'', "'\\''"))
                } else {
                    s.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Placeholder names referenced by a token, in order
pub fn placeholders(token: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(token)
        .map(|c| c[1].to_string())
        .collect()
}

/// Names referenced anywhere in a template
pub fn referenced_params(parts: &[TemplatePart]) -> Vec<String> {
    let mut names = Vec::new();
    for part in parts {
        match part {
            TemplatePart::Literal(token) => names.extend(placeholders(token)),
            TemplatePart::Group(tokens) => {
                for token in tokens {
                    names.extend(placeholders(token));
                }
            }
            TemplatePart::Flag { when, .. } => names.push(when.clone()),
        }
    }
    names
}

/// Substitute every placeholder in `token`. Returns `Ok(None)` when a
/// referenced parameter has no value.
fn substitute(token: &str, args: &Arguments) -> Result<Option<String>, String> {
    let mut out = String::with_capacity(token.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(token) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&token[last..whole.start]);
        match args.get(&caps[1]) {
            Some(value) => out.push_str(&scalar_text(value).map_err(|e| format!("{}: {}", &caps[1], e))?),
            None => return Ok(None),
        }
        last = whole.end;
    }
    out.push_str(&token[last..]);
    Ok(Some(out))
}

/// Render a template against resolved arguments
pub fn render(parts: &[TemplatePart], args: &Arguments) -> Result<Invocation, String> {
    let mut tokens: Vec<String> = Vec::new();

    for part in parts {
        match part {
            TemplatePart::Literal(token) => {
                if let Some(rendered) = substitute(token, args)? {
                    tokens.push(rendered);
                }
            }
            TemplatePart::Group(group) => {
                let mut rendered = Vec::with_capacity(group.len());
                for token in group {
                    match substitute(token, args)? {
                        Some(t) => rendered.push(t),
                        None => {
                            rendered.clear();
                            break;
                        }
                    }
                }
                tokens.extend(rendered);
            }
            TemplatePart::Flag { flag, when } => {
                if let Some(value) = args.get(when) {
                    if parse_bool(value).map_err(|e| format!("{}: {}", when, e))? {
                        tokens.push(flag.clone());
                    }
                }
            }
        }
    }

    let mut iter = tokens.into_iter();
    let program = iter
        .next()
        .ok_or_else(|| "template rendered an empty command".to_string())?;
    Ok(Invocation {
        program,
        args: iter.collect(),
    })
}
