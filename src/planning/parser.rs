//! Action parser
//!
//! Turns raw model output into validated [`Action`]s. Two proposal forms are
//! recognised:
//!
//! 1. JSON, either in ```json fenced blocks or as bare top-level JSON: an
//!    object or array of objects shaped
//!    `{"tool": "nmap", "args": {"target": "10.0.0.5"}, "thought": "...", "timeout": 120}`
//! 2. Line form: `ACTION: nmap target=10.0.0.5 ports="22,80"`
//!
//! Parsing is total. A bad proposal becomes a [`ParseWarning`] and the rest
//! of the text is still parsed. Values are never guessed or corrected.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error;
use crate::tools::schema::{Arguments, FieldViolation};
use crate::tools::ToolRegistry;
use crate::utils::truncate_str;

use super::types::Action;

const ACTION_PREFIX: &str = "ACTION:";
const EXCERPT_CHARS: usize = 200;
const PROPOSAL_KEYS: &[&str] = &["tool", "args", "arguments", "thought", "timeout"];

/// Why a proposal was not turned into an action
#[derive(Debug, Clone, PartialEq)]
pub enum WarningKind {
    Malformed(String),
    UnknownTool(String),
    SchemaViolation {
        tool: String,
        violations: Vec<FieldViolation>,
    },
    /// Recognised shape that is deliberately not executed
    UnsupportedFormat(String),
    DuplicateArgument(String),
}

/// A proposal that was dropped, with enough context for the model to fix it
#[derive(Debug, Clone, PartialEq)]
pub struct ParseWarning {
    /// 1-based index of the proposal in the text
    pub item: usize,
    /// 1-based line where the proposal (or its block) starts
    pub line: Option<usize>,
    pub excerpt: String,
    pub kind: WarningKind,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proposal #{}", self.item)?;
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        match &self.kind {
            WarningKind::Malformed(reason) => write!(f, ": malformed: {}", reason),
            WarningKind::UnknownTool(name) => write!(f, ": unknown tool '{}'", name),
            WarningKind::SchemaViolation { tool, violations } => write!(
                f,
                ": invalid arguments for '{}': {}",
                tool,
                violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
            WarningKind::UnsupportedFormat(reason) => write!(f, ": unsupported: {}", reason),
            WarningKind::DuplicateArgument(key) => {
                write!(f, ": argument '{}' given more than once", key)
            }
        }
    }
}

/// Result of parsing one model completion
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub actions: Vec<Action>,
    pub warnings: Vec<ParseWarning>,
}

impl ParseOutcome {
    /// Warnings rendered one per line, for feeding back to the model
    pub fn render_warnings(&self) -> String {
        self.warnings
            .iter()
            .map(|w| format!("- {}", w))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Converts model output into validated actions
pub struct ActionParser<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> ActionParser<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn parse(&self, text: &str) -> ParseOutcome {
        let mut state = ParseState::default();
        let mut found_explicit = false;

        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim();

            if let Some(lang) = trimmed.strip_prefix("```") {
                let lang = lang.trim().to_ascii_lowercase();
                // `start` is the first body line (0-based), i.e. the fence's 1-based line
                let start = i + 1;
                let mut end = start;
                while end < lines.len() && !lines[end].trim().starts_with("```") {
                    end += 1;
                }
                let terminated = end < lines.len();
                let body = lines[start..end].join("\n");
                let body_trimmed = body.trim();
                let looks_json = body_trimmed.starts_with('[') || body_trimmed.starts_with('{');

                if lang == "json" || (lang.is_empty() && looks_json) {
                    found_explicit = true;
                    match serde_json::from_str::<Value>(body_trimmed) {
                        Ok(value) => self.parse_json_value(value, Some(start), &mut state),
                        Err(e) => {
                            let reason = if terminated {
                                format!("invalid JSON: {}", e)
                            } else {
                                format!("unterminated code block, invalid JSON: {}", e)
                            };
                            state.warn(Some(start), body_trimmed, WarningKind::Malformed(reason));
                        }
                    }
                    i = end + 1;
                    continue;
                }
                // Other fences are scanned line by line for ACTION lines
                i += 1;
                continue;
            }

            if let Some(rest) = strip_action_prefix(trimmed) {
                found_explicit = true;
                self.parse_action_line(rest, trimmed, i + 1, &mut state);
            }
            i += 1;
        }

        if !found_explicit {
            self.parse_bare_json(text, &mut state);
        }

        ParseOutcome {
            actions: state.actions,
            warnings: state.warnings,
        }
    }

    /// Whole-text JSON, or the outermost JSON array/object embedded in prose
    fn parse_bare_json(&self, text: &str, state: &mut ParseState) {
        let trimmed = text.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => self.parse_json_value(value, None, state),
                Err(e) => state.warn(
                    None,
                    trimmed,
                    WarningKind::Malformed(format!("invalid JSON: {}", e)),
                ),
            }
            return;
        }

        for (open, close) in [('[', ']'), ('{', '}')] {
            let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) else {
                continue;
            };
            if start >= end {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if looks_like_proposal(&value) {
                    self.parse_json_value(value, None, state);
                    return;
                }
            }
        }
    }

    fn parse_json_value(&self, value: Value, line: Option<usize>, state: &mut ParseState) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.parse_json_item(item, line, state);
                }
            }
            other => self.parse_json_item(other, line, state),
        }
    }

    fn parse_json_item(&self, item: Value, line: Option<usize>, state: &mut ParseState) {
        let excerpt = item.to_string();
        let Value::Object(obj) = item else {
            state.warn(
                line,
                &excerpt,
                WarningKind::Malformed("expected an object with 'tool' and 'args'".to_string()),
            );
            return;
        };

        match Self::read_proposal(&obj) {
            Ok(proposal) => self.finish(proposal, line, &excerpt, state),
            Err(kind) => state.warn(line, &excerpt, kind),
        }
    }

    fn read_proposal(obj: &Map<String, Value>) -> Result<Proposal, WarningKind> {
        let tool = match obj.get("tool") {
            Some(Value::String(tool)) => tool.clone(),
            Some(_) => return Err(WarningKind::Malformed("'tool' must be a string".to_string())),
            None if obj.contains_key("command") => {
                return Err(WarningKind::UnsupportedFormat(
                    "free-form shell commands are not executed; propose {\"tool\": ..., \"args\": {...}}"
                        .to_string(),
                ))
            }
            None => return Err(WarningKind::Malformed("missing 'tool'".to_string())),
        };

        if let Some(key) = obj.keys().find(|k| !PROPOSAL_KEYS.contains(&k.as_str())) {
            return Err(WarningKind::Malformed(format!(
                "unexpected field '{}'; tool arguments belong in 'args'",
                key
            )));
        }

        let args = match (obj.get("args"), obj.get("arguments")) {
            (Some(_), Some(_)) => {
                return Err(WarningKind::Malformed(
                    "both 'args' and 'arguments' given".to_string(),
                ))
            }
            (Some(Value::Object(map)), None) | (None, Some(Value::Object(map))) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Arguments>(),
            (None, None) => Arguments::new(),
            _ => return Err(WarningKind::Malformed("'args' must be an object".to_string())),
        };

        let thought = match obj.get("thought") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(WarningKind::Malformed("'thought' must be a string".to_string())),
        };

        let timeout_secs = match obj.get("timeout") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(secs) if secs > 0 => Some(secs),
                _ => {
                    return Err(WarningKind::Malformed(
                        "'timeout' must be a positive integer number of seconds".to_string(),
                    ))
                }
            },
        };

        Ok(Proposal {
            tool,
            args,
            thought,
            timeout_secs,
        })
    }

    fn parse_action_line(&self, rest: &str, raw: &str, line: usize, state: &mut ParseState) {
        let tokens = match split_tokens(rest) {
            Ok(tokens) => tokens,
            Err(reason) => {
                state.warn(Some(line), raw, WarningKind::Malformed(reason));
                return;
            }
        };

        let mut iter = tokens.into_iter();
        let Some(tool) = iter.next() else {
            state.warn(
                Some(line),
                raw,
                WarningKind::Malformed("missing tool name".to_string()),
            );
            return;
        };

        let mut args: BTreeMap<String, Value> = BTreeMap::new();
        for token in iter {
            let Some((key, value)) = token.split_once('=') else {
                state.warn(
                    Some(line),
                    raw,
                    WarningKind::Malformed(format!("expected key=value, found '{}'", token)),
                );
                return;
            };
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                state.warn(
                    Some(line),
                    raw,
                    WarningKind::Malformed(format!("invalid argument name '{}'", key)),
                );
                return;
            }
            if args.contains_key(key) {
                state.warn(Some(line), raw, WarningKind::DuplicateArgument(key.to_string()));
                return;
            }
            args.insert(key.to_string(), Value::String(value.to_string()));
        }

        let proposal = Proposal {
            tool,
            args,
            thought: None,
            timeout_secs: None,
        };
        self.finish(proposal, Some(line), raw, state);
    }

    /// Validate against the registry and either keep the action or warn
    fn finish(&self, proposal: Proposal, line: Option<usize>, excerpt: &str, state: &mut ParseState) {
        match self.registry.validate(&proposal.tool, &proposal.args) {
            Ok(()) => {
                let mut action = Action::new(proposal.tool, proposal.args);
                action.thought = proposal.thought;
                action.timeout_secs = proposal.timeout_secs;
                state.item += 1;
                state.actions.push(action);
            }
            Err(Error::UnknownTool(name)) => {
                state.warn(line, excerpt, WarningKind::UnknownTool(name));
            }
            Err(Error::SchemaViolation { tool, violations }) => {
                state.warn(line, excerpt, WarningKind::SchemaViolation { tool, violations });
            }
            Err(other) => {
                state.warn(line, excerpt, WarningKind::Malformed(other.to_string()));
            }
        }
    }
}

struct Proposal {
    tool: String,
    args: Arguments,
    thought: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Default)]
struct ParseState {
    /// Proposals seen so far, kept or not
    item: usize,
    actions: Vec<Action>,
    warnings: Vec<ParseWarning>,
}

impl ParseState {
    fn warn(&mut self, line: Option<usize>, excerpt: &str, kind: WarningKind) {
        self.item += 1;
        tracing::debug!("Dropping proposal #{}: {:?}", self.item, kind);
        self.warnings.push(ParseWarning {
            item: self.item,
            line,
            excerpt: truncate_str(excerpt, EXCERPT_CHARS).to_string(),
            kind,
        });
    }
}

fn strip_action_prefix(line: &str) -> Option<&str> {
    let head = line.get(..ACTION_PREFIX.len())?;
    if head.eq_ignore_ascii_case(ACTION_PREFIX) {
        Some(line[ACTION_PREFIX.len()..].trim())
    } else {
        None
    }
}

fn looks_like_proposal(value: &Value) -> bool {
    let is_proposal = |v: &Value| {
        v.as_object()
            .map(|o| o.contains_key("tool") || o.contains_key("command"))
            .unwrap_or(false)
    };
    match value {
        Value::Array(items) => !items.is_empty() && items.iter().any(is_proposal),
        other => is_proposal(other),
    }
}

/// Split on whitespace, honouring single and double quotes. Backslash
/// escapes the next character inside double quotes.
fn split_tokens(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => match chars.next() {
                Some(next) => current.push(next),
                None => return Err("trailing backslash".to_string()),
            },
            Some(_) => current.push(c),
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        ToolRegistry::with_builtins().unwrap()
    }

    #[test]
    fn test_fenced_json_array() {
        let registry = registry();
        let text = r#"Here is the plan:

```json
[
  {"tool": "nmap", "args": {"target": "10.0.0.5"}, "thought": "find open ports"},
  {"tool": "gobuster", "args": {"url": "http://10.0.0.5"}, "timeout": 600}
]
```
Let me know."#;

        let outcome = ActionParser::new(&registry).parse(text);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.actions[0].tool, "nmap");
        assert_eq!(outcome.actions[0].thought.as_deref(), Some("find open ports"));
        assert_eq!(outcome.actions[1].timeout_secs, Some(600));
    }

    #[test]
    fn test_action_lines() {
        let registry = registry();
        let text = "First scan, then enumerate.\n\
                    ACTION: nmap target=10.0.0.5 ports=\"22,80\" service_detection=true\n\
                    ACTION: gobuster url=http://10.0.0.5 threads=20\n";
        let outcome = ActionParser::new(&registry).parse(text);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.actions[0].args.get("ports"), Some(&json!("22,80")));
    }

    #[test]
    fn test_one_bad_apple_does_not_spoil_the_rest() {
        let registry = registry();
        let text = "ACTION: nmap target=10.0.0.5\n\
                    ACTION: hydra target=10.0.0.5\n\
                    ACTION: gobuster\n\
                    ACTION: whois domain=\"unterminated\n\
                    ACTION: whois domain=example.com domain=example.org\n\
                    ACTION: whois domain=example.com\n";
        let outcome = ActionParser::new(&registry).parse(text);

        let tools: Vec<&str> = outcome.actions.iter().map(|a| a.tool.as_str()).collect();
        assert_eq!(tools, vec!["nmap", "whois"]);
        assert_eq!(outcome.warnings.len(), 4);
        assert!(matches!(&outcome.warnings[0].kind, WarningKind::UnknownTool(t) if t == "hydra"));
        assert!(matches!(&outcome.warnings[1].kind, WarningKind::SchemaViolation { .. }));
        assert!(matches!(&outcome.warnings[2].kind, WarningKind::Malformed(_)));
        assert!(matches!(&outcome.warnings[3].kind, WarningKind::DuplicateArgument(k) if k == "domain"));
        assert_eq!(outcome.warnings[0].item, 2);
        assert_eq!(outcome.warnings[0].line, Some(2));
    }

    #[test]
    fn test_bare_json_from_plan_conversion() {
        let registry = registry();
        let text = r#"[{"thought": "get registration", "command": "whois example.com"},
                       {"thought": "get registration", "tool": "whois", "args": {"domain": "example.com"}}]"#;
        let outcome = ActionParser::new(&registry).parse(text);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(matches!(outcome.warnings[0].kind, WarningKind::UnsupportedFormat(_)));
    }

    #[test]
    fn test_json_embedded_in_prose() {
        let registry = registry();
        let text = r#"Sure! I will run [{"tool": "dig", "args": {"domain": "example.com"}}] now."#;
        let outcome = ActionParser::new(&registry).parse(text);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].tool, "dig");
    }

    #[test]
    fn test_args_at_top_level_are_not_guessed() {
        let registry = registry();
        let text = r#"{"tool": "nmap", "target": "10.0.0.5"}"#;
        let outcome = ActionParser::new(&registry).parse(text);
        assert!(outcome.actions.is_empty());
        assert!(matches!(&outcome.warnings[0].kind, WarningKind::Malformed(m) if m.contains("target")));
    }

    #[test]
    fn test_broken_fenced_json_warns() {
        let registry = registry();
        let text = "```json\n[{\"tool\": \"nmap\", \"args\": {\"target\": \"10.0.0.5\"}\n```\nACTION: whois domain=example.com";
        let outcome = ActionParser::new(&registry).parse(text);
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].line, Some(1));
    }

    #[test]
    fn test_parsing_is_total() {
        let registry = registry();
        let parser = ActionParser::new(&registry);
        for text in [
            "",
            "no proposals at all",
            "```",
            "```json",
            "ACTION:",
            "action: \"",
            "[",
            "{}",
            "[1, 2, 3]",
            "]{[",
            "ACTION: nmap target=",
            "ACTION: nmap =x",
            "```json\nnull\n```",
            "ä ö ü ```json\n[{\"tool\": 5}]",
        ] {
            let outcome = parser.parse(text);
            assert!(outcome.actions.is_empty(), "input {:?}", text);
        }
    }

    #[test]
    fn test_warning_rendering() {
        let registry = registry();
        let outcome = ActionParser::new(&registry).parse("ACTION: nmap ports=99999");
        let rendered = outcome.render_warnings();
        assert!(rendered.contains("proposal #1 (line 1)"));
        assert!(rendered.contains("target: required parameter missing"));
        assert!(rendered.contains("ports:"));
    }

    #[test]
    fn test_split_tokens() {
        assert_eq!(
            split_tokens(r#"a b="c d" e='f g' h="i\"j""#).unwrap(),
            vec!["a", "b=c d", "e=f g", "h=i\"j"]
        );
        assert!(split_tokens("a \"b").is_err());
    }
}
