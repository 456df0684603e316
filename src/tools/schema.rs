//! Tool argument schemas and validation rules
//!
//! A [`ToolSchema`] is the machine-checkable contract of a registered tool:
//! the ordered parameter list, each with a kind that doubles as its
//! validation rule. Validation never stops at the first problem; every
//! offending field is reported so the model can correct all of them in one
//! round trip.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Argument mapping of an action: parameter name to value
pub type Arguments = BTreeMap<String, Value>;

lazy_static! {
    static ref HOSTNAME_LABEL: Regex =
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap();
}

/// How a tool's raw stdout should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Text,
    Json,
}

/// Type and validation rule of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    /// Free text; a leading '-' is rejected unless `allow_flags` is set
    String {
        #[serde(default)]
        allow_flags: bool,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Boolean,
    Ipv4,
    /// IPv4 or IPv6 network in address/prefix form
    Cidr,
    /// Hostname or IP address
    Host,
    /// IP address, CIDR network or hostname
    Target,
    /// Absolute http(s) URL
    Url,
    Port,
    /// Comma separated ports and ranges, e.g. `22,80,8000-8100`
    PortList,
    Choice {
        values: Vec<String>,
    },
    /// Whole-value match against a regular expression
    Pattern {
        regex: String,
    },
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String { .. } => "string",
            ParamKind::Integer { .. } => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Ipv4 => "ipv4",
            ParamKind::Cidr => "cidr",
            ParamKind::Host => "host",
            ParamKind::Target => "target",
            ParamKind::Url => "url",
            ParamKind::Port => "port",
            ParamKind::PortList => "port_list",
            ParamKind::Choice { .. } => "choice",
            ParamKind::Pattern { .. } => "pattern",
        }
    }

    /// Human readable rule, used in documentation and error messages
    pub fn rule(&self) -> String {
        match self {
            ParamKind::String { allow_flags: true } => "non-empty text".to_string(),
            ParamKind::String { allow_flags: false } => {
                "non-empty text not starting with '-'".to_string()
            }
            ParamKind::Integer { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("integer in {}..={}", lo, hi),
                (Some(lo), None) => format!("integer >= {}", lo),
                (None, Some(hi)) => format!("integer <= {}", hi),
                (None, None) => "integer".to_string(),
            },
            ParamKind::Boolean => "true or false".to_string(),
            ParamKind::Ipv4 => "valid IPv4 address".to_string(),
            ParamKind::Cidr => "valid CIDR network (address/prefix)".to_string(),
            ParamKind::Host => "hostname or IP address".to_string(),
            ParamKind::Target => "IP address, CIDR network or hostname".to_string(),
            ParamKind::Url => "absolute http(s) URL".to_string(),
            ParamKind::Port => "port number 1-65535".to_string(),
            ParamKind::PortList => "ports or ranges like 22,80,8000-8100".to_string(),
            ParamKind::Choice { values } => format!("one of: {}", values.join(", ")),
            ParamKind::Pattern { regex } => format!("matching /{}/", regex),
        }
    }

    /// Check a value against this rule. `compiled` is the anchored regex for
    /// `Pattern` parameters, prepared at registration time.
    fn check(&self, value: &Value, compiled: Option<&Regex>) -> Result<(), String> {
        let text = scalar_text(value)?;

        match self {
            ParamKind::String { allow_flags } => {
                if text.trim().is_empty() {
                    return Err("must not be empty".to_string());
                }
                if text.contains('\0') {
                    return Err("must not contain NUL bytes".to_string());
                }
                if !allow_flags && text.starts_with('-') {
                    return Err("must not start with '-'".to_string());
                }
                Ok(())
            }
            ParamKind::Integer { min, max } => {
                let n = parse_integer(value, &text)?;
                if let Some(lo) = min {
                    if n < *lo {
                        return Err(format!("must be >= {}", lo));
                    }
                }
                if let Some(hi) = max {
                    if n > *hi {
                        return Err(format!("must be <= {}", hi));
                    }
                }
                Ok(())
            }
            ParamKind::Boolean => parse_bool(value).map(|_| ()),
            ParamKind::Ipv4 => text
                .parse::<Ipv4Addr>()
                .map(|_| ())
                .map_err(|_| format!("'{}' is not a valid IPv4 address", text)),
            ParamKind::Cidr => check_cidr(&text),
            ParamKind::Host => check_host(&text),
            ParamKind::Target => {
                if text.contains('/') {
                    check_cidr(&text)
                } else {
                    check_host(&text)
                }
            }
            ParamKind::Url => check_url(&text),
            ParamKind::Port => {
                let n = parse_integer(value, &text)?;
                check_port(n)
            }
            ParamKind::PortList => check_port_list(&text),
            ParamKind::Choice { values } => {
                if values.iter().any(|v| v == &text) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of: {}", text, values.join(", ")))
                }
            }
            ParamKind::Pattern { regex } => {
                let matched = match compiled {
                    Some(re) => re.is_match(&text),
                    None => anchored(regex)
                        .map_err(|e| format!("invalid pattern: {}", e))?
                        .is_match(&text),
                };
                if matched {
                    Ok(())
                } else {
                    Err(format!("'{}' does not match /{}/", text, regex))
                }
            }
        }
    }
}

/// Keys every parameter object may carry, whatever its kind
const PARAM_KEYS: &[&str] = &["name", "kind", "required", "description", "default"];

/// One named, typed parameter of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Param {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Value substituted when an optional parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

/// Field layout of a parameter object, read once its keys are known to be valid
#[derive(Deserialize)]
struct ParamFields {
    name: String,
    #[serde(flatten)]
    kind: ParamKind,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    description: String,
    #[serde(default)]
    default: Option<Value>,
}

impl TryFrom<Value> for Param {
    type Error = String;

    /// `kind` is flattened, which rules out `deny_unknown_fields`, so the key
    /// set is checked here against the keys of the declared kind
    fn try_from(value: Value) -> Result<Self, String> {
        let Value::Object(map) = &value else {
            return Err("parameter must be an object".to_string());
        };
        let kind_keys: &[&str] = match map.get("kind").and_then(Value::as_str) {
            Some("string") => &["allow_flags"],
            Some("integer") => &["min", "max"],
            Some("choice") => &["values"],
            Some("pattern") => &["regex"],
            _ => &[],
        };
        if let Some(key) = map
            .keys()
            .find(|k| !PARAM_KEYS.contains(&k.as_str()) && !kind_keys.contains(&k.as_str()))
        {
            let name = map.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
            return Err(format!("unknown field '{}' in parameter '{}'", key, name));
        }

        let fields: ParamFields = serde_json::from_value(value).map_err(|e| e.to_string())?;
        Ok(Self {
            name: fields.name,
            kind: fields.kind,
            required: fields.required,
            description: fields.description,
            default: fields.default,
            compiled: None,
        })
    }
}

impl Param {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self::new(name, kind, true)
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self::new(name, kind, false)
    }

    fn new(name: impl Into<String>, kind: ParamKind, required: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            required,
            description: String::new(),
            default: None,
            compiled: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Compile the pattern (if any) and validate the default value.
    /// Called once when the owning tool is registered.
    pub fn prepare(&mut self) -> Result<(), String> {
        if let ParamKind::Pattern { regex } = &self.kind {
            let re = anchored(regex).map_err(|e| format!("invalid regex /{}/: {}", regex, e))?;
            self.compiled = Some(re);
        }
        if let ParamKind::Choice { values } = &self.kind {
            if values.is_empty() {
                return Err("choice parameter has no values".to_string());
            }
        }
        if let Some(default) = &self.default {
            if self.required {
                return Err("required parameter cannot have a default".to_string());
            }
            self.kind
                .check(default, self.compiled.as_ref())
                .map_err(|e| format!("invalid default: {}", e))?;
        }
        Ok(())
    }

    pub fn check(&self, value: &Value) -> Result<(), String> {
        self.kind.check(value, self.compiled.as_ref())
    }
}

/// Machine-checkable description of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub args_description: String,
    pub params: Vec<Param>,
    #[serde(default)]
    pub output: OutputKind,
    /// Tool specific default timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args_description: String::new(),
            params: Vec::new(),
            output: OutputKind::Text,
            timeout_secs: None,
        }
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_output(mut self, output: OutputKind) -> Self {
        self.output = output;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Prepare every parameter; rejects duplicates and bad rules
    pub fn prepare(&mut self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for param in &mut self.params {
            if !seen.insert(param.name.clone()) {
                return Err(format!("duplicate parameter '{}'", param.name));
            }
            param
                .prepare()
                .map_err(|e| format!("parameter '{}': {}", param.name, e))?;
        }
        Ok(())
    }

    /// Validate a full argument set, collecting every violation
    pub fn validate(&self, args: &Arguments) -> Result<(), Vec<FieldViolation>> {
        let mut violations = Vec::new();

        for param in &self.params {
            match args.get(&param.name) {
                None if param.required => {
                    violations.push(FieldViolation::new(&param.name, ViolationKind::Missing));
                }
                None => {}
                Some(value) => {
                    if let Err(reason) = param.check(value) {
                        violations.push(FieldViolation::new(
                            &param.name,
                            ViolationKind::Invalid(reason),
                        ));
                    }
                }
            }
        }

        for name in args.keys() {
            if self.param(name).is_none() {
                violations.push(FieldViolation::new(name, ViolationKind::Unexpected));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Arguments with defaults filled in for omitted optional parameters
    pub fn resolve(&self, args: &Arguments) -> Arguments {
        let mut resolved = args.clone();
        for param in &self.params {
            if let Some(default) = &param.default {
                resolved
                    .entry(param.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        resolved
    }

    /// JSON-schema rendering, for model-facing tool listings
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": json_type(&param.kind),
                    "description": if param.description.is_empty() {
                        param.kind.rule()
                    } else {
                        format!("{} ({})", param.description, param.kind.rule())
                    },
                }),
            );
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }
}

/// What is wrong with one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "problem", content = "detail", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    Unexpected,
    Invalid(String),
}

/// A single schema violation, named by field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub kind: ViolationKind,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "{}: required parameter missing", self.field),
            ViolationKind::Unexpected => write!(f, "{}: unexpected parameter", self.field),
            ViolationKind::Invalid(reason) => write!(f, "{}: {}", self.field, reason),
        }
    }
}

/// Text form of a scalar argument value, as it will appear on a command line
pub fn scalar_text(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err("null is not a value".to_string()),
        Value::Array(_) | Value::Object(_) => Err("must be a single value".to_string()),
    }
}

/// Strict boolean reading: JSON bools or exactly "true"/"false"
pub fn parse_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        other => Err(format!("'{}' is not true or false", display_value(other))),
    }
}

fn parse_integer(value: &Value, text: &str) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("'{}' is not an integer", n)),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", s)),
        _ => Err(format!("'{}' is not an integer", text)),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

fn json_type(kind: &ParamKind) -> &'static str {
    match kind {
        ParamKind::Integer { .. } | ParamKind::Port => "integer",
        ParamKind::Boolean => "boolean",
        _ => "string",
    }
}

fn check_port(n: i64) -> Result<(), String> {
    if (1..=65535).contains(&n) {
        Ok(())
    } else {
        Err(format!("{} is not a port number (1-65535)", n))
    }
}

fn check_port_list(text: &str) -> Result<(), String> {
    if text.is_empty() {
        return Err("port list must not be empty".to_string());
    }
    for entry in text.split(',') {
        let parse = |s: &str| -> Result<i64, String> {
            let n = s
                .parse::<i64>()
                .map_err(|_| format!("'{}' is not a port", s))?;
            check_port(n)?;
            Ok(n)
        };
        match entry.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("range '{}' is reversed", entry));
                }
            }
            None => {
                parse(entry)?;
            }
        }
    }
    Ok(())
}

fn check_cidr(text: &str) -> Result<(), String> {
    let invalid = || format!("'{}' is not a valid CIDR network", text);
    let (addr, prefix) = text.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

fn check_host(text: &str) -> Result<(), String> {
    if text.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let invalid = || format!("'{}' is not a valid hostname or IP address", text);
    let name = text.strip_suffix('.').unwrap_or(text);
    if name.is_empty() || name.len() > 253 {
        return Err(invalid());
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.iter().any(|l| !HOSTNAME_LABEL.is_match(l)) {
        return Err(invalid());
    }
    // All-numeric names look like a mistyped IP address
    if labels.iter().all(|l| l.chars().all(|c| c.is_ascii_digit())) {
        return Err(invalid());
    }
    Ok(())
}

fn check_url(text: &str) -> Result<(), String> {
    let parsed = url::Url::parse(text).map_err(|e| format!("'{}' is not a valid URL: {}", text, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(format!("'{}' must use http or https", text));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(format!("'{}' has no host", text));
    }
    Ok(())
}
