//! Custom nmap binding
//!
//! Always requests grepable output on stdout (`-oG -`) and turns it into a
//! structured host/port listing, so later turns see open services as data
//! instead of a wall of text.

use serde::Serialize;
use serde_json::json;

use super::schema::{parse_bool, scalar_text, Arguments, FieldViolation, Param, ParamKind, ToolSchema, ViolationKind};
use super::template::Invocation;
use super::{ToolBinding, ToolOutput};

pub struct NmapTool {
    schema: ToolSchema,
}

#[derive(Debug, Serialize, PartialEq)]
struct HostEntry {
    address: String,
    hostname: Option<String>,
    status: Option<String>,
    ports: Vec<PortEntry>,
}

#[derive(Debug, Serialize, PartialEq)]
struct PortEntry {
    port: u16,
    state: String,
    protocol: String,
    service: String,
    version: String,
}

impl NmapTool {
    pub fn new() -> Self {
        let timing: Vec<String> = (0..=5).map(|n| n.to_string()).collect();
        let mut schema = ToolSchema::new(
            "nmap",
            "Network scanner: host discovery, port scanning and service/OS detection.",
        )
        .with_param(
            Param::required("target", ParamKind::Target)
                .with_description("Host, IP address or CIDR network to scan"),
        )
        .with_param(
            Param::optional(
                "scan_type",
                ParamKind::Choice {
                    values: vec![
                        "connect".to_string(),
                        "syn".to_string(),
                        "udp".to_string(),
                        "ping".to_string(),
                    ],
                },
            )
            .with_description("connect (-sT), syn (-sS), udp (-sU) or ping sweep (-sn)"),
        )
        .with_param(Param::optional("ports", ParamKind::PortList).with_description("Ports to scan"))
        .with_param(
            Param::optional(
                "top_ports",
                ParamKind::Integer {
                    min: Some(1),
                    max: Some(65535),
                },
            )
            .with_description("Scan the N most common ports"),
        )
        .with_param(
            Param::optional("service_detection", ParamKind::Boolean)
                .with_description("Detect service versions on open ports (-sV)"),
        )
        .with_param(
            Param::optional("os_detection", ParamKind::Boolean)
                .with_description("Enable OS detection (-O)"),
        )
        .with_param(
            Param::optional("timing", ParamKind::Choice { values: timing })
                .with_description("Timing template 0 (paranoid) to 5 (insane)"),
        )
        .with_timeout(1800);
        // No pattern parameters or defaults, so there is nothing to prepare
        schema.args_description =
            "target is required; ports and top_ports are mutually exclusive".to_string();
        Self { schema }
    }

    fn parse_grepable(raw: &str) -> Vec<HostEntry> {
        let mut hosts: Vec<HostEntry> = Vec::new();

        for line in raw.lines() {
            let Some(rest) = line.strip_prefix("Host: ") else {
                continue;
            };
            let mut fields = rest.split('\t');
            let Some(head) = fields.next() else {
                continue;
            };

            let (address, hostname) = match head.split_once(' ') {
                Some((addr, name)) => {
                    let name = name.trim().trim_start_matches('(').trim_end_matches(')');
                    (addr.to_string(), (!name.is_empty()).then(|| name.to_string()))
                }
                None => (head.trim().to_string(), None),
            };

            let idx = match hosts.iter().position(|h| h.address == address) {
                Some(idx) => idx,
                None => {
                    hosts.push(HostEntry {
                        address: address.clone(),
                        hostname: None,
                        status: None,
                        ports: Vec::new(),
                    });
                    hosts.len() - 1
                }
            };
            let host = &mut hosts[idx];
            if host.hostname.is_none() {
                host.hostname = hostname;
            }

            for field in fields {
                if let Some(status) = field.strip_prefix("Status: ") {
                    host.status = Some(status.trim().to_string());
                } else if let Some(ports) = field.strip_prefix("Ports: ") {
                    host.ports.extend(ports.split(", ").filter_map(Self::parse_port));
                }
            }
        }

        hosts
    }

    /// `22/open/tcp//ssh//OpenSSH 8.2p1/`
    fn parse_port(entry: &str) -> Option<PortEntry> {
        let cols: Vec<&str> = entry.trim().split('/').collect();
        if cols.len() < 5 {
            return None;
        }
        Some(PortEntry {
            port: cols[0].parse().ok()?,
            state: cols[1].to_string(),
            protocol: cols[2].to_string(),
            service: cols[4].to_string(),
            version: cols.get(6).map(|s| s.to_string()).unwrap_or_default(),
        })
    }
}

impl Default for NmapTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBinding for NmapTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn cross_check(&self, args: &Arguments) -> Vec<FieldViolation> {
        let mut violations = Vec::new();
        if args.contains_key("ports") && args.contains_key("top_ports") {
            violations.push(FieldViolation::new(
                "top_ports",
                ViolationKind::Invalid("cannot be combined with 'ports'".to_string()),
            ));
        }
        let is_ping = args.get("scan_type").and_then(|v| v.as_str()) == Some("ping");
        if is_ping && (args.contains_key("ports") || args.contains_key("top_ports")) {
            violations.push(FieldViolation::new(
                "scan_type",
                ViolationKind::Invalid("a ping sweep does not scan ports".to_string()),
            ));
        }
        violations
    }

    fn build_command(&self, args: &Arguments) -> Result<Invocation, String> {
        let text = |name: &str| -> Result<Option<String>, String> {
            args.get(name)
                .map(|v| scalar_text(v).map_err(|e| format!("{}: {}", name, e)))
                .transpose()
        };
        let flag = |name: &str| -> Result<bool, String> {
            args.get(name)
                .map(|v| parse_bool(v).map_err(|e| format!("{}: {}", name, e)))
                .transpose()
                .map(|b| b.unwrap_or(false))
        };

        let target = text("target")?.ok_or_else(|| "target is required".to_string())?;
        let mut inv = Invocation::new("nmap").arg("-oG").arg("-");

        match text("scan_type")?.as_deref() {
            Some("connect") => inv = inv.arg("-sT"),
            Some("syn") => inv = inv.arg("-sS"),
            Some("udp") => inv = inv.arg("-sU"),
            Some("ping") => inv = inv.arg("-sn"),
            Some(other) => return Err(format!("unsupported scan_type '{}'", other)),
            None => {}
        }
        if flag("service_detection")? {
            inv = inv.arg("-sV");
        }
        if flag("os_detection")? {
            inv = inv.arg("-O");
        }
        if let Some(ports) = text("ports")? {
            inv = inv.arg("-p").arg(ports);
        }
        if let Some(top) = text("top_ports")? {
            inv = inv.arg("--top-ports").arg(top);
        }
        if let Some(timing) = text("timing")? {
            inv = inv.arg(format!("-T{}", timing));
        }

        Ok(inv.arg(target))
    }

    fn parse_output(&self, raw: &str) -> ToolOutput {
        let hosts = Self::parse_grepable(raw);
        if hosts.is_empty() {
            return ToolOutput::Text(raw.to_string());
        }
        match serde_json::to_value(&hosts) {
            Ok(hosts) => ToolOutput::Structured(json!({ "hosts": hosts })),
            Err(_) => ToolOutput::Text(raw.to_string()),
        }
    }
}
