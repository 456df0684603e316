use ai_ops::config::{EngineConfig, ExecutorConfig};
use ai_ops::planning::{Action, Executor, PlanEngine, PlanEvent};
use ai_ops::tools::{Arguments, DeclarativeTool, ToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn args(value: Value) -> Arguments {
    serde_json::from_value(value).expect("arguments must be an object")
}

pub fn action(tool: &str, value: Value) -> Action {
    Action::new(tool, args(value))
}

fn register(registry: &mut ToolRegistry, descriptor: Value) {
    let tool = DeclarativeTool::from_json(&descriptor.to_string()).expect("valid test descriptor");
    registry.register(Arc::new(tool)).expect("unique test tool");
}

/// Registry of stand-in tools
pub fn test_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Grepable-looking output from plain echo
    register(
        &mut registry,
        json!({
            "name": "nmap",
            "tool_description": "Port scanner stand-in",
            "command": ["echo", "Host: {target} ()\tStatus: Up"],
            "parameters": [{"name": "target", "kind": "target", "required": true}]
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "gobuster",
            "tool_description": "Directory brute-forcer stand-in",
            "command": ["sh", "-c", "sleep {delay}; echo \"/admin (Status: 200) $1\"", "gobuster", "{url}"],
            "parameters": [
                {"name": "url", "kind": "url", "required": true},
                {"name": "delay", "kind": "integer", "min": 0, "max": 600, "default": 0}
            ]
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "sleeper",
            "tool_description": "Sleeps",
            "command": ["sleep", "{seconds}"],
            "parameters": [{"name": "seconds", "kind": "integer", "min": 0, "max": 600, "required": true}]
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "stubborn",
            "tool_description": "Ignores SIGTERM while sleeping",
            "command": ["sh", "-c", "trap '' TERM; sleep {seconds}"],
            "parameters": [{"name": "seconds", "kind": "integer", "min": 0, "max": 600, "required": true}]
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "fail",
            "tool_description": "Exits 1",
            "command": ["false"]
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "chatty",
            "tool_description": "Prints a lot",
            "command": ["seq", "1", "{count}"],
            "parameters": [{"name": "count", "kind": "integer", "min": 1, "required": true}]
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "jsonout",
            "tool_description": "Prints a JSON report",
            "command": ["echo", "{\"target\": \"{target}\", \"open\": [22, 80]}"],
            "parameters": [{"name": "target", "kind": "host", "required": true}],
            "output": "json"
        }),
    );
    register(
        &mut registry,
        json!({
            "name": "missing",
            "tool_description": "Binary that is not installed",
            "command": ["ai-ops-no-such-binary-7f3a", "{target}"],
            "parameters": [{"name": "target", "kind": "host", "required": true}]
        }),
    );

    registry
}

pub fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        default_timeout_secs: 30,
        kill_grace_ms: 200,
        ..ExecutorConfig::default()
    }
}

pub fn engine_with(executor: ExecutorConfig) -> PlanEngine {
    PlanEngine::new(
        Arc::new(test_registry()),
        Executor::new(executor),
        EngineConfig::default(),
    )
}

pub fn engine() -> PlanEngine {
    engine_with(executor_config())
}

/// Engine plus a receiver for its progress events
pub fn engine_with_events() -> (PlanEngine, mpsc::UnboundedReceiver<PlanEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (engine().with_events(tx), rx)
}

/// Wait until the engine reports that an action started
pub async fn wait_for_action_start(rx: &mut mpsc::UnboundedReceiver<PlanEvent>) -> String {
    loop {
        match rx.recv().await {
            Some(PlanEvent::ActionStarted { plan_id, .. }) => return plan_id,
            Some(_) => continue,
            None => panic!("engine dropped its event sender"),
        }
    }
}

/// True when no process with this pid exists any more
pub fn process_gone(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

/// Pid of a process that has exited and been reaped
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("true is installed");
    let pid = child.id();
    child.wait().expect("true exits");
    pid
}
