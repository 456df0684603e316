use ai_ops::config::ToolsConfig;
use ai_ops::error::Error;
use ai_ops::tools::ToolRegistry;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use serde_json::json;

fn write_descriptors(dir: &TempDir) {
    dir.child("a_ping.json")
        .write_str(
            &json!({
                "name": "ping",
                "tool_description": "ICMP echo",
                "command": ["ping", "-c", "{count}", "{host}"],
                "parameters": [
                    {"name": "host", "kind": "host", "required": true},
                    {"name": "count", "kind": "integer", "min": 1, "max": 10, "default": 3}
                ]
            })
            .to_string(),
        )
        .unwrap();
    // Placeholder in the program position
    dir.child("b_shell.json")
        .write_str(
            &json!({
                "name": "shell",
                "tool_description": "Runs anything",
                "command": ["{program}"],
                "parameters": [{"name": "program", "kind": "string", "required": true}]
            })
            .to_string(),
        )
        .unwrap();
    dir.child("c_broken.json").write_str("{ not json").unwrap();
    dir.child("notes.txt").write_str("ignored").unwrap();
}

#[test]
fn test_descriptor_dir_rejects_bad_files() {
    let dir = TempDir::new().unwrap();
    write_descriptors(&dir);

    let mut registry = ToolRegistry::new();
    let rejected = registry.load_descriptor_dir(dir.path()).unwrap();

    assert_eq!(registry.names(), vec!["ping"]);
    assert_eq!(rejected.len(), 2);
    assert!(rejected[0].0.ends_with("b_shell.json"));
    assert!(matches!(rejected[0].1, Error::InvalidDescriptor { .. }));
    assert!(rejected[1].0.ends_with("c_broken.json"));
}

#[test]
fn test_from_config_layers_descriptor_dirs_over_builtins() {
    let dir = TempDir::new().unwrap();
    write_descriptors(&dir);

    let config = ToolsConfig {
        include_builtin: true,
        descriptor_dirs: vec![dir.path().to_path_buf()],
    };
    let registry = ToolRegistry::from_config(&config).unwrap();
    assert!(registry.lookup("nmap").is_ok());
    assert!(registry.lookup("gobuster").is_ok());
    assert!(registry.lookup("ping").is_ok());
    assert!(matches!(
        registry.lookup("shell"),
        Err(Error::UnknownTool(_))
    ));

    let docs = registry.render_documentation();
    assert!(docs.contains("ping: ICMP echo"));
}

#[test]
fn test_descriptor_clashing_with_builtin_is_rejected() {
    let dir = TempDir::new().unwrap();
    dir.child("nmap.json")
        .write_str(
            &json!({
                "name": "nmap",
                "tool_description": "Shadow nmap",
                "command": ["nmap"]
            })
            .to_string(),
        )
        .unwrap();

    let mut registry = ToolRegistry::with_builtins().unwrap();
    let rejected = registry.load_descriptor_dir(dir.path()).unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(matches!(rejected[0].1, Error::DuplicateTool(_)));
}

#[test]
fn test_missing_descriptor_dir_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut registry = ToolRegistry::new();
    assert!(matches!(
        registry.load_descriptor_dir(&dir.path().join("nope")),
        Err(Error::Io(_))
    ));
}
