#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn run_cli(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_cqmon"))
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("failed to spawn binary");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

/// A temp dir holding a config file whose queue, processed set and working
/// directory all live inside it. The `TempDir` must be kept alive for the
/// duration of the test.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new(tool_command: &str, extra: &str) -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        ws.write_config(tool_command, extra);
        ws
    }

    /// Workspace whose tool appends each command to `ran.txt`.
    #[cfg(unix)]
    pub fn with_stand_in_tool() -> Self {
        Self::with_tool_script("printf '%s\\n' \"$2\" >> \"$PWD/ran.txt\"\n", "")
    }

    /// Workspace whose tool is a shell script: `--version` succeeds, any other
    /// invocation runs `body` with the command text in `$2`.
    #[cfg(unix)]
    pub fn with_tool_script(body: &str, extra: &str) -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        let tool = write_tool(ws.path(), body);
        ws.write_config(tool.to_str().unwrap(), extra);
        ws
    }

    fn write_config(&self, tool_command: &str, extra: &str) {
        let root = self.path();
        let config = format!(
            "queue_file = {:?}\nprocessed_file = {:?}\nworking_dir = {:?}\ntool_command = {:?}\npoll_interval = \"100ms\"\n{extra}",
            root.join("command_queue.json").to_str().unwrap(),
            root.join("processed_commands.json").to_str().unwrap(),
            root.to_str().unwrap(),
            tool_command,
        );
        fs::write(self.config_path(), config).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("monitor.toml")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.path().join("command_queue.json")
    }

    pub fn processed_path(&self) -> PathBuf {
        self.path().join("processed_commands.json")
    }

    /// Run the binary with `--config` pointing at this workspace.
    pub fn cli(&self, args: &[&str]) -> (i32, String, String) {
        let config = self.config_path();
        let mut full = vec!["--config", config.to_str().unwrap()];
        full.extend_from_slice(args);
        run_cli(&full)
    }

    pub fn queue(&self) -> Vec<serde_json::Value> {
        serde_json::from_str(&fs::read_to_string(self.queue_path()).unwrap()).unwrap()
    }

    pub fn processed_ids(&self) -> Vec<String> {
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(self.processed_path()).unwrap()).unwrap();
        serde_json::from_value(raw["processed_ids"].clone()).unwrap()
    }
}

#[cfg(unix)]
fn write_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-tool");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo \"fake-tool 1.0\"; exit 0; fi\n{body}"
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
