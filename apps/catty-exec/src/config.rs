use std::env;
use std::path::PathBuf;

/// Where uploaded snapshots are extracted.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Hard cap on the snapshot archive (100 MiB), enforced before extraction.
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub listen_addr: String,
    /// Capability token every `/upload` and `/connect` must present. When
    /// unset (local testing) all callers are accepted.
    pub connect_token: Option<String>,
    /// Command to run inside the pty, whitespace-split from `CATTY_CMD`.
    pub command: Vec<String>,
    pub workspace_dir: PathBuf,
}

impl ExecConfig {
    pub fn from_env() -> Self {
        let command = env::var("CATTY_CMD")
            .ok()
            .map(|raw| split_command(&raw))
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or_else(|| vec!["/bin/sh".to_string()]);

        Self {
            listen_addr: env::var("CATTY_EXEC_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            connect_token: env::var("CONNECT_TOKEN").ok().filter(|t| !t.is_empty()),
            command,
            workspace_dir: PathBuf::from(WORKSPACE_DIR),
        }
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_on_whitespace() {
        assert_eq!(
            split_command("claude --dangerously-skip-permissions"),
            vec!["claude", "--dangerously-skip-permissions"]
        );
        assert!(split_command("   ").is_empty());
    }
}
