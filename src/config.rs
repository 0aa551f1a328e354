//! `ServerConfig` loading and validation (§3, §6.2) plus the command-line
//! `WrapperOptions` (§3, §6.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Size limit for a `ServerConfig` file (§6.2).
pub const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Maximum JSON nesting depth accepted by the config parser (§6.2).
pub const MAX_CONFIG_DEPTH: u32 = 32;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub executable_path: String,
    pub arguments: Option<String>,
    pub working_directory: Option<String>,
    pub environment_variables: HashMap<String, String>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub redirect_stdin: bool,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub restart_delay_seconds: u64,
    pub cpu_limit_percent: Option<u32>,
    pub memory_limit_mb: Option<u64>,
    pub graceful_shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable_path: String::new(),
            arguments: None,
            working_directory: None,
            environment_variables: HashMap::new(),
            capture_stdout: true,
            capture_stderr: true,
            redirect_stdin: false,
            auto_restart: false,
            max_restart_attempts: 0,
            restart_delay_seconds: 1,
            cpu_limit_percent: None,
            memory_limit_mb: None,
            graceful_shutdown_timeout_seconds: 30,
        }
    }
}

impl ServerConfig {
    /// Load, size-check, depth-check, parse, and validate a config file in
    /// one pass, following §6.2's "single concatenated error message"
    /// requirement for validation failures.
    pub async fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > MAX_CONFIG_BYTES {
            return Err(ConfigError::TooLarge {
                limit: MAX_CONFIG_BYTES,
                actual: metadata.len(),
            });
        }

        let bytes = tokio::fs::read(path).await?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
        check_depth(&raw, 0)?;

        let config: ServerConfig = serde_json::from_value(raw)?;
        let errors = config.validate().await;
        if !errors.is_empty() {
            // The first error becomes the typed `Err`; `ConfigError::concat`
            // builds the full joined message the process exits with (§6.2).
            return Err(errors.into_iter().next().unwrap());
        }

        Ok(config)
    }

    /// Run every invariant from §3 and return every violation found (rather
    /// than short-circuiting) so the caller can build the concatenated
    /// error message required by §6.2.
    pub async fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let path = Path::new(&self.executable_path);
        if !path.is_absolute() {
            errors.push(ConfigError::NotAbsolute(self.executable_path.clone()));
        } else {
            match tokio::fs::canonicalize(path).await {
                Ok(canonical) if canonical == *path => match tokio::fs::metadata(&canonical).await {
                    Ok(meta) if meta.is_file() => {}
                    _ => errors.push(ConfigError::NotARegularFile(self.executable_path.clone())),
                },
                Ok(_) => errors.push(ConfigError::NotCanonical(self.executable_path.clone())),
                Err(_) => errors.push(ConfigError::NotARegularFile(self.executable_path.clone())),
            }
        }

        if self.restart_delay_seconds < 1 {
            errors.push(ConfigError::InvalidRestartDelay);
        }

        if let Some(cpu) = self.cpu_limit_percent
            && cpu > 100
        {
            errors.push(ConfigError::InvalidCpuLimit(cpu));
        }

        if self.graceful_shutdown_timeout_seconds < 1 {
            errors.push(ConfigError::InvalidGracefulTimeout);
        }

        errors
    }

    /// Effective working directory for the child process (§4.3): configured
    /// value if present, else `dirname(executablePath)`.
    pub fn effective_working_directory(&self) -> Option<PathBuf> {
        if let Some(wd) = &self.working_directory {
            return Some(PathBuf::from(wd));
        }
        Path::new(&self.executable_path)
            .parent()
            .map(Path::to_path_buf)
    }

    /// Parsed argv for the child, following §4.3.1.
    pub fn argv(&self) -> Vec<String> {
        match &self.arguments {
            Some(raw) => crate::argv::parse(raw),
            None => Vec::new(),
        }
    }
}

fn check_depth(value: &serde_json::Value, depth: u32) -> Result<(), ConfigError> {
    if depth > MAX_CONFIG_DEPTH {
        return Err(ConfigError::TooDeep {
            limit: MAX_CONFIG_DEPTH,
        });
    }
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                check_depth(v, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Command-line inputs to the supervisor wrapper executable (§3, §6.1):
/// `--server-id=<opaque> --pipe=<endpoint-name> --config=<absolute-path>`.
#[derive(Debug, Clone)]
pub struct WrapperOptions {
    pub server_id: String,
    pub pipe_name: String,
    pub config_path: PathBuf,
}

impl WrapperOptions {
    /// Parse from an argv-style iterator (excluding argv[0]). Returns a
    /// usage-line-ready error string on any missing/malformed argument,
    /// matching the exit-code-1-without-opening-the-ipc-endpoint contract
    /// of §6.1.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<WrapperOptions, String> {
        let mut server_id = None;
        let mut pipe_name = None;
        let mut config_path = None;

        for arg in args {
            if let Some(v) = arg.strip_prefix("--server-id=") {
                server_id = Some(v.to_string());
            } else if let Some(v) = arg.strip_prefix("--pipe=") {
                pipe_name = Some(v.to_string());
            } else if let Some(v) = arg.strip_prefix("--config=") {
                config_path = Some(PathBuf::from(v));
            } else {
                return Err(format!("unrecognized argument: {arg}"));
            }
        }

        let server_id = server_id.ok_or("missing required --server-id=<opaque>")?;
        let pipe_name = pipe_name.ok_or("missing required --pipe=<endpoint-name>")?;
        let config_path = config_path.ok_or("missing required --config=<absolute-path>")?;

        if server_id.is_empty() {
            return Err("--server-id must not be empty".to_string());
        }
        if pipe_name.is_empty() {
            return Err("--pipe must not be empty".to_string());
        }
        if !config_path.is_absolute() {
            return Err("--config must be an absolute path".to_string());
        }

        Ok(WrapperOptions {
            server_id,
            pipe_name,
            config_path,
        })
    }

    pub const USAGE: &'static str =
        "usage: supervisor --server-id=<opaque> --pipe=<endpoint-name> --config=<absolute-path>";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_well_formed_arguments() {
        let opts = WrapperOptions::parse(args(&[
            "--server-id=abc",
            "--pipe=\\\\.\\pipe\\srv1",
            "--config=/etc/srv1.json",
        ]))
        .unwrap();
        assert_eq!(opts.server_id, "abc");
        assert_eq!(opts.config_path, PathBuf::from("/etc/srv1.json"));
    }

    #[test]
    fn missing_server_id_is_rejected() {
        let err = WrapperOptions::parse(args(&["--pipe=p", "--config=/a"])).unwrap_err();
        assert!(err.contains("server-id"));
    }

    #[test]
    fn relative_config_path_is_rejected() {
        let err =
            WrapperOptions::parse(args(&["--server-id=a", "--pipe=p", "--config=rel.json"]))
                .unwrap_err();
        assert!(err.contains("absolute"));
    }

    #[test]
    fn config_default_matches_spec_minimums() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.restart_delay_seconds, 1);
        assert_eq!(cfg.graceful_shutdown_timeout_seconds, 30);
        assert!(cfg.capture_stdout);
    }

    #[test]
    fn depth_check_rejects_excess_nesting() {
        let mut value = serde_json::json!(1);
        for _ in 0..(MAX_CONFIG_DEPTH + 5) {
            value = serde_json::json!({ "nested": value });
        }
        assert!(check_depth(&value, 0).is_err());
    }

    #[test]
    fn depth_check_accepts_shallow_document() {
        let value = serde_json::json!({ "a": { "b": { "c": 1 } } });
        assert!(check_depth(&value, 0).is_ok());
    }

    #[test]
    fn null_optional_fields_are_treated_as_absent() {
        let raw = serde_json::json!({
            "executablePath": "/bin/true",
            "workingDirectory": null,
            "memoryLimitMb": null,
        });
        let cfg: ServerConfig = serde_json::from_value(raw).unwrap();
        assert!(cfg.working_directory.is_none());
        assert!(cfg.memory_limit_mb.is_none());
    }
}
