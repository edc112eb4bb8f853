//! CLI configuration: TOML file + command-line overrides.

use ptymux_core::{LaunchSpec, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no command given: pass one after `--` or set [launch] candidates")]
    MissingLaunch,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub session: SessionConfig,
    /// `[launch]` section; optional when the command is given on the CLI.
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
}

/// Values from the command line that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `command` and its arguments; the first element becomes the primary
    /// candidate.
    pub command: Vec<String>,
    /// Extra executables to try when `command[0]` does not resolve.
    pub fallbacks: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub require_env: Vec<String>,
    pub send_timeout_secs: Option<u64>,
    pub transcript: bool,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub session: SessionConfig,
    pub launch: LaunchSpec,
}

impl CliConfig {
    /// Load the TOML file if it exists, then apply `overrides`.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content =
                        std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Read {
                            path: expanded.clone(),
                            source,
                        })?;
                    toml::from_str::<ConfigFile>(&content).map_err(|source| {
                        ConfigError::Parse {
                            path: expanded.clone(),
                            source,
                        }
                    })?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut session = file.session;
        if let Some(secs) = overrides.send_timeout_secs {
            session.send_timeout_ms = secs.saturating_mul(1000);
        }
        if overrides.transcript {
            session.transcript = true;
        }

        let mut launch = match (overrides.command.split_first(), file.launch) {
            (Some((program, args)), file_launch) => {
                // A command on the CLI replaces the file's candidates and
                // args but keeps its other launch settings.
                let base = file_launch.unwrap_or_else(|| LaunchSpec::new(Vec::<String>::new()));
                LaunchSpec {
                    candidates: vec![program.clone()],
                    args: args.to_vec(),
                    ..base
                }
            }
            (None, Some(file_launch)) => file_launch,
            (None, None) => return Err(ConfigError::MissingLaunch),
        };
        launch.candidates.extend(overrides.fallbacks);
        launch.required_env.extend(overrides.require_env);
        if let Some(dir) = overrides.working_dir {
            launch.working_dir = Some(dir);
        }
        if let Some(dir) = launch.working_dir.take() {
            launch.working_dir = Some(expand_tilde(&dir));
        }
        if launch.candidates.is_empty() {
            return Err(ConfigError::MissingLaunch);
        }

        Ok(Self { session, launch })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_sections_are_loaded() {
        let file = write_config(
            r#"
[session]
send_timeout_ms = 5000
transcript = true

[session.framer]
idle_window_ms = 900

[launch]
candidates = ["kubectl-ai", "/opt/bin/kubectl-ai"]
args = ["--quiet"]
required_env = ["GEMINI_API_KEY"]
"#,
        );
        let cfg = CliConfig::load(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(cfg.session.send_timeout_ms, 5000);
        assert!(cfg.session.transcript);
        assert_eq!(cfg.session.framer.idle_window_ms, 900);
        assert_eq!(cfg.session.framer.desperate_window_ms, 8000);
        assert_eq!(cfg.launch.candidates, vec!["kubectl-ai", "/opt/bin/kubectl-ai"]);
        assert_eq!(cfg.launch.args, vec!["--quiet"]);
        assert_eq!(cfg.launch.line_terminator, "\r");
    }

    #[test]
    fn cli_command_overrides_file() {
        let file = write_config(
            r#"
[launch]
candidates = ["kubectl-ai"]
required_env = ["GEMINI_API_KEY"]
line_terminator = "\n"
"#,
        );
        let overrides = Overrides {
            command: vec!["sh".into(), "-i".into()],
            fallbacks: vec!["/bin/sh".into()],
            require_env: vec!["KUBECONFIG".into()],
            send_timeout_secs: Some(7),
            ..Overrides::default()
        };
        let cfg = CliConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(cfg.launch.candidates, vec!["sh", "/bin/sh"]);
        assert_eq!(cfg.launch.args, vec!["-i"]);
        assert_eq!(cfg.launch.line_terminator, "\n");
        assert_eq!(cfg.launch.required_env, vec!["GEMINI_API_KEY", "KUBECONFIG"]);
        assert_eq!(cfg.session.send_timeout_ms, 7000);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let overrides = Overrides {
            command: vec!["sh".into()],
            ..Overrides::default()
        };
        let cfg = CliConfig::load(Some(Path::new("/nonexistent/ptymux.toml")), overrides).unwrap();
        assert_eq!(cfg.session.send_timeout_ms, SessionConfig::default().send_timeout_ms);
        assert!(!cfg.session.transcript);
    }

    #[test]
    fn no_command_anywhere_is_an_error() {
        assert!(matches!(
            CliConfig::load(None, Overrides::default()),
            Err(ConfigError::MissingLaunch)
        ));
    }

    #[test]
    fn malformed_file_is_reported() {
        let file = write_config("[session\nsend_timeout_ms = ");
        let overrides = Overrides {
            command: vec!["sh".into()],
            ..Overrides::default()
        };
        assert!(matches!(
            CliConfig::load(Some(file.path()), overrides),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn tilde_expansion() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde(Path::new("~/x.toml")), home.join("x.toml"));
        assert_eq!(expand_tilde(Path::new("/etc/x.toml")), PathBuf::from("/etc/x.toml"));
    }
}
