//! Launch specifications and credential environment.
//!
//! A `LaunchSpec` names one or more executable candidates; the first that
//! resolves (absolute/relative path or `$PATH` lookup) is spawned. Nothing is
//! ever installed or downloaded when none resolve.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{StartupError, StartupResult};

/// What to run for a session.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchSpec {
    /// Executable names or paths, tried in order.
    pub candidates: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Variables that must be present in the credential map or the
    /// inherited environment.
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Appended to every message written by `send`.
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
}

fn default_line_terminator() -> String {
    "\r".to_string()
}

impl LaunchSpec {
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            args: Vec::new(),
            working_dir: None,
            required_env: Vec::new(),
            line_terminator: default_line_terminator(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn require_env(mut self, name: impl Into<String>) -> Self {
        self.required_env.push(name.into());
        self
    }

    pub fn line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Check required environment and pick the first executable candidate.
    pub fn resolve(&self, env: &CredentialEnv) -> StartupResult<ResolvedLaunch> {
        for name in &self.required_env {
            let in_map = env.get(name).is_some_and(|v| !v.is_empty());
            let inherited = std::env::var_os(name).is_some_and(|v| !v.is_empty());
            if !in_map && !inherited {
                return Err(StartupError::MissingEnvironment(name.clone()));
            }
        }

        let program = self
            .candidates
            .iter()
            .find_map(|candidate| match which::which(candidate) {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!(candidate = %candidate, error = %e, "launch candidate not usable");
                    None
                }
            })
            .ok_or_else(|| StartupError::ExecutableNotFound(self.candidates.clone()))?;

        debug!(program = %program.display(), "resolved launch candidate");

        Ok(ResolvedLaunch {
            program,
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            line_terminator: self.line_terminator.clone(),
        })
    }
}

/// A launch spec with its executable located on disk.
#[derive(Debug, Clone)]
pub struct ResolvedLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub line_terminator: String,
}

/// Environment handed to the child, typically transient credential material
/// (a kubeconfig path, an API key). Values are never logged: `Debug` prints
/// variable names only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialEnv(BTreeMap<String, String>);

impl CredentialEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CredentialEnv {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Debug for CredentialEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for name in self.0.keys() {
            map.entry(name, &"<redacted>");
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_resolvable_candidate_wins() {
        let spec = LaunchSpec::new(["definitely-not-a-real-binary-7f3a", "sh"]);
        let resolved = spec.resolve(&CredentialEnv::new()).unwrap();
        assert!(resolved.program.ends_with("sh"));
        assert_eq!(resolved.line_terminator, "\r");
    }

    #[test]
    fn absolute_path_candidate() {
        let spec = LaunchSpec::new(["/bin/sh"]).args(["-c", "true"]);
        let resolved = spec.resolve(&CredentialEnv::new()).unwrap();
        assert_eq!(resolved.program, PathBuf::from("/bin/sh"));
        assert_eq!(resolved.args, vec!["-c", "true"]);
    }

    #[test]
    fn no_candidate_resolves() {
        let spec = LaunchSpec::new(["nope-ptymux-1", "/nonexistent/nope-ptymux-2"]);
        match spec.resolve(&CredentialEnv::new()) {
            Err(StartupError::ExecutableNotFound(c)) => assert_eq!(c.len(), 2),
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[test]
    fn required_env_from_credentials_or_inherited() {
        let spec = LaunchSpec::new(["sh"]).require_env("PTYMUX_TEST_API_KEY_UNSET");
        match spec.resolve(&CredentialEnv::new()) {
            Err(StartupError::MissingEnvironment(name)) => {
                assert_eq!(name, "PTYMUX_TEST_API_KEY_UNSET")
            }
            other => panic!("expected MissingEnvironment, got {other:?}"),
        }

        let env: CredentialEnv = [("PTYMUX_TEST_API_KEY_UNSET", "k-123")].into_iter().collect();
        assert!(spec.resolve(&env).is_ok());

        // PATH is always inherited.
        let spec = LaunchSpec::new(["sh"]).require_env("PATH");
        assert!(spec.resolve(&CredentialEnv::new()).is_ok());
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let spec = LaunchSpec::new(["sh"]).require_env("PTYMUX_TEST_EMPTY_KEY");
        let env: CredentialEnv = [("PTYMUX_TEST_EMPTY_KEY", "")].into_iter().collect();
        assert!(matches!(
            spec.resolve(&env),
            Err(StartupError::MissingEnvironment(_))
        ));
    }

    #[test]
    fn debug_redacts_values() {
        let env: CredentialEnv = [("OPENAI_API_KEY", "sk-secret"), ("KUBECONFIG", "/tmp/kc")]
            .into_iter()
            .collect();
        let printed = format!("{env:?}");
        assert!(printed.contains("OPENAI_API_KEY"));
        assert!(printed.contains("KUBECONFIG"));
        assert!(!printed.contains("sk-secret"));
        assert!(!printed.contains("/tmp/kc"));
    }
}
