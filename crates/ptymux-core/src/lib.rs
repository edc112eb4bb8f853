//! ptymux-core: interactive PTY session multiplexer.
//!
//! Keeps long-lived, protocol-less interactive programs alive on
//! pseudo-terminals, feeds each one discrete messages, and frames one
//! response per request out of the raw terminal stream.
//!
//! # Quick Start
//!
//! ```no_run
//! use ptymux_core::{CredentialEnv, LaunchSpec, SessionConfig, SessionRegistry};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = SessionRegistry::new(SessionConfig::default())?;
//! let launch = LaunchSpec::new(["kubectl-ai", "/usr/local/bin/kubectl-ai"])
//!     .require_env("GEMINI_API_KEY");
//! let env: CredentialEnv = [("KUBECONFIG", "/tmp/cluster-a.kubeconfig")]
//!     .into_iter()
//!     .collect();
//!
//! registry.create("cluster-a", &launch, &env).await?;
//! let answer = registry
//!     .send("cluster-a", "how many pods are running?", Duration::from_secs(60))
//!     .await?;
//! println!("{answer}");
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod framer;
pub mod health;
pub mod launch;
pub mod pty;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod transcript;

// Re-export commonly used items at crate root.
pub use config::{FramerRules, SanitizeRules, SessionConfig};
pub use error::{PatternError, PtyError, SendError, SendResult, StartupError, StartupResult};
pub use framer::{FlushReason, FramePolicy, Framer};
pub use launch::{CredentialEnv, LaunchSpec};
pub use registry::SessionRegistry;
pub use sanitize::Sanitizer;
pub use session::{InteractiveSession, SessionInfo, SessionRules, SessionState, SessionStatus};
pub use transcript::{Direction, TranscriptEntry};
