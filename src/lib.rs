//! Sandbox Env - ephemeral, single-use container sessions.
//!
//! This crate runs untrusted code inside a throwaway container: it provisions
//! a container, waits until the engine reports it running, moves files in and
//! out through tar archives, runs shell commands, and removes the container on
//! every exit path.
//!
//! # Requirements
//!
//! - A reachable container engine (the Docker CLI by default)
//! - The configured image pulled or pullable
//!
//! # Example
//!
//! ```no_run
//! use sandbox_env::session::{SandboxSession, SessionConfig};
//! use sandbox_env::transfer::FileTransfer;
//!
//! fn main() -> miette::Result<()> {
//!     let mut session = SandboxSession::new(SessionConfig::default())?;
//!
//!     session.copy_files(
//!         FileTransfer::new().with_contents("test_python.py", "print('Hello, World!')"),
//!     )?;
//!     let output = session.run_command("python test_python.py", None)?;
//!     println!("{} (exit {})", output.output.trim(), output.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod session;
pub mod transfer;

// Re-export commonly used types
pub use engine::{CommandOutput, ContainerEngine, DockerCli};
pub use error::{Error, Result, SessionError};
pub use session::{SandboxSession, SessionConfig};
pub use transfer::FileTransfer;
