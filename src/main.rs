//! Sandbox Env - Entry Point
//!
//! Runs one command in a throwaway container, or the built-in self-test.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, bail};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt};

use sandbox_env::engine::DockerCli;
use sandbox_env::session::{DEFAULT_IMAGE, DEFAULT_WORKING_DIR, SandboxSession, SessionConfig};
use sandbox_env::transfer::FileTransfer;

const SELF_TEST_SCRIPT: &str = "test_python.py";
const SELF_TEST_SOURCE: &str = "print('Hello, World!')";
const SELF_TEST_EXPECTED: &str = "Hello, World!";

/// Sandbox Env - Run untrusted code in ephemeral containers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Container image to run
    #[arg(long, global = true, default_value = DEFAULT_IMAGE)]
    image: String,

    /// Working directory created inside the container
    #[arg(long, global = true, default_value = DEFAULT_WORKING_DIR)]
    working_dir: String,

    /// Seconds to wait for the container to report running
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,

    /// Container engine client binary
    #[arg(long, global = true, env = "SANDBOX_ENV_DOCKER", default_value = "docker")]
    docker_bin: String,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a hello-world script into a fresh container and run it
    SelfTest,

    /// Copy files into a fresh container, run one command, and exit with its code
    Run {
        /// Host file or directory to copy in (repeatable)
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,

        /// Container directory the files are extracted into (must exist)
        #[arg(long, value_name = "DIR")]
        dest: Option<String>,

        /// Directory the command runs in
        #[arg(long, value_name = "DIR")]
        workdir: Option<String>,

        /// Shell command to run
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so command output on stdout stays clean
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Sandbox Env v{}", env!("CARGO_PKG_VERSION"));

    let engine = Arc::new(DockerCli::with_binary(&args.docker_bin)?);
    let config = SessionConfig::new()
        .with_image(args.image)
        .with_working_dir(args.working_dir)
        .with_readiness_timeout(Duration::from_secs(args.timeout))
        .with_verbose(args.verbose);

    match args.command {
        Commands::SelfTest => self_test(engine, config),
        Commands::Run {
            files,
            dest,
            workdir,
            command,
        } => {
            let mut transfer = FileTransfer::new().with_host_files(files);
            if let Some(dest) = dest {
                transfer = transfer.with_destination(dest);
            }
            let command = command.join(" ");

            let output = SandboxSession::scope(engine, config, |session| {
                if !transfer.is_empty() {
                    session.copy_files(transfer)?;
                }
                session.run_command(&command, workdir.as_deref())
            })?;

            let mut stdout = std::io::stdout();
            stdout.write_all(output.output.as_bytes()).into_diagnostic()?;
            stdout.flush().into_diagnostic()?;
            // The session is already torn down, nothing left to drop
            std::process::exit(output.exit_code);
        }
    }
}

/// Runs the hello-world scenario against a fresh container.
fn self_test(engine: Arc<DockerCli>, config: SessionConfig) -> Result<()> {
    let output = SandboxSession::scope(engine, config, |session| {
        session.copy_files(FileTransfer::new().with_contents(SELF_TEST_SCRIPT, SELF_TEST_SOURCE))?;
        session.run_command(&format!("python {SELF_TEST_SCRIPT}"), None)
    })?;

    if output.exit_code != 0 || output.output.trim() != SELF_TEST_EXPECTED {
        bail!(
            "Self-test failed: expected {SELF_TEST_EXPECTED:?}, got {:?} (exit code {})",
            output.output.trim(),
            output.exit_code
        );
    }

    println!("SELF-TEST PASSED [OK]");
    Ok(())
}
