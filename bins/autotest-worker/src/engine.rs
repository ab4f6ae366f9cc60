/// Execution Engine - Boundary to the tester
///
/// **Core Responsibility:**
/// Run the tester for one job and capture what it printed.
///
/// **Boundary:**
/// - Engine knows HOW to start the tester
/// - Engine does NOT enforce the job timeout (the runner does, by dropping
///   the future)
/// - Engine does NOT grade anything

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Raw tester output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Execution engine trait
///
/// Implementations must stop all work when the returned future is dropped.
pub trait ExecutionEngine {
    /// Run the tester with the job's argument bundle, inside `workdir` when
    /// the job reserved one.
    async fn run(&self, payload: &Value, workdir: Option<&Path>) -> Result<EngineOutput>;
}

/// Spawns an external tester process per job
///
/// The payload is written to the tester's stdin as JSON. The process is
/// killed if the job is abandoned (timeout or shutdown).
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line such as
    /// `python3 /opt/autotest/run_tests.py`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl ExecutionEngine for CommandEngine {
    async fn run(&self, payload: &Value, workdir: Option<&Path>) -> Result<EngineOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start tester '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&serde_json::to_vec(payload)?).await {
                // Testers that never read their input may exit first
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
                    return Err(e).context("failed to send payload to tester")
                }
                _ => {}
            }
            // Closing stdin signals end of input
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to collect tester output")?;

        Ok(EngineOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
