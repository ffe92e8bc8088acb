use crate::model::format_endpoint;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "unreachable",
    "no route",
    "temporarily unavailable",
];

/// Outcome of a failed replication attempt, as classified by the tool adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("transient replication failure: {diagnostic}")]
    Transient { diagnostic: String },
    #[error("replication rejected: {diagnostic}")]
    Permanent { diagnostic: String },
}

impl ToolError {
    pub fn transient(diagnostic: impl Into<String>) -> Self {
        ToolError::Transient {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn permanent(diagnostic: impl Into<String>) -> Self {
        ToolError::Permanent {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient { .. })
    }

    pub fn diagnostic(&self) -> &str {
        match self {
            ToolError::Transient { diagnostic } | ToolError::Permanent { diagnostic } => diagnostic,
        }
    }
}

/// One alias handed to the replication tool, resolved to its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationMember {
    pub alias: String,
    pub address: String,
    pub port: u16,
}

impl ReplicationMember {
    pub fn endpoint(&self) -> String {
        format_endpoint(&self.address, self.port)
    }
}

/// External program that links storage nodes into a replication group.
///
/// Implementations perform exactly one attempt per call; retries and backoff
/// belong to the caller.
pub trait ReplicationTool: Send + Sync {
    fn apply_replication(&self, cluster: &str, members: &[ReplicationMember])
        -> Result<(), ToolError>;
}

/// Drives the `mc` client: alias registration, optional reset, then
/// `admin replicate add` across every member.
#[derive(Debug, Clone)]
pub struct McReplicationTool {
    binary: PathBuf,
    scheme: String,
    access_key: String,
    secret_key: String,
    attempt_timeout: Duration,
    reset_before_apply: bool,
}

impl McReplicationTool {
    pub fn new(binary: impl Into<PathBuf>, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            scheme: "http".to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            attempt_timeout: Duration::from_secs(60),
            reset_before_apply: true,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_reset_before_apply(mut self, reset: bool) -> Self {
        self.reset_before_apply = reset;
        self
    }

    fn run(&self, args: &[String], deadline: Instant) -> Result<CommandOutput, ToolError> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| {
                ToolError::transient(format!(
                    "attempt exceeded {:?} before `{}`",
                    self.attempt_timeout,
                    describe(args)
                ))
            })?;
        debug!(
            "event=mc_exec binary={} command={:?}",
            self.binary.display(),
            describe(args)
        );
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                ToolError::transient(format!(
                    "failed to start {}: {err}",
                    self.binary.display()
                ))
            })?;
        wait_with_timeout(child, remaining).map_err(|err| match err {
            WaitError::TimedOut => ToolError::transient(format!(
                "`{}` timed out after {:?}",
                describe(args),
                self.attempt_timeout
            )),
            WaitError::Io(err) => {
                ToolError::transient(format!("`{}` failed: {err}", describe(args)))
            }
        })
    }
}

impl ReplicationTool for McReplicationTool {
    fn apply_replication(
        &self,
        cluster: &str,
        members: &[ReplicationMember],
    ) -> Result<(), ToolError> {
        let deadline = Instant::now() + self.attempt_timeout;
        for member in members {
            let url = format!("{}://{}", self.scheme, member.endpoint());
            let args = vec![
                "alias".to_string(),
                "set".to_string(),
                member.alias.clone(),
                url,
                self.access_key.clone(),
                self.secret_key.clone(),
            ];
            let output = self.run(&args, deadline)?;
            if !output.status.success() {
                return Err(classify(&output.stderr));
            }
        }
        if self.reset_before_apply {
            for member in members {
                let args: Vec<String> = ["admin", "replicate", "rm", "--all", "--force"]
                    .iter()
                    .map(|arg| arg.to_string())
                    .chain(std::iter::once(member.alias.clone()))
                    .collect();
                match self.run(&args, deadline) {
                    Ok(output) if !output.status.success() => debug!(
                        "event=mc_reset_ignored alias={} stderr={}",
                        member.alias,
                        output.stderr.trim()
                    ),
                    Ok(_) => {}
                    Err(err) if err.is_transient() && Instant::now() >= deadline => return Err(err),
                    Err(err) => debug!("event=mc_reset_ignored alias={} error={err}", member.alias),
                }
            }
        }
        let mut args: Vec<String> = vec!["admin".into(), "replicate".into(), "add".into()];
        args.extend(members.iter().map(|member| member.alias.clone()));
        let output = self.run(&args, deadline)?;
        if output.status.success() {
            info!(
                "event=mc_replicate_added cluster={} members={}",
                cluster,
                members.len()
            );
            return Ok(());
        }
        if output.stderr.to_ascii_lowercase().contains("already") {
            info!(
                "event=mc_replicate_already_configured cluster={} stderr={}",
                cluster,
                output.stderr.trim()
            );
            return Ok(());
        }
        let err = classify(&output.stderr);
        warn!(
            "event=mc_replicate_failed cluster={} transient={} diagnostic={}",
            cluster,
            err.is_transient(),
            err.diagnostic()
        );
        Err(err)
    }
}

/// Maps a failed invocation's stderr to a transient or permanent error.
pub fn classify(stderr: &str) -> ToolError {
    let diagnostic = stderr.trim();
    let diagnostic = if diagnostic.is_empty() {
        "replication tool exited unsuccessfully with no output"
    } else {
        diagnostic
    };
    let lowered = diagnostic.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        ToolError::transient(diagnostic)
    } else {
        ToolError::permanent(diagnostic)
    }
}

// Secrets are the last two `alias set` arguments; never log them.
fn describe(args: &[String]) -> String {
    if args.len() == 6 && args[0] == "alias" && args[1] == "set" {
        return format!("alias set {} {} ****", args[2], args[3]);
    }
    args.join(" ")
}

#[derive(Debug)]
struct CommandOutput {
    status: ExitStatus,
    stderr: String,
}

enum WaitError {
    TimedOut,
    Io(io::Error),
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> Option<thread::JoinHandle<String>> {
    source.map(|mut source| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = source.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<CommandOutput, WaitError> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WaitError::TimedOut);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                let _ = child.kill();
                return Err(WaitError::Io(err));
            }
        }
    };
    if let Some(stdout) = stdout {
        let _ = stdout.join();
    }
    let stderr = stderr
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    Ok(CommandOutput { status, stderr })
}
