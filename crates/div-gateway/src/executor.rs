//! Execution adapter: the boundary between the controller and whatever
//! actually runs an install.
//!
//! The controller hands an [`Executor`] a [`JobSubmission`] and a log
//! sink. The executor must write all job output to the sink before its
//! future resolves. [`ProcessExecutor`] runs the job script with a local
//! shell.

use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::process::Stdio;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use div_core::InstallSpec;

use crate::error::ExecError;

/// Event name every install job is submitted under.
pub const INSTALL_EVENT: &str = "div:install";

/// Boxed future returned by [`Executor::submit`].
pub type SubmitFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExecError>> + Send + 'a>>;

/// Everything a job runner needs to run one install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    /// Project the job runs for.
    pub namespace: String,
    pub script: String,
    pub event: String,
    /// Content hash being installed.
    pub commit: String,
    /// JSON document with the command to run.
    pub payload: String,
}

impl JobSubmission {
    /// The job for `install`, deploying into `environment`.
    pub fn for_install(environment: &str, install: &InstallSpec, script: &str) -> Self {
        Self {
            namespace: install.project.clone(),
            script: script.to_string(),
            event: INSTALL_EVENT.to_string(),
            commit: install.sha1.clone(),
            payload: install_payload(environment, &install.app, &install.sha1).to_string(),
        }
    }
}

/// `{"command": [...]}`: apply the app's charts to the environment at `sha1`.
pub fn install_payload(environment: &str, app: &str, sha1: &str) -> serde_json::Value {
    json!({
        "command": [
            "helmfile",
            "--log-level=debug",
            "-f=helmfile.yaml",
            format!("--environment={environment}"),
            format!("-l=name={app}"),
            format!("--set=ref={sha1}"),
            "apply",
            "--auto-approve",
        ]
    })
}

/// Runs jobs. Injected into the controller so tests can script outcomes.
pub trait Executor: Send + Sync {
    /// Run `job` to completion, writing its output to `sink`.
    fn submit<'a>(
        &'a self,
        job: &'a JobSubmission,
        sink: &'a mut (dyn Write + Send),
    ) -> SubmitFuture<'a>;
}

/// Runs the job script with a local shell (`<shell> -c <script>`).
///
/// The job is described to the script through `DIV_PROJECT`, `DIV_EVENT`,
/// `DIV_COMMIT` and `DIV_PAYLOAD`. Stdout and stderr are copied to the sink
/// line by line; a non-zero exit is a failed job.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: String,
}

impl ProcessExecutor {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }

    async fn run(&self, job: &JobSubmission, sink: &mut (dyn Write + Send)) -> Result<(), ExecError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.script)
            .env("DIV_PROJECT", &job.namespace)
            .env("DIV_EVENT", &job.event)
            .env("DIV_COMMIT", &job.commit)
            .env("DIV_PAYLOAD", &job.payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                shell: self.shell.clone(),
                source,
            })?;
        debug!(shell = %self.shell, project = %job.namespace, commit = %job.commit, "job started");

        // Output is copied as raw bytes; a job may print anything.
        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);
        if let (Some(mut stdout), Some(mut stderr)) = (stdout, stderr) {
            let (mut out_line, mut err_line) = (Vec::new(), Vec::new());
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                tokio::select! {
                    read = stdout.read_until(b'\n', &mut out_line), if !out_done => match read? {
                        0 => out_done = true,
                        _ => copy_line(sink, &mut out_line)?,
                    },
                    read = stderr.read_until(b'\n', &mut err_line), if !err_done => match read? {
                        0 => err_done = true,
                        _ => copy_line(sink, &mut err_line)?,
                    },
                }
            }
        }
        sink.flush()?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(ExecError::Failed {
                code: status.code(),
            });
        }
        info!(project = %job.namespace, commit = %job.commit, "job succeeded");
        Ok(())
    }
}

impl Executor for ProcessExecutor {
    fn submit<'a>(
        &'a self,
        job: &'a JobSubmission,
        sink: &'a mut (dyn Write + Send),
    ) -> SubmitFuture<'a> {
        Box::pin(self.run(job, sink))
    }
}

/// Write one line read from a job, terminating it if the job did not.
/// `read_until` keeps partial reads in `line`, so it is only cleared here.
fn copy_line(sink: &mut (dyn Write + Send), line: &mut Vec<u8>) -> io::Result<()> {
    if !line.ends_with(b"\n") {
        line.push(b'\n');
    }
    sink.write_all(line)?;
    line.clear();
    Ok(())
}

/// Writes everything to both writers.
pub struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}
