//! Crontab access, directly on the host or bridged from a container.
//!
//! ```text
//! host mode:     sh -c "crontab -l -u 'user'"
//! bridged mode:  nsenter -t 1 -m -u -i -n -p -- sh -c "crontab -l -u 'user'"
//! ```
//!
//! In bridged mode the new crontab travels base64-encoded inside the command
//! string, so job commands and comments never reach the host shell unquoted.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::commands::ShellCommand;
use crate::crontab::normalize_crontab;
use crate::{CronError, Result};

const NO_CRONTAB: &str = "no crontab for";

/// Captured result of one shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn into_failure(self, what: &str) -> CronError {
        let message = match self.code {
            Some(code) => format!("{what} exited with code {code}"),
            None => format!("{what} was terminated by a signal"),
        };
        CronError::ExecFailure {
            message,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

/// Where shell commands execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellTarget {
    /// This machine (or this container).
    Local,
    /// The host, entered through the namespaces of PID 1.
    Host,
}

/// Credentials a command should drop to before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

impl ShellTarget {
    pub fn from_bridged(bridged: bool) -> Self {
        if bridged { ShellTarget::Host } else { ShellTarget::Local }
    }

    /// Build a process running `script` through `sh -c` on this target.
    pub fn command(&self, script: &str, run_as: Option<RunAs>) -> tokio::process::Command {
        match self {
            ShellTarget::Local => {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(script);
                if let Some(creds) = run_as {
                    cmd.uid(creds.uid).gid(creds.gid);
                }
                cmd
            }
            ShellTarget::Host => {
                let mut cmd = tokio::process::Command::new("nsenter");
                cmd.args(["-t", "1", "-m", "-u", "-i", "-n", "-p"]);
                if let Some(creds) = run_as {
                    cmd.arg("-S")
                        .arg(creds.uid.to_string())
                        .arg("-G")
                        .arg(creds.gid.to_string());
                }
                cmd.arg("--").arg("sh").arg("-c").arg(script);
                cmd
            }
        }
    }
}

/// Run a script to completion, optionally feeding `stdin`.
pub async fn run_shell(target: ShellTarget, script: &str, stdin: Option<&str>) -> Result<CommandOutput> {
    debug!(?target, script, "Running shell command");
    let mut cmd = target.command(script, None);
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match target {
        ShellTarget::Host => CronError::BridgeUnavailable(format!("cannot enter host namespaces: {e}")),
        ShellTarget::Local => CronError::ExecFailure {
            message: format!("failed to spawn sh: {e}"),
            stderr: String::new(),
        },
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Interpret the output of a list-crontab command.
fn crontab_text(output: CommandOutput, user: &str) -> Result<String> {
    if output.success() {
        return Ok(output.stdout);
    }
    if output.stderr.contains(NO_CRONTAB) {
        debug!(user, "No crontab installed yet");
        return Ok(String::new());
    }
    Err(output.into_failure("crontab -l"))
}

fn parse_user_listing(stdout: &str) -> Vec<String> {
    let mut users: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('.'))
        .map(String::from)
        .collect();
    users.sort();
    users.dedup();
    users
}

fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string())
}

/// Read and replace crontabs for a user.
#[async_trait]
pub trait CrontabBridge: Send + Sync {
    /// Raw crontab text. A user without a crontab yields an empty string.
    async fn read(&self, user: &str) -> Result<String>;

    /// Atomically replace the user's crontab with `content`.
    async fn write(&self, user: &str, content: &str) -> Result<()>;

    /// Users whose crontabs can be managed. Never fails.
    async fn list_users(&self) -> Vec<String>;

    /// Where job commands should run.
    fn target(&self) -> ShellTarget;
}

/// Direct `crontab` access on the machine the service runs on.
pub struct HostCrontab {
    users: Vec<String>,
    spool_dir: PathBuf,
}

impl HostCrontab {
    pub fn new(users: Vec<String>, spool_dir: PathBuf) -> Self {
        Self { users, spool_dir }
    }
}

#[async_trait]
impl CrontabBridge for HostCrontab {
    async fn read(&self, user: &str) -> Result<String> {
        let cmd = ShellCommand::list_crontab(user);
        let output = run_shell(ShellTarget::Local, &cmd.render(), None).await?;
        crontab_text(output, user)
    }

    async fn write(&self, user: &str, content: &str) -> Result<()> {
        let cmd = ShellCommand::replace_crontab(user);
        let content = normalize_crontab(content);
        let output = run_shell(ShellTarget::Local, &cmd.render(), Some(&content)).await?;
        if output.success() {
            info!(user, "Crontab installed");
            Ok(())
        } else {
            Err(output.into_failure("crontab"))
        }
    }

    async fn list_users(&self) -> Vec<String> {
        if !self.users.is_empty() {
            return self.users.clone();
        }
        let cmd = ShellCommand::list_crontabs_dir(&self.spool_dir);
        match run_shell(ShellTarget::Local, &cmd.render(), None).await {
            Ok(output) if output.success() => {
                let mut users = parse_user_listing(&output.stdout);
                let me = current_user();
                if !users.contains(&me) {
                    users.insert(0, me);
                }
                users
            }
            Ok(_) => vec![current_user()],
            Err(e) => {
                warn!("Failed to list crontab users: {e}");
                vec![current_user()]
            }
        }
    }

    fn target(&self) -> ShellTarget {
        ShellTarget::Local
    }
}

/// Opaque access to a shell on the host machine.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn run(&self, script: &str) -> Result<CommandOutput>;
}

/// Runs scripts in the host namespaces via `nsenter`.
///
/// Requires the container to share the host PID namespace and hold
/// `CAP_SYS_ADMIN`.
pub struct NsenterExecutor;

#[async_trait]
impl HostExecutor for NsenterExecutor {
    async fn run(&self, script: &str) -> Result<CommandOutput> {
        run_shell(ShellTarget::Host, script, None).await
    }
}

/// Crontab access from inside a container, through a [`HostExecutor`].
pub struct BridgedCrontab {
    executor: Arc<dyn HostExecutor>,
    users: Vec<String>,
    spool_dir: PathBuf,
}

impl BridgedCrontab {
    pub fn new(executor: Arc<dyn HostExecutor>, users: Vec<String>, spool_dir: PathBuf) -> Self {
        Self {
            executor,
            users,
            spool_dir,
        }
    }

    pub async fn read_host_crontab(&self, user: &str) -> Result<String> {
        let cmd = ShellCommand::list_crontab(user);
        let output = self.executor.run(&cmd.render()).await?;
        crontab_text(output, user)
    }

    pub async fn write_host_crontab(&self, user: &str, content: &str) -> Result<()> {
        let cmd = ShellCommand::replace_crontab_inline(user, normalize_crontab(content));
        let output = self.executor.run(&cmd.render()).await?;
        if output.success() {
            info!(user, "Host crontab installed");
            Ok(())
        } else {
            Err(output.into_failure("host crontab"))
        }
    }

    /// Owner of the docker socket, usually the host's primary user.
    async fn docker_socket_owner(&self) -> Option<String> {
        let output = self
            .executor
            .run(&ShellCommand::docker_socket_owner().render())
            .await
            .ok()?;
        let owner = output.stdout.trim();
        (output.success() && !owner.is_empty() && owner != "UNKNOWN").then(|| owner.to_string())
    }
}

#[async_trait]
impl CrontabBridge for BridgedCrontab {
    async fn read(&self, user: &str) -> Result<String> {
        self.read_host_crontab(user).await
    }

    async fn write(&self, user: &str, content: &str) -> Result<()> {
        self.write_host_crontab(user, content).await
    }

    async fn list_users(&self) -> Vec<String> {
        if !self.users.is_empty() {
            return self.users.clone();
        }
        let cmd = ShellCommand::list_crontabs_dir(&self.spool_dir);
        match self.executor.run(&cmd.render()).await {
            Ok(output) if output.success() => {
                let users = parse_user_listing(&output.stdout);
                if !users.is_empty() {
                    return users;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to list host crontab users: {e}"),
        }
        match self.docker_socket_owner().await {
            Some(owner) => vec![owner],
            None => vec!["root".to_string()],
        }
    }

    fn target(&self) -> ShellTarget {
        ShellTarget::Host
    }
}
