//! SSH Remote Command Transport
//!
//! Runs commands on the storage host through the system `ssh` client. By
//! default every command opens its own connection, so concurrent callers
//! never share a session. With multiplexing enabled the first command lazily
//! starts an OpenSSH control master that later commands reuse; a transport
//! failure tears the master down and the next command reconnects.

use crate::config::SshSettings;
use crate::domain::ports::{CommandOutput, RemoteExecutor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Exit status `ssh` itself uses for connection and authentication failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

// =============================================================================
// Configuration
// =============================================================================

/// Connection parameters for one storage host
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub strict_host_key_checking: bool,
    pub connect_timeout: Duration,
    pub multiplex: bool,
}

impl SshTarget {
    pub fn from_settings(host: &str, settings: &SshSettings) -> Self {
        Self {
            host: host.to_string(),
            port: settings.port,
            user: settings.identity.clone().filter(|u| !u.is_empty()),
            private_key_file: settings.private_key_file.clone(),
            strict_host_key_checking: settings.strict_host_key_checking,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            multiplex: settings.multiplex,
        }
    }
}

// =============================================================================
// SSH Executor
// =============================================================================

pub struct SshExecutor {
    target: SshTarget,
    program: String,
    control_path: Option<PathBuf>,
    /// Whether a control master is believed to be running
    session_open: Mutex<bool>,
}

impl SshExecutor {
    pub fn new(target: SshTarget) -> Self {
        let control_path = target
            .multiplex
            .then(|| std::env::temp_dir().join(format!("zfspv-{}-%C", std::process::id())));
        Self {
            target,
            program: "ssh".to_string(),
            control_path,
            session_open: Mutex::new(false),
        }
    }

    /// Use a different client binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn connection_args(&self) -> Vec<String> {
        let t = &self.target;
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", t.connect_timeout.as_secs()),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if t.strict_host_key_checking { "yes" } else { "no" }
            ),
        ];
        if !t.strict_host_key_checking {
            args.extend(["-o".to_string(), "UserKnownHostsFile=/dev/null".to_string()]);
        }
        if let Some(path) = &self.control_path {
            args.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                format!("ControlPath={}", path.display()),
                "-o".to_string(),
                "ControlPersist=300".to_string(),
            ]);
        }
        args.extend(["-p".to_string(), t.port.to_string()]);
        if let Some(key) = &t.private_key_file {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        if let Some(user) = &t.user {
            args.extend(["-l".to_string(), user.clone()]);
        }
        args
    }

    /// Full argument list for running `command` on the target
    pub fn command_args(&self, command: &str) -> Vec<String> {
        let mut args = self.connection_args();
        args.push(self.target.host.clone());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    /// Stop the control master, if any
    async fn teardown(&self) {
        let was_open = std::mem::replace(&mut *self.session_open.lock(), false);
        if self.control_path.is_none() || !was_open {
            return;
        }
        let mut args = self.connection_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.target.host.clone()]);
        match Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(_) => debug!("Closed SSH session to {}", self.target.host),
            Err(e) => warn!("Failed to close SSH session to {}: {}", self.target.host, e),
        }
    }

    fn transport_error(&self, reason: String) -> Error {
        Error::RemoteTransport {
            host: self.target.host.clone(),
            reason,
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        trace!("ssh {}: {}", self.target.host, command);

        let result = Command::new(&self.program)
            .args(self.command_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.teardown().await;
                return Err(self.transport_error(e.to_string()));
            }
        };

        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));

        let exit_status = match output.status.code() {
            Some(SSH_TRANSPORT_FAILURE) => {
                self.teardown().await;
                return Err(self.transport_error(merged.trim().to_string()));
            }
            Some(code) => code,
            None => {
                self.teardown().await;
                return Err(self.transport_error("ssh terminated by signal".into()));
            }
        };

        if self.control_path.is_some() {
            *self.session_open.lock() = true;
        }

        Ok(CommandOutput {
            exit_status,
            output: merged,
        })
    }

    fn host(&self) -> &str {
        &self.target.host
    }
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
