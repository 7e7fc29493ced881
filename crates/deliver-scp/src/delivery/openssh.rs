// ── OpenSSH binary transport ─────────────────────────────────────────────────
//
// Shells out to the system `ssh` / `scp` (and `sshpass` for password auth).
// Every operation is its own process, so each phase performs a fresh
// handshake.

use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::transport::{
    list_command, mkdir_command, parse_listing, shell_escape, upload_target, DeliveryTransport,
    TransportConnector,
};
use crate::delivery::types::*;
use async_trait::async_trait;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// sshpass: the password was rejected.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// sshpass: the host key is not yet known.
const SSHPASS_UNKNOWN_HOST_KEY: i32 = 6;
/// ssh / scp: connection-level error.
const SSH_CONNECTION_ERROR: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct OpenSshConnector {
    options: ConnectionOptions,
}

impl OpenSshConnector {
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl TransportConnector for OpenSshConnector {
    async fn connect(&self, credentials: &Credentials) -> DeliveryResult<Box<dyn DeliveryTransport>> {
        let transport = OpenSshTransport::new(credentials, &self.options)?;
        Ok(Box::new(transport))
    }
}

pub struct OpenSshTransport {
    ssh: PathBuf,
    scp: PathBuf,
    sshpass: Option<PathBuf>,
    host: String,
    port: u16,
    username: String,
    identity: Option<PathBuf>,
    password: Option<Zeroizing<String>>,
    options: ConnectionOptions,
}

impl OpenSshTransport {
    /// Locate the binaries on PATH. Nothing is executed yet.
    pub fn new(credentials: &Credentials, options: &ConnectionOptions) -> DeliveryResult<Self> {
        let ssh = locate("ssh")?;
        let scp = locate("scp")?;
        let sshpass = match credentials.secret {
            AuthSecret::Password(_) => Some(locate("sshpass")?),
            AuthSecret::KeyFile { .. } => None,
        };
        info!(
            "Using OpenSSH binaries {} and {}",
            ssh.display(),
            scp.display()
        );
        Ok(Self::with_programs(ssh, scp, sshpass, credentials, options))
    }

    pub(crate) fn with_programs(
        ssh: PathBuf,
        scp: PathBuf,
        sshpass: Option<PathBuf>,
        credentials: &Credentials,
        options: &ConnectionOptions,
    ) -> Self {
        let (identity, password) = match &credentials.secret {
            AuthSecret::Password(p) => (None, Some(Zeroizing::new(p.expose_secret().clone()))),
            AuthSecret::KeyFile { path, passphrase } => {
                if passphrase.is_some() {
                    warn!("ssh cannot take a key passphrase non-interactively; relying on ssh-agent");
                }
                (Some(path.clone()), None)
            }
        };
        Self {
            ssh,
            scp,
            sshpass,
            host: credentials.host.clone(),
            port: credentials.port,
            username: credentials.username.clone(),
            identity,
            password,
            options: options.clone(),
        }
    }

    fn common_options(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut opt = |value: String| {
            args.push("-o".into());
            args.push(value.into());
        };
        opt(format!("ConnectTimeout={}", self.options.connect_timeout_secs));
        let strict = match self.options.host_key_policy {
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Strict => "yes",
            HostKeyPolicy::Ignore => "no",
        };
        opt(format!("StrictHostKeyChecking={}", strict));
        if self.options.host_key_policy == HostKeyPolicy::Ignore {
            opt("UserKnownHostsFile=/dev/null".into());
        } else if let Some(path) = &self.options.known_hosts_path {
            opt(format!("UserKnownHostsFile={}", path.display()));
        }
        if self.options.keepalive_interval_secs > 0 {
            opt(format!("ServerAliveInterval={}", self.options.keepalive_interval_secs));
        }
        if self.password.is_some() {
            opt("PreferredAuthentications=password,keyboard-interactive".into());
            opt("PubkeyAuthentication=no".into());
        } else {
            opt("BatchMode=yes".into());
        }
        if let Some(identity) = &self.identity {
            opt("IdentitiesOnly=yes".into());
            args.push("-i".into());
            args.push(identity.clone().into_os_string());
        }
        if self.options.compress {
            args.push("-C".into());
        }
        args
    }

    fn ssh_args(&self, remote_command: &str) -> Vec<OsString> {
        let mut args = self.common_options();
        args.push("-p".into());
        args.push(self.port.to_string().into());
        args.push("--".into());
        args.push(format!("{}@{}", self.username, self.host).into());
        args.push(remote_command.into());
        args
    }

    fn scp_args(&self, item: &TransferItem, remote_target: &str) -> Vec<OsString> {
        let mut args = self.common_options();
        args.push("-P".into());
        args.push(self.port.to_string().into());
        // -p keeps modes and times, matching the ssh2 transport.
        args.push("-p".into());
        if item.is_dir() {
            args.push("-r".into());
        }
        args.push("--".into());
        args.push(item.local_path.clone().into_os_string());
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        args.push(format!("{}@{}:{}", self.username, host, shell_escape(remote_target)).into());
        args
    }

    /// Final program and argv, routed through `sshpass -e` for passwords.
    fn invocation(&self, program: &Path, args: Vec<OsString>) -> (PathBuf, Vec<OsString>) {
        match (&self.sshpass, &self.password) {
            (Some(sshpass), Some(_)) => {
                let mut wrapped: Vec<OsString> = vec!["-e".into(), program.as_os_str().to_owned()];
                wrapped.extend(args);
                (sshpass.clone(), wrapped)
            }
            _ => (program.to_path_buf(), args),
        }
    }

    async fn execute(
        &self,
        program: &Path,
        args: Vec<OsString>,
        cancel: Option<&CancellationToken>,
    ) -> DeliveryResult<Output> {
        let (program, args) = self.invocation(program, args);
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.password {
            command.env("SSHPASS", password.as_str());
        }

        let output = command.output();
        let result = match cancel {
            // Dropping the output future kills the child.
            Some(cancel) => tokio::select! {
                out = output => out,
                _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            },
            None => output.await,
        };
        result.map_err(|e| {
            DeliveryError::unexpected(format!("Failed to run '{}': {}", program.display(), e))
        })
    }

    /// Map a failed process to the error taxonomy.
    fn classify_failure(&self, code: Option<i32>, stderr: &str, command: &str) -> DeliveryError {
        let code = code.unwrap_or(-1);
        let stderr = stderr.trim().to_string();
        let with_password = self.password.is_some();

        // Remote programs report "Permission denied" too; only ssh's own
        // rejection ("Permission denied (publickey,password).") exits 255.
        let ssh_rejected = code == SSH_CONNECTION_ERROR && stderr.contains("Permission denied (");
        if (with_password && code == SSHPASS_BAD_PASSWORD) || ssh_rejected {
            return DeliveryError::AuthenticationFailure {
                host: self.host.clone(),
                username: self.username.clone(),
                message: if stderr.is_empty() {
                    "Password rejected".into()
                } else {
                    stderr
                },
            };
        }
        if with_password && code == SSHPASS_UNKNOWN_HOST_KEY {
            return DeliveryError::ConnectionFailure {
                host: self.host.clone(),
                port: self.port,
                message: "Host key is unknown; add it to known_hosts first".into(),
            };
        }
        if code == SSH_CONNECTION_ERROR || stderr.contains("Host key verification failed") {
            return DeliveryError::ConnectionFailure {
                host: self.host.clone(),
                port: self.port,
                message: if stderr.is_empty() {
                    format!("ssh exited with status {}", code)
                } else {
                    stderr
                },
            };
        }
        DeliveryError::RemoteCommandFailure {
            command: command.to_string(),
            exit_code: code,
            stderr,
        }
    }

    async fn remote(&self, remote_command: &str) -> DeliveryResult<String> {
        let output = self
            .execute(&self.ssh, self.ssh_args(remote_command), None)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.classify_failure(output.status.code(), &stderr, remote_command));
        }
        debug!("Remote command '{}' succeeded", remote_command);
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn locate(program: &str) -> DeliveryResult<PathBuf> {
    which::which(program).map_err(|_| DeliveryError::MissingDependency(program.to_string()))
}

#[async_trait]
impl DeliveryTransport for OpenSshTransport {
    async fn ensure_directory(&mut self, path: &RemoteDestination) -> DeliveryResult<()> {
        self.remote(&mkdir_command(path)).await.map(|_| ())
    }

    async fn upload_item(
        &mut self,
        item: &TransferItem,
        destination: &RemoteDestination,
        cancel: &CancellationToken,
    ) -> DeliveryResult<()> {
        let target = upload_target(item, destination);
        let output = self
            .execute(&self.scp, self.scp_args(item, &target), Some(cancel))
            .await?;
        if output.status.success() {
            debug!("scp copied '{}' to {}", item.local_path.display(), target);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let description = format!("scp {} {}", item.local_path.display(), target);
        match self.classify_failure(output.status.code(), &stderr, &description) {
            DeliveryError::RemoteCommandFailure { exit_code, stderr, .. } => Err(
                DeliveryError::transport(format!("scp exited with status {}: {}", exit_code, stderr)),
            ),
            other => Err(other),
        }
    }

    async fn list_directory(&mut self, path: &RemoteDestination) -> DeliveryResult<Vec<String>> {
        let output = self.remote(&list_command(path)).await?;
        Ok(parse_listing(&output))
    }

    async fn close(&mut self) {
        debug!("OpenSSH transport for {}@{} released", self.username, self.host);
    }
}
