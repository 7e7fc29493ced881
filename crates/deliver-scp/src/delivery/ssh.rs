// ── libssh2 transport ────────────────────────────────────────────────────────

use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::transport::{
    list_command, mkdir_command, parse_listing, shell_escape, DeliveryTransport, TransportConnector,
};
use crate::delivery::types::*;
use async_trait::async_trait;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use ssh2::{CheckResult, HashType, KnownHostFileKind, KnownHosts, Session};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 1_048_576;
/// Directories created per remote `mkdir -p` invocation.
const MKDIR_BATCH: usize = 64;

// ── Connector ────────────────────────────────────────────────────────────────

/// Opens one libssh2 session per run and reuses it for every phase.
#[derive(Debug, Clone, Default)]
pub struct Ssh2Connector {
    options: ConnectionOptions,
}

impl Ssh2Connector {
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl TransportConnector for Ssh2Connector {
    async fn connect(&self, credentials: &Credentials) -> DeliveryResult<Box<dyn DeliveryTransport>> {
        let transport = Ssh2Transport::connect(credentials, &self.options).await?;
        Ok(Box::new(transport))
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct Ssh2Transport {
    session: Session,
    address: String,
}

impl Ssh2Transport {
    /// TCP connect, handshake, host key check and authentication.
    pub async fn connect(
        credentials: &Credentials,
        options: &ConnectionOptions,
    ) -> DeliveryResult<Self> {
        let host = credentials.host.clone();
        let port = credentials.port;
        let username = credentials.username.clone();
        let secret = credentials.secret.duplicate();
        let options = options.clone();

        info!("SSH connecting to {}:{} as {}", host, port, username);
        let session = tokio::task::spawn_blocking(move || {
            open_session(&host, port, &username, &secret, &options)
        })
        .await??;

        Ok(Self {
            session,
            address: credentials.address(),
        })
    }
}

#[async_trait]
impl DeliveryTransport for Ssh2Transport {
    async fn ensure_directory(&mut self, path: &RemoteDestination) -> DeliveryResult<()> {
        let session = self.session.clone();
        let command = mkdir_command(path);
        tokio::task::spawn_blocking(move || exec_checked(&session, &command)).await??;
        Ok(())
    }

    async fn upload_item(
        &mut self,
        item: &TransferItem,
        destination: &RemoteDestination,
        cancel: &CancellationToken,
    ) -> DeliveryResult<()> {
        let session = self.session.clone();
        let item = item.clone();
        let destination = destination.clone();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || match item.kind {
            TransferItemKind::File => {
                let remote = destination.join(&item.basename);
                send_file(&session, &item.local_path, &remote, &cancel).map(|_| ())
            }
            TransferItemKind::Directory => send_directory(&session, &item, &destination, &cancel),
        })
        .await?
    }

    async fn list_directory(&mut self, path: &RemoteDestination) -> DeliveryResult<Vec<String>> {
        let session = self.session.clone();
        let command = list_command(path);
        let output = tokio::task::spawn_blocking(move || exec_checked(&session, &command)).await??;
        Ok(parse_listing(&output))
    }

    async fn close(&mut self) {
        let session = self.session.clone();
        let address = self.address.clone();
        let result = tokio::task::spawn_blocking(move || {
            session.disconnect(None, "Delivery finished", None)
        })
        .await;
        match result {
            Ok(Ok(())) => debug!("SSH session to {} closed", address),
            Ok(Err(e)) => debug!("SSH disconnect from {} failed: {}", address, e),
            Err(e) => warn!("SSH disconnect task for {} failed: {}", address, e),
        }
    }
}

// ── Session setup (blocking) ─────────────────────────────────────────────────

fn open_session(
    host: &str,
    port: u16,
    username: &str,
    secret: &AuthSecret,
    options: &ConnectionOptions,
) -> DeliveryResult<Session> {
    let conn_err = |message: String| DeliveryError::ConnectionFailure {
        host: host.to_string(),
        port,
        message,
    };

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| conn_err(format!("Cannot resolve host: {}", e)))?
        .collect();

    let mut last_error = None;
    let mut tcp = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, options.connect_timeout()) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| match last_error {
        Some(e) => conn_err(format!("TCP connection failed: {}", e)),
        None => conn_err("Host resolved to no addresses".into()),
    })?;

    let mut session = Session::new()
        .map_err(|e| DeliveryError::unexpected(format!("Failed to create SSH session: {}", e)))?;
    if options.compress {
        session.set_compress(true);
    }
    // Bounded handshake and auth; transfers afterwards wait on the remote.
    session.set_timeout(timeout_millis(options.connect_timeout_secs));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| conn_err(format!("SSH handshake failed: {}", e)))?;

    verify_host_key(&session, host, port, options)?;

    authenticate(&session, username, secret).map_err(|message| {
        DeliveryError::AuthenticationFailure {
            host: host.to_string(),
            username: username.to_string(),
            message,
        }
    })?;
    info!("SSH authenticated to {}:{} via {}", host, port, secret.method());

    session.set_timeout(0);
    if options.keepalive_interval_secs > 0 {
        session.set_keepalive(true, options.keepalive_interval_secs.min(u32::MAX as u64) as u32);
    }
    Ok(session)
}

fn timeout_millis(secs: u64) -> u32 {
    secs.saturating_mul(1000).min(u32::MAX as u64) as u32
}

fn authenticate(session: &Session, username: &str, secret: &AuthSecret) -> Result<(), String> {
    match secret {
        AuthSecret::Password(password) => session
            .userauth_password(username, password.expose_secret())
            .map_err(|e| e.to_string())?,
        AuthSecret::KeyFile { path, passphrase } => {
            if !path.exists() {
                return Err(format!("Key file '{}' does not exist", path.display()));
            }
            let passphrase = passphrase.as_ref().map(|p| p.expose_secret().as_str());
            session
                .userauth_pubkey_file(username, None, path, passphrase)
                .map_err(|e| e.to_string())?
        }
    }

    if !session.authenticated() {
        return Err("Server did not accept the credentials".into());
    }
    Ok(())
}

fn verify_host_key(
    session: &Session,
    host: &str,
    port: u16,
    options: &ConnectionOptions,
) -> DeliveryResult<()> {
    let conn_err = |message: String| DeliveryError::ConnectionFailure {
        host: host.to_string(),
        port,
        message,
    };

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| conn_err("Server presented no host key".into()))?;

    if let Some(hash) = session.host_key_hash(HashType::Sha256) {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, hash);
        info!("Host key for {}:{} is SHA256:{}", host, port, encoded);
    }

    if options.host_key_policy == HostKeyPolicy::Ignore {
        return Ok(());
    }

    let Some(path) = options.resolved_known_hosts_path() else {
        if options.host_key_policy == HostKeyPolicy::Strict {
            return Err(conn_err("No known_hosts file available for strict checking".into()));
        }
        warn!("No known_hosts location; accepting host key for {}", host);
        return Ok(());
    };

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| DeliveryError::unexpected(format!("Cannot initialise known_hosts: {}", e)))?;
    if path.exists() {
        known_hosts
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(|e| conn_err(format!("Cannot read '{}': {}", path.display(), e)))?;
    }

    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(conn_err(format!(
            "Host key does not match the entry in '{}'",
            path.display()
        ))),
        CheckResult::Failure => Err(conn_err("Host key check failed".into())),
        CheckResult::NotFound if options.host_key_policy == HostKeyPolicy::Strict => Err(conn_err(
            format!("Host is not listed in '{}'", path.display()),
        )),
        CheckResult::NotFound => {
            let entry = if port == 22 {
                host.to_string()
            } else {
                format!("[{}]:{}", host, port)
            };
            known_hosts
                .add(&entry, key, "added by deliver", key_type.into())
                .map_err(|e| DeliveryError::unexpected(format!("Cannot record host key: {}", e)))?;
            if save_known_hosts(&known_hosts, &path) {
                info!("Added {} to '{}'", entry, path.display());
            }
            Ok(())
        }
    }
}

/// Write the known_hosts file; a failure is logged and reported as `false`.
fn save_known_hosts(known_hosts: &KnownHosts, path: &Path) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Could not create '{}': {}", parent.display(), e);
            return false;
        }
    }
    match known_hosts.write_file(path, KnownHostFileKind::OpenSSH) {
        Ok(()) => true,
        Err(e) => {
            warn!("Could not write '{}': {}", path.display(), e);
            false
        }
    }
}

// ── Remote commands (blocking) ───────────────────────────────────────────────

/// Run `command` and return its stdout; a non-zero exit is an error.
fn exec_checked(session: &Session, command: &str) -> DeliveryResult<String> {
    let mut channel = session
        .channel_session()
        .map_err(|e| DeliveryError::transport(format!("Failed to open channel: {}", e)))?;

    channel.exec(command).map_err(|e| {
        DeliveryError::transport(format!("Failed to execute command '{}': {}", command, e))
    })?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| DeliveryError::transport(format!("Failed to read command output: {}", e)))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| DeliveryError::transport(format!("Failed to read command errors: {}", e)))?;

    channel
        .wait_close()
        .map_err(|e| DeliveryError::transport(format!("Failed waiting for close: {}", e)))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| DeliveryError::transport(format!("No exit status: {}", e)))?;

    if exit_code != 0 {
        // Commands run with `2>&1` report their errors on stdout.
        let stderr = if stderr.trim().is_empty() { &stdout } else { &stderr };
        return Err(DeliveryError::RemoteCommandFailure {
            command: command.to_string(),
            exit_code,
            stderr: stderr.trim().to_string(),
        });
    }
    debug!("Remote command '{}' succeeded", command);
    Ok(stdout)
}

// ── SCP upload (blocking) ────────────────────────────────────────────────────

fn send_file(
    session: &Session,
    local: &Path,
    remote: &str,
    cancel: &CancellationToken,
) -> DeliveryResult<u64> {
    let metadata = std::fs::metadata(local).map_err(|e| {
        DeliveryError::transport(format!("Cannot read local file '{}': {}", local.display(), e))
    })?;
    let total_bytes = metadata.len();

    let mut channel = session
        .scp_send(Path::new(remote), file_mode(&metadata), total_bytes, file_times(&metadata))
        .map_err(|e| DeliveryError::transport(format!("SCP send init for '{}' failed: {}", remote, e)))?;

    let mut local_file = std::fs::File::open(local)
        .map_err(|e| DeliveryError::transport(format!("Cannot open '{}': {}", local.display(), e)))?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut transferred: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        let n = local_file
            .read(&mut buffer)
            .map_err(|e| DeliveryError::transport(format!("Local read error: {}", e)))?;
        if n == 0 {
            break;
        }
        channel
            .write_all(&buffer[..n])
            .map_err(|e| DeliveryError::transport(format!("SCP write error: {}", e)))?;
        transferred += n as u64;
    }

    // EOF handshake so the remote scp commits the file.
    channel
        .send_eof()
        .map_err(|e| DeliveryError::transport(format!("Failed to send EOF: {}", e)))?;
    channel
        .wait_eof()
        .map_err(|e| DeliveryError::transport(format!("Failed waiting for EOF: {}", e)))?;
    channel
        .close()
        .map_err(|e| DeliveryError::transport(format!("Failed to close channel: {}", e)))?;
    channel
        .wait_close()
        .map_err(|e| DeliveryError::transport(format!("Failed waiting for close: {}", e)))?;

    debug!("SCP uploaded {} bytes to {}", transferred, remote);
    Ok(transferred)
}

/// Recreate the local tree under `destination/<basename>`: directories first,
/// then every file. All files are attempted before the first error is reported.
fn send_directory(
    session: &Session,
    item: &TransferItem,
    destination: &RemoteDestination,
    cancel: &CancellationToken,
) -> DeliveryResult<()> {
    let remote_root = destination.join(&item.basename);

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut walk_errors = Vec::new();
    for entry in WalkDir::new(&item.local_path).follow_links(true) {
        match entry {
            Ok(e) if e.file_type().is_dir() => dirs.push(e),
            Ok(e) if e.file_type().is_file() => files.push(e),
            Ok(e) => debug!("Skipping special file '{}'", e.path().display()),
            Err(e) => walk_errors.push(format!("walk: {}", e)),
        }
    }

    // WalkDir is pre-order, so parents come before children.
    let remote_dirs: Vec<String> = dirs
        .iter()
        .map(|d| remote_child(&remote_root, &item.local_path, d.path()))
        .collect();
    for batch in remote_dirs.chunks(MKDIR_BATCH) {
        exec_checked(session, &mkdir_batch_command(batch))?;
    }

    let mut file_errors = Vec::new();

    for file in &files {
        if cancel.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        let remote = remote_child(&remote_root, &item.local_path, file.path());
        match send_file(session, file.path(), &remote, cancel) {
            Ok(_) => {}
            Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
            Err(e) => {
                warn!("SCP dir upload: failed '{}': {}", file.path().display(), e);
                file_errors.push(format!("{}: {}", file.path().display(), e));
            }
        }
    }

    if file_errors.is_empty() && walk_errors.is_empty() {
        info!(
            "SCP uploaded directory '{}' ({} files) to {}",
            item.local_path.display(),
            files.len(),
            remote_root
        );
        Ok(())
    } else {
        Err(DeliveryError::transport(directory_failure(
            &item.basename,
            files.len(),
            &file_errors,
            &walk_errors,
        )))
    }
}

/// One `mkdir -p` for a batch of directories. Stderr is folded into stdout so
/// a long error list cannot fill the unread stderr window.
fn mkdir_batch_command(dirs: &[String]) -> String {
    let quoted: Vec<String> = dirs.iter().map(|d| shell_escape(d)).collect();
    format!("mkdir -p {} 2>&1", quoted.join(" "))
}

fn directory_failure(
    basename: &str,
    file_count: usize,
    file_errors: &[String],
    walk_errors: &[String],
) -> String {
    let mut parts = Vec::new();
    if !file_errors.is_empty() {
        parts.push(format!("{} of {} files failed", file_errors.len(), file_count));
    }
    if !walk_errors.is_empty() {
        parts.push(format!("{} entries could not be read", walk_errors.len()));
    }
    let details: Vec<&str> = file_errors
        .iter()
        .chain(walk_errors)
        .map(String::as_str)
        .collect();
    format!("'{}': {}: {}", basename, parts.join(", "), details.join("; "))
}

/// Remote counterpart of `local`, a path somewhere under `local_root`.
fn remote_child(remote_root: &str, local_root: &Path, local: &Path) -> String {
    let relative = local.strip_prefix(local_root).unwrap_or(local);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        remote_root.to_string()
    } else {
        format!("{}/{}", remote_root, parts.join("/"))
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> i32 {
    0o644
}

/// (mtime, atime) in seconds, when the platform reports them.
fn file_times(metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    let mtime = metadata
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    let atime = metadata
        .accessed()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(mtime);
    Some((mtime, atime))
}
