// ── Types ─────────────────────────────────────────────────────────────────────

use crate::delivery::error::DeliveryError;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout_secs() -> u64 {
    20
}
fn default_keepalive_secs() -> u64 {
    60
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// Secret half of the credentials. Both variants zeroize on drop.
#[derive(Debug)]
pub enum AuthSecret {
    Password(SecretString),
    /// Private key on disk, with an optional passphrase.
    KeyFile {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl AuthSecret {
    pub fn password(value: impl Into<String>) -> Self {
        AuthSecret::Password(SecretString::new(value.into()))
    }

    pub fn key_file(path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        AuthSecret::KeyFile {
            path: path.into(),
            passphrase: passphrase.map(SecretString::new),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AuthSecret::Password(p) => p.expose_secret().is_empty(),
            AuthSecret::KeyFile { path, .. } => path.as_os_str().is_empty(),
        }
    }

    /// Owned copy for a blocking worker thread. Also zeroized on drop.
    pub(crate) fn duplicate(&self) -> AuthSecret {
        match self {
            AuthSecret::Password(p) => {
                AuthSecret::Password(SecretString::new(p.expose_secret().clone()))
            }
            AuthSecret::KeyFile { path, passphrase } => AuthSecret::KeyFile {
                path: path.clone(),
                passphrase: passphrase
                    .as_ref()
                    .map(|p| SecretString::new(p.expose_secret().clone())),
            },
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            AuthSecret::Password(_) => "password",
            AuthSecret::KeyFile { .. } => "publickey-file",
        }
    }
}

/// Per-run credentials. Never persisted; dropped when the run ends.
#[derive(Debug)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: AuthSecret,
}

impl Credentials {
    pub fn new(host: impl Into<String>, username: impl Into<String>, secret: AuthSecret) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            secret,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Connection options ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyPolicy {
    /// Trust and record unknown hosts, reject changed keys.
    #[default]
    AcceptNew,
    /// Only hosts already present in known_hosts are accepted.
    Strict,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds between keep-alive packets; 0 disables them.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_secs(),
            compress: false,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
        }
    }
}

impl ConnectionOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn resolved_known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts_path
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")))
    }
}

// ── Transfer plan ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferItemKind {
    File,
    Directory,
}

/// One local entry to upload. `local_path` is absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub kind: TransferItemKind,
    pub local_path: PathBuf,
    pub basename: String,
}

impl TransferItem {
    pub fn new(kind: TransferItemKind, local_path: PathBuf) -> Self {
        let basename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| local_path.to_string_lossy().to_string());
        Self {
            kind,
            local_path,
            basename,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == TransferItemKind::Directory
    }
}

/// Snapshot of what a source spec resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPlan {
    pub items: Vec<TransferItem>,
    /// The source was expanded as a glob rather than naming one path.
    pub from_wildcard: bool,
}

impl TransferPlan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TransferItem> {
        self.items.iter()
    }
}

// ── Remote destination ───────────────────────────────────────────────────────

/// Normalized remote directory, always ending in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RemoteDestination(String);

impl RemoteDestination {
    pub(crate) fn from_normalized(path: String) -> Self {
        debug_assert!(path.ends_with('/'));
        RemoteDestination(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote path of an entry placed directly inside this directory.
    pub fn join(&self, name: &str) -> String {
        format!("{}{}", self.0, name.trim_start_matches('/'))
    }
}

impl fmt::Display for RemoteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Progress events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryPhase {
    Idle,
    Validating,
    EnsuringDirectory,
    Resolving,
    Uploading,
    Verifying,
    Done,
    Aborted,
}

impl fmt::Display for DeliveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryPhase::Idle => "idle",
            DeliveryPhase::Validating => "validating",
            DeliveryPhase::EnsuringDirectory => "ensuring-directory",
            DeliveryPhase::Resolving => "resolving",
            DeliveryPhase::Uploading => "uploading",
            DeliveryPhase::Verifying => "verifying",
            DeliveryPhase::Done => "done",
            DeliveryPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: DeliveryPhase,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    /// Zero-based plan position for events raised while uploading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
}

impl ProgressEvent {
    pub fn new(phase: DeliveryPhase, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            item_index: None,
        }
    }

    pub fn info(phase: DeliveryPhase, message: impl Into<String>) -> Self {
        Self::new(phase, Severity::Info, message)
    }

    pub fn warning(phase: DeliveryPhase, message: impl Into<String>) -> Self {
        Self::new(phase, Severity::Warning, message)
    }

    pub fn error(phase: DeliveryPhase, message: impl Into<String>) -> Self {
        Self::new(phase, Severity::Error, message)
    }

    pub fn with_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub item: TransferItem,
    pub remote_path: String,
    /// `ItemTransferFailure` when the upload failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

impl ItemOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum Verification {
    NotAttempted,
    Listed {
        entries: Vec<String>,
        /// Uploaded basenames absent from the listing.
        missing: Vec<String>,
    },
    Failed {
        error: DeliveryError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeStatus {
    Verified,
    CompletedUnverified,
    PartialFailure,
    /// Wildcard matched nothing; no upload was attempted.
    EmptyResolution,
    Aborted,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeStatus::Verified => "verified",
            OutcomeStatus::CompletedUnverified => "completed (unverified)",
            OutcomeStatus::PartialFailure => "partial failure",
            OutcomeStatus::EmptyResolution => "nothing to transfer",
            OutcomeStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub run_id: String,
    pub status: OutcomeStatus,
    pub destination: Option<RemoteDestination>,
    pub items: Vec<ItemOutcome>,
    pub verification: Verification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<DeliveryError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransferOutcome {
    pub fn succeeded_count(&self) -> usize {
        self.items.iter().filter(|i| i.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.items.len() - self.succeeded_count()
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| !i.succeeded())
    }

    pub fn is_aborted(&self) -> bool {
        self.status == OutcomeStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connection_options() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.connect_timeout(), Duration::from_secs(20));
        assert_eq!(opts.keepalive_interval_secs, 60);
        assert_eq!(opts.host_key_policy, HostKeyPolicy::AcceptNew);
    }

    #[test]
    fn test_connection_options_from_partial_json() {
        let opts: ConnectionOptions =
            serde_json::from_str(r#"{"hostKeyPolicy":"strict","compress":true}"#).unwrap();
        assert_eq!(opts.host_key_policy, HostKeyPolicy::Strict);
        assert!(opts.compress);
        assert_eq!(opts.connect_timeout_secs, 20);
    }

    #[test]
    fn test_credentials_default_port() {
        let creds = Credentials::new("files.example.org", "deploy", AuthSecret::password("pw"));
        assert_eq!(creds.port, 22);
        assert_eq!(creds.with_port(2222).address(), "files.example.org:2222");
    }

    #[test]
    fn test_empty_secrets() {
        assert!(AuthSecret::password("").is_empty());
        assert!(!AuthSecret::password("hunter2").is_empty());
        assert!(AuthSecret::key_file("", None).is_empty());
        assert!(!AuthSecret::key_file("/home/u/.ssh/id_ed25519", None).is_empty());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let creds = Credentials::new("h", "u", AuthSecret::password("hunter2"));
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_transfer_item_basename() {
        let item = TransferItem::new(TransferItemKind::File, PathBuf::from("/tmp/proj/a.txt"));
        assert_eq!(item.basename, "a.txt");
        assert!(!item.is_dir());
    }

    #[test]
    fn test_destination_join() {
        let dest = RemoteDestination::from_normalized("/data/2024/".into());
        assert_eq!(dest.join("a.txt"), "/data/2024/a.txt");
        assert_eq!(dest.to_string(), "/data/2024/");
    }
}
