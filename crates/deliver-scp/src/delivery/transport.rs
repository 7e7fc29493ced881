// ── Transport abstraction ────────────────────────────────────────────────────

use crate::delivery::error::DeliveryResult;
use crate::delivery::types::{Credentials, RemoteDestination, TransferItem, TransferItemKind};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One authenticated session to the remote host.
///
/// Operations are never retried internally; callers decide what a failure
/// means for the run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryTransport: Send {
    /// `mkdir -p` semantics: succeeds when the directory already exists.
    async fn ensure_directory(&mut self, path: &RemoteDestination) -> DeliveryResult<()>;

    /// Files land at `destination + basename`; directories are copied
    /// recursively into `destination`, keeping their basename.
    async fn upload_item(
        &mut self,
        item: &TransferItem,
        destination: &RemoteDestination,
        cancel: &CancellationToken,
    ) -> DeliveryResult<()>;

    /// Detailed listing, one raw line per entry.
    async fn list_directory(&mut self, path: &RemoteDestination) -> DeliveryResult<Vec<String>>;

    /// Release the session. Errors are logged, not returned.
    async fn close(&mut self);
}

/// Opens transports. Authentication, connection and missing-binary failures
/// surface here as distinct [`DeliveryError`](crate::delivery::DeliveryError)
/// variants.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> DeliveryResult<Box<dyn DeliveryTransport>>;
}

// ── Remote command helpers ───────────────────────────────────────────────────

/// Single-quote a value for a POSIX remote shell.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn mkdir_command(path: &RemoteDestination) -> String {
    format!("mkdir -p {}", shell_escape(path.as_str()))
}

pub fn list_command(path: &RemoteDestination) -> String {
    format!("ls -lh {}", shell_escape(path.as_str()))
}

/// Where an item ends up on the remote side.
pub fn upload_target(item: &TransferItem, destination: &RemoteDestination) -> String {
    match item.kind {
        TransferItemKind::File => destination.join(&item.basename),
        TransferItemKind::Directory => destination.as_str().to_string(),
    }
}

/// Split `ls -lh` output into entry lines, dropping the `total` header.
pub fn parse_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim_end())
        .filter(|l| !l.is_empty() && !l.starts_with("total "))
        .map(|l| l.to_string())
        .collect()
}

/// Whether an `ls -l` style listing shows an entry called `name`.
pub fn listing_contains(entries: &[String], name: &str) -> bool {
    let suffix = format!(" {}", name);
    let link_prefix = format!(" {} -> ", name);
    entries
        .iter()
        .any(|line| line == name || line.ends_with(&suffix) || line.contains(&link_prefix))
}
