// ── Transfer orchestrator ────────────────────────────────────────────────────
//
// Validate -> ensure directory -> resolve -> upload -> verify. One transport
// per run, closed on every path once it was opened.

use crate::delivery::error::{DeliveryError, DeliveryResult};
use crate::delivery::progress::ProgressSink;
use crate::delivery::remote_path::{build_destination, validate_subdir_token};
use crate::delivery::resolver::resolve;
use crate::delivery::transport::{listing_contains, upload_target, DeliveryTransport, TransportConnector};
use crate::delivery::types::*;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    /// Refuse subdirectory tokens containing `..` or control characters.
    #[serde(default = "default_true")]
    pub reject_traversal: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            reject_traversal: true,
        }
    }
}

/// Inputs of one run. Credentials are consumed and dropped by the run.
#[derive(Debug)]
pub struct DeliveryRequest {
    pub source_spec: String,
    pub credentials: Credentials,
    pub remote_base_dir: String,
    pub subdir_token: String,
}

pub struct TransferOrchestrator<C> {
    connector: C,
    options: DeliveryOptions,
}

impl<C: TransportConnector> TransferOrchestrator<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            options: DeliveryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Execute one delivery. Never fails: every error ends up in the
    /// returned outcome, either per item or as the abort reason.
    pub async fn run(
        &self,
        request: DeliveryRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> TransferOutcome {
        let DeliveryRequest {
            source_spec,
            credentials,
            remote_base_dir,
            subdir_token,
        } = request;
        let mut run = RunState::new(sink);
        info!("Delivery {} started", run.run_id);

        run.enter(DeliveryPhase::Validating);
        if let Err(e) = self.validate(&source_spec, &credentials, &subdir_token) {
            return run.abort(e);
        }
        let destination = build_destination(&remote_base_dir, &subdir_token);
        run.destination = Some(destination.clone());
        run.emit(ProgressEvent::info(
            DeliveryPhase::Validating,
            format!("Delivering '{}' to {}", source_spec.trim(), destination),
        ));
        if cancel.is_cancelled() {
            return run.abort(DeliveryError::Cancelled);
        }

        run.enter(DeliveryPhase::EnsuringDirectory);
        let label = format!("{}@{}", credentials.username, credentials.address());
        let connected = tokio::select! {
            result = self.connector.connect(&credentials) => result,
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
        };
        // The secret is not needed past the handshake.
        drop(credentials);
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => return run.abort(e),
        };
        run.emit(ProgressEvent::info(
            DeliveryPhase::EnsuringDirectory,
            format!("Connected to {}", label),
        ));

        let result = run
            .deliver(transport.as_mut(), &source_spec, &destination, cancel)
            .await;
        transport.close().await;
        debug!("Transport for {} closed", label);

        match result {
            Ok(status) => run.finish(status),
            Err(e) => run.abort(e),
        }
    }

    fn validate(
        &self,
        source_spec: &str,
        credentials: &Credentials,
        subdir_token: &str,
    ) -> DeliveryResult<()> {
        if source_spec.trim().is_empty() {
            return Err(DeliveryError::invalid_input("No source file or directory given"));
        }
        if credentials.host.trim().is_empty() {
            return Err(DeliveryError::invalid_input("No remote host given"));
        }
        if credentials.username.trim().is_empty() {
            return Err(DeliveryError::invalid_input("No username given"));
        }
        if credentials.secret.is_empty() {
            return Err(DeliveryError::invalid_input(
                "A password or private key file is required",
            ));
        }
        if credentials.host.starts_with('-') || credentials.username.starts_with('-') {
            return Err(DeliveryError::invalid_input(
                "Host and username must not start with '-'",
            ));
        }
        if self.options.reject_traversal {
            validate_subdir_token(subdir_token)?;
        }
        Ok(())
    }
}

/// Mutable bookkeeping of one run.
struct RunState<'a> {
    run_id: String,
    started_at: chrono::DateTime<Utc>,
    sink: &'a dyn ProgressSink,
    phase: DeliveryPhase,
    destination: Option<RemoteDestination>,
    items: Vec<ItemOutcome>,
    verification: Verification,
}

impl<'a> RunState<'a> {
    fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            sink,
            phase: DeliveryPhase::Idle,
            destination: None,
            items: Vec::new(),
            verification: Verification::NotAttempted,
        }
    }

    fn enter(&mut self, phase: DeliveryPhase) {
        debug!("Delivery {}: {} -> {}", self.run_id, self.phase, phase);
        self.phase = phase;
    }

    fn emit(&self, event: ProgressEvent) {
        self.sink.emit(event);
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> DeliveryResult<()> {
        if cancel.is_cancelled() {
            Err(DeliveryError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn deliver(
        &mut self,
        transport: &mut dyn DeliveryTransport,
        source_spec: &str,
        destination: &RemoteDestination,
        cancel: &CancellationToken,
    ) -> DeliveryResult<OutcomeStatus> {
        self.check_cancel(cancel)?;
        transport.ensure_directory(destination).await?;
        self.emit(ProgressEvent::info(
            DeliveryPhase::EnsuringDirectory,
            format!("Remote directory {} is ready", destination),
        ));

        self.enter(DeliveryPhase::Resolving);
        self.check_cancel(cancel)?;
        let plan = resolve(source_spec)?;
        if plan.is_empty() {
            self.emit(ProgressEvent::warning(
                DeliveryPhase::Resolving,
                format!("No files match '{}'; nothing to transfer", source_spec.trim()),
            ));
            return Ok(OutcomeStatus::EmptyResolution);
        }
        self.emit(ProgressEvent::info(
            DeliveryPhase::Resolving,
            format!("{} item(s) to upload", plan.len()),
        ));

        self.enter(DeliveryPhase::Uploading);
        let total = plan.len();
        for (index, item) in plan.iter().enumerate() {
            self.check_cancel(cancel)?;
            let remote_path = upload_target(item, destination);
            debug!("Uploading {} -> {}", item.local_path.display(), remote_path);

            match transport.upload_item(item, destination, cancel).await {
                Ok(()) => {
                    self.emit(
                        ProgressEvent::info(
                            DeliveryPhase::Uploading,
                            format!("Uploaded {} ({}/{})", item.basename, index + 1, total),
                        )
                        .with_item(index),
                    );
                    self.items.push(ItemOutcome {
                        item: item.clone(),
                        remote_path,
                        error: None,
                    });
                }
                Err(e) => {
                    let failure =
                        DeliveryError::item_failure(item.local_path.display().to_string(), &e);
                    self.emit(
                        ProgressEvent::error(
                            DeliveryPhase::Uploading,
                            format!("{} ({}/{})", failure, index + 1, total),
                        )
                        .with_item(index),
                    );
                    self.items.push(ItemOutcome {
                        item: item.clone(),
                        remote_path,
                        error: Some(failure),
                    });
                    if e.is_session_fatal() {
                        return Err(e);
                    }
                }
            }
        }

        self.enter(DeliveryPhase::Verifying);
        self.check_cancel(cancel)?;
        let any_failed = self.items.iter().any(|i| !i.succeeded());
        let listed = match transport.list_directory(destination).await {
            Ok(entries) => {
                let missing: Vec<String> = self
                    .items
                    .iter()
                    .filter(|i| i.succeeded() && !listing_contains(&entries, &i.item.basename))
                    .map(|i| i.item.basename.clone())
                    .collect();
                if missing.is_empty() {
                    self.emit(ProgressEvent::info(
                        DeliveryPhase::Verifying,
                        format!("Listing of {} shows {} entries", destination, entries.len()),
                    ));
                } else {
                    self.emit(ProgressEvent::warning(
                        DeliveryPhase::Verifying,
                        format!("Uploaded but not listed: {}", missing.join(", ")),
                    ));
                }
                let complete = missing.is_empty();
                self.verification = Verification::Listed { entries, missing };
                complete
            }
            Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
            Err(e) => {
                self.emit(ProgressEvent::warning(
                    DeliveryPhase::Verifying,
                    format!("Could not list {}: {}", destination, e),
                ));
                self.verification = Verification::Failed { error: e };
                false
            }
        };

        Ok(if any_failed {
            OutcomeStatus::PartialFailure
        } else if listed {
            OutcomeStatus::Verified
        } else {
            OutcomeStatus::CompletedUnverified
        })
    }

    fn finish(mut self, status: OutcomeStatus) -> TransferOutcome {
        self.enter(DeliveryPhase::Done);
        let event = match status {
            OutcomeStatus::PartialFailure => ProgressEvent::error(
                DeliveryPhase::Done,
                format!(
                    "Finished with failures: {} of {} item(s) failed",
                    self.items.iter().filter(|i| !i.succeeded()).count(),
                    self.items.len()
                ),
            ),
            OutcomeStatus::CompletedUnverified => {
                ProgressEvent::warning(DeliveryPhase::Done, format!("Finished: {}", status))
            }
            _ => ProgressEvent::info(DeliveryPhase::Done, format!("Finished: {}", status)),
        };
        self.emit(event);
        info!("Delivery {} finished: {}", self.run_id, status);
        self.into_outcome(status, None)
    }

    fn abort(mut self, reason: DeliveryError) -> TransferOutcome {
        let failed_in = self.phase;
        self.enter(DeliveryPhase::Aborted);
        self.emit(ProgressEvent::error(
            DeliveryPhase::Aborted,
            format!("Aborted during {}: {}", failed_in, reason),
        ));
        info!("Delivery {} aborted: {}", self.run_id, reason.kind());
        self.into_outcome(OutcomeStatus::Aborted, Some(reason))
    }

    fn into_outcome(self, status: OutcomeStatus, abort_reason: Option<DeliveryError>) -> TransferOutcome {
        TransferOutcome {
            run_id: self.run_id,
            status,
            destination: self.destination,
            items: self.items,
            verification: self.verification,
            abort_reason,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::progress::CollectingSink;
    use crate::delivery::transport::{MockDeliveryTransport, MockTransportConnector};

    fn request(source: &str, subdir: &str) -> DeliveryRequest {
        DeliveryRequest {
            source_spec: source.to_string(),
            credentials: Credentials::new("files.example.org", "deploy", AuthSecret::password("pw")),
            remote_base_dir: "/data/".to_string(),
            subdir_token: subdir.to_string(),
        }
    }

    fn connector_with(transport: MockDeliveryTransport) -> MockTransportConnector {
        let mut connector = MockTransportConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(Box::new(transport) as Box<dyn DeliveryTransport>));
        connector
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_before_any_command() {
        let mut connector = MockTransportConnector::new();
        connector.expect_connect().times(1).returning(|c| {
            Err(DeliveryError::AuthenticationFailure {
                host: c.host.clone(),
                username: c.username.clone(),
                message: "denied".into(),
            })
        });
        let sink = CollectingSink::new();
        let outcome = TransferOrchestrator::new(connector)
            .run(request("/tmp", ""), &sink, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Aborted);
        assert!(matches!(
            outcome.abort_reason,
            Some(DeliveryError::AuthenticationFailure { .. })
        ));
        assert!(outcome.items.is_empty());
        let last = sink.events().pop().unwrap();
        assert_eq!(last.phase, DeliveryPhase::Aborted);
        assert_eq!(last.severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_option_like_host_never_connects() {
        let mut connector = MockTransportConnector::new();
        connector.expect_connect().never();
        let mut req = request("/tmp", "");
        req.credentials.host = "-oProxyCommand=touch /tmp/x".into();

        let outcome = TransferOrchestrator::new(connector)
            .run(req, &CollectingSink::new(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.abort_reason, Some(DeliveryError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_empty_secret_never_connects() {
        let mut connector = MockTransportConnector::new();
        connector.expect_connect().never();
        let mut req = request("/tmp", "");
        req.credentials.secret = AuthSecret::password("");

        let outcome = TransferOrchestrator::new(connector)
            .run(req, &CollectingSink::new(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.abort_reason, Some(DeliveryError::InvalidInput(_))));
        assert!(outcome.destination.is_none());
    }

    #[tokio::test]
    async fn test_traversal_rejected_unless_disabled() {
        let mut connector = MockTransportConnector::new();
        connector.expect_connect().never();
        let outcome = TransferOrchestrator::new(connector)
            .run(request("/tmp", "../etc"), &CollectingSink::new(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.abort_reason, Some(DeliveryError::InvalidInput(_))));

        let mut transport = MockDeliveryTransport::new();
        transport.expect_ensure_directory().times(1).returning(|path| {
            assert_eq!(path.as_str(), "/data/../etc/");
            Err(DeliveryError::RemoteCommandFailure {
                command: "mkdir".into(),
                exit_code: 1,
                stderr: "denied".into(),
            })
        });
        transport.expect_close().times(1).return_const(());
        let outcome = TransferOrchestrator::new(connector_with(transport))
            .with_options(DeliveryOptions {
                reject_traversal: false,
            })
            .run(request("/tmp", "../etc"), &CollectingSink::new(), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome.abort_reason,
            Some(DeliveryError::RemoteCommandFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_mkdir_failure_aborts_and_closes() {
        let mut transport = MockDeliveryTransport::new();
        transport.expect_ensure_directory().times(1).returning(|_| {
            Err(DeliveryError::RemoteCommandFailure {
                command: "mkdir -p '/data/2024/'".into(),
                exit_code: 1,
                stderr: "Permission denied".into(),
            })
        });
        transport.expect_upload_item().never();
        transport.expect_list_directory().never();
        transport.expect_close().times(1).return_const(());

        let outcome = TransferOrchestrator::new(connector_with(transport))
            .run(request("/tmp", "2024"), &CollectingSink::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Aborted);
        assert_eq!(outcome.destination.unwrap().as_str(), "/data/2024/");
    }

    #[tokio::test]
    async fn test_missing_source_aborts_after_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");

        let mut transport = MockDeliveryTransport::new();
        transport.expect_ensure_directory().times(1).returning(|_| Ok(()));
        transport.expect_upload_item().never();
        transport.expect_close().times(1).return_const(());

        let outcome = TransferOrchestrator::new(connector_with(transport))
            .run(
                request(missing.to_str().unwrap(), ""),
                &CollectingSink::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome.abort_reason, Some(DeliveryError::SourceNotFound(_))));
    }

    #[tokio::test]
    async fn test_connection_loss_mid_upload_aborts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let pattern = format!("{}/*.txt", dir.path().display());

        let mut transport = MockDeliveryTransport::new();
        transport.expect_ensure_directory().returning(|_| Ok(()));
        transport.expect_upload_item().times(1).returning(|_, _, _| {
            Err(DeliveryError::ConnectionFailure {
                host: "files.example.org".into(),
                port: 22,
                message: "reset".into(),
            })
        });
        transport.expect_list_directory().never();
        transport.expect_close().times(1).return_const(());

        let outcome = TransferOrchestrator::new(connector_with(transport))
            .run(request(&pattern, ""), &CollectingSink::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Aborted);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.failed_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut connector = MockTransportConnector::new();
        connector.expect_connect().never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = TransferOrchestrator::new(connector)
            .run(request("/tmp", ""), &CollectingSink::new(), &cancel)
            .await;
        assert_eq!(outcome.abort_reason, Some(DeliveryError::Cancelled));
    }
}
