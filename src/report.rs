//! Outcome rendering and process exit codes.

use anyhow::{Context, Result};
use deliver_scp::delivery::{DeliveryError, OutcomeStatus, TransferOutcome, Verification};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INVALID_INPUT: u8 = 2;
pub const EXIT_PARTIAL: u8 = 3;
pub const EXIT_SOURCE_NOT_FOUND: u8 = 4;
pub const EXIT_AUTHENTICATION: u8 = 5;
pub const EXIT_CONNECTION: u8 = 6;
pub const EXIT_REMOTE_COMMAND: u8 = 7;
pub const EXIT_MISSING_DEPENDENCY: u8 = 8;
pub const EXIT_CANCELLED: u8 = 130;

pub fn exit_code(outcome: &TransferOutcome, allow_partial: bool) -> u8 {
    match outcome.status {
        OutcomeStatus::Verified
        | OutcomeStatus::CompletedUnverified
        | OutcomeStatus::EmptyResolution => EXIT_OK,
        OutcomeStatus::PartialFailure if allow_partial => EXIT_OK,
        OutcomeStatus::PartialFailure => EXIT_PARTIAL,
        OutcomeStatus::Aborted => outcome
            .abort_reason
            .as_ref()
            .map(abort_exit_code)
            .unwrap_or(EXIT_FAILURE),
    }
}

fn abort_exit_code(reason: &DeliveryError) -> u8 {
    match reason {
        DeliveryError::InvalidInput(_) => EXIT_INVALID_INPUT,
        DeliveryError::SourceNotFound(_) => EXIT_SOURCE_NOT_FOUND,
        DeliveryError::AuthenticationFailure { .. } => EXIT_AUTHENTICATION,
        DeliveryError::ConnectionFailure { .. } => EXIT_CONNECTION,
        DeliveryError::RemoteCommandFailure { .. } => EXIT_REMOTE_COMMAND,
        DeliveryError::MissingDependency(_) => EXIT_MISSING_DEPENDENCY,
        DeliveryError::Cancelled => EXIT_CANCELLED,
        DeliveryError::TransportFailure(_)
        | DeliveryError::ItemTransferFailure { .. }
        | DeliveryError::UnexpectedFailure(_) => EXIT_FAILURE,
    }
}

/// Human-readable summary for stdout. Aborts and partial failures read
/// differently so neither is mistaken for the other.
pub fn render_summary(outcome: &TransferOutcome) -> String {
    let mut out = String::new();
    let destination = outcome
        .destination
        .as_ref()
        .map(|d| d.as_str())
        .unwrap_or("-");

    match outcome.status {
        OutcomeStatus::Aborted => {
            let reason = outcome
                .abort_reason
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown reason".into());
            let _ = writeln!(out, "ABORTED: {}", reason);
        }
        OutcomeStatus::PartialFailure => {
            let _ = writeln!(
                out,
                "PARTIAL: {} of {} item(s) delivered to {}",
                outcome.succeeded_count(),
                outcome.items.len(),
                destination
            );
        }
        OutcomeStatus::EmptyResolution => {
            let _ = writeln!(out, "Nothing to transfer");
        }
        OutcomeStatus::Verified | OutcomeStatus::CompletedUnverified => {
            let _ = writeln!(
                out,
                "Delivered {} item(s) to {} ({})",
                outcome.succeeded_count(),
                destination,
                outcome.status
            );
        }
    }

    for failed in outcome.failed_items() {
        if let Some(err) = &failed.error {
            let _ = writeln!(out, "  failed: {}", err);
        }
    }

    match &outcome.verification {
        Verification::Listed { entries, missing } => {
            let _ = writeln!(out, "Remote listing of {}:", destination);
            for entry in entries {
                let _ = writeln!(out, "  {}", entry);
            }
            if !missing.is_empty() {
                let _ = writeln!(out, "Not listed: {}", missing.join(", "));
            }
        }
        Verification::Failed { error } => {
            let _ = writeln!(out, "Listing failed: {}", error);
        }
        Verification::NotAttempted => {}
    }
    out
}

pub fn write_report(path: &Path, outcome: &TransferOutcome) -> Result<()> {
    let json = serde_json::to_string_pretty(outcome).context("Failed to serialise report")?;
    fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))
}
