//! End-of-run summary.

use serde::Serialize;
use tracing::{info, warn};

use crate::models::archive::FailedObject;

const TRACING_TARGET: &str = "cold_archiver::pipeline::report";

/// How a run ended.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every listed object is archived.
    Success,

    /// The listing was exhausted but some objects failed.
    PartialSuccess,

    /// Stopped by a shutdown request before the listing was exhausted.
    /// The ledger is consistent and the next run resumes.
    Interrupted,

    /// Stopped by an error that needs an operator.
    Fatal,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialSuccess | RunOutcome::Interrupted => 2,
            RunOutcome::Fatal => 1,
        }
    }
}

/// One volume committed during the run.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VolumeSummary {
    pub index: u64,
    pub name: String,
    pub entries: u64,
    pub uncompressed_bytes: u64,
    pub container_bytes: u64,
    pub parts: u32,

    /// Times the volume was uploaded; more than one means it was rebuilt.
    pub attempts: u32,
}

#[derive(Serialize, Clone, Debug)]
pub struct ArchiveReport {
    pub outcome: RunOutcome,

    /// Objects committed by this run.
    pub objects_archived: u64,

    /// Objects committed by earlier runs of the same archive.
    pub objects_previously_archived: u64,

    /// Listed objects skipped because the ledger had already settled them.
    pub objects_skipped: u64,

    /// Every object excluded from the archive so far, earlier runs included.
    pub objects_failed: Vec<FailedObject>,

    pub volumes: Vec<VolumeSummary>,

    /// Uncompressed bytes committed by this run.
    pub bytes_in: u64,

    /// Container bytes committed by this run.
    pub bytes_out: u64,

    pub compression_ratio: f64,
    pub peak_in_flight_bytes: u64,
    pub elapsed_ms: u64,

    /// The error that ended the run, for `fatal` outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveReport {
    pub fn ratio(bytes_in: u64, bytes_out: u64) -> f64 {
        if bytes_out == 0 {
            return 0.0;
        }
        bytes_in as f64 / bytes_out as f64
    }

    pub fn log(&self) {
        info!(
            target: TRACING_TARGET,
            outcome = ?self.outcome,
            archived = self.objects_archived,
            previously_archived = self.objects_previously_archived,
            skipped = self.objects_skipped,
            failed = self.objects_failed.len(),
            volumes = self.volumes.len(),
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            ratio = format!("{:.2}", self.compression_ratio),
            peak_in_flight = self.peak_in_flight_bytes,
            elapsed_ms = self.elapsed_ms,
            "archive run finished"
        );
        for failure in &self.objects_failed {
            warn!(
                target: TRACING_TARGET,
                key = %failure.key,
                stage = %failure.stage.as_str(),
                reason = %failure.reason,
                "object not archived"
            );
        }
        if let Some(error) = &self.error {
            warn!(target: TRACING_TARGET, error = %error, "run stopped by error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Success.exit_code(), 0);
        assert_eq!(RunOutcome::PartialSuccess.exit_code(), 2);
        assert_eq!(RunOutcome::Interrupted.exit_code(), 2);
        assert_eq!(RunOutcome::Fatal.exit_code(), 1);
    }

    #[test]
    fn ratio_of_nothing_is_zero() {
        assert_eq!(ArchiveReport::ratio(0, 0), 0.0);
        assert_eq!(ArchiveReport::ratio(300, 100), 3.0);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&RunOutcome::PartialSuccess).unwrap();
        assert_eq!(json, "\"partial_success\"");
    }
}
