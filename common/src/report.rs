use crate::transfer::TransferOutcome;

/// Outcome counts for one batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub files_dispatched: usize,
    pub files_downloaded: usize,
    pub files_failed: usize,
    pub bytes_written: u64,
}

impl BatchReport {
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.files_failed == 0
    }
}

impl std::ops::Add for BatchReport {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_dispatched: self.files_dispatched + other.files_dispatched,
            files_downloaded: self.files_downloaded + other.files_downloaded,
            files_failed: self.files_failed + other.files_failed,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files dispatched: {}\n\
            files downloaded: {}\n\
            files failed: {}\n\
            bytes written: {}",
            self.files_dispatched,
            self.files_downloaded,
            self.files_failed,
            bytesize::ByteSize(self.bytes_written),
        )
    }
}

/// Folds the outcomes of `dispatched` jobs into a report, logging every failure.
///
/// Individual failures never fail the batch. Outcomes missing relative to `dispatched` can only
/// come from a worker that died mid-job; they are logged and counted as failures.
pub fn aggregate(dispatched: usize, outcomes: Vec<TransferOutcome>) -> BatchReport {
    let mut report = BatchReport {
        files_dispatched: dispatched,
        ..Default::default()
    };
    let collected = outcomes.len();
    for outcome in outcomes {
        match outcome.result {
            Ok(bytes_written) => {
                report.files_downloaded += 1;
                report.bytes_written += bytes_written;
            }
            Err(error) => {
                tracing::warn!("failed downloading {:?}: {}", &outcome.name, &error);
                report.files_failed += 1;
            }
        }
    }
    if collected < dispatched {
        tracing::error!(
            "{} of {} dispatched jobs reported no outcome",
            dispatched - collected,
            dispatched
        );
        report.files_failed += dispatched - collected;
    }
    report
}
