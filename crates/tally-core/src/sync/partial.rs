//! Per-row and per-file failures absorbed during a run.

use std::fmt::Display;

use crate::models::{FailureTarget, PartialFailure, SyncTable, TransferDirection};

/// Collects failures that must not abort the run.
#[derive(Debug, Default)]
pub struct PartialFailures {
    entries: Vec<PartialFailure>,
}

impl PartialFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_row(
        &mut self,
        table: SyncTable,
        id: impl Into<String>,
        direction: TransferDirection,
        error: impl Display,
    ) {
        let id = id.into();
        tracing::warn!("Failed to {} {table} row {id}: {error}", verb(direction));
        self.entries.push(PartialFailure {
            target: FailureTarget::Row { table, id },
            direction,
            message: error.to_string(),
        });
    }

    pub fn record_file(
        &mut self,
        path: impl Into<String>,
        direction: TransferDirection,
        error: impl Display,
    ) {
        let path = path.into();
        tracing::warn!("Failed to {} file {path}: {error}", verb(direction));
        self.entries.push(PartialFailure {
            target: FailureTarget::File { path },
            direction,
            message: error.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<PartialFailure> {
        self.entries
    }
}

const fn verb(direction: TransferDirection) -> &'static str {
    match direction {
        TransferDirection::Push => "push",
        TransferDirection::Pull => "pull",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_rows_and_files_in_order() {
        let mut failures = PartialFailures::new();
        assert!(failures.is_empty());

        failures.record_row(SyncTable::Invoice, "i1", TransferDirection::Push, "conflict");
        failures.record_file("bills/a.pdf", TransferDirection::Pull, "denied");
        assert_eq!(failures.len(), 2);

        let entries = failures.into_vec();
        assert_eq!(
            entries[0].target,
            FailureTarget::Row {
                table: SyncTable::Invoice,
                id: "i1".to_string()
            }
        );
        assert_eq!(entries[1].message, "denied");
    }
}
