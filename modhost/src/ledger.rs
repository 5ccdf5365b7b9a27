//! Dependency ledger.
//!
//! Records the first-seen `(name, version, size)` of every shared descriptor
//! and validates later claims against it. The ledger only grows.

use modhost_common::abi::{DependencyMismatch, DependencySink};
use serde::Serialize;
use tracing::debug;

/// One recorded shared descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Descriptor name.
    pub name: String,
    /// Version string recorded at first sight.
    pub version: String,
    /// Byte size recorded at first sight.
    pub size: usize,
}

/// Ordered, append-only record of shared descriptors.
#[derive(Debug, Default)]
pub struct DependencyLedger {
    entries: Vec<Dependency>,
}

impl DependencyLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a descriptor without comparing it to existing entries.
    ///
    /// Used for the host's own claims, which define the reference values.
    /// A name already in the ledger keeps its first values.
    pub fn record(&mut self, name: &str, version: &str, size: usize) {
        if self.entries.iter().any(|d| d.name == name) {
            debug!(name, "dependency already recorded");
            return;
        }
        debug!(name, version, size, "dependency recorded");
        self.entries.push(Dependency {
            name: name.to_string(),
            version: version.to_string(),
            size,
        });
    }

    /// Validate a claim. A name seen for the first time is recorded and
    /// accepted; otherwise version and size must both match exactly.
    pub fn check(&mut self, name: &str, version: &str, size: usize) -> Result<(), DependencyMismatch> {
        let Some(pos) = self.entries.iter().position(|d| d.name == name) else {
            self.record(name, version, size);
            return Ok(());
        };
        let existing = &self.entries[pos];

        if existing.version != version {
            return Err(DependencyMismatch::Version {
                name: name.to_string(),
                claimed: version.to_string(),
                recorded: existing.version.clone(),
            });
        }

        if existing.size != size {
            return Err(DependencyMismatch::Size {
                name: name.to_string(),
                claimed: size,
                recorded: existing.size,
            });
        }

        Ok(())
    }

    /// Recorded descriptors, in first-seen order.
    pub fn entries(&self) -> &[Dependency] {
        &self.entries
    }

    /// Number of recorded descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a [`LedgerSink`] treats claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LedgerMode {
    /// Host claims: record unconditionally.
    Record,
    /// Module claims: compare against the ledger.
    Check,
}

/// Adapter exposing the ledger to a module's dependency hook.
pub(crate) struct LedgerSink<'a> {
    pub(crate) ledger: &'a mut DependencyLedger,
    pub(crate) mode: LedgerMode,
}

impl DependencySink for LedgerSink<'_> {
    fn check_dependency(&mut self, name: &str, version: &str, size: usize) -> Result<(), DependencyMismatch> {
        match self.mode {
            LedgerMode::Record => {
                self.ledger.record(name, version, size);
                Ok(())
            }
            LedgerMode::Check => self.ledger.check(name, version, size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claim_is_recorded() {
        let mut ledger = DependencyLedger::new();
        assert!(ledger.check("core", "1.0", 64).is_ok());
        assert_eq!(
            ledger.entries(),
            &[Dependency { name: "core".into(), version: "1.0".into(), size: 64 }]
        );
    }

    #[test]
    fn test_matching_claim_leaves_ledger_unchanged() {
        let mut ledger = DependencyLedger::new();
        ledger.check("core", "1.0", 64).unwrap();
        ledger.check("core", "1.0", 64).unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_version_mismatch() {
        let mut ledger = DependencyLedger::new();
        ledger.check("core", "1.0", 64).unwrap();
        let err = ledger.check("core", "1.1", 64).unwrap_err();
        assert_eq!(
            err,
            DependencyMismatch::Version {
                name: "core".into(),
                claimed: "1.1".into(),
                recorded: "1.0".into(),
            }
        );
        // The reference value is immutable.
        assert_eq!(ledger.entries()[0].version, "1.0");
    }

    #[test]
    fn test_size_mismatch_catches_structural_drift() {
        let mut ledger = DependencyLedger::new();
        ledger.check("devblk", "4.2", 512).unwrap();
        let err = ledger.check("devblk", "4.2", 520).unwrap_err();
        assert!(matches!(err, DependencyMismatch::Size { claimed: 520, recorded: 512, .. }));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_record_mode_appends_without_checking() {
        let mut ledger = DependencyLedger::new();
        {
            let mut sink = LedgerSink { ledger: &mut ledger, mode: LedgerMode::Record };
            sink.check_dependency("core", "1.0", 64).unwrap();
            sink.check_dependency("sysblk", "3", 4096).unwrap();
        }
        let mut sink = LedgerSink { ledger: &mut ledger, mode: LedgerMode::Check };
        assert!(sink.check_dependency("sysblk", "3", 4000).is_err());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_record_mode_keeps_first_claim() {
        let mut ledger = DependencyLedger::new();
        let mut sink = LedgerSink { ledger: &mut ledger, mode: LedgerMode::Record };
        sink.check_dependency("core", "1.0", 64).unwrap();
        sink.check_dependency("core", "2.0", 128).unwrap();
        assert_eq!(
            ledger.entries(),
            &[Dependency { name: "core".into(), version: "1.0".into(), size: 64 }]
        );
    }
}
