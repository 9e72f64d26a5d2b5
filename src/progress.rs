//! Progress and warning reporting for the long-running engines.
//!
//! The engines never print; they feed this trait. Returning `false` from
//! either callback asks the engine to stop at the next safe point.
//! Warnings are per-file trouble that must not abort the whole run (a
//! symlink pointing outside the source, an unsupported file type); fatal
//! trouble is an `Err` return instead.

/// Which engine is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Backup,
    Restore,
    Purge,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Backup => "Backup",
            Action::Restore => "Restore",
            Action::Purge => "Purge",
        }
    }
}

pub trait Progress {
    /// Report progress on the current entry.
    ///
    /// `done`/`total` are byte counts for the entry, `index`/`count` the
    /// position in the overall run.
    fn progressed(
        &mut self,
        action: Action,
        name: &str,
        done: u64,
        total: u64,
        index: u32,
        count: u32,
    ) -> bool;

    /// Report a non-fatal, per-entry problem.
    fn warn(&mut self, action: Action, name: &str, message: &str) -> bool;
}

/// Progress sink that only forwards warnings to the log (used by tests and
/// by `cat`, whose stdout belongs to the file content).
pub struct LogProgress;

impl Progress for LogProgress {
    fn progressed(
        &mut self,
        _action: Action,
        _name: &str,
        _done: u64,
        _total: u64,
        _index: u32,
        _count: u32,
    ) -> bool {
        true
    }

    fn warn(&mut self, action: Action, name: &str, message: &str) -> bool {
        log::warn!("{}: {}: {}", action.name(), name, message);
        true
    }
}
