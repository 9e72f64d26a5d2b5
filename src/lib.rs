//! Frost: an encrypted, deduplicating, content-addressed backup engine.
//!
//! The storage engine lives in `frost-datastore`, the key hierarchy in
//! `frost-key-config`; this crate holds the engines driving them: backup,
//! restore, purge, listing, the safe-index cipher and the glue (progress
//! reporting, exclusion rules, signal flags) they share.

pub mod backup;
pub mod chunk_reader;
pub mod exclude;
pub mod list;
pub mod progress;
pub mod purge;
pub mod restore;
pub mod safe_index;
pub mod signals;

pub use backup::{backup_folder, BackupOptions, BackupStats};
pub use exclude::ExcludeList;
pub use list::{dump_index, list_backups, TimeRange};
pub use progress::{Action, LogProgress, Progress};
pub use purge::{purge_backup, PurgeOptions, PurgeStats, STRATEGY_FAST, STRATEGY_SLOW};
pub use restore::{restore_backup, restore_single_file, OverwritePolicy, RestoreOptions};
