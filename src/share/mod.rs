//! Share lifecycle core
//!
//! A share is created Pending, receives chunks for one or more files, becomes
//! Active when finalized and ends Expired or Deleted. This module holds:
//! - [`ShareRegistry`]: records, transitions, quotas and notification
//! - [`ChunkAssembler`]: chunk intake and file assembly
//! - [`DownloadTracker`]: serving files and counting downloads
//! - [`ExpiryReaper`]: periodic expiry, reclamation and cleanup

mod assembler;
mod downloads;
mod names;
mod reaper;
mod registry;
mod token;
mod types;

pub use assembler::{ChunkAssembler, MAX_TOTAL_CHUNKS};
pub use downloads::{DownloadTracker, DownloadedFile, ShareBundle};
pub use names::{sanitize_filename, NameResolver};
pub use reaper::{ExpiryReaper, SweepFailure, SweepReport};
pub use registry::{ShareRegistry, MAX_RETENTION_HOURS};
pub use token::generate_token;
pub use types::*;
