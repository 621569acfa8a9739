//! Claimable record store
//!
//! This module provides:
//! - [`ClaimableStore`] - the claim-by-rename capability the queue is built on
//! - [`FileRecordStore`] - its implementation over plain directories
//! - [`RecordName`] / [`FileNameGenerator`] - the file name grammar
//!
//! # Directory layout
//!
//! ```text
//! <base>/
//! ├── orders/
//! │   ├── b0000017145667890000000000_0190f3...json   ready
//! │   ├── d0000017145699990000000001_0190f3...json   deferred
//! │   ├── t0000017145600000000000002_0190a1...json   claimed / being written
//! │   └── e0000017145500000000000000_0190a1...json   aborted
//! └── invoices/
//! ```

mod directory;
mod record;

pub use directory::{ClaimMode, ClaimableStore, FileRecordStore, StoreError};
pub use record::{
    datetime_from_ticks, effective_order_key, now_ticks, ticks_from_datetime, FileNameGenerator,
    RecordName, Visibility, RECORD_EXTENSION,
};
