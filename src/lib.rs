//! Worktree population and filesystem monitoring for git working
//! directories.
//!
//! Two cooperating cores share this crate. The [`checkout`] module is a
//! parallel worktree populator: a foreground coordinator distributes
//! eligible index entries over helper subprocesses, each of which preloads
//! blobs and writes them to disk from a small thread pool. The [`monitor`]
//! module is an fsmonitor daemon: it watches a working directory through a
//! platform backend and answers "what changed since token T" queries over a
//! local socket. Both ride on the same packet-line framing ([`pkt`]), a
//! bounded FIFO ([`fifo`]) and a generic Unix-socket IPC server ([`ipc`]).

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod convert;
pub mod fifo;
pub mod monitor;
pub mod odb;
pub mod pkt;

#[cfg(unix)]
pub mod checkout;
#[cfg(unix)]
pub mod ipc;

#[cfg(unix)]
pub use crate::checkout::CheckoutMode;
#[cfg(unix)]
pub use crate::checkout::CheckoutSettings;
#[cfg(unix)]
pub use crate::checkout::ErrorClass;
#[cfg(unix)]
pub use crate::checkout::IndexEntry;
#[cfg(unix)]
pub use crate::checkout::PopulateReport;
#[cfg(unix)]
pub use crate::checkout::populate_worktree;
pub use crate::convert::ConvertAttrs;
pub use crate::convert::ConvertClass;
pub use crate::convert::Converter;
pub use crate::convert::DefaultConverter;
#[cfg(unix)]
pub use crate::monitor::MonitorSettings;
#[cfg(unix)]
pub use crate::monitor::QueryReply;
pub use crate::odb::BlobDir;
pub use crate::odb::ObjectId;
pub use crate::odb::ObjectStore;
