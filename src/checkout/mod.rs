//! Parallel worktree populator.
//!
//! The foreground coordinator ([`client`]) walks the index, picks the
//! entries whose conversion permits out-of-order population, and spreads
//! them over helper subprocesses. Each helper ([`helper`], [`server`]) runs
//! a preload thread and a writer pool that advance items through a state
//! machine and report results back over the wire protocol ([`wire`]).

pub mod client;
pub mod helper;
pub mod item;
pub mod server;
pub mod wire;

mod write;

pub use client::CheckoutMode;
pub use client::CheckoutSettings;
pub use client::EntryError;
pub use client::IndexEntry;
pub use client::PopulateReport;
pub use client::populate_worktree;
pub use item::ErrorClass;
pub use item::Item;
pub use item::ItemState;
pub use item::Watermark;
pub use item::WireStat;
pub use server::ItemServer;
pub use server::ServerConfig;
pub use wire::ProtocolError;
