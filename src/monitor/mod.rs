//! Filesystem-monitor daemon.
//!
//! One process per working directory: a platform watcher feeds the listener
//! thread ([`listener`]), which classifies paths and publishes batches into
//! the shared state ([`state`], [`token`]); the IPC server answers client
//! queries ([`client`]) with the paths changed since the client's token.
//! [`daemon`] ties the pieces together and carries the client-side commands.

pub mod backend;
pub mod cookie;
pub mod ewah;
pub mod index_ext;
pub mod state;
pub mod token;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod daemon;
#[cfg(unix)]
pub mod listener;

pub use cookie::CookieResult;
#[cfg(unix)]
pub use daemon::MonitorSettings;
#[cfg(unix)]
pub use daemon::QueryReply;
pub use ewah::EwahBitmap;
pub use index_ext::IndexExt;
#[cfg(unix)]
pub use listener::PathKind;
#[cfg(unix)]
pub use listener::classify;
pub use state::MonitorState;
pub use token::Token;
pub use token::TokenState;
