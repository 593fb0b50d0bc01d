//! Concurrent TCP daemon serving a directory over a small length-prefixed
//! binary protocol: echo, directory listing, file-size queries, ranged file
//! retrieval multiplexed across sessions, and remote shutdown. Payloads may
//! be prefix-code compressed in either direction.

pub mod config;
pub mod error;
pub mod server;
pub mod sessions;

mod conn;
mod handlers;
mod worker;

pub use config::Config;
pub use error::ServerError;
pub use server::{Server, StopFlag};
