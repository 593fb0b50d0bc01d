use std::{io, net::SocketAddr, path::PathBuf};

use silo_codec::DictError;
use thiserror::Error;

/// Fatal errors: anything that prevents the server from starting, plus the
/// acceptor loop failing at runtime. Per-request problems never surface
/// here; they become error responses on the offending connection.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unable to load configuration file {path}: {err}")]
    Config {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("configuration file too short ({0} bytes)")]
    ConfigTruncated(usize),
    #[error("unable to load compression dictionary: {0}")]
    Dict(#[from] DictError),
    #[error("unable to bind {addr}: {err}")]
    Bind {
        addr: SocketAddr,
        #[source]
        err: io::Error,
    },
    #[error("readiness setup failed: {0}")]
    Poll(#[source] io::Error),
    #[error("unable to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("unable to install signal handler: {0}")]
    Signal(#[source] io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}
