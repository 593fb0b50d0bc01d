use std::{
    ffi::OsString,
    fs,
    net::{Ipv4Addr, SocketAddr},
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
};

use crate::error::ServerError;

const IP_SIZE: usize = 4;
const PORT_SIZE: usize = 2;

/// Server configuration, loaded from a fixed-layout binary file: 4 bytes of
/// IPv4 address in network order, 2 bytes of port in network order, and the
/// remaining bytes the serving directory path (not NUL-terminated on disk).
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub dir: PathBuf,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .map_err(|err| ServerError::Config { path: path.to_path_buf(), err })?;
        if raw.len() < IP_SIZE + PORT_SIZE {
            return Err(ServerError::ConfigTruncated(raw.len()));
        }
        Ok(Self {
            ip: Ipv4Addr::from([raw[0], raw[1], raw[2], raw[3]]),
            port: u16::from_be_bytes([raw[4], raw[5]]),
            dir: PathBuf::from(OsString::from_vec(raw[IP_SIZE + PORT_SIZE..].to_vec())),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}
