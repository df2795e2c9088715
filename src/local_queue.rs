//! The local queue broker.
//!
//! The broker executes jobs on the local machine with a bounded number of
//! concurrent processes. Clients talk to it over a TCP or unix socket with
//! length-delimited JSON messages, one response per request.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

pub mod client;
pub mod protocol;
pub mod server;
pub mod signing;
pub mod table;

pub use client::Client;
pub use protocol::Request;
pub use protocol::Response;
pub use server::Server;

/// The address of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A TCP `host:port` address.
    Tcp(String),
    /// A unix socket path.
    Unix(PathBuf),
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s
            .strip_prefix("unix://")
            .or_else(|| s.strip_prefix("ipc://"))
        {
            if path.is_empty() {
                return Err(AddressError(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let address = s.strip_prefix("tcp://").unwrap_or(s);
        if address.contains('/') {
            return Ok(Self::Unix(PathBuf::from(address)));
        }

        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(address.to_string()))
            }
            _ => Err(AddressError(s.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "tcp://{address}"),
            Self::Unix(path) => write!(f, "unix://{path}", path = path.display()),
        }
    }
}

/// An invalid broker address.
#[derive(Debug, Error)]
#[error("invalid local queue address `{0}`: expected `host:port` or `unix:///path`")]
pub struct AddressError(String);

/// A bidirectional byte stream carrying broker messages.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}
