// SPDX-License-Identifier: MIT

use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::{self};
use std::io;

use madeira_common::impl_error_from;
use thiserror::Error;

use super::peer::PeerError;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Error while writing into a channel")]
    ChannelSend,
    #[error("Peer error: {0}")]
    Peer(PeerError),
    #[error("Peer not found in our current connections")]
    PeerNotFound,
    #[error("We don't have any peers")]
    NoPeersAvailable,
    #[error("Our peer is misbehaving")]
    PeerMisbehaving,
    #[error("Generic io error: {0}")]
    Io(io::Error),
    #[error("{0}")]
    Serde(serde_json::Error),
    #[error("We couldn't parse the provided address due to: {0}")]
    InvalidAddress(AddrParseError),
    #[error("Failed to bind the listening socket: {0}")]
    Listen(io::Error),
}

impl_error_from!(WireError, PeerError, Peer);
impl_error_from!(WireError, AddrParseError, InvalidAddress);

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> WireError {
        WireError::Io(err)
    }
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> WireError {
        WireError::Serde(err)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WireError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        WireError::ChannelSend
    }
}

#[derive(Debug, Clone)]
pub enum AddrParseError {
    InvalidIpv6,
    InvalidIpv4,
    InvalidHostname,
    InvalidPort,
    Inconclusive,
}

impl Display for AddrParseError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            AddrParseError::InvalidIpv6 => write!(f, "Invalid ipv6"),
            AddrParseError::InvalidIpv4 => write!(f, "Invalid ipv4"),
            AddrParseError::InvalidHostname => write!(f, "Invalid hostname"),
            AddrParseError::InvalidPort => write!(f, "Invalid port"),
            AddrParseError::Inconclusive => write!(f, "Inconclusive"),
        }
    }
}
