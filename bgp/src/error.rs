// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{fmt::Display, net::IpAddr};

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too small: {0}")]
    TooSmall(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("no marker")]
    NoMarker,

    #[error("bad version: {0}")]
    BadVersion(u8),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message type error")]
    MessageType(#[from] TryFromPrimitiveError<crate::messages::MessageType>),

    #[error("message parse error")]
    Parse(nom::Err<(Vec<u8>, nom::error::ErrorKind)>),

    #[error("Attempt to send a message when not connected")]
    NotConnected,

    #[error("IPv6 peers are not supported: {0}")]
    Ipv6Unsupported(IpAddr),

    #[error("Unexpected ASN: {0}")]
    UnexpectedAsn(ExpectationMismatch<u32>),

    #[error("Failed to send event: {0}")]
    EventSend(String),

    #[error("Internal communication error: {0}")]
    InternalCommunication(String),

    #[error("TCP MD5 signatures are not supported on this platform")]
    Md5UnsupportedPlatform,

    #[error("TCP MD5 signatures are not supported for peer {0}")]
    Md5UnsupportedAddress(IpAddr),

    #[error("TCP MD5 key too long: {0} bytes, max is {1}")]
    Md5KeyTooLong(usize, usize),

    #[error("TCP MD5 option malformed: {0}")]
    Md5Malformed(String),

    #[error("failed to apply TCP MD5 option: {0}")]
    Md5Apply(std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors that keep a session from starting at all. Everything else on
    /// the connect path is treated as a transient connect failure and retried.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Md5UnsupportedPlatform
                | Error::Md5UnsupportedAddress(_)
                | Error::Md5KeyTooLong(..)
                | Error::Md5Malformed(_)
                | Error::Md5Apply(_)
        )
    }
}

#[derive(Debug)]
pub struct ExpectationMismatch<T: Display> {
    pub expected: T,
    pub got: T,
}

impl<T: Display> Display for ExpectationMismatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected: {} got: {}", self.expected, self.got)
    }
}

impl<'a> From<nom::Err<(&'a [u8], nom::error::ErrorKind)>> for Error {
    fn from(e: nom::Err<(&'a [u8], nom::error::ErrorKind)>) -> Error {
        Error::Parse(e.to_owned())
    }
}
