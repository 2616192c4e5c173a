// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use slog::{error, warn, Logger};
use std::net::IpAddr;

/// Receives lifecycle callbacks from a peering.
pub trait ProtocolHandler: Send {
    /// An outbound connection attempt to `peer` failed.
    fn on_connection_failed(&mut self, peer: IpAddr, reason: &str);

    /// The session to `peer` was stopped by an error it cannot recover from
    /// on its own.
    fn on_session_failed(&mut self, _peer: IpAddr, _err: &Error) {}
}

/// Handler that reports callbacks to the log.
pub struct LogHandler {
    log: Logger,
}

impl LogHandler {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl ProtocolHandler for LogHandler {
    fn on_connection_failed(&mut self, peer: IpAddr, reason: &str) {
        warn!(self.log, "connection to {peer} failed: {reason}";
            "component" => crate::COMPONENT_BGP,
            "unit" => crate::UNIT_HANDLER,
            "peer" => format!("{peer}"),
        );
    }

    fn on_session_failed(&mut self, peer: IpAddr, err: &Error) {
        error!(self.log, "session to {peer} failed: {err}";
            "component" => crate::COMPONENT_BGP,
            "unit" => crate::UNIT_HANDLER,
            "peer" => format!("{peer}"),
        );
    }
}
