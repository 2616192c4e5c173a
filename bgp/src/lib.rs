// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod clock;
pub mod config;
pub mod connection;
pub mod connection_tcp;
pub mod error;
pub mod fsm;
pub mod handler;
pub mod log;
pub mod md5;
pub mod messages;
pub mod peering;


#[cfg(test)]
pub mod connection_channel;

pub const BGP_PORT: u16 = 179;
pub const COMPONENT_BGP: &str = "bgp";
pub const MOD_PEERING: &str = "peering";
pub const UNIT_CONTROLLER: &str = "controller";
pub const UNIT_CONNECTION: &str = "connection";
pub const UNIT_HANDLER: &str = "handler";

/// Outbound connect attempts give up after this long.
pub const CONNECT_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(30);

/// A send blocked on a peer that stops reading fails after this long.
pub const SEND_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(1);

// XXX: Make this configurable
pub const IO_TIMEOUT: std::time::Duration =
    std::time::Duration::from_millis(100);
