// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::messages::AfiSafi;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Top level daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub router: RouterConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let f = std::fs::File::open(path)?;
        let cfg: Config = serde_json::from_reader(std::io::BufReader::new(f))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.peers {
            if !seen.insert(p.host) {
                return Err(Error::Config(format!(
                    "duplicate peer {}",
                    p.host
                )));
            }
            p.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Autonomous system number for this router
    pub asn: u32,

    /// Id for this router
    pub id: u32,

    /// Address outbound sessions bind to
    pub local_address: IpAddr,
}

#[derive(Debug, Copy, Clone, Deserialize, Serialize, PartialEq)]
pub struct JitterRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    pub name: String,
    pub host: IpAddr,
    pub asn: u32,
    #[serde(default = "default_afi_safi")]
    pub afi_safi: Vec<AfiSafi>,
    #[serde(default)]
    pub md5_auth_key: Option<String>,
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    /// Seconds
    #[serde(default = "default_idle_hold_time")]
    pub idle_hold_time: u64,
    /// Seconds
    #[serde(default = "default_max_idle_hold_time")]
    pub max_idle_hold_time: u64,
    #[serde(default = "default_true")]
    pub damp_peer_oscillations: bool,
    #[serde(default = "default_true")]
    pub allow_automatic_start: bool,
    #[serde(default)]
    pub idle_hold_jitter: Option<JitterRange>,
    /// Timer resolution in milliseconds
    #[serde(default = "default_resolution")]
    pub resolution: u64,
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_ipv6() {
            return Err(Error::Ipv6Unsupported(self.host));
        }
        if self.resolution == 0 {
            return Err(Error::Config(format!(
                "{}: resolution must be non-zero",
                self.name
            )));
        }
        if let Some(j) = self.idle_hold_jitter {
            if j.min < 0.0 || j.min > j.max {
                return Err(Error::Config(format!(
                    "{}: invalid idle hold jitter {}..{}",
                    self.name, j.min, j.max
                )));
            }
        }
        Ok(())
    }
}

fn default_afi_safi() -> Vec<AfiSafi> {
    vec![AfiSafi::IPV4_UNICAST]
}

fn default_hold_time() -> u16 {
    90
}

fn default_idle_hold_time() -> u64 {
    5
}

fn default_max_idle_hold_time() -> u64 {
    300
}

fn default_resolution() -> u64 {
    100
}

fn default_true() -> bool {
    true
}
