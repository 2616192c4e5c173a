// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::{JitterRange, PeerConfig};
use rand::Rng;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// BGP session states.
///
/// Ref: RFC 4271 §8.2.2
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsmStateKind {
    /// Initial state. No resources allocated to the peer.
    Idle,

    /// Waiting for the TCP connection to be completed.
    Connect,

    /// Trying to acquire the peer by listening for and accepting a TCP
    /// connection.
    Active,

    /// Waiting for open message from peer.
    OpenSent,

    /// Waiting for keepaliave or notification from peer.
    OpenConfirm,

    /// Able to exchange update, notification and keepliave messages with peers.
    Established,
}

impl Display for FsmStateKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FsmStateKind::Idle => write!(f, "idle"),
            FsmStateKind::Connect => write!(f, "connect"),
            FsmStateKind::Active => write!(f, "active"),
            FsmStateKind::OpenSent => write!(f, "open sent"),
            FsmStateKind::OpenConfirm => write!(f, "open confirm"),
            FsmStateKind::Established => write!(f, "established"),
        }
    }
}

/// An accepted transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// State after the transition.
    pub state: FsmStateKind,

    /// Set when the session must sit in idle for this long before the
    /// connection attempt is made.
    pub idle_hold: Option<Duration>,
}

impl Accepted {
    fn to(state: FsmStateKind) -> Self {
        Self {
            state,
            idle_hold: None,
        }
    }
}

/// A transition the state machine refused. Refusals are an expected outcome
/// and carry no side effects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub state: FsmStateKind,
    pub event: &'static str,
}

impl Display for Rejected {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "event {} not allowed in {}", self.event, self.state)
    }
}

pub type Transition = Result<Accepted, Rejected>;

/// The state machine a peering drives. Implementations own the session
/// state; the peering owns the connection.
pub trait Fsm: Send {
    fn state(&self) -> FsmStateKind;

    /// Force the state back to idle after the connection has gone away.
    fn set_idle(&mut self);

    /// Whether the session may restart on its own after a close.
    fn allow_automatic_start(&self) -> bool;

    fn automatic_start(&mut self, idle_hold: bool) -> Transition;
    fn manual_start(&mut self, idle_hold: bool) -> Transition;
    fn manual_stop(&mut self) -> Transition;

    /// The outbound TCP connection completed.
    fn connection_made(&mut self) -> Transition;

    /// The outbound TCP connection attempt failed.
    fn connection_failed(&mut self, reason: &str) -> Transition;

    /// A valid open message was received.
    fn open_received(&mut self) -> Transition;

    /// A keepalive message was received.
    fn keepalive_received(&mut self) -> Transition;
}

/// Optional session attributes that shape restart behavior.
///
/// Ref: RFC 4271 §8.1.1
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Start the peer session automatically.
    pub allow_automatic_start: bool,

    /// Increase the idle hold time in response to repeated connection
    /// failures.
    pub damp_peer_oscillations: bool,

    /// Amount of time that a peer is held in the idle state.
    pub idle_hold_time: Duration,

    /// Upper bound for the damped idle hold time.
    pub max_idle_hold_time: Duration,

    pub idle_hold_jitter: Option<JitterRange>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            allow_automatic_start: true,
            damp_peer_oscillations: true,
            idle_hold_time: Duration::from_secs(5),
            max_idle_hold_time: Duration::from_secs(300),
            idle_hold_jitter: None,
        }
    }
}

impl From<&PeerConfig> for SessionPolicy {
    fn from(cfg: &PeerConfig) -> Self {
        Self {
            allow_automatic_start: cfg.allow_automatic_start,
            damp_peer_oscillations: cfg.damp_peer_oscillations,
            idle_hold_time: Duration::from_secs(cfg.idle_hold_time),
            max_idle_hold_time: Duration::from_secs(cfg.max_idle_hold_time),
            idle_hold_jitter: cfg.idle_hold_jitter,
        }
    }
}

/// Default state machine covering the transitions a peering drives.
pub struct SessionFsm {
    state: FsmStateKind,

    /// Track how many times a connection has failed since the session was
    /// last established or stopped.
    pub connect_retry_counter: u64,

    pub policy: SessionPolicy,
}

impl SessionFsm {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            state: FsmStateKind::Idle,
            connect_retry_counter: 0,
            policy,
        }
    }

    /// How long to hold in idle before the next attempt. With damping the
    /// base time doubles for every consecutive failure.
    pub fn idle_hold_time(&self) -> Duration {
        let base = self.policy.idle_hold_time;
        let hold = if self.policy.damp_peer_oscillations {
            let shift = self.connect_retry_counter.saturating_sub(1).min(16);
            base.saturating_mul(1u32 << shift)
                .min(self.policy.max_idle_hold_time.max(base))
        } else {
            base
        };
        match self.policy.idle_hold_jitter {
            Some(jitter) => jitter.apply(hold),
            None => hold,
        }
    }

    fn start(&mut self, idle_hold: bool, event: &'static str) -> Transition {
        if self.state != FsmStateKind::Idle {
            return Err(self.reject(event));
        }
        if idle_hold {
            return Ok(Accepted {
                state: FsmStateKind::Idle,
                idle_hold: Some(self.idle_hold_time()),
            });
        }
        self.state = FsmStateKind::Connect;
        Ok(Accepted::to(self.state))
    }

    fn reject(&self, event: &'static str) -> Rejected {
        Rejected {
            state: self.state,
            event,
        }
    }
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}

impl Fsm for SessionFsm {
    fn state(&self) -> FsmStateKind {
        self.state
    }

    fn set_idle(&mut self) {
        self.state = FsmStateKind::Idle;
    }

    fn allow_automatic_start(&self) -> bool {
        self.policy.allow_automatic_start
    }

    fn automatic_start(&mut self, idle_hold: bool) -> Transition {
        self.start(idle_hold, "automatic start")
    }

    fn manual_start(&mut self, idle_hold: bool) -> Transition {
        let result = self.start(idle_hold, "manual start");
        if result.is_ok() {
            self.connect_retry_counter = 0;
        }
        result
    }

    fn manual_stop(&mut self) -> Transition {
        self.connect_retry_counter = 0;
        self.state = FsmStateKind::Idle;
        Ok(Accepted::to(self.state))
    }

    fn connection_made(&mut self) -> Transition {
        match self.state {
            FsmStateKind::Connect | FsmStateKind::Active => {
                self.state = FsmStateKind::OpenSent;
                Ok(Accepted::to(self.state))
            }
            _ => Err(self.reject("tcp connection confirmed")),
        }
    }

    fn connection_failed(&mut self, _reason: &str) -> Transition {
        match self.state {
            FsmStateKind::Connect
            | FsmStateKind::Active
            | FsmStateKind::OpenSent => {
                self.connect_retry_counter += 1;
                self.state = FsmStateKind::Idle;
                Ok(Accepted::to(self.state))
            }
            _ => Err(self.reject("tcp connection fails")),
        }
    }

    fn open_received(&mut self) -> Transition {
        match self.state {
            FsmStateKind::OpenSent => {
                self.state = FsmStateKind::OpenConfirm;
                Ok(Accepted::to(self.state))
            }
            _ => Err(self.reject("bgp open")),
        }
    }

    fn keepalive_received(&mut self) -> Transition {
        match self.state {
            FsmStateKind::OpenConfirm => {
                self.connect_retry_counter = 0;
                self.state = FsmStateKind::Established;
                Ok(Accepted::to(self.state))
            }
            FsmStateKind::Established => Ok(Accepted::to(self.state)),
            _ => Err(self.reject("keepalive message")),
        }
    }
}

impl JitterRange {
    /// Scale `d` by a random factor drawn from this range.
    pub fn apply(&self, d: Duration) -> Duration {
        if self.min >= self.max {
            return d.mul_f64(self.min.max(0.0));
        }
        let factor = rand::thread_rng().gen_range(self.min..=self.max);
        d.mul_f64(factor.max(0.0))
    }
}
