// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::BgpConnection;
use crate::peering::PeeringEvent;
use bgp_common::lock;
use slog::{error, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn};
use std::time::Duration;

/// Drives the timers of one peering. A background thread ticks every
/// `resolution` and posts an event to the peering when a timer expires.
pub struct Clock {
    pub resolution: Duration,
    pub timers: Arc<ClockTimers>,

    shutdown: Arc<AtomicBool>,
}

pub struct ClockTimers {
    /// Amount of time that a peer is held in the idle state before an
    /// automatic restart.
    pub idle_hold_timer: Timer,
}

impl Clock {
    pub fn new<Cnx: BgpConnection>(
        resolution: Duration,
        s: Sender<PeeringEvent<Cnx>>,
        log: Logger,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let timers = Arc::new(ClockTimers {
            idle_hold_timer: Timer::new(),
        });
        Self::run(resolution, timers.clone(), s, shutdown.clone(), log);
        Self {
            resolution,
            timers,
            shutdown,
        }
    }

    fn run<Cnx: BgpConnection>(
        resolution: Duration,
        timers: Arc<ClockTimers>,
        s: Sender<PeeringEvent<Cnx>>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) {
        spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let t = &timers.idle_hold_timer;
            t.tick(resolution);
            // The idle hold timer is one-shot: it is disabled on expiry and
            // re-armed by the peering when it holds again.
            if let Some(generation) = t.take_expired() {
                let event = PeeringEvent::IdleHoldTimerExpires { generation };
                if let Err(e) = s.send(event) {
                    error!(log, "send idle hold timer event: {e}");
                    return;
                }
            }
            sleep(resolution);
        });
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TimerState {
    enabled: bool,
    remaining: Duration,

    /// Bumped on every arm. Expiry events carry it so an expiry of an
    /// earlier arm can be told apart from the current one.
    generation: u64,
}

#[derive(Clone, Default)]
pub struct Timer {
    value: Arc<Mutex<TimerState>>,
}

impl Timer {
    /// Create a new, disabled timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the timer tick, decrementing the value by the specified resolution.
    /// The decrementing action is saturating, so ticking once the timer has
    /// reached zero is a no-op.
    pub fn tick(&self, resolution: Duration) {
        let mut value = lock!(self.value);
        if value.enabled {
            value.remaining = value.remaining.saturating_sub(resolution);
        }
    }

    pub fn disable(&self) {
        lock!(self.value).enabled = false
    }

    /// If the timer is enabled and has ticked down to zero, disable it and
    /// return the generation that expired.
    pub fn take_expired(&self) -> Option<u64> {
        let mut v = lock!(self.value);
        if !v.enabled || !v.remaining.is_zero() {
            return None;
        }
        v.enabled = false;
        Some(v.generation)
    }

    /// Set the interval and enable the timer in one step. Returns the new
    /// generation.
    pub fn arm(&self, interval: Duration) -> u64 {
        let mut v = lock!(self.value);
        v.generation += 1;
        v.remaining = interval;
        v.enabled = true;
        v.generation
    }
}
