//! Liveness sweep. Each tick either probes a connection or, if it stayed
//! silent since the previous probe, tells the caller to drop it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Still alive: send a ping and wait for traffic.
    Probe,
    /// Nothing heard since the last probe.
    Terminate,
}

/// First tick fires one full period after connect, not immediately.
pub fn ticker(interval_secs: u64) -> Interval {
    let period = Duration::from_secs(interval_secs.max(1));
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

pub fn on_tick(alive: &AtomicBool) -> Beat {
    if alive.swap(false, Ordering::AcqRel) {
        Beat::Probe
    } else {
        Beat::Terminate
    }
}

pub fn mark_alive(alive: &AtomicBool) {
    alive.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_connection_is_terminated_on_second_tick() {
        let alive = AtomicBool::new(true);
        assert_eq!(on_tick(&alive), Beat::Probe);
        assert_eq!(on_tick(&alive), Beat::Terminate);
    }

    #[test]
    fn traffic_between_ticks_keeps_it_alive() {
        let alive = AtomicBool::new(true);
        for _ in 0..5 {
            assert_eq!(on_tick(&alive), Beat::Probe);
            mark_alive(&alive);
            mark_alive(&alive);
        }
    }
}
