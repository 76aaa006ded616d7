//! Delay-based ordering of concurrent workers.
//!
//! Workers never talk to each other while a scenario runs. Their critical
//! statements are ordered by start offsets and by dwell/hold windows during
//! which one worker keeps its transaction open. The ordering is best effort:
//! a starved scheduler can still reorder statements, which the verdict
//! heuristics treat as noise rather than as a result.
//!
//! With `timing.handshake` enabled, workers additionally exchange one-shot
//! cues over channels, so every follower starts its offset only after the
//! leader reported its first observation.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::config::TimingConfig;
use crate::session::CancelSlot;

/// Symbolic delay, resolved against [`TimingConfig`] at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delay {
    Stagger,
    WriterOffset,
    Dwell,
    ContenderOffset,
    Hold,
}

impl Delay {
    pub fn resolve(self, timing: &TimingConfig) -> Duration {
        match self {
            Delay::Stagger => timing.stagger(),
            Delay::WriterOffset => timing.writer_offset(),
            Delay::Dwell => timing.dwell(),
            Delay::ContenderOffset => timing.contender_offset(),
            Delay::Hold => timing.hold(),
        }
    }
}

const PAUSE_SLICE: Duration = Duration::from_millis(10);

/// Sleeps for `duration`, waking early if `slot` is cancelled.
///
/// Returns `false` when the pause was cut short.
pub fn pause(duration: Duration, slot: &CancelSlot) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if slot.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(PAUSE_SLICE.min(deadline - now));
    }
}

/// Runs `f` and measures its wall-clock duration.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}

/// Common time origin of the workers of one scenario execution.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn since_start(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// One worker's end of the optional cue exchange.
///
/// The leader holds a sender per follower; each follower holds the
/// receiving end of its own channel.
pub struct Handshake {
    enabled: bool,
    to_followers: Vec<Sender<()>>,
    from_leader: Option<Receiver<()>>,
}

impl Handshake {
    /// Ends for `workers` workers, leader first.
    pub fn group(enabled: bool, workers: usize) -> Vec<Handshake> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (1..workers.max(1))
            .map(|_| channel::bounded::<()>(1))
            .unzip();
        let leader = Handshake {
            enabled,
            to_followers: senders,
            from_leader: None,
        };
        std::iter::once(leader)
            .chain(receivers.into_iter().map(|rx| Handshake {
                enabled,
                to_followers: Vec::new(),
                from_leader: Some(rx),
            }))
            .collect()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Tells every follower the leader reached its cue point. Never blocks.
    pub fn signal(&self) {
        if !self.enabled {
            return;
        }
        for tx in &self.to_followers {
            // A full or disconnected channel means the follower already got
            // its cue or is gone.
            let _ = tx.try_send(());
        }
    }

    /// Waits for the leader's cue. Returns `false` on timeout, on a vanished
    /// leader, or when `slot` is cancelled. Always `true` when disabled.
    pub fn await_cue(&self, timeout: Duration, slot: &CancelSlot) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(from_leader) = &self.from_leader else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        loop {
            if slot.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match from_leader.recv_timeout(PAUSE_SLICE.min(deadline - now)) {
                Ok(()) => return true,
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_resolve_from_timing() {
        let timing = TimingConfig {
            stagger_ms: 1,
            writer_offset_ms: 2,
            dwell_ms: 3,
            contender_offset_ms: 4,
            hold_ms: 5,
            handshake: false,
        };
        assert_eq!(Delay::Stagger.resolve(&timing), Duration::from_millis(1));
        assert_eq!(Delay::Dwell.resolve(&timing), Duration::from_millis(3));
        assert_eq!(Delay::Hold.resolve(&timing), Duration::from_millis(5));
    }

    #[test]
    fn pause_stops_on_cancel() {
        let slot = CancelSlot::new();
        let canceller = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });
        let (completed, took) = timed(|| pause(Duration::from_secs(5), &slot));
        handle.join().unwrap();
        assert!(!completed);
        assert!(took < Duration::from_secs(2));
    }

    #[test]
    fn cue_reaches_every_follower() {
        let mut ends = Handshake::group(true, 3);
        let leader = ends.remove(0);
        let slot = CancelSlot::new();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            leader.signal();
            leader
        });
        let waiters: Vec<_> = ends
            .into_iter()
            .map(|follower| {
                let slot = slot.clone();
                thread::spawn(move || follower.await_cue(Duration::from_secs(2), &slot))
            })
            .collect();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        drop(handle.join().unwrap());
    }

    #[test]
    fn disabled_handshake_never_waits() {
        let ends = Handshake::group(false, 2);
        let (ok, took) = timed(|| ends[1].await_cue(Duration::from_secs(5), &CancelSlot::new()));
        assert!(ok);
        assert!(took < Duration::from_millis(100));
    }

    #[test]
    fn missing_cue_times_out() {
        let ends = Handshake::group(true, 2);
        assert!(!ends[1].await_cue(Duration::from_millis(30), &CancelSlot::new()));
        // The leader never waits on anyone.
        assert!(!ends[0].await_cue(Duration::from_millis(30), &CancelSlot::new()));
    }
}
