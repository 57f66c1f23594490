/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The timeout scheduler: one-shot timers that put liveness deadlines on each step of a round,
//! growing linearly with the round number so that rounds eventually become long enough for an
//! honest proposer's block to arrive everywhere.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::round_state::Step;
use crate::types::{BlockHeight, Round};

/// Durations for each step's timer. Each of propose, prevote-wait and precommit-wait grows by its
/// `delta` for every round taken, so repeated failed rounds stretch the deadlines until progress
/// is possible again. The commit timeout is flat: it is breathing room between heights, not a
/// liveness deadline.
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub propose_base: Duration,
    pub propose_delta: Duration,
    pub prevote_base: Duration,
    pub prevote_delta: Duration,
    pub precommit_base: Duration,
    pub precommit_delta: Duration,
    pub commit: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> TimeoutConfig {
        TimeoutConfig {
            propose_base: Duration::from_millis(3000),
            propose_delta: Duration::from_millis(500),
            prevote_base: Duration::from_millis(1000),
            prevote_delta: Duration::from_millis(500),
            precommit_base: Duration::from_millis(1000),
            precommit_delta: Duration::from_millis(500),
            commit: Duration::from_millis(1000),
        }
    }
}

impl TimeoutConfig {
    /// The duration of the timer armed at `step` of `round`.
    pub fn duration_for(&self, step: Step, round: Round) -> Duration {
        match step {
            Step::Propose => self.propose_base + self.propose_delta * round,
            Step::PrevoteWait => self.prevote_base + self.prevote_delta * round,
            Step::PrecommitWait => self.precommit_base + self.precommit_delta * round,
            Step::NewHeight => self.commit,
            // Other steps never arm a timer.
            _ => Duration::ZERO,
        }
    }
}

/// Identifies the timer that expired: the (height, round, step) it was armed at. The consensus
/// thread compares this against its current position and ignores expiries that arrive after the
/// step they guarded has already been left.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct TimeoutInfo {
    pub height: BlockHeight,
    pub round: Round,
    pub step: Step,
}

impl TimeoutInfo {
    /// Whether this expiry still matters at position (`height`, `round`, `step`).
    ///
    /// A timer fired at an old height or round never matters. Within the current round, a timer
    /// matters only if the step it guarded has not been passed: e.g. the propose timer is moot
    /// once a prevote has been cast.
    pub fn is_relevant(&self, height: BlockHeight, round: Round, step: Step) -> bool {
        if self.height != height {
            return false;
        }
        match self.step {
            // The commit timer of a height fires while the round field has already moved on, so
            // only the step gates it.
            Step::NewHeight => step == Step::NewHeight,
            _ => self.round == round && step <= self.step,
        }
    }
}

enum ArmedTimer {
    None,
    Armed { deadline: Instant, info: TimeoutInfo },
}

/// Start the timeout scheduler thread.
///
/// The scheduler holds at most one armed timer. Arming requests arrive on `schedule`, and a newer
/// request always replaces the armed timer, since the consensus thread only ever moves forward.
/// Expiries are delivered to `expired`. The thread exits when every [TimeoutScheduler] handle has
/// been dropped.
pub(crate) fn start_scheduler(
    schedule: Receiver<TimeoutRequest>,
    expired: Sender<TimeoutInfo>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut armed = ArmedTimer::None;
        loop {
            let wait = match &armed {
                ArmedTimer::None => Duration::from_millis(100),
                ArmedTimer::Armed { deadline, .. } => {
                    deadline.saturating_duration_since(Instant::now())
                }
            };

            match schedule.recv_timeout(wait) {
                Ok(request) => {
                    armed = ArmedTimer::Armed {
                        deadline: Instant::now() + request.duration,
                        info: request.info,
                    };
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let ArmedTimer::Armed { deadline, info } = &armed {
                        if Instant::now() >= *deadline {
                            let info = *info;
                            armed = ArmedTimer::None;
                            // The consensus thread hanging up means shutdown.
                            if expired.send(info).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

pub(crate) struct TimeoutRequest {
    pub(crate) info: TimeoutInfo,
    pub(crate) duration: Duration,
}

/// The consensus thread's handle for arming timers.
#[derive(Clone)]
pub(crate) struct TimeoutScheduler {
    config: TimeoutConfig,
    schedule: Sender<TimeoutRequest>,
}

impl TimeoutScheduler {
    pub(crate) fn new(config: TimeoutConfig, schedule: Sender<TimeoutRequest>) -> TimeoutScheduler {
        TimeoutScheduler { config, schedule }
    }

    /// Arm the timer for (`height`, `round`, `step`), replacing whatever timer is armed.
    pub(crate) fn arm(&self, height: BlockHeight, round: Round, step: Step) {
        let request = TimeoutRequest {
            info: TimeoutInfo {
                height,
                round,
                step,
            },
            duration: self.config.duration_for(step, round),
        };
        // Failure means the scheduler thread is gone, which only happens during shutdown.
        let _ = self.schedule.send(request);
    }
}
