use std::thread;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use log::{info, warn};
use serde::Serialize;

use crate::config::{PulsePattern, SelfTestConfig};
use crate::relay::RelayBank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelfTestPhase {
    Idle,
    Running,
    Done,
}

enum Stage {
    Idle,
    Running { next: usize, snapshot: Vec<bool> },
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub phase: SelfTestPhase,
    pub pattern: PulsePattern,
    pub relays_tested: usize,
    pub write_faults: usize,
    pub readback_mismatches: usize,
}

/// One-shot boot sweep pulsing every relay and restoring the prior states.
///
/// Each [`SelfTest::step`] does a bounded slice of work: the first takes the
/// snapshot, every following one pulses a single relay (blocking for the dwell
/// interval), and the one that finishes the last relay restores the snapshot.
/// Once `Done`, further steps do nothing.
pub struct SelfTest {
    stage: Stage,
    enabled: bool,
    pattern: PulsePattern,
    dwell_ms: u32,
    tested: usize,
    faults: usize,
    mismatches: usize,
}

impl SelfTest {
    pub fn new(config: &SelfTestConfig) -> Self {
        Self {
            stage: Stage::Idle,
            enabled: config.enabled,
            pattern: config.pattern,
            dwell_ms: config.dwell_ms,
            tested: 0,
            faults: 0,
            mismatches: 0,
        }
    }

    pub fn phase(&self) -> SelfTestPhase {
        match self.stage {
            Stage::Idle => SelfTestPhase::Idle,
            Stage::Running { .. } => SelfTestPhase::Running,
            Stage::Done => SelfTestPhase::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }

    pub fn report(&self) -> SelfTestReport {
        SelfTestReport {
            phase: self.phase(),
            pattern: self.pattern,
            relays_tested: self.tested,
            write_faults: self.faults,
            readback_mismatches: self.mismatches,
        }
    }

    pub fn step<D: DelayNs>(&mut self, bank: &mut RelayBank, delay: &mut D) -> SelfTestPhase {
        self.stage = match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Idle if !self.enabled => {
                info!("self-test disabled");
                Stage::Done
            }
            Stage::Idle => {
                info!(
                    "self-test: sweeping {} relays ({:?}, {} ms dwell)",
                    bank.len(),
                    self.pattern,
                    self.dwell_ms
                );
                Stage::Running {
                    next: 0,
                    snapshot: bank.states().to_vec(),
                }
            }
            Stage::Running { next, snapshot } if next < bank.len() => {
                self.pulse(bank, next, delay);
                if next + 1 < bank.len() {
                    Stage::Running {
                        next: next + 1,
                        snapshot,
                    }
                } else {
                    self.restore(bank, &snapshot)
                }
            }
            Stage::Running { snapshot, .. } => self.restore(bank, &snapshot),
            Stage::Done => Stage::Done,
        };

        self.phase()
    }

    /// Steps until `Done`, blocking the caller for the whole sweep.
    pub fn run<D: DelayNs>(&mut self, bank: &mut RelayBank, delay: &mut D) -> SelfTestReport {
        while self.step(bank, delay) != SelfTestPhase::Done {}
        self.report()
    }

    fn pulse<D: DelayNs>(&mut self, bank: &mut RelayBank, index: usize, delay: &mut D) {
        let (pulse, rest) = self.pattern.levels();

        match bank.drive(index, pulse) {
            Ok(()) => self.verify(bank, index, pulse),
            Err(e) => {
                warn!("self-test: relay {index} pulse failed: {e}");
                self.faults += 1;
            }
        }
        delay.delay_ms(self.dwell_ms);
        if let Err(e) = bank.drive(index, rest) {
            warn!("self-test: relay {index} release failed: {e}");
            self.faults += 1;
        }

        self.tested += 1;
    }

    fn verify(&mut self, bank: &mut RelayBank, index: usize, expected: bool) {
        match bank.read_back(index) {
            Ok(Some(actual)) if actual != expected => {
                warn!("self-test: relay {index} reads {actual} after writing {expected}");
                self.mismatches += 1;
            }
            Ok(_) => {}
            Err(e) => warn!("self-test: relay {index} read-back failed: {e}"),
        }
    }

    fn restore(&mut self, bank: &mut RelayBank, snapshot: &[bool]) -> Stage {
        match bank.set_all(snapshot) {
            Ok(failed) => self.faults += failed,
            Err(e) => warn!("self-test: restore failed: {e}"),
        }
        info!(
            "self-test done: {} relays pulsed, {} write faults, {} read-back mismatches",
            self.tested, self.faults, self.mismatches
        );
        Stage::Done
    }
}

/// Dwell implementation that parks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingDelay;

impl DelayNs for BlockingDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns.into()));
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }
}
