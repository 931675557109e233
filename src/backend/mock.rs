use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{BackendKind, Polarity};
use crate::error::AppError;
use crate::relay::RelayBackend;

/// An adapter call as received, whether or not the backend is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Configure(u32),
    Write(u32, bool),
}

#[derive(Default)]
struct MockLog {
    calls: Vec<MockCall>,
    configured: Vec<u32>,
    writes: Vec<(u32, bool)>, // electrical levels, in call order
    levels: FxHashMap<u32, bool>,
    stuck: FxHashSet<u32>,
    fail_writes: bool,
}

/// Inspection handle that stays valid after the backend moves into a bank.
#[derive(Clone, Default)]
pub struct MockHandle(Arc<Mutex<MockLog>>);

impl MockHandle {
    pub fn calls(&self) -> Vec<MockCall> {
        self.0.lock().calls.clone()
    }

    pub fn configured(&self) -> Vec<u32> {
        self.0.lock().configured.clone()
    }

    pub fn writes(&self) -> Vec<(u32, bool)> {
        self.0.lock().writes.clone()
    }

    pub fn level(&self, pin: u32) -> Option<bool> {
        self.0.lock().levels.get(&pin).copied()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.0.lock().fail_writes = fail;
    }

    /// Writes to `pin` are accepted but its level never changes, like a welded contact.
    pub fn stick(&self, pin: u32) {
        self.0.lock().stuck.insert(pin);
    }

    pub fn clear(&self) {
        let mut log = self.0.lock();
        log.calls.clear();
        log.configured.clear();
        log.writes.clear();
    }
}

/// In-memory backend standing in for any chip.
pub struct MockRelayBackend {
    name: String,
    kind: BackendKind,
    polarity: Polarity,
    connected: bool,
    log: MockHandle,
}

impl MockRelayBackend {
    pub fn new(name: impl Into<String>, polarity: Polarity) -> Self {
        Self {
            name: name.into(),
            kind: BackendKind::Native,
            polarity,
            connected: true,
            log: MockHandle::default(),
        }
    }

    /// A backend whose probe failed.
    pub fn disconnected(name: impl Into<String>, polarity: Polarity) -> Self {
        Self {
            connected: false,
            ..Self::new(name, polarity)
        }
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.log.clone()
    }
}

impl RelayBackend for MockRelayBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn configure_output(&mut self, pin: u32) -> Result<(), AppError> {
        let mut log = self.log.0.lock();
        log.calls.push(MockCall::Configure(pin));
        if !self.connected {
            return Ok(());
        }
        log.configured.push(pin);
        log.levels.insert(pin, self.polarity.level(false));
        Ok(())
    }

    fn write(&mut self, pin: u32, on: bool) -> Result<(), AppError> {
        let mut log = self.log.0.lock();
        log.calls.push(MockCall::Write(pin, on));
        if !self.connected {
            return Ok(());
        }
        if log.fail_writes {
            return Err(AppError::BusWrite(format!("{}: pin {pin} nacked", self.name)));
        }
        let level = self.polarity.level(on);
        log.writes.push((pin, level));
        if !log.stuck.contains(&pin) {
            log.levels.insert(pin, level);
        }
        Ok(())
    }

    fn read(&mut self, pin: u32) -> Result<bool, AppError> {
        let level = self
            .log
            .0
            .lock()
            .levels
            .get(&pin)
            .copied()
            .unwrap_or(self.polarity.level(false));
        Ok(self.polarity.logical(level))
    }
}
