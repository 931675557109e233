use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{AppConfig, BackendKind, Polarity};
use crate::error::AppError;

/// A physical mechanism driving a group of relay outputs.
///
/// Adapters translate logical on/off into their own electrical level using the
/// [`Polarity`] declared at construction. Connectivity is probed once when the
/// adapter is built and never re-probed.
pub trait RelayBackend: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> BackendKind;
    fn polarity(&self) -> Polarity;
    fn is_connected(&self) -> bool;
    fn configure_output(&mut self, pin: u32) -> Result<(), AppError>;
    fn write(&mut self, pin: u32, on: bool) -> Result<(), AppError>;
    fn read(&mut self, pin: u32) -> Result<bool, AppError>;
}

/// Where a logical relay lives: backend position and that backend's local pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinRoute {
    pub backend: usize,
    pub pin: u32,
}

/// Immutable logical index → backend routing table.
#[derive(Debug, Clone, Default)]
pub struct PinMapping {
    routes: Vec<PinRoute>,
}

impl PinMapping {
    pub fn new(routes: Vec<PinRoute>) -> Self {
        Self { routes }
    }

    /// Numbers relays contiguously in backend declaration order, then pin order.
    /// Backend positions count fitted backends only.
    pub fn from_config(config: &AppConfig) -> Self {
        let routes = config
            .present_backends()
            .enumerate()
            .flat_map(|(backend, cfg)| cfg.pins.iter().map(move |&pin| PinRoute { backend, pin }))
            .collect();
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn route(&self, index: usize) -> Option<PinRoute> {
        self.routes.get(index).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub kind: BackendKind,
    pub polarity: Polarity,
    pub connected: bool,
    pub faults: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub index: usize,
    pub backend: String,
    pub pin: u32,
    pub state: bool,
    pub connected: bool,
}

/// Owner of the relay state cache and every backend adapter.
///
/// The cache is authoritative: presentation reads it, hardware is only written
/// to. Relays on a disconnected backend keep tracking toggles in memory but
/// never reach the adapter.
pub struct RelayBank {
    mapping: PinMapping,
    backends: Vec<Box<dyn RelayBackend>>,
    states: Vec<bool>,
    faults: Vec<u64>,
}

impl RelayBank {
    pub fn initialize(
        mapping: PinMapping,
        backends: Vec<Box<dyn RelayBackend>>,
        initial: bool,
    ) -> Result<Self, AppError> {
        if let Some(route) = mapping.routes.iter().find(|r| r.backend >= backends.len()) {
            return Err(AppError::Config(format!(
                "pin {} routed to backend #{} but only {} backends exist",
                route.pin,
                route.backend,
                backends.len()
            )));
        }

        for backend in backends.iter().filter(|b| !b.is_connected()) {
            warn!(
                "{}; its relays run cache-only",
                AppError::BackendUnavailable(backend.name().to_string())
            );
        }

        let count = mapping.len();
        let mut bank = Self {
            faults: vec![0; backends.len()],
            states: vec![initial; count],
            mapping,
            backends,
        };

        for index in 0..count {
            let Some(route) = bank.mapping.route(index) else {
                continue;
            };
            let backend = &mut bank.backends[route.backend];
            if !backend.is_connected() {
                continue;
            }
            if let Err(e) = backend.configure_output(route.pin) {
                warn!("relay {index}: configure {} pin {} failed: {e}", backend.name(), route.pin);
                bank.faults[route.backend] += 1;
                continue;
            }
            let _ = bank.dispatch(route, initial);
        }

        info!(
            "relay bank ready: {count} relays on {} backends, initial state {}",
            bank.backends.len(),
            if initial { "on" } else { "off" }
        );

        Ok(bank)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn route(&self, index: usize) -> Result<PinRoute, AppError> {
        self.mapping.route(index).ok_or(AppError::OutOfRange(index))
    }

    /// Flips the cached state of `index` and returns the new value.
    ///
    /// Physical write failures are recorded against the backend and do not
    /// fail the toggle.
    pub fn toggle(&mut self, index: usize) -> Result<bool, AppError> {
        let route = self.route(index)?;
        let next = !self.states[index];
        self.states[index] = next;
        let _ = self.dispatch(route, next);

        Ok(next)
    }

    pub fn state(&self, index: usize) -> Result<bool, AppError> {
        self.states
            .get(index)
            .copied()
            .ok_or(AppError::OutOfRange(index))
    }

    /// Cached states in index order.
    pub fn states(&self) -> &[bool] {
        &self.states
    }

    /// Sets one relay to an explicit level, reporting a failed physical write.
    pub(crate) fn drive(&mut self, index: usize, on: bool) -> Result<(), AppError> {
        let route = self.route(index)?;
        self.states[index] = on;
        self.dispatch(route, on)
    }

    /// Rewrites every relay from `states`, continuing past failed writes.
    /// Returns how many physical writes failed.
    pub(crate) fn set_all(&mut self, states: &[bool]) -> Result<usize, AppError> {
        if states.len() != self.states.len() {
            return Err(AppError::InvalidValue(format!(
                "expected {} relay states, got {}",
                self.states.len(),
                states.len()
            )));
        }

        let failed = states
            .iter()
            .enumerate()
            .filter(|&(index, &on)| self.drive(index, on).is_err())
            .count();

        Ok(failed)
    }

    /// Electrical read-back through the adapter, `None` when the backend is offline.
    pub fn read_back(&mut self, index: usize) -> Result<Option<bool>, AppError> {
        let route = self.route(index)?;
        let backend = &mut self.backends[route.backend];
        if !backend.is_connected() {
            return Ok(None);
        }
        backend.read(route.pin).map(Some)
    }

    pub fn is_connected(&self, backend: usize) -> bool {
        self.backends
            .get(backend)
            .map(|b| b.is_connected())
            .unwrap_or(false)
    }

    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .zip(&self.faults)
            .map(|(b, &faults)| BackendStatus {
                name: b.name().to_string(),
                kind: b.kind(),
                polarity: b.polarity(),
                connected: b.is_connected(),
                faults,
            })
            .collect()
    }

    pub fn relay_info(&self, index: usize) -> Result<RelayInfo, AppError> {
        let route = self.route(index)?;
        let backend = &self.backends[route.backend];

        Ok(RelayInfo {
            index,
            backend: backend.name().to_string(),
            pin: route.pin,
            state: self.states[index],
            connected: backend.is_connected(),
        })
    }

    pub fn relays(&self) -> Vec<RelayInfo> {
        (0..self.len())
            .filter_map(|i| self.relay_info(i).ok())
            .collect()
    }

    fn dispatch(&mut self, route: PinRoute, on: bool) -> Result<(), AppError> {
        let backend = &mut self.backends[route.backend];
        if !backend.is_connected() {
            debug!("{} offline, pin {} kept in cache only", backend.name(), route.pin);
            return Ok(());
        }

        match backend.write(route.pin, on) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{} pin {}: {e}", backend.name(), route.pin);
                self.faults[route.backend] += 1;
                Err(e)
            }
        }
    }
}
