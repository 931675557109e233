use std::{fs, path::Path};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Native,
    Pcf8574,
    Mcp23017,
}

impl BackendKind {
    /// Number of addressable pins on the chip, `None` when bounded only by the gpiochip.
    pub fn pin_count(&self) -> Option<u32> {
        match self {
            BackendKind::Native => None,
            BackendKind::Pcf8574 => Some(8),
            BackendKind::Mcp23017 => Some(16),
        }
    }

    pub fn is_i2c(&self) -> bool {
        !matches!(self, BackendKind::Native)
    }
}

/// Electrical sense of a backend's outputs.
///
/// Relay boards are wired either way round, so every backend declares which
/// level energizes its coils instead of call sites picking `HIGH`/`LOW`.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Electrical level (`true` = high) that represents the logical state `on`.
    pub fn level(&self, on: bool) -> bool {
        match self {
            Polarity::ActiveHigh => on,
            Polarity::ActiveLow => !on,
        }
    }

    /// Logical state represented by an electrical level.
    pub fn logical(&self, level: bool) -> bool {
        self.level(level)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InitialState {
    Off,
    On,
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState::Off
    }
}

impl InitialState {
    pub fn as_bool(&self) -> bool {
        matches!(self, InitialState::On)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PulsePattern {
    /// Energize, dwell, release.
    #[default]
    OffOnOff,
    /// Release, dwell, energize.
    OnOffOn,
}

impl PulsePattern {
    /// Logical levels `(pulse, rest)` a relay is driven through during the sweep.
    pub fn levels(&self) -> (bool, bool) {
        match self {
            PulsePattern::OffOnOff => (true, false),
            PulsePattern::OnOffOn => (false, true),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SelfTestConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pattern: PulsePattern,
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u32,
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern: PulsePattern::default(),
            dwell_ms: default_dwell_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub kind: BackendKind,
    pub chip: Option<String>,
    pub bus: Option<String>,
    pub address: Option<u8>,
    pub polarity: Polarity,
    #[serde(default = "default_true")]
    pub present: bool,
    pub pins: Vec<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayLabel {
    pub index: usize,
    pub label: String,
    pub row: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default)]
    pub self_test: SelfTestConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub labels: Vec<RelayLabel>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_dwell_ms() -> u32 {
    1000
}

fn default_event_capacity() -> usize {
    64
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Backends fitted on this board, in declaration order.
    pub fn present_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.present)
    }

    /// Total relay count, backends marked absent contribute nothing.
    pub fn relay_count(&self) -> usize {
        self.present_backends().map(|b| b.pins.len()).sum()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let mut names = FxHashSet::default();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }

            match backend.kind {
                BackendKind::Native if backend.chip.is_none() => {
                    return Err(AppError::Config(format!(
                        "native backend '{}' requires 'chip'",
                        backend.name
                    )));
                }
                kind if kind.is_i2c() && backend.address.is_none() => {
                    return Err(AppError::Config(format!(
                        "i2c backend '{}' requires 'address'",
                        backend.name
                    )));
                }
                _ => {}
            }

            let mut pins = FxHashSet::default();
            for pin in &backend.pins {
                if !pins.insert(*pin) {
                    return Err(AppError::Config(format!(
                        "backend '{}' lists pin {pin} twice",
                        backend.name
                    )));
                }
                if let Some(count) = backend.kind.pin_count()
                    && *pin >= count
                {
                    return Err(AppError::Config(format!(
                        "backend '{}' has no pin {pin} (chip has {count})",
                        backend.name
                    )));
                }
            }
        }

        let count = self.relay_count();
        if let Some(label) = self.labels.iter().find(|l| l.index >= count) {
            return Err(AppError::Config(format!(
                "label '{}' refers to relay {} but only {count} relays exist",
                label.label, label.index
            )));
        }

        Ok(())
    }

    pub fn label_for(&self, index: usize) -> Option<&RelayLabel> {
        self.labels.iter().find(|l| l.index == index)
    }
}
