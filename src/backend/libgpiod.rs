use log::{info, warn};
use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};
use rustc_hash::FxHashMap;

use crate::config::{BackendKind, Polarity};
use crate::error::AppError;
use crate::relay::RelayBackend;

/// On-board GPIO lines through the Linux GPIO character device.
pub struct LibgpiodBackend {
    name: String,
    chip: String,
    polarity: Polarity,
    connected: bool,
    lines: FxHashMap<u32, request::Request>, // keyed by line offset
    latched: FxHashMap<u32, bool>,
}

impl LibgpiodBackend {
    pub fn open(name: impl Into<String>, chip: impl Into<String>, polarity: Polarity) -> Self {
        let name = name.into();
        let chip = chip.into();
        let connected = match Self::open_chip(&chip) {
            Ok(_) => {
                info!("{name}: opened {chip}");
                true
            }
            Err(e) => {
                warn!("{name}: {e}");
                false
            }
        };

        Self {
            name,
            chip,
            polarity,
            connected,
            lines: FxHashMap::default(),
            latched: FxHashMap::default(),
        }
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn value(level: bool) -> line::Value {
        if level {
            line::Value::Active
        } else {
            line::Value::InActive
        }
    }

    fn request_output(&self, offset: u32, level: bool) -> Result<request::Request, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Output)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_drive(line::Drive::PushPull)
            .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
        ls.set_output_value(Self::value(level))
            .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;

        let mut line_cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        line_cfg
            .add_line_settings(&[offset], ls)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;

        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;

        Self::open_chip(&self.chip)?
            .request_lines(Some(&req_cfg), &line_cfg)
            .map_err(|e| AppError::Gpio(format!("request line {offset}: {e}")))
    }
}

impl RelayBackend for LibgpiodBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn configure_output(&mut self, pin: u32) -> Result<(), AppError> {
        if !self.connected || self.lines.contains_key(&pin) {
            return Ok(());
        }

        let level = self.polarity.level(false);
        let request = self.request_output(pin, level)?;
        self.lines.insert(pin, request);
        self.latched.insert(pin, level);

        Ok(())
    }

    fn write(&mut self, pin: u32, on: bool) -> Result<(), AppError> {
        if !self.connected {
            return Ok(());
        }

        let level = self.polarity.level(on);
        let request = self
            .lines
            .get_mut(&pin)
            .ok_or_else(|| AppError::Gpio(format!("line {pin} not configured as output")))?;
        request
            .set_value(pin, Self::value(level))
            .map_err(|e| AppError::BusWrite(format!("{} line {pin}: {e}", self.name)))?;
        self.latched.insert(pin, level);

        Ok(())
    }

    fn read(&mut self, pin: u32) -> Result<bool, AppError> {
        let stale = self
            .latched
            .get(&pin)
            .copied()
            .unwrap_or(self.polarity.level(false));
        let Some(request) = self.lines.get(&pin).filter(|_| self.connected) else {
            return Ok(self.polarity.logical(stale));
        };

        let level = match request
            .value(pin)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?
        {
            line::Value::InActive => false,
            line::Value::Active => true,
        };
        Ok(self.polarity.logical(level))
    }
}
