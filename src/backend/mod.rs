#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mcp23017;
pub mod mock;
pub mod pcf8574;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mcp23017::Mcp23017;
pub use mock::{MockCall, MockHandle, MockRelayBackend};
pub use pcf8574::Pcf8574;

use crate::config::{BackendKind, Polarity};
use crate::error::AppError;
use crate::relay::RelayBackend;

/// Placeholder for a declared backend whose bus could not even be opened.
pub struct OfflineBackend {
    name: String,
    kind: BackendKind,
    polarity: Polarity,
}

impl OfflineBackend {
    pub fn new(name: impl Into<String>, kind: BackendKind, polarity: Polarity) -> Self {
        Self {
            name: name.into(),
            kind,
            polarity,
        }
    }
}

impl RelayBackend for OfflineBackend {
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
        false
    }

    fn configure_output(&mut self, _pin: u32) -> Result<(), AppError> {
        Ok(())
    }

    fn write(&mut self, _pin: u32, _on: bool) -> Result<(), AppError> {
        Ok(())
    }

    fn read(&mut self, _pin: u32) -> Result<bool, AppError> {
        Ok(false)
    }
}
