use embedded_hal::i2c::I2c;
use log::{info, warn};

use crate::config::{BackendKind, Polarity};
use crate::error::AppError;
use crate::relay::RelayBackend;

const MCP23017_PIN_COUNT: u32 = 16;

// register addresses with IOCON.BANK = 0 (power-on default)
mod reg {
    pub const IODIRA: u8 = 0x00;
    pub const GPIOA: u8 = 0x12;
    pub const OLATA: u8 = 0x14;
}

/// MCP23017 16-bit I2C port expander, pins 0-7 on port A and 8-15 on port B.
pub struct Mcp23017<I2C> {
    name: String,
    i2c: I2C,
    address: u8,
    polarity: Polarity,
    connected: bool,
    iodir: [u8; 2],
    olat: [u8; 2],
}

impl<I2C: I2c> Mcp23017<I2C> {
    pub fn new(name: impl Into<String>, i2c: I2C, address: u8, polarity: Polarity) -> Self {
        let released = if polarity.level(false) { 0xFF } else { 0x00 };
        let mut dev = Self {
            name: name.into(),
            i2c,
            address,
            polarity,
            connected: false,
            iodir: [0xFF; 2],
            olat: [released; 2],
        };
        dev.connected = dev.probe();
        dev
    }

    fn probe(&mut self) -> bool {
        let mut iodir = [0u8; 2];
        match self.i2c.write_read(self.address, &[reg::IODIRA], &mut iodir) {
            Ok(()) => {
                info!("{}: MCP23017 found at 0x{:02x}", self.name, self.address);
                self.iodir = iodir;
                true
            }
            Err(e) => {
                warn!(
                    "{}: no MCP23017 answering at 0x{:02x}: {e:?}",
                    self.name, self.address
                );
                false
            }
        }
    }

    /// Port index (0 = A, 1 = B) and bit mask for `pin`.
    fn locate(pin: u32) -> Result<(usize, u8), AppError> {
        if pin >= MCP23017_PIN_COUNT {
            return Err(AppError::InvalidValue(format!("MCP23017 has no pin {pin}")));
        }
        Ok(((pin / 8) as usize, 1 << (pin % 8)))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), AppError> {
        self.i2c.write(self.address, &[register, value]).map_err(|e| {
            AppError::BusWrite(format!(
                "{}@0x{:02x} reg 0x{register:02x}: {e:?}",
                self.name, self.address
            ))
        })
    }

    fn set_bit(byte: &mut u8, mask: u8, level: bool) {
        if level {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

impl<I2C: I2c + Send> RelayBackend for Mcp23017<I2C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mcp23017
    }

    fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn configure_output(&mut self, pin: u32) -> Result<(), AppError> {
        if !self.connected {
            return Ok(());
        }
        let (port, mask) = Self::locate(pin)?;

        // latch the released level before turning the driver on
        Self::set_bit(&mut self.olat[port], mask, self.polarity.level(false));
        self.write_register(reg::OLATA + port as u8, self.olat[port])?;

        self.iodir[port] &= !mask;
        self.write_register(reg::IODIRA + port as u8, self.iodir[port])
    }

    fn write(&mut self, pin: u32, on: bool) -> Result<(), AppError> {
        if !self.connected {
            return Ok(());
        }
        let (port, mask) = Self::locate(pin)?;
        Self::set_bit(&mut self.olat[port], mask, self.polarity.level(on));
        self.write_register(reg::OLATA + port as u8, self.olat[port])
    }

    fn read(&mut self, pin: u32) -> Result<bool, AppError> {
        let (port, mask) = Self::locate(pin)?;
        if !self.connected {
            return Ok(self.polarity.logical(self.olat[port] & mask != 0));
        }

        let mut value = [0u8];
        self.i2c
            .write_read(self.address, &[reg::GPIOA + port as u8], &mut value)
            .map_err(|e| AppError::Gpio(format!("{}@0x{:02x}: {e:?}", self.name, self.address)))?;
        Ok(self.polarity.logical(value[0] & mask != 0))
    }
}
