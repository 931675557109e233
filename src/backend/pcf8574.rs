use embedded_hal::i2c::I2c;
use log::{info, warn};

use crate::config::{BackendKind, Polarity};
use crate::error::AppError;
use crate::relay::RelayBackend;

const PCF8574_PIN_COUNT: u32 = 8;

/// PCF8574 8-bit quasi-bidirectional I2C port expander.
///
/// The chip has no registers: a one-byte write sets all eight latches, a
/// one-byte read returns the pin levels.
pub struct Pcf8574<I2C> {
    name: String,
    i2c: I2C,
    address: u8,
    polarity: Polarity,
    connected: bool,
    latch: u8,
}

impl<I2C: I2c> Pcf8574<I2C> {
    pub fn new(name: impl Into<String>, i2c: I2C, address: u8, polarity: Polarity) -> Self {
        let mut dev = Self {
            name: name.into(),
            i2c,
            address,
            polarity,
            connected: false,
            latch: 0xFF, // power-on state
        };
        dev.connected = dev.probe();
        dev
    }

    fn probe(&mut self) -> bool {
        let mut buf = [0u8];
        match self.i2c.read(self.address, &mut buf) {
            Ok(()) => {
                info!("{}: PCF8574 found at 0x{:02x}", self.name, self.address);
                true
            }
            Err(e) => {
                warn!(
                    "{}: no PCF8574 answering at 0x{:02x}: {e:?}",
                    self.name, self.address
                );
                false
            }
        }
    }

    fn mask(pin: u32) -> Result<u8, AppError> {
        if pin >= PCF8574_PIN_COUNT {
            return Err(AppError::InvalidValue(format!("PCF8574 has no pin {pin}")));
        }
        Ok(1 << pin)
    }

    fn latch_pin(&mut self, pin: u32, level: bool) -> Result<(), AppError> {
        let mask = Self::mask(pin)?;
        if level {
            self.latch |= mask;
        } else {
            self.latch &= !mask;
        }
        self.i2c.write(self.address, &[self.latch]).map_err(|e| {
            AppError::BusWrite(format!("{}@0x{:02x}: {e:?}", self.name, self.address))
        })
    }
}

impl<I2C: I2c + Send> RelayBackend for Pcf8574<I2C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Pcf8574
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
        self.latch_pin(pin, self.polarity.level(false))
    }

    fn write(&mut self, pin: u32, on: bool) -> Result<(), AppError> {
        if !self.connected {
            return Ok(());
        }
        self.latch_pin(pin, self.polarity.level(on))
    }

    fn read(&mut self, pin: u32) -> Result<bool, AppError> {
        let mask = Self::mask(pin)?;
        if !self.connected {
            return Ok(self.polarity.logical(self.latch & mask != 0));
        }

        let mut buf = [0u8];
        self.i2c.read(self.address, &mut buf).map_err(|e| {
            AppError::Gpio(format!("{}@0x{:02x}: {e:?}", self.name, self.address))
        })?;
        Ok(self.polarity.logical(buf[0] & mask != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};

    struct FakePort {
        present: bool,
        port: u8,
        writes: Vec<u8>,
    }

    impl FakePort {
        fn new(present: bool) -> Self {
            Self {
                present,
                port: 0xFF,
                writes: Vec::new(),
            }
        }
    }

    impl ErrorType for FakePort {
        type Error = ErrorKind;
    }

    impl I2c for FakePort {
        fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if !self.present {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        for b in bytes.iter() {
                            self.port = *b;
                            self.writes.push(*b);
                        }
                    }
                    Operation::Read(buf) => buf.fill(self.port),
                }
            }
            Ok(())
        }
    }

    #[test]
    fn active_low_relay_pulls_pin_down_when_on() {
        let mut dev = Pcf8574::new("a", FakePort::new(true), 0x20, Polarity::ActiveLow);
        assert!(dev.is_connected());

        dev.configure_output(2).unwrap();
        assert_eq!(dev.i2c.writes, vec![0xFF]);

        dev.write(2, true).unwrap();
        assert_eq!(dev.i2c.port, 0b1111_1011);
        assert!(dev.read(2).unwrap());

        dev.write(2, false).unwrap();
        assert_eq!(dev.i2c.port, 0xFF);
        assert!(!dev.read(2).unwrap());
    }

    #[test]
    fn active_high_relays_start_low() {
        let mut dev = Pcf8574::new("a", FakePort::new(true), 0x20, Polarity::ActiveHigh);
        dev.configure_output(0).unwrap();
        dev.configure_output(7).unwrap();
        assert_eq!(dev.i2c.port, 0b0111_1110);

        dev.write(7, true).unwrap();
        assert_eq!(dev.i2c.port, 0b1111_1110);
    }

    #[test]
    fn missing_chip_is_a_silent_no_op() {
        let mut dev = Pcf8574::new("a", FakePort::new(false), 0x20, Polarity::ActiveLow);
        assert!(!dev.is_connected());

        dev.configure_output(1).unwrap();
        dev.write(1, true).unwrap();
        assert!(dev.i2c.writes.is_empty());
        // latch never moved, so the pin still reads as released
        assert!(!dev.read(1).unwrap());
    }

    #[test]
    fn bus_failure_after_probe_is_reported() {
        let mut dev = Pcf8574::new("a", FakePort::new(true), 0x20, Polarity::ActiveHigh);
        dev.i2c.present = false;
        assert!(matches!(dev.write(3, true), Err(AppError::BusWrite(_))));
    }

    #[test]
    fn rejects_pins_past_seven() {
        let mut dev = Pcf8574::new("a", FakePort::new(true), 0x20, Polarity::ActiveHigh);
        assert!(matches!(dev.write(8, true), Err(AppError::InvalidValue(_))));
    }
}
