mod backend;
mod config;
mod error;
mod relay;
mod routes;
mod selftest;

pub use config::{
    AppConfig, BackendConfig, BackendKind, HttpConfig, InitialState, Polarity, PulsePattern,
    RelayLabel, SelfTestConfig,
};
pub use error::AppError;
pub use relay::{BackendStatus, PinMapping, PinRoute, RelayBackend, RelayBank, RelayInfo};
pub use routes::{AppState, RelayEvent, SharedBank};
pub use selftest::{BlockingDelay, SelfTest, SelfTestPhase, SelfTestReport};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{Mcp23017, MockCall, MockHandle, MockRelayBackend, OfflineBackend, Pcf8574};
