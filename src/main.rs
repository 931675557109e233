use log::{info, warn};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use parking_lot::Mutex;

use relayctl::{
    AppConfig, AppState, BackendConfig, BlockingDelay, PinMapping, RelayBackend, RelayBank,
    SelfTest,
};

#[cfg(feature = "hardware-gpio")]
use relayctl::{BackendKind, LibgpiodBackend, Mcp23017, OfflineBackend, Pcf8574};
#[cfg(not(feature = "hardware-gpio"))]
use relayctl::MockRelayBackend;

#[cfg(feature = "hardware-gpio")]
const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";

#[cfg(feature = "hardware-gpio")]
fn build_backend(cfg: &BackendConfig) -> Box<dyn RelayBackend> {
    use linux_embedded_hal::I2cdev;

    let address = cfg.address.unwrap_or_default();
    let bus = cfg.bus.as_deref().unwrap_or(DEFAULT_I2C_BUS);

    match cfg.kind {
        BackendKind::Native => Box::new(LibgpiodBackend::open(
            &cfg.name,
            cfg.chip.clone().unwrap_or_default(),
            cfg.polarity,
        )),
        kind => match I2cdev::new(bus) {
            Ok(i2c) if kind == BackendKind::Pcf8574 => {
                Box::new(Pcf8574::new(&cfg.name, i2c, address, cfg.polarity))
            }
            Ok(i2c) => Box::new(Mcp23017::new(&cfg.name, i2c, address, cfg.polarity)),
            Err(e) => {
                warn!("{}: cannot open {bus}: {e}", cfg.name);
                Box::new(OfflineBackend::new(&cfg.name, kind, cfg.polarity))
            }
        },
    }
}

#[cfg(not(feature = "hardware-gpio"))]
fn build_backend(cfg: &BackendConfig) -> Box<dyn RelayBackend> {
    warn!("{}: built without hardware-gpio, using in-memory backend", cfg.name);
    Box::new(MockRelayBackend::new(&cfg.name, cfg.polarity).with_kind(cfg.kind))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAYCTL_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(AppConfig::load_from_file(&config_path).map_err(io::Error::other)?);

    for absent in config.backends.iter().filter(|b| !b.present) {
        info!("{} marked absent, its pins are not mapped", absent.name);
    }
    let backends = config.present_backends().map(build_backend).collect();
    let mapping = PinMapping::from_config(&config);
    let mut bank = RelayBank::initialize(mapping, backends, config.initial_state.as_bool())
        .map_err(io::Error::other)?;

    // the sweep blocks boot on purpose: nothing is served until it is done
    let report = SelfTest::new(&config.self_test).run(&mut bank, &mut BlockingDelay);

    let app_state = AppState::new(Arc::new(Mutex::new(bank)), config.clone(), report);

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        (None, None) => {
            return Err(io::Error::other(
                "Config error: either 'unix_socket' or 'host' must be specified",
            ));
        }
    };

    info!("Starting server on {}...", bind_addrs);

    server.run().await
}
