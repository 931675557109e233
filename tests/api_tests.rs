use std::sync::Arc;

use actix_web::{App, test, web};
use parking_lot::Mutex;
use relayctl::{
    AppConfig, AppState, MockHandle, MockRelayBackend, PinMapping, RelayBackend, RelayBank,
    SelfTest,
};
use serde_json::Value;

struct Fixture {
    state: AppState,
    board: MockHandle,
    expander: MockHandle,
}

fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1"
            },
            "self_test": {
                "pattern": "on-off-on",
                "dwell_ms": 0
            },
            "backends": [
                {
                    "name": "board",
                    "kind": "native",
                    "chip": "/dev/gpiochip0",
                    "polarity": "active-high",
                    "pins": [32, 33, 25, 26, 27, 14, 12, 13]
                },
                {
                    "name": "expander",
                    "kind": "mcp23017",
                    "bus": "/dev/i2c-1",
                    "address": 32,
                    "polarity": "active-low",
                    "pins": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                }
            ],
            "labels": [
                { "index": 3, "label": "A1", "row": 2, "column": 1 },
                { "index": 4, "label": "A2 <pump>", "row": 1, "column": 2 }
            ]
        }
        "#,
    )
    .expect("valid sample config")
}

/// Bank over mocks with the sequencer already run, as `main` does at boot.
fn fixture(expander_connected: bool) -> Fixture {
    let cfg = Arc::new(sample_config());
    let board = MockRelayBackend::new("board", cfg.backends[0].polarity);
    let expander = match expander_connected {
        true => MockRelayBackend::new("expander", cfg.backends[1].polarity),
        false => MockRelayBackend::disconnected("expander", cfg.backends[1].polarity),
    };
    let expander = expander.with_kind(cfg.backends[1].kind);
    let (board_log, expander_log) = (board.handle(), expander.handle());

    let backends: Vec<Box<dyn RelayBackend>> = vec![Box::new(board), Box::new(expander)];
    let mut bank = RelayBank::initialize(
        PinMapping::from_config(&cfg),
        backends,
        cfg.initial_state.as_bool(),
    )
    .expect("bank initializes");
    let report = SelfTest::new(&cfg.self_test).run(&mut bank, &mut NoDelay);

    board_log.clear();
    expander_log.clear();

    Fixture {
        state: AppState::new(Arc::new(Mutex::new(bank)), cfg, report),
        board: board_log,
        expander: expander_log,
    }
}

struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

macro_rules! init_app {
    ($state:expr) => {{
        let state: &AppState = &$state;
        let scope_path = state.config.http.path.clone();
        test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(state.api_scope(&scope_path)),
        )
        .await
    }};
}

#[actix_rt::test]
async fn list_relays_returns_all_in_index_order() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let req = test::TestRequest::get().uri("/api/v1/relays").to_request();
    let relays: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(relays.len(), 24);
    assert_eq!(relays[0]["backend"], "board");
    assert_eq!(relays[0]["pin"], 32);
    assert_eq!(relays[8]["backend"], "expander");
    assert_eq!(relays[8]["pin"], 0);
    assert!(relays.iter().all(|r| r["state"] == false));
}

#[actix_rt::test]
async fn toggle_query_flips_state_and_back() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let req = test::TestRequest::get()
        .uri("/api/v1/toggle?relay=3")
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["relay"], 3);
    assert_eq!(resp["state"], true);
    assert_eq!(fx.board.writes(), vec![(26, true)]);

    let req = test::TestRequest::get().uri("/api/v1/relays").to_request();
    let relays: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    for (i, relay) in relays.iter().enumerate() {
        assert_eq!(relay["state"], i == 3);
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/toggle?relay=3")
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["state"], false);
}

#[actix_rt::test]
async fn toggle_out_of_range_returns_404_and_changes_nothing() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let req = test::TestRequest::get()
        .uri("/api/v1/toggle?relay=24")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/relay/99/toggle")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    assert!(fx.state.bank.lock().states().iter().all(|s| !s));
    assert!(fx.board.writes().is_empty());
    assert!(fx.expander.writes().is_empty());
}

#[actix_rt::test]
async fn toggle_with_bad_parameter_returns_400() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    for uri in ["/api/v1/toggle", "/api/v1/toggle?relay=abc", "/api/v1/toggle?relay=-1"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{uri}");
    }
}

#[actix_rt::test]
async fn disconnected_expander_toggles_cache_only() {
    let fx = fixture(false);
    let app = init_app!(fx.state);

    let req = test::TestRequest::post()
        .uri("/api/v1/relay/10/toggle")
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["state"], true);
    assert!(fx.expander.calls().is_empty());

    let req = test::TestRequest::get().uri("/api/v1/relay/10").to_request();
    let info: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(info["state"], true);
    assert_eq!(info["connected"], false);

    let req = test::TestRequest::get().uri("/api/v1/backends").to_request();
    let backends: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(backends[0]["connected"], true);
    assert_eq!(backends[1]["name"], "expander");
    assert_eq!(backends[1]["kind"], "mcp23017");
    assert_eq!(backends[1]["connected"], false);
}

#[actix_rt::test]
async fn expander_toggle_writes_active_low() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let req = test::TestRequest::post()
        .uri("/api/v1/relay/9/toggle")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    assert_eq!(fx.expander.writes(), vec![(1, false)]);
    assert!(fx.board.writes().is_empty());
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let req = test::TestRequest::post().uri("/api/v1/relays").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::get()
        .uri("/api/v1/relay/1/toggle")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn self_test_report_is_done_and_restored() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let req = test::TestRequest::get().uri("/api/v1/self-test").to_request();
    let report: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(report["phase"], "done");
    assert_eq!(report["pattern"], "on-off-on");
    assert_eq!(report["relays_tested"], 24);
    assert_eq!(report["write_faults"], 0);
    assert_eq!(report["readback_mismatches"], 0);

    assert!(fx.state.bank.lock().states().iter().all(|s| !s));
}

#[actix_rt::test]
async fn index_page_renders_states_labels_and_warnings() {
    let fx = fixture(false);
    fx.state.toggle(3).expect("relay 3 exists");
    let app = init_app!(fx.state);

    let req = test::TestRequest::get().uri("/api/v1/").to_request();
    let body = test::call_and_read_body(&app, req).await;
    let html = std::str::from_utf8(&body).expect("utf-8 page");

    assert!(html.contains("<h1>Relay Control</h1>"));
    assert!(html.contains("toggleRelay(3)"));
    assert!(html.contains("grid-row: 2; grid-column: 1; "));
    assert!(html.contains("background-color: green;\" title=\"board pin 26\">A1</button>"));
    assert!(html.contains("A2 &lt;pump&gt;"));
    assert!(html.contains(">R24</button>"));
    assert!(html.contains("expander is not connected"));
}

#[actix_rt::test]
async fn toggles_are_broadcast_to_subscribers() {
    let fx = fixture(true);
    let mut rx = fx.state.subscribe_events();

    fx.state.toggle(5).expect("relay 5 exists");

    let event = rx.try_recv().expect("event published");
    assert_eq!(event.relay, 5);
    assert!(event.state);
}

#[actix_rt::test]
async fn relay_event_stream_upgrades_for_known_relay_only() {
    let fx = fixture(true);
    let app = init_app!(fx.state);

    let upgrade = |uri: &str| {
        test::TestRequest::get()
            .uri(uri)
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "Upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="))
            .to_request()
    };

    let resp = test::call_service(&app, upgrade("/api/v1/relay/5/events")).await;
    assert_eq!(resp.status(), 101);

    let resp = test::call_service(&app, upgrade("/api/v1/relay/24/events")).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get()
        .uri("/api/v1/relay/5/events")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/relay/5/events")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}
