use log::warn;
use std::fmt::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::relay::{BackendStatus, RelayBank, RelayInfo};
use crate::selftest::SelfTestReport;

pub type SharedBank = Arc<Mutex<RelayBank>>;

#[derive(Clone)]
pub struct AppState {
    pub bank: SharedBank,
    pub config: Arc<AppConfig>,
    pub self_test: Arc<SelfTestReport>,
    events: broadcast::Sender<RelayEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    pub relay: usize,
    pub state: bool,
    pub timestamp_ms: u64,
}

#[derive(Serialize)]
struct ToggleResponse {
    relay: usize,
    state: bool,
}

#[derive(Deserialize, Default)]
struct ToggleQuery {
    relay: Option<String>,
}

impl AppState {
    pub fn new(bank: SharedBank, config: Arc<AppConfig>, self_test: SelfTestReport) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            bank,
            config,
            self_test: Arc::new(self_test),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Toggles under the bank lock, then announces the new state.
    pub fn toggle(&self, relay: usize) -> Result<bool, AppError> {
        let state = self.bank.lock().toggle(relay)?;
        let _ = self.events.send(RelayEvent {
            relay,
            state,
            timestamp_ms: epoch_millis(),
        });
        Ok(state)
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path.trim_end_matches('/'))
            .service(
                web::resource("/")
                    .route(web::get().to(index_page))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/toggle")
                    .route(web::get().to(toggle_query))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relays")
                    .route(web::get().to(list_relays))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relays/events")
                    .route(web::get().to(events_ws_all))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relay/{index}")
                    .route(web::get().to(relay_info))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relay/{index}/toggle")
                    .route(web::post().to(toggle_relay))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relay/{index}/events")
                    .route(web::get().to(events_ws_relay))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/backends")
                    .route(web::get().to(list_backends))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/self-test")
                    .route(web::get().to(self_test_report))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<RelayEvent>,
    relay_filter: Option<usize>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if relay_filter.map(|r| r == event.relay).unwrap_or(true)
                            && let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = format!("Relay event stream lagged by {n} messages");
                        if session.text(notice).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn index_page(state: web::Data<AppState>) -> impl Responder {
    let (relays, backends) = {
        let bank = state.bank.lock();
        (bank.relays(), bank.backend_status())
    };

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_page(&state.config, &relays, &backends))
}

async fn toggle_query(
    query: web::Query<ToggleQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let raw = query
        .relay
        .as_deref()
        .ok_or_else(|| AppError::InvalidValue("Missing 'relay' parameter".into()))?;
    let relay = parse_index(raw)?;
    let new_state = state.toggle(relay)?;

    Ok(web::Json(ToggleResponse {
        relay,
        state: new_state,
    }))
}

async fn toggle_relay(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let relay = parse_index_param(&req)?;
    let new_state = state.toggle(relay)?;

    Ok(web::Json(ToggleResponse {
        relay,
        state: new_state,
    }))
}

async fn list_relays(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let relays = state.bank.lock().relays();

    Ok(web::Json(relays))
}

async fn relay_info(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let relay = parse_index_param(&req)?;
    let info = state.bank.lock().relay_info(relay)?;

    Ok(web::Json(info))
}

async fn list_backends(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let backends = state.bank.lock().backend_status();

    Ok(web::Json(backends))
}

async fn self_test_report(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.self_test.as_ref().clone()))
}

async fn events_ws_all(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    start_event_websocket(&req, stream, &state, None)
}

async fn events_ws_relay(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let relay = parse_index_param(&req)?;
    state.bank.lock().state(relay)?;

    start_event_websocket(&req, stream, &state, Some(relay))
}

fn start_event_websocket(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState,
    relay_filter: Option<usize>,
) -> Result<HttpResponse, AppError> {
    let rx = state.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::InvalidValue(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, relay_filter).await;
    });

    Ok(response)
}

fn parse_index(raw: &str) -> Result<usize, AppError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| AppError::InvalidValue(format!("Invalid relay index '{raw}'")))
}

fn parse_index_param(req: &HttpRequest) -> Result<usize, AppError> {
    let index = req
        .match_info()
        .get("index")
        .ok_or_else(|| AppError::InvalidValue("Missing relay index".into()))?;

    parse_index(index)
}

fn render_page(config: &AppConfig, relays: &[RelayInfo], backends: &[BackendStatus]) -> String {
    let placed = relays.iter().any(|r| {
        config
            .label_for(r.index)
            .is_some_and(|l| l.row.is_some() && l.column.is_some())
    });

    let mut html = String::from("<html><head><meta charset=\"utf-8\"><title>Relay Control</title></head><body><h1>Relay Control</h1>");

    for backend in backends.iter().filter(|b| !b.connected) {
        let _ = write!(
            html,
            "<p class=\"offline\" style=\"color: darkorange;\">{} is not connected: its relays change state here but not on the board.</p>",
            escape_html(&backend.name)
        );
    }

    html.push_str(if placed {
        "<div style='display: grid; grid-auto-rows: 50px; grid-auto-columns: 50px; gap: 10px;'>"
    } else {
        "<div style='display: flex; flex-wrap: wrap; gap: 10px;'>"
    });

    for relay in relays {
        let label = config.label_for(relay.index);
        let text = label
            .map(|l| escape_html(&l.label))
            .unwrap_or_else(|| format!("R{}", relay.index + 1));
        let placement = label
            .and_then(|l| Some(format!("grid-row: {}; grid-column: {}; ", l.row?, l.column?)))
            .unwrap_or_default();
        let color = if relay.state { "green" } else { "red" };
        let _ = write!(
            html,
            "<button onclick=\"toggleRelay({index})\" style=\"{placement}min-width: 50px; height: 50px; background-color: {color};{dim}\" title=\"{backend} pin {pin}\">{text}</button>",
            index = relay.index,
            dim = if relay.connected { "" } else { " opacity: 0.6;" },
            backend = escape_html(&relay.backend),
            pin = relay.pin,
        );
    }

    html.push_str("</div>");
    html.push_str("<script>function toggleRelay(relay) { fetch('toggle?relay=' + relay).then(response => response.text()).then(data => { location.reload(); }); }</script>");
    html.push_str("</body></html>");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
