//! The WebSocket router (spec.md §4.2): the three accept paths, shared
//! application state, and the ambient HTTP surface (`/health`, `/stats`,
//! `/api/turn/credentials`) SPEC_FULL.md §2/§4.2 adds around the core.

mod auth_extract;
mod dispatch;
mod session;

use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use slog::info;

use crate::config::Settings;
use crate::manager::ConnectionManager;
use crate::store::{DeviceStatusStore, DogMetricsStore, PairingStore};
use crate::turn::TurnClient;

pub use session::WsSession;

/// Shared, request-handler-visible application state: the connection
/// manager plus every external collaborator the router calls through
/// (spec.md §6, SPEC_FULL.md §6).
pub struct AppState {
    pub manager: ConnectionManager,
    pub settings: Settings,
    pub turn: TurnClient,
    pub pairing_store: Box<dyn PairingStore>,
    pub dog_store: Box<dyn DogMetricsStore>,
    pub device_status_store: Box<dyn DeviceStatusStore>,
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info().peer_addr().unwrap_or("unknown").to_owned()
}

/// A minimal actor that completes the WebSocket handshake and immediately
/// closes with a given close code, used to reject bad auth the way
/// spec.md §6's close-code table requires (the WS protocol has no way to
/// refuse with a specific code *before* the handshake completes).
struct RejectSession {
    code: u16,
    reason: String,
}

impl actix::Actor for RejectSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Other(self.code),
            description: Some(std::mem::take(&mut self.reason)),
        }));
        ctx.stop();
    }
}

impl actix::StreamHandler<Result<ws::Message, ws::ProtocolError>> for RejectSession {
    fn handle(
        &mut self,
        _item: Result<ws::Message, ws::ProtocolError>,
        _ctx: &mut Self::Context,
    ) {
    }
}

fn reject(
    req: &HttpRequest,
    stream: web::Payload,
    code: u16,
    reason: &str,
) -> actix_web::Result<HttpResponse> {
    ws::start(RejectSession { code, reason: reason.to_owned() }, req, stream)
}

/// `GET /ws/device` — robot accept path (spec.md §6): query/header
/// `device_id` + `sig` (+ optional `timestamp`), verified via the
/// five-layout HMAC verifier.
pub async fn device_ws(
    req: HttpRequest,
    stream: web::Payload,
    app: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let ip = client_ip(&req);
    let params = match auth_extract::device_auth(&req) {
        Some(p) => p,
        None => return reject(&req, stream, 4000, "missing device auth params"),
    };
    if !crate::auth::hmac_sig::verify(
        params.device_id.as_str(),
        params.timestamp.as_deref(),
        &params.signature,
        &app.settings.auth.device_secret,
    ) {
        return reject(&req, stream, 4001, "bad signature");
    }

    let owner = app.pairing_store.get_device_owner(&params.device_id).await;
    let session = WsSession::new_robot(params.device_id, owner, ip, app.into_inner());
    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(20 * 1024 * 1024)
        .start()
}

/// `GET /ws/app` — mobile app accept path (spec.md §6): query `token`,
/// decoded as a bearer token whose subject claim becomes the user id.
pub async fn app_ws(
    req: HttpRequest,
    stream: web::Payload,
    app: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let ip = client_ip(&req);
    let token = match auth_extract::app_token(&req) {
        Some(t) => t,
        None => return reject(&req, stream, 4001, "missing token"),
    };
    let claims =
        match crate::auth::token::decode_token(&token, &app.settings.auth.token_secret) {
            Some(c) if !c.sub.is_empty() => c,
            _ => return reject(&req, stream, 4001, "bad or expired token"),
        };

    let session = WsSession::new_app(claims.user_id(), ip, app.into_inner());
    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(20 * 1024 * 1024)
        .start()
}

/// `GET /ws` — generic accept path (spec.md §6): no credentials at
/// handshake time, expects the first frame to be a `type: auth` message.
pub async fn generic_ws(
    req: HttpRequest,
    stream: web::Payload,
    app: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let ip = client_ip(&req);
    let session = WsSession::new_pending(ip, app.into_inner());
    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(20 * 1024 * 1024)
        .start()
}

/// `GET /health` (SPEC_FULL.md §4.2, ported from the Python `main.py`
/// `health_check`).
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// `GET /stats` (SPEC_FULL.md §4.1).
pub async fn stats(app: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(app.manager.stats())
}

#[derive(serde::Deserialize)]
pub struct DeviceRegisterRequest {
    device_id: String,
}

#[derive(serde::Serialize)]
pub struct DeviceRegisterResponse {
    success: bool,
}

/// `POST /api/device/register` — the device registration signature check
/// (SPEC_FULL.md §4.5, ported from
/// `app/routers/device.py::register_device`): verifies the `Authorization:
/// HMAC-SHA256 <sig>` header against the device-id-only layout. The
/// Python endpoint's device-CRUD persistence (a pairing code, the
/// `devices_db` row) is out of scope per spec.md §1's Non-goal; this
/// route only performs the auth check itself.
pub async fn device_register(
    req: HttpRequest,
    app: web::Data<AppState>,
    body: web::Json<DeviceRegisterRequest>,
) -> actix_web::Result<HttpResponse> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .map(|header| {
            crate::auth::hmac_sig::verify_registration(
                &body.device_id,
                header,
                &app.settings.auth.device_secret,
            )
        })
        .unwrap_or(false);
    if !authorized {
        return Err(crate::error::Error::AuthFailed.into());
    }
    Ok(HttpResponse::Ok().json(DeviceRegisterResponse { success: true }))
}

#[derive(serde::Deserialize)]
pub struct TurnCredentialsRequest {
    ttl_seconds: Option<u64>,
}

/// `POST /api/turn/credentials` — the one HTTP surface the TURN client
/// backs directly (SPEC_FULL.md §6); mints fresh ICE server credentials
/// with the configured or caller-supplied TTL.
pub async fn turn_credentials(
    app: web::Data<AppState>,
    body: web::Json<TurnCredentialsRequest>,
) -> actix_web::Result<HttpResponse> {
    let ttl = body
        .ttl_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| app.turn.default_ttl());
    let ice_servers = app
        .turn
        .generate_credentials(ttl)
        .await
        .map_err(crate::error::Error::from)?;
    Ok(HttpResponse::Ok().json(ice_servers))
}

/// Registers every route this crate's core owns directly: the three WS
/// accept paths, the ambient `/health`, `/stats` and TURN HTTP surface
/// (SPEC_FULL.md §4.2/§6), and the device registration signature check
/// (SPEC_FULL.md §4.5). Device/user CRUD, pairing, music upload and the
/// rest of spec.md §6's HTTP surface are out of scope Non-goals and are
/// not wired here.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/device", web::get().to(device_ws))
        .route("/ws/app", web::get().to(app_ws))
        .route("/ws", web::get().to(generic_ws))
        .route("/health", web::get().to(health))
        .route("/stats", web::get().to(stats))
        .route("/api/device/register", web::post().to(device_register))
        .route("/api/turn/credentials", web::post().to(turn_credentials));
}

/// Builds and runs the HTTP/WS server, binding the address from
/// `settings.socket` and seeding the connection manager's ownership map
/// from `app_state.pairing_store` (spec.md §3 "Seeded from the external
/// persistent store at process start").
///
/// # Errors
///
/// Propagates any I/O error binding the configured socket.
pub async fn run(settings: Settings, app_state: AppState) -> std::io::Result<()> {
    let bind_addr = settings.socket.bind_addr();
    let pairings = app_state.pairing_store.get_all_device_pairings().await;
    app_state.manager.seed_ownership(pairings);

    let data = web::Data::new(app_state);
    info!(slog_scope::logger(), "cloud relay listening"; "addr" => &bind_addr);

    let shutdown_manager = data.manager.clone();
    actix::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(slog_scope::logger(), "shutdown signal received, cancelling grace timers");
            shutdown_manager.cancel_all_grace_periods();
        }
    });

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(1024 * 1024))
            .wrap(Cors::permissive())
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
