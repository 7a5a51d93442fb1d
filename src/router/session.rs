//! The `WsSession` actor: one instance per WebSocket connection, covering
//! all three accept paths (spec.md §4.2/§6) and the full connect/disconnect
//! lifecycle (spec.md §4.3).

use std::sync::Arc;
use std::time::Instant;

use actix::{Actor, ActorFutureExt, AsyncContext, Handler, StreamHandler};
use actix_web_actors::ws;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use slog::{debug, info, warn};

use crate::ids::{DeviceId, UserId};
use crate::manager::{ConnHandle, ConnId, Disconnect as ManagerDisconnect, ServerFrame};
use crate::protocol::{self, out, InboundFrame};
use crate::router::auth_extract::{self, GenericAuthFrame};
use crate::router::dispatch::Dispatcher;
use crate::router::AppState;

/// What a connection currently is. The `*Start` variants are transient:
/// they carry the information gathered before the actor was spawned (query
/// params already verified by the router handler) and are consumed the
/// moment [`Actor::started`] runs.
pub(crate) enum ConnState {
    /// `/ws`, no credentials presented yet.
    PendingGeneric,
    /// `/ws/device`, already HMAC-verified; owner resolved.
    RobotStart { device_id: DeviceId, owner: Option<UserId> },
    /// `/ws/app`, already token-verified.
    AppStart { user_id: UserId },
    /// A registered robot connection.
    Robot { device_id: DeviceId, owner: Option<UserId>, conn_id: ConnId },
    /// A registered app connection.
    App { user_id: UserId, conn_id: ConnId },
}

/// One WebSocket connection. Holds no table of its own: every durable fact
/// (who owns what, who is online, what sessions exist) lives in the
/// [`crate::manager::ConnectionManager`] this session registers itself with
/// on `started()` and tears down from on `stopped()`.
pub struct WsSession {
    pub(crate) state: ConnState,
    pub(crate) ip: String,
    pub(crate) app: Arc<AppState>,
    hb: Instant,
}

impl WsSession {
    /// Builds a session for the `/ws/device` accept path; auth has already
    /// run in the route handler.
    #[must_use]
    pub fn new_robot(
        device_id: DeviceId,
        owner: Option<UserId>,
        ip: String,
        app: Arc<AppState>,
    ) -> Self {
        Self { state: ConnState::RobotStart { device_id, owner }, ip, app, hb: Instant::now() }
    }

    /// Builds a session for the `/ws/app` accept path; auth has already run
    /// in the route handler.
    #[must_use]
    pub fn new_app(user_id: UserId, ip: String, app: Arc<AppState>) -> Self {
        Self { state: ConnState::AppStart { user_id }, ip, app, hb: Instant::now() }
    }

    /// Builds a session for the generic `/ws` accept path; the first frame
    /// must be a `type: auth` frame (spec.md §6).
    #[must_use]
    pub fn new_pending(ip: String, app: Arc<AppState>) -> Self {
        Self { state: ConnState::PendingGeneric, ip, app, hb: Instant::now() }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = self.app.settings.ws.ping_interval;
        let timeout = self.app.settings.ws.pong_timeout;
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                warn!(slog_scope::logger(), "heartbeat timed out, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Registers this connection as a robot with the manager and runs the
    /// post-connect notifications spec.md §4.2 describes for the robot
    /// side: tell the owner's live app connections the robot is online,
    /// then asynchronously flip the device-status store.
    fn register_as_robot(
        &mut self,
        device_id: DeviceId,
        owner: Option<UserId>,
        send_auth_result: bool,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let handle = ConnHandle {
            frame: ctx.address().recipient(),
            disconnect: ctx.address().recipient(),
        };
        let conn_id = self.app.manager.register_robot(device_id.clone(), handle, self.ip.clone());
        self.state = ConnState::Robot { device_id: device_id.clone(), owner: owner.clone(), conn_id };

        if let Some(owner) = &owner {
            self.app.manager.send_to_user_apps(owner, out::robot_connected(device_id.as_str()));
            self.app.manager.send_to_user_apps(owner, out::robot_status(device_id.as_str(), true));
        }
        if send_auth_result {
            ctx.text(out::auth_result(true).to_string());
        }

        info!(slog_scope::logger(), "robot connected"; "device_id" => device_id.as_str(), "ip" => &self.ip);

        let app = self.app.clone();
        let device_id2 = device_id;
        ctx.spawn(actix::fut::wrap_future(async move {
            app.device_status_store.update_device_online_status(&device_id2, true).await;
        }));
    }

    /// Registers this connection as an app with the manager and runs the
    /// post-connect notifications spec.md §4.2 describes for the app side:
    /// restore any sessions preserved from a grace period, report every
    /// owned device's online state, tell each online robot its owner
    /// reconnected, then asynchronously sync dog metrics.
    fn register_as_app(
        &mut self,
        user_id: UserId,
        send_auth_result: bool,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let handle = ConnHandle {
            frame: ctx.address().recipient(),
            disconnect: ctx.address().recipient(),
        };
        let conn_id = self.app.manager.register_app(user_id.clone(), handle, self.ip.clone());
        self.state = ConnState::App { user_id: user_id.clone(), conn_id };

        if let Some(sessions) = self.app.manager.cancel_grace_period(&user_id) {
            for (session_id, _device_id) in sessions {
                if self.app.manager.rebind_session_app(&session_id, conn_id) {
                    ctx.text(out::session_restored(&session_id).to_string());
                }
            }
        }

        if send_auth_result {
            ctx.text(out::auth_result(true).to_string());
        }

        for device_id in self.app.manager.devices_for_user(&user_id) {
            let online = self.app.manager.is_robot_online(&device_id);
            ctx.text(out::robot_status(device_id.as_str(), online).to_string());
            if online {
                self.app.manager.send_to_robot(&device_id, out::user_connected(user_id.as_str()));
            }
        }

        info!(slog_scope::logger(), "app connected"; "user_id" => user_id.as_str(), "ip" => &self.ip);

        let app = self.app.clone();
        let user_id2 = user_id;
        ctx.spawn(
            actix::fut::wrap_future(async move {
                let dogs = app.dog_store.get_user_dogs(&user_id2).await;
                let since = Utc::now() - ChronoDuration::days(1);
                let mut synced = Vec::with_capacity(dogs.len());
                for dog in dogs {
                    let metrics = app.dog_store.get_metrics(&dog.dog_id, &user_id2, since).await;
                    synced.push((dog, metrics));
                }
                synced
            })
            .map(|synced, _act: &mut Self, ctx| {
                for (dog, metrics) in synced {
                    let metrics_json =
                        serde_json::to_value(&metrics).unwrap_or(Value::Null);
                    ctx.text(out::metrics_sync(&dog.dog_id, &dog.name, metrics_json).to_string());
                }
            }),
        );
    }

    fn close_with(&self, ctx: &mut ws::WebsocketContext<Self>, code: u16, reason: &str) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Other(code),
            description: Some(reason.to_owned()),
        }));
        ctx.stop();
    }

    /// The only frame a [`ConnState::PendingGeneric`] connection may send:
    /// a `type: auth` frame carrying either device credentials or a bearer
    /// token (spec.md §6). Anything else closes with code 4000; a
    /// recognized shape that fails verification closes with code 4001.
    fn handle_first_frame(&mut self, obj: Map<String, Value>, ctx: &mut ws::WebsocketContext<Self>) {
        let auth_obj = match protocol::classify(obj) {
            Some(InboundFrame::Auth(map)) => map,
            _ => {
                self.close_with(ctx, 4000, "first frame must be an auth frame");
                return;
            }
        };

        match auth_extract::generic_auth_frame(&auth_obj) {
            Some(GenericAuthFrame::Robot(params)) => {
                if !crate::auth::hmac_sig::verify(
                    params.device_id.as_str(),
                    params.timestamp.as_deref(),
                    &params.signature,
                    &self.app.settings.auth.device_secret,
                ) {
                    self.close_with(ctx, 4001, "bad signature");
                    return;
                }
                let app = self.app.clone();
                let lookup_id = params.device_id.clone();
                let register_id = params.device_id;
                ctx.spawn(
                    actix::fut::wrap_future(async move {
                        app.pairing_store.get_device_owner(&lookup_id).await
                    })
                    .map(move |owner, act: &mut Self, ctx| {
                        act.register_as_robot(register_id, owner, true, ctx);
                    }),
                );
            }
            Some(GenericAuthFrame::App(token)) => {
                match crate::auth::token::decode_token(&token, &self.app.settings.auth.token_secret)
                {
                    Some(claims) if !claims.sub.is_empty() => {
                        self.register_as_app(claims.user_id(), true, ctx);
                    }
                    _ => self.close_with(ctx, 4001, "bad or expired token"),
                }
            }
            None => self.close_with(ctx, 4000, "malformed auth frame"),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                debug!(slog_scope::logger(), "dropping non-JSON frame");
                return;
            }
        };
        let obj = match value {
            Value::Object(o) => o,
            _ => return,
        };

        if matches!(self.state, ConnState::PendingGeneric) {
            self.handle_first_frame(obj, ctx);
            return;
        }

        let frame = match protocol::classify(obj) {
            Some(f) => f,
            None => {
                debug!(slog_scope::logger(), "dropping unroutable frame");
                return;
            }
        };

        if let ConnState::App { user_id, .. } = &self.state {
            self.app.manager.touch_activity(user_id);
        }

        let raw_len = text.len();
        let mut dispatcher = Dispatcher { session: self, ctx, raw_len };
        frame.dispatch_with(&mut dispatcher);
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.start_heartbeat(ctx);

        match std::mem::replace(&mut self.state, ConnState::PendingGeneric) {
            ConnState::RobotStart { device_id, owner } => {
                self.register_as_robot(device_id, owner, false, ctx);
            }
            ConnState::AppStart { user_id } => {
                self.register_as_app(user_id, false, ctx);
            }
            other => self.state = other,
        }
    }

    /// Runs the full disconnect cascade (spec.md §4.3 "Disconnect
    /// cleanup"): a robot's sessions and online status are torn down
    /// unconditionally unless this connection was already displaced; an
    /// app's sessions are torn down immediately if other live connections
    /// remain for the user, otherwise preserved under a grace timer.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        match &self.state {
            ConnState::Robot { device_id, owner, conn_id } => {
                let device_id = device_id.clone();
                let owner = owner.clone();
                let manager = self.app.manager.clone();
                if manager.unregister_robot(&device_id, *conn_id) {
                    manager.cleanup_robot_sessions(&device_id);
                    if let Some(owner) = &owner {
                        manager
                            .send_to_user_apps(owner, out::robot_disconnected(device_id.as_str()));
                        manager.send_to_user_apps(owner, out::robot_status(device_id.as_str(), false));
                    }
                    info!(slog_scope::logger(), "robot disconnected"; "device_id" => device_id.as_str());

                    let app = self.app.clone();
                    actix::spawn(async move {
                        app.device_status_store.update_device_online_status(&device_id, false).await;
                    });
                }
            }
            ConnState::App { user_id, conn_id } => {
                let user_id = user_id.clone();
                let conn_id = *conn_id;
                let manager = self.app.manager.clone();
                manager.unregister_app(&user_id, conn_id);

                if manager.user_has_live_apps(&user_id) {
                    manager.remove_app_conn_sessions(&user_id, conn_id);
                } else {
                    let sessions = manager.list_app_conn_sessions(&user_id, conn_id);
                    let period =
                        std::time::Duration::from_secs(self.app.settings.grace.period_seconds);
                    if !manager.extend_grace_period(&user_id, sessions.clone()) {
                        manager.start_grace_period(user_id.clone(), sessions, period);
                    }
                    info!(slog_scope::logger(), "app disconnected, grace period started"; "user_id" => user_id.as_str());
                }
            }
            ConnState::PendingGeneric | ConnState::RobotStart { .. } | ConnState::AppStart { .. } => {}
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(m) => m,
            Err(e) => {
                warn!(slog_scope::logger(), "ws protocol error"; "error" => %e);
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Ping(bytes) => {
                self.hb = Instant::now();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => self.hb = Instant::now(),
            ws::Message::Text(text) => self.handle_text(&text, ctx),
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Binary(_) | ws::Message::Continuation(_) | ws::Message::Nop => {}
        }
    }
}

impl Handler<ServerFrame> for WsSession {
    type Result = ();
    fn handle(&mut self, msg: ServerFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0.to_string());
    }
}

impl Handler<ManagerDisconnect> for WsSession {
    type Result = ();
    fn handle(&mut self, _msg: ManagerDisconnect, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some("superseded by a newer connection".to_owned()),
        }));
        ctx.stop();
    }
}
