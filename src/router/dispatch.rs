//! Per-frame dispatch (spec.md §4.2's table, §4.3's WebRTC signaling steps,
//! §4.2.1's command-forwarding pipeline), implemented as the
//! [`InboundFrameHandler`] the `#[dispatchable]` macro generates for
//! [`InboundFrame`].

use actix::{ActorFutureExt, AsyncContext};
use actix_web_actors::ws;
use serde_json::{Map, Value};
use slog::{debug, info, warn};

use crate::config::Settings;
use crate::error::ErrorCode;
use crate::ids::{DeviceId, SessionId, UserId};
use crate::manager::{ConnId, ConnectionManager, ForwardCommandError, RateLimited, SessionRecord};
use crate::protocol::{self, out, InboundFrameHandler};
use crate::router::session::{ConnState, WsSession};

/// Outcome of running an app-originated command through the §4.2.1
/// pipeline, kept separate from how `on_command` turns it into a reply so
/// the pipeline itself can be exercised without a socket.
#[derive(Debug)]
pub(crate) enum CommandOutcome {
    RateLimited(RateLimited),
    TooLarge,
    Stale { age_ms: i64 },
    NoDevice,
    Forwarded(Result<(), ForwardCommandError>),
}

/// Runs `data` through the full §4.2.1 pipeline (rate limit, size cap,
/// staleness check exempting uploads, target resolution, forwarding)
/// against `manager`. `on_command` is a thin adapter over this that turns
/// the outcome into a reply frame.
pub(crate) fn run_command_pipeline(
    manager: &ConnectionManager,
    settings: &Settings,
    user_id: &UserId,
    ip: &str,
    raw_len: usize,
    mut data: Map<String, Value>,
) -> CommandOutcome {
    let cmd_type = protocol::str_field(&data, "command").unwrap_or("unknown").to_owned();

    if let Some(rl) = manager.check_rate_limit(user_id, &cmd_type, ip, &settings.rate_limit) {
        return CommandOutcome::RateLimited(rl);
    }

    if raw_len > settings.ws.max_command_size {
        return CommandOutcome::TooLarge;
    }

    if !protocol::is_upload_command(&cmd_type) {
        if let Some(ts) = protocol::i64_field(&data, "timestamp") {
            let age_ms = chrono::Utc::now().timestamp_millis() - ts;
            if age_ms > settings.ws.stale_command_ms {
                return CommandOutcome::Stale { age_ms };
            }
        }
    }

    let device_id = match protocol::str_field(&data, "device_id")
        .or_else(|| protocol::str_field(&data, "target_device"))
        .map(|s| DeviceId(s.to_owned()))
        .or_else(|| manager.first_device_for_user(user_id))
    {
        Some(d) => d,
        None => return CommandOutcome::NoDevice,
    };

    protocol::strip_routing_fields(&mut data);
    CommandOutcome::Forwarded(manager.forward_command(user_id, &device_id, Value::Object(data)))
}

/// Short-lived handle bundling the session, its actor context and the raw
/// frame length, built fresh for each inbound text frame once it has been
/// classified (`session.rs`'s `handle_text`).
pub(crate) struct Dispatcher<'a> {
    pub(crate) session: &'a mut WsSession,
    pub(crate) ctx: &'a mut ws::WebsocketContext<WsSession>,
    pub(crate) raw_len: usize,
}

impl Dispatcher<'_> {
    fn reply(&mut self, v: Value) {
        self.ctx.text(v.to_string());
    }

    fn app_conn(&self) -> Option<(UserId, ConnId)> {
        match &self.session.state {
            ConnState::App { user_id, conn_id } => Some((user_id.clone(), *conn_id)),
            _ => None,
        }
    }

    fn robot_conn(&self) -> Option<(DeviceId, Option<UserId>)> {
        match &self.session.state {
            ConnState::Robot { device_id, owner, .. } => {
                Some((device_id.clone(), owner.clone()))
            }
            _ => None,
        }
    }

    fn lookup_session(&self, data: &Map<String, Value>) -> Option<SessionRecord> {
        let session_id = protocol::str_field(data, "session_id")?;
        self.session.app.manager.get_session(&SessionId(session_id.to_owned()))
    }

    /// Stamps `device_id`/`timestamp` and forwards to the owner's app
    /// connections, for the robot-originated notice frames (spec.md §4.2
    /// dispatch table's many `robot -> app, forwarded as-is` rows).
    fn forward_robot_notice(&mut self, mut data: Map<String, Value>) {
        let (device_id, _owner) = match self.robot_conn() {
            Some(x) => x,
            None => return,
        };
        protocol::stamp_device_id(&mut data, device_id.as_str());
        protocol::stamp_timestamp(&mut data);
        let sent = self.session.app.manager.forward_event(&device_id, Value::Object(data));
        if sent == 0 {
            debug!(
                slog_scope::logger(),
                "event had no app connection to deliver to";
                "device_id" => device_id.as_str(),
            );
        }
    }
}

impl InboundFrameHandler for Dispatcher<'_> {
    type Output = ();

    fn on_ping(&mut self) -> Self::Output {
        self.reply(out::pong());
    }

    fn on_auth(&mut self, _data: Map<String, Value>) -> Self::Output {
        debug!(slog_scope::logger(), "auth frame ignored outside the handshake");
    }

    /// App requests a fresh WebRTC session with a robot (spec.md §4.3 step
    /// A): resolve the target device, verify ownership and liveness,
    /// allocate the session, mint TURN credentials, and on success reply to
    /// the app while forwarding the offer invitation to the robot.
    fn on_webrtc_request(&mut self, data: Map<String, Value>) -> Self::Output {
        let (user_id, app_conn_id) = match self.app_conn() {
            Some(x) => x,
            None => return,
        };
        let manager = self.session.app.manager.clone();
        let device_id = match protocol::str_field(&data, "device_id")
            .map(|s| DeviceId(s.to_owned()))
            .or_else(|| manager.first_device_for_user(&user_id))
        {
            Some(d) => d,
            None => {
                self.reply(out::error(ErrorCode::NoDevice, "no device to route to"));
                return;
            }
        };
        if !manager.owns(&user_id, &device_id) {
            self.reply(out::error(ErrorCode::NotAuthorized, "not authorized for this device"));
            return;
        }
        if !manager.is_robot_online(&device_id) {
            self.reply(out::error(ErrorCode::DeviceOffline, "device is offline"));
            return;
        }

        let session_id = manager.create_webrtc_session(&device_id);
        manager.purge_stale_sessions_for_device(&device_id);

        let app = self.session.app.clone();
        let device_id2 = device_id;
        let session_id2 = session_id;
        let user_id2 = user_id;
        self.ctx.spawn(
            actix::fut::wrap_future(async move {
                let ttl = app.turn.default_ttl();
                app.turn.generate_credentials(ttl).await
            })
            .map(move |result, act: &mut WsSession, ctx| {
                let manager = act.app.manager.clone();
                match result {
                    Ok(ice) => {
                        manager.insert_session_record(SessionRecord {
                            session_id: session_id2.clone(),
                            device_id: device_id2.clone(),
                            user_id: user_id2,
                            app_conn_id,
                            created_at: chrono::Utc::now(),
                        });
                        ctx.text(
                            out::webrtc_credentials(&session_id2, ice.ice_servers.clone())
                                .to_string(),
                        );
                        manager.send_to_robot(
                            &device_id2,
                            out::webrtc_request(&session_id2, ice.ice_servers),
                        );
                    }
                    Err(e) => {
                        manager.rollback_webrtc_session(&device_id2, &session_id2);
                        ctx.text(out::error(ErrorCode::TurnError, &e.to_string()).to_string());
                    }
                }
            }),
        );
    }

    /// Robot's SDP offer, forwarded to the app side of the session (spec.md
    /// §4.3 step C). Dropped if the session is unknown, belongs to a
    /// different device, or its app connection is gone.
    fn on_webrtc_offer(&mut self, data: Map<String, Value>) -> Self::Output {
        let (device_id, _owner) = match self.robot_conn() {
            Some(x) => x,
            None => return,
        };
        let record = match self.lookup_session(&data) {
            Some(r) => r,
            None => {
                warn!(slog_scope::logger(), "webrtc_offer for unknown or stale session");
                return;
            }
        };
        if record.device_id != device_id {
            warn!(slog_scope::logger(), "webrtc_offer session/device mismatch");
            return;
        }
        if !self.session.app.manager.is_app_conn_live(&record.user_id, record.app_conn_id) {
            debug!(slog_scope::logger(), "webrtc_offer dropped: app connection gone");
            return;
        }
        self.session.app.manager.send_to_app_conn(
            &record.user_id,
            record.app_conn_id,
            Value::Object(data),
        );
    }

    /// App's SDP answer, forwarded to the robot (spec.md §4.3 step D).
    fn on_webrtc_answer(&mut self, data: Map<String, Value>) -> Self::Output {
        let (user_id, _conn_id) = match self.app_conn() {
            Some(x) => x,
            None => return,
        };
        let record = match self.lookup_session(&data) {
            Some(r) => r,
            None => {
                warn!(slog_scope::logger(), "webrtc_answer for unknown or stale session");
                return;
            }
        };
        if record.user_id != user_id {
            warn!(slog_scope::logger(), "webrtc_answer session/user mismatch");
            return;
        }
        self.session.app.manager.send_to_robot(&record.device_id, Value::Object(data));
    }

    /// ICE candidate from either side, forwarded to its peer (spec.md §4.3
    /// step E).
    fn on_webrtc_ice(&mut self, data: Map<String, Value>) -> Self::Output {
        let record = match self.lookup_session(&data) {
            Some(r) => r,
            None => {
                debug!(slog_scope::logger(), "webrtc_ice for unknown or stale session");
                return;
            }
        };
        match &self.session.state {
            ConnState::Robot { device_id, .. } if *device_id == record.device_id => {
                self.session.app.manager.send_to_app_conn(
                    &record.user_id,
                    record.app_conn_id,
                    Value::Object(data),
                );
            }
            ConnState::App { user_id, .. } if *user_id == record.user_id => {
                self.session.app.manager.send_to_robot(&record.device_id, Value::Object(data));
            }
            _ => warn!(slog_scope::logger(), "webrtc_ice from unrelated connection dropped"),
        }
    }

    /// Either side closes a session (spec.md §4.3 step F); a close for an
    /// already-superseded session is a no-op inside
    /// `close_webrtc_session` itself.
    fn on_webrtc_close(&mut self, data: Map<String, Value>) -> Self::Output {
        let record = match self.lookup_session(&data) {
            Some(r) => r,
            None => return,
        };
        self.session.app.manager.close_webrtc_session(&record.session_id, &record.device_id);
    }

    fn on_status_update(&mut self, data: Map<String, Value>) -> Self::Output {
        self.forward_robot_notice(data);
    }

    fn on_upload_notice(&mut self, data: Map<String, Value>) -> Self::Output {
        self.forward_robot_notice(data);
    }

    fn on_audio_state(&mut self, data: Map<String, Value>) -> Self::Output {
        self.forward_robot_notice(data);
    }

    fn on_schedule_event(&mut self, data: Map<String, Value>) -> Self::Output {
        self.forward_robot_notice(data);
    }

    fn on_legacy_event(&mut self, data: Map<String, Value>) -> Self::Output {
        self.forward_robot_notice(data);
    }

    fn on_catch_all(&mut self, data: Map<String, Value>) -> Self::Output {
        self.forward_robot_notice(data);
    }

    /// Robot's metric/mission sample: persisted via the dog-metrics store,
    /// then forwarded regardless of whether the persist succeeded (spec.md
    /// §7: "drop the metric, still forward the event").
    fn on_metric_event(&mut self, mut data: Map<String, Value>) -> Self::Output {
        let (device_id, owner) = match self.robot_conn() {
            Some(x) => x,
            None => return,
        };
        let owner = match owner.or_else(|| self.session.app.manager.get_device_owner(&device_id)) {
            Some(o) => o,
            None => {
                debug!(slog_scope::logger(), "metric_event from unowned device dropped");
                return;
            }
        };

        let app = self.session.app.clone();
        let dog_id = protocol::str_field(&data, "dog_id").unwrap_or_default().to_owned();
        let mission_type = protocol::str_field(&data, "mission_type").map(ToOwned::to_owned);
        let mission_result = protocol::str_field(&data, "mission_result").map(ToOwned::to_owned);
        let metric_type = protocol::str_field(&data, "metric_type").map(ToOwned::to_owned);
        let value = data.get("value").and_then(Value::as_f64).unwrap_or(0.0);
        let details = data.get("details").cloned().unwrap_or(Value::Null);
        let owner_for_store = owner.clone();

        self.ctx.spawn(actix::fut::wrap_future(async move {
            if let (Some(mission_type), Some(mission_result)) = (mission_type, mission_result) {
                if let Err(e) = app
                    .dog_store
                    .log_mission(&dog_id, &owner_for_store, &mission_type, &mission_result, details)
                    .await
                {
                    warn!(slog_scope::logger(), "metric_event store failure"; "error" => %e);
                }
            } else if let Some(metric_type) = metric_type {
                if let Err(e) =
                    app.dog_store.log_metric(&dog_id, &owner_for_store, &metric_type, value).await
                {
                    warn!(slog_scope::logger(), "metric_event store failure"; "error" => %e);
                }
            }
        }));

        protocol::stamp_device_id(&mut data, device_id.as_str());
        protocol::stamp_timestamp(&mut data);
        self.session.app.manager.send_to_user_apps(&owner, Value::Object(data));
    }

    /// App asks for a device's pairing/online state, answered inline
    /// without touching any other table (spec.md §4.2 dispatch table).
    fn on_get_status(&mut self, data: Map<String, Value>) -> Self::Output {
        let (user_id, _conn_id) = match self.app_conn() {
            Some(x) => x,
            None => return,
        };
        let manager = self.session.app.manager.clone();
        let device_id = match protocol::str_field(&data, "device_id")
            .map(|s| DeviceId(s.to_owned()))
            .or_else(|| manager.first_device_for_user(&user_id))
        {
            Some(d) => d,
            None => {
                self.reply(out::error(ErrorCode::NoDevice, "no device to route to"));
                return;
            }
        };
        let is_paired = manager.owns(&user_id, &device_id);
        let is_online = manager.is_robot_online(&device_id);
        self.reply(out::get_status_reply(device_id.as_str(), is_paired, is_online));
    }

    /// App's debug log line: recorded server-side only, never forwarded
    /// (spec.md §4.2 dispatch table).
    fn on_debug_log(&mut self, data: Map<String, Value>) -> Self::Output {
        info!(slog_scope::logger(), "client debug_log"; "payload" => %Value::Object(data));
    }

    /// App-originated command, run through the full §4.2.1 pipeline: rate
    /// limit, size cap, staleness check (exempting uploads), target
    /// resolution, then forwarding.
    fn on_command(&mut self, data: Map<String, Value>) -> Self::Output {
        let (user_id, _conn_id) = match self.app_conn() {
            Some(x) => x,
            None => return,
        };
        let manager = self.session.app.manager.clone();
        let outcome = run_command_pipeline(
            &manager,
            &self.session.app.settings,
            &user_id,
            &self.session.ip,
            self.raw_len,
            data,
        );

        match outcome {
            CommandOutcome::RateLimited(rl) => self.reply(out::error(
                ErrorCode::RateLimited,
                &format!("{} commands in the last {}s", rl.count, rl.window_seconds),
            )),
            CommandOutcome::TooLarge => {
                self.reply(out::error(ErrorCode::MessageTooLarge, "command frame too large"));
            }
            CommandOutcome::Stale { age_ms } => self.reply(out::error(
                ErrorCode::StaleCommand,
                &format!("command is {}ms old", age_ms),
            )),
            CommandOutcome::NoDevice => {
                self.reply(out::error(ErrorCode::NoDevice, "no device to route to"));
            }
            CommandOutcome::Forwarded(Ok(())) => {}
            CommandOutcome::Forwarded(Err(ForwardCommandError::Offline)) => {
                self.reply(out::error(ErrorCode::DeviceOffline, "device is offline"));
            }
            CommandOutcome::Forwarded(Err(
                ForwardCommandError::NotOwned | ForwardCommandError::WriteFailed,
            )) => {
                self.reply(out::error(ErrorCode::ForwardFailed, "forward failed"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use actix::{Actor, Context, Handler};
    use serde_json::json;

    use super::*;
    use crate::config::RateLimitSettings;
    use crate::manager::{ConnHandle, Disconnect, ServerFrame};

    /// Same connection-actor stand-in `manager::tests` uses: records every
    /// frame it receives, with no real socket involved.
    struct RecordingConn {
        frames: Arc<StdMutex<Vec<Value>>>,
    }

    impl Actor for RecordingConn {
        type Context = Context<Self>;
    }

    impl Handler<ServerFrame> for RecordingConn {
        type Result = ();
        fn handle(&mut self, msg: ServerFrame, _ctx: &mut Self::Context) {
            self.frames.lock().unwrap().push(msg.0);
        }
    }

    impl Handler<Disconnect> for RecordingConn {
        type Result = ();
        fn handle(&mut self, _msg: Disconnect, ctx: &mut Self::Context) {
            ctx.stop();
        }
    }

    fn recording_handle() -> (ConnHandle, Arc<StdMutex<Vec<Value>>>) {
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let addr = RecordingConn { frames: frames.clone() }.start();
        let handle = ConnHandle { frame: addr.clone().recipient(), disconnect: addr.recipient() };
        (handle, frames)
    }

    fn device(s: &str) -> DeviceId {
        DeviceId(s.to_owned())
    }
    fn user(s: &str) -> UserId {
        UserId(s.to_owned())
    }

    fn cmd(fields: Value) -> Map<String, Value> {
        fields.as_object().unwrap().clone()
    }

    /// A device online and owned by `u1`, ready to receive a forwarded
    /// command, so the boundary checks below run against the real
    /// target-resolution and forwarding steps rather than short-circuiting
    /// on `NoDevice`/`Offline`.
    fn manager_with_online_device() -> (ConnectionManager, Arc<StdMutex<Vec<Value>>>) {
        let mgr = ConnectionManager::new();
        mgr.set_device_owner(device("d1"), user("u1"));
        let (h, frames) = recording_handle();
        mgr.register_robot(device("d1"), h, "1.2.3.4".into());
        (mgr, frames)
    }

    async fn settle() {
        actix_rt::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[actix_rt::test]
    async fn size_boundary_accepts_exactly_the_cap_and_rejects_one_byte_more() {
        let (mgr, frames) = manager_with_online_device();
        let settings = Settings::default();
        let cap = settings.ws.max_command_size;

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            cap,
            cmd(json!({"command": "motor"})),
        );
        assert!(matches!(outcome, CommandOutcome::Forwarded(Ok(()))));

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            cap + 1,
            cmd(json!({"command": "motor"})),
        );
        assert!(matches!(outcome, CommandOutcome::TooLarge));

        settle().await;
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn staleness_boundary_accepts_exactly_the_cap_and_rejects_one_ms_more() {
        let (mgr, _frames) = manager_with_online_device();
        let settings = Settings::default();
        let cap = settings.ws.stale_command_ms;
        let now = chrono::Utc::now().timestamp_millis();

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "motor", "timestamp": now - cap})),
        );
        assert!(matches!(outcome, CommandOutcome::Forwarded(Ok(()))));

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "motor", "timestamp": now - cap - 1})),
        );
        assert!(matches!(outcome, CommandOutcome::Stale { .. }));
    }

    #[actix_rt::test]
    async fn upload_commands_skip_the_staleness_check() {
        let (mgr, _frames) = manager_with_online_device();
        let settings = Settings::default();
        let ancient = chrono::Utc::now().timestamp_millis() - settings.ws.stale_command_ms * 100;

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "upload_song", "timestamp": ancient})),
        );
        assert!(matches!(outcome, CommandOutcome::Forwarded(Ok(()))));
    }

    #[actix_rt::test]
    async fn rate_limit_allows_exactly_n_then_rejects_via_on_command_pipeline() {
        let (mgr, _frames) = manager_with_online_device();
        let mut settings = Settings::default();
        settings.rate_limit = RateLimitSettings {
            max_commands: 2,
            window_seconds: 60,
            diversity_threshold: 100,
            diversity_window_seconds: 60,
        };

        for _ in 0..2 {
            let outcome = run_command_pipeline(
                &mgr,
                &settings,
                &user("u1"),
                "1.2.3.4",
                10,
                cmd(json!({"command": "motor"})),
            );
            assert!(matches!(outcome, CommandOutcome::Forwarded(Ok(()))));
        }

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "motor"})),
        );
        assert!(matches!(outcome, CommandOutcome::RateLimited(_)));
    }

    #[actix_rt::test]
    async fn no_device_and_offline_short_circuit_before_forwarding() {
        let mgr = ConnectionManager::new();
        let settings = Settings::default();

        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "motor"})),
        );
        assert!(matches!(outcome, CommandOutcome::NoDevice));

        mgr.set_device_owner(device("d1"), user("u1"));
        let outcome = run_command_pipeline(
            &mgr,
            &settings,
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "motor", "device_id": "d1"})),
        );
        assert!(matches!(
            outcome,
            CommandOutcome::Forwarded(Err(ForwardCommandError::Offline))
        ));
    }

    #[actix_rt::test]
    async fn routing_fields_are_stripped_before_the_robot_receives_the_command() {
        let (mgr, frames) = manager_with_online_device();

        let outcome = run_command_pipeline(
            &mgr,
            &Settings::default(),
            &user("u1"),
            "1.2.3.4",
            10,
            cmd(json!({"command": "motor", "device_id": "d1", "target_device": "d1"})),
        );
        assert!(matches!(outcome, CommandOutcome::Forwarded(Ok(()))));

        settle().await;
        let received = frames.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert!(!received[0].as_object().unwrap().contains_key("device_id"));
        assert!(!received[0].as_object().unwrap().contains_key("target_device"));
        assert_eq!(received[0]["command"], "motor");
    }
}
