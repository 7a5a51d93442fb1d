//! The connection manager (spec.md §4.1): the single shared registry of
//! robot connections, app connections, the device ownership map, the
//! WebRTC session table, grace timers and the rate limiter.
//!
//! Per spec.md §5, the tables are small and the hot path is
//! lookup-and-write, so this crate protects them with a single coarse
//! [`std::sync::Mutex`] rather than modeling the manager as its own actor —
//! spec.md explicitly allows either. Connections are actors
//! (`src/router`); the manager never holds the lock across a socket write
//! or an `.await` — every write goes through a cloned [`ConnHandle`]
//! *after* the lock is dropped.

pub mod webrtc;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix::{Message, Recipient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use slog::{debug, warn};

use crate::config::RateLimitSettings;
use crate::ids::{DeviceId, SessionId, UserId};
use crate::protocol::out;
pub use webrtc::SessionRecord;

/// Opaque per-connection id, unique for the process lifetime. Used as the
/// "non-owning handle" spec.md §9 describes for session-to-app-connection
/// references: storing this instead of the actor address itself lets the
/// manager tell a *current* connection apart from a since-replaced one.
pub type ConnId = u64;

/// Message carrying one outbound JSON frame to a connection actor's
/// mailbox.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ServerFrame(pub Value);

/// Message telling a connection actor to close its socket and stop.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect;

/// The two mailbox addresses the manager needs for a registered
/// connection: one to push frames, one to force a close (used when a
/// second connect displaces an older one).
#[derive(Clone)]
pub struct ConnHandle {
    pub frame: Recipient<ServerFrame>,
    pub disconnect: Recipient<Disconnect>,
}

struct RobotConn {
    conn_id: ConnId,
    handle: ConnHandle,
    connected_at: DateTime<Utc>,
    ip: String,
}

struct AppConn {
    conn_id: ConnId,
    handle: ConnHandle,
    connected_at: DateTime<Utc>,
    ip: String,
}

/// Per-user grace-period state (spec.md §3 `GraceState`).
///
/// `generation` is bumped on every `start_grace_period` call for a user
/// and captured by the spawned cleanup timer; a timer only performs its
/// cleanup if its captured generation still matches what's stored when it
/// wakes, which is how cancellation (spec.md §5) is observed without an
/// explicit cancellation handle.
struct GraceState {
    generation: u64,
    sessions: Vec<(SessionId, DeviceId)>,
    last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_conn_id: ConnId,
    ownership: HashMap<DeviceId, UserId>,
    robots: HashMap<DeviceId, RobotConn>,
    apps: HashMap<UserId, HashMap<ConnId, AppConn>>,
    sessions: HashMap<SessionId, SessionRecord>,
    active_slot: HashMap<DeviceId, SessionId>,
    grace: HashMap<UserId, GraceState>,
    rate_limit: HashMap<UserId, VecDeque<(Instant, String)>>,
    activity: HashMap<UserId, DateTime<Utc>>,
}

/// Current counts across all tables, for the ambient `GET /stats`
/// endpoint (SPEC_FULL.md §4.1).
#[derive(Clone, Debug, Serialize)]
pub struct Stats {
    pub robots_connected: usize,
    pub app_connections: usize,
    pub users_with_apps: usize,
    pub device_pairings: usize,
    pub active_webrtc_sessions: usize,
    pub routed_webrtc_sessions: usize,
    pub users_in_grace: usize,
}

/// Why a command was rejected by the rate limiter.
#[derive(Clone, Debug)]
pub struct RateLimited {
    pub count: usize,
    pub window_seconds: u64,
}

/// Why `forward_command` could not deliver to the target robot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForwardCommandError {
    /// The acting user does not own the target device (or no one does).
    NotOwned,
    /// The device is owned by the user but has no live connection.
    Offline,
    /// The device has a live connection but the write to it failed.
    WriteFailed,
}

/// The connection / session / signaling engine's shared state, cheaply
/// cloneable (an `Arc` internally) so it can be handed to every
/// connection actor and to spawned grace-period timers alike.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the in-memory ownership map from the persistent store at
    /// process start (spec.md §3 `OwnershipMap`).
    pub fn seed_ownership(&self, pairings: HashMap<DeviceId, UserId>) {
        self.inner.lock().unwrap().ownership = pairings;
    }

    // ---- ownership -----------------------------------------------------

    #[must_use]
    pub fn get_device_owner(&self, device_id: &DeviceId) -> Option<UserId> {
        self.inner.lock().unwrap().ownership.get(device_id).cloned()
    }

    pub fn set_device_owner(&self, device_id: DeviceId, user_id: UserId) {
        self.inner.lock().unwrap().ownership.insert(device_id, user_id);
    }

    pub fn remove_device_owner(&self, device_id: &DeviceId) {
        self.inner.lock().unwrap().ownership.remove(device_id);
    }

    #[must_use]
    pub fn owns(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.get_device_owner(device_id).as_ref() == Some(user_id)
    }

    /// The first device owned by `user_id`, used to default a command's
    /// or a `webrtc_request`'s target device when none is given
    /// explicitly (spec.md §4.2.1 step 4, §4.3 step A).
    #[must_use]
    pub fn first_device_for_user(&self, user_id: &UserId) -> Option<DeviceId> {
        self.inner
            .lock()
            .unwrap()
            .ownership
            .iter()
            .find(|(_, u)| *u == user_id)
            .map(|(d, _)| d.clone())
    }

    /// All devices owned by `user_id`, for the per-device `robot_status`
    /// frames and `user_connected` notices sent on app connect.
    #[must_use]
    pub fn devices_for_user(&self, user_id: &UserId) -> Vec<DeviceId> {
        self.inner
            .lock()
            .unwrap()
            .ownership
            .iter()
            .filter(|(_, u)| *u == user_id)
            .map(|(d, _)| d.clone())
            .collect()
    }

    // ---- robot connections ----------------------------------------------

    #[must_use]
    pub fn is_robot_online(&self, device_id: &DeviceId) -> bool {
        self.inner.lock().unwrap().robots.contains_key(device_id)
    }

    /// Registers a robot connection, displacing (closing) any existing
    /// connection for the same device id first (spec.md §4.1
    /// `register-robot`, invariant: at most one live connection per
    /// device).
    pub fn register_robot(
        &self,
        device_id: DeviceId,
        handle: ConnHandle,
        ip: String,
    ) -> ConnId {
        let (conn_id, displaced) = {
            let mut inner = self.inner.lock().unwrap();
            let conn_id = inner.next_conn_id;
            inner.next_conn_id += 1;
            let displaced = inner.robots.insert(
                device_id,
                RobotConn { conn_id, handle, connected_at: Utc::now(), ip },
            );
            (conn_id, displaced)
        };
        if let Some(old) = displaced {
            let _ = old.handle.disconnect.do_send(Disconnect);
        }
        conn_id
    }

    /// Removes a robot connection, but only if `conn_id` is still the one
    /// on file — a stale disconnect from an already-displaced connection
    /// must not evict its replacement. Returns whether this `conn_id` was
    /// still current, so the caller knows whether to run the
    /// disconnect-cascade (session teardown, offline notice) or skip it
    /// because a newer connection has already taken over.
    #[must_use]
    pub fn unregister_robot(&self, device_id: &DeviceId, conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.robots.get(device_id).map(|c| c.conn_id) == Some(conn_id) {
            inner.robots.remove(device_id);
            true
        } else {
            false
        }
    }

    // ---- app connections -------------------------------------------------

    #[must_use]
    pub fn user_has_live_apps(&self, user_id: &UserId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .apps
            .get(user_id)
            .map_or(false, |m| !m.is_empty())
    }

    pub fn register_app(
        &self,
        user_id: UserId,
        handle: ConnHandle,
        ip: String,
    ) -> ConnId {
        let mut inner = self.inner.lock().unwrap();
        let conn_id = inner.next_conn_id;
        inner.next_conn_id += 1;
        inner.apps.entry(user_id).or_default().insert(
            conn_id,
            AppConn { conn_id, handle, connected_at: Utc::now(), ip },
        );
        conn_id
    }

    pub fn unregister_app(&self, user_id: &UserId, conn_id: ConnId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.apps.get_mut(user_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                inner.apps.remove(user_id);
            }
        }
    }

    #[must_use]
    pub fn is_app_conn_live(&self, user_id: &UserId, conn_id: ConnId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .apps
            .get(user_id)
            .map_or(false, |m| m.contains_key(&conn_id))
    }

    // ---- sending ----------------------------------------------------------

    /// Writes `msg` to the robot connection for `device_id`. On mailbox
    /// failure, tears that connection down and returns `false` (spec.md
    /// §4.1 `send-to-robot`).
    pub fn send_to_robot(&self, device_id: &DeviceId, msg: Value) -> bool {
        let found = {
            let inner = self.inner.lock().unwrap();
            inner.robots.get(device_id).map(|c| (c.handle.clone(), c.conn_id))
        };
        let (handle, conn_id) = match found {
            Some(x) => x,
            None => return false,
        };
        match handle.frame.do_send(ServerFrame(msg)) {
            Ok(()) => true,
            Err(_) => {
                self.unregister_robot(device_id, conn_id);
                false
            }
        }
    }

    /// Writes `msg` to every live app connection for `user_id`, tearing
    /// down any that fail, and returns the count of successful deliveries
    /// (spec.md §4.1 `send-to-user-apps`).
    pub fn send_to_user_apps(&self, user_id: &UserId, msg: Value) -> usize {
        let conns: Vec<(ConnId, ConnHandle)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .apps
                .get(user_id)
                .map(|m| m.iter().map(|(id, c)| (*id, c.handle.clone())).collect())
                .unwrap_or_default()
        };

        let mut sent = 0;
        let mut failed = Vec::new();
        for (conn_id, handle) in conns {
            match handle.frame.do_send(ServerFrame(msg.clone())) {
                Ok(()) => sent += 1,
                Err(_) => failed.push(conn_id),
            }
        }
        if !failed.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            if let Some(set) = inner.apps.get_mut(user_id) {
                for id in &failed {
                    set.remove(id);
                }
                if set.is_empty() {
                    inner.apps.remove(user_id);
                }
            }
        }
        sent
    }

    /// Writes `msg` to one specific app connection, used by WebRTC
    /// signaling (§4.3 steps C/E) to reach the app side of a session
    /// without broadcasting to every session the user holds.
    #[must_use]
    pub fn send_to_app_conn(
        &self,
        user_id: &UserId,
        conn_id: ConnId,
        msg: Value,
    ) -> bool {
        let handle = {
            let inner = self.inner.lock().unwrap();
            inner
                .apps
                .get(user_id)
                .and_then(|m| m.get(&conn_id))
                .map(|c| c.handle.clone())
        };
        match handle {
            Some(h) => h.frame.do_send(ServerFrame(msg)).is_ok(),
            None => false,
        }
    }

    /// Verifies ownership, then delegates to [`Self::send_to_robot`]
    /// (spec.md §4.1 `forward-command`).
    ///
    /// # Errors
    ///
    /// [`ForwardCommandError::NotOwned`] if `user_id` does not own
    /// `device_id`; [`ForwardCommandError::Offline`] if it does but the
    /// device has no live connection; [`ForwardCommandError::WriteFailed`]
    /// if the write itself failed.
    pub fn forward_command(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        msg: Value,
    ) -> Result<(), ForwardCommandError> {
        if !self.owns(user_id, device_id) {
            return Err(ForwardCommandError::NotOwned);
        }
        if !self.is_robot_online(device_id) {
            return Err(ForwardCommandError::Offline);
        }
        if self.send_to_robot(device_id, msg) {
            Ok(())
        } else {
            Err(ForwardCommandError::WriteFailed)
        }
    }

    /// Looks up the owner of `device_id` and delegates to
    /// [`Self::send_to_user_apps`]; returns `0` and leaves it to the
    /// caller to log when there is no owner (spec.md §4.1
    /// `forward-event`).
    pub fn forward_event(&self, device_id: &DeviceId, msg: Value) -> usize {
        match self.get_device_owner(device_id) {
            Some(user_id) => self.send_to_user_apps(&user_id, msg),
            None => 0,
        }
    }

    // ---- WebRTC session table -------------------------------------------

    #[must_use]
    pub fn get_session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.inner.lock().unwrap().sessions.get(session_id).cloned()
    }

    #[must_use]
    pub fn active_session_for_device(
        &self,
        device_id: &DeviceId,
    ) -> Option<SessionId> {
        self.inner.lock().unwrap().active_slot.get(device_id).cloned()
    }

    /// Removes any `SessionRecord`s left over for `device_id` that are not
    /// the (just-allocated) active slot. Called by the router between
    /// `create_webrtc_session` and inserting the new record, per spec.md
    /// §4.3 step A ("Purge stale routing-table entries for the same
    /// device").
    pub fn purge_stale_sessions_for_device(&self, device_id: &DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.retain(|_, rec| &rec.device_id != device_id);
    }

    pub fn insert_session_record(&self, record: SessionRecord) {
        self.inner.lock().unwrap().sessions.insert(record.session_id.clone(), record);
    }

    fn evict_session_locked(
        inner: &mut Inner,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> bool {
        inner.sessions.remove(session_id);
        if inner.active_slot.get(device_id) == Some(session_id) {
            inner.active_slot.remove(device_id);
            true
        } else {
            false
        }
    }

    /// Allocates a new session id for `device_id`, evicting (and notifying
    /// the robot of) any existing active session for the device first
    /// (spec.md §4.1 `create-webrtc-session`). The new id is set as the
    /// active slot immediately but is *not* inserted into the routing
    /// index — the caller must do that via [`Self::insert_session_record`]
    /// once TURN credentials have been minted, or undo the slot via
    /// [`Self::rollback_webrtc_session`] on failure, so the invariant
    /// "active slot implies a routing-index entry" never observably
    /// breaks under concurrent lookups.
    pub fn create_webrtc_session(&self, device_id: &DeviceId) -> SessionId {
        let (new_id, notify_old) = {
            let mut inner = self.inner.lock().unwrap();
            let old = inner.active_slot.get(device_id).cloned();
            let notify = old
                .as_ref()
                .map(|old_id| Self::evict_session_locked(&mut inner, old_id, device_id))
                .unwrap_or(false);
            let new_id = SessionId::generate();
            inner.active_slot.insert(device_id.clone(), new_id.clone());
            (new_id, old.filter(|_| notify))
        };
        if let Some(old_id) = notify_old {
            self.send_to_robot(device_id, out::webrtc_close(&old_id));
        }
        new_id
    }

    /// Undoes a [`Self::create_webrtc_session`] call whose TURN credential
    /// mint subsequently failed (spec.md §4.3 step A: "on TURN failure,
    /// roll back the session creation").
    pub fn rollback_webrtc_session(
        &self,
        device_id: &DeviceId,
        session_id: &SessionId,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active_slot.get(device_id) == Some(session_id) {
            inner.active_slot.remove(device_id);
        }
    }

    /// Closes a session (spec.md §4.1 `close-webrtc-session`, §4.3 step
    /// F). Always removes the routing-index entry; only clears the active
    /// slot and notifies the robot if `session_id` is still the active
    /// slot for `device_id` — a close of an already-superseded session is
    /// a deliberate no-op on the notify side, so a racing late close can
    /// never cancel a session that has since replaced it.
    pub fn close_webrtc_session(&self, session_id: &SessionId, device_id: &DeviceId) {
        let notify = {
            let mut inner = self.inner.lock().unwrap();
            Self::evict_session_locked(&mut inner, session_id, device_id)
        };
        if notify {
            self.send_to_robot(device_id, out::webrtc_close(session_id));
        }
    }

    /// Rebinds a preserved session's app-connection reference to a new
    /// connection id after a grace-period reconnect (spec.md §4.2 step 3:
    /// "re-binds each restored session's app reference to this new
    /// connection"). Returns `false` if the session no longer exists (it
    /// may have been torn down by a racing robot disconnect during the
    /// grace window).
    pub fn rebind_session_app(&self, session_id: &SessionId, new_conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get_mut(session_id) {
            Some(rec) => {
                rec.app_conn_id = new_conn_id;
                true
            }
            None => false,
        }
    }

    /// Removes every `SessionRecord` referencing `(user_id, conn_id)` and
    /// clears the active slot for any device they were active for.
    /// Used when a robot-owning... no: used on app disconnect when other
    /// live connections remain for the user, so this connection's
    /// sessions are torn down immediately rather than preserved for grace
    /// (spec.md §4.3 "Disconnect cleanup").
    pub fn remove_app_conn_sessions(
        &self,
        user_id: &UserId,
        conn_id: ConnId,
    ) -> Vec<(SessionId, DeviceId)> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, r)| &r.user_id == user_id && r.app_conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rec) = inner.sessions.remove(&id) {
                if inner.active_slot.get(&rec.device_id) == Some(&id) {
                    inner.active_slot.remove(&rec.device_id);
                }
                removed.push((id, rec.device_id));
            }
        }
        removed
    }

    /// Lists (without removing) every `SessionRecord` referencing
    /// `(user_id, conn_id)`, for seeding or extending a grace period —
    /// the records themselves are deliberately left in the routing index
    /// so a reconnect can restore them (spec.md §4.3 "When an app enters
    /// grace, the saved session ids are not removed from either index").
    #[must_use]
    pub fn list_app_conn_sessions(
        &self,
        user_id: &UserId,
        conn_id: ConnId,
    ) -> Vec<(SessionId, DeviceId)> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|(_, r)| &r.user_id == user_id && r.app_conn_id == conn_id)
            .map(|(id, r)| (id.clone(), r.device_id.clone()))
            .collect()
    }

    /// Removes every `SessionRecord` for `device_id` and clears its active
    /// slot unconditionally. Used on robot disconnect (spec.md §4.3
    /// "When a robot socket dies...").
    pub fn cleanup_robot_sessions(&self, device_id: &DeviceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.retain(|_, r| &r.device_id != device_id);
        inner.active_slot.remove(device_id);
    }

    // ---- grace period -----------------------------------------------------

    /// Cancels any existing timer for `user_id` and starts a fresh one
    /// that fires `execute_grace_cleanup` after `period` (spec.md §4.1
    /// `start-grace-period`).
    pub fn start_grace_period(
        &self,
        user_id: UserId,
        sessions: Vec<(SessionId, DeviceId)>,
        period: Duration,
    ) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            let generation =
                inner.grace.get(&user_id).map_or(0, |g| g.generation) + 1;
            inner.grace.insert(
                user_id.clone(),
                GraceState { generation, sessions, last_activity: Utc::now() },
            );
            generation
        };
        let manager = self.clone();
        actix::spawn(async move {
            tokio::time::sleep(period).await;
            manager.execute_grace_cleanup_if_current(&user_id, generation);
        });
    }

    /// Appends `extra` to an in-progress grace period's saved session
    /// list without resetting its timer. Returns `false` if no grace
    /// state exists for `user_id` (the caller should start a fresh one
    /// instead).
    pub fn extend_grace_period(
        &self,
        user_id: &UserId,
        extra: Vec<(SessionId, DeviceId)>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.grace.get_mut(user_id) {
            Some(state) => {
                state.sessions.extend(extra);
                state.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Cancels the grace timer for `user_id` (observed by the spawned
    /// timer as a generation mismatch when it wakes) and returns the
    /// sessions that had been saved for restoration, if any (spec.md
    /// §4.1 `cancel-grace-period`).
    pub fn cancel_grace_period(
        &self,
        user_id: &UserId,
    ) -> Option<Vec<(SessionId, DeviceId)>> {
        self.inner.lock().unwrap().grace.remove(user_id).map(|g| g.sessions)
    }

    /// Cancels every outstanding grace timer, for process shutdown
    /// (spec.md §5 "A process shutdown cancels all outstanding grace
    /// timers and clears their saved session lists").
    pub fn cancel_all_grace_periods(&self) {
        self.inner.lock().unwrap().grace.clear();
    }

    fn execute_grace_cleanup_if_current(&self, user_id: &UserId, generation: u64) {
        let sessions = {
            let mut inner = self.inner.lock().unwrap();
            match inner.grace.get(user_id) {
                Some(g) if g.generation == generation => {
                    inner.grace.remove(user_id).map(|g| g.sessions)
                }
                _ => None,
            }
        };
        let sessions = match sessions {
            Some(s) => s,
            None => return,
        };

        for (session_id, device_id) in &sessions {
            self.close_webrtc_session(session_id, device_id);
        }

        for device_id in self.devices_for_user(user_id) {
            self.send_to_robot(&device_id, out::user_disconnected(user_id.as_str()));
        }

        self.drop_rate_limit_and_activity(user_id);

        debug!(
            slog_scope::logger(),
            "grace period expired, sessions torn down";
            "user_id" => user_id.as_str(),
            "session_count" => sessions.len(),
        );
    }

    // ---- rate limiter -------------------------------------------------------

    /// Records one command for `user_id` and checks both the hard count
    /// limit (rejects) and the command-type diversity window (forensic
    /// warning only, never rejects), per spec.md §4.1.
    #[must_use]
    pub fn check_rate_limit(
        &self,
        user_id: &UserId,
        cmd_type: &str,
        ip: &str,
        cfg: &RateLimitSettings,
    ) -> Option<RateLimited> {
        let now = Instant::now();
        let window = Duration::from_secs(cfg.window_seconds);
        let diversity_window = Duration::from_secs(cfg.diversity_window_seconds);

        let mut inner = self.inner.lock().unwrap();
        let entries = inner.rate_limit.entry(user_id.clone()).or_default();
        entries.retain(|(t, _)| now.duration_since(*t) <= window);

        if entries.len() >= cfg.max_commands {
            return Some(RateLimited {
                count: entries.len(),
                window_seconds: cfg.window_seconds,
            });
        }
        entries.push_back((now, cmd_type.to_owned()));

        let distinct: HashSet<&str> = entries
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= diversity_window)
            .map(|(_, c)| c.as_str())
            .collect();
        if distinct.len() > cfg.diversity_threshold {
            warn!(
                slog_scope::logger(),
                "command-type diversity spike";
                "user_id" => user_id.as_str(),
                "ip" => ip,
                "distinct_types" => distinct.len(),
            );
        }
        None
    }

    fn drop_rate_limit_and_activity(&self, user_id: &UserId) {
        let mut inner = self.inner.lock().unwrap();
        inner.rate_limit.remove(user_id);
        inner.activity.remove(user_id);
    }

    /// Stamps the last-activity timestamp for `user_id`. Called on every
    /// app-originated frame (SPEC_FULL.md §3's resolution of spec.md §9's
    /// open question on when `update_activity` should run), not only at
    /// connect time.
    pub fn touch_activity(&self, user_id: &UserId) {
        self.inner.lock().unwrap().activity.insert(user_id.clone(), Utc::now());
    }

    // ---- stats --------------------------------------------------------------

    #[must_use]
    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock().unwrap();
        Stats {
            robots_connected: inner.robots.len(),
            app_connections: inner.apps.values().map(HashMap::len).sum(),
            users_with_apps: inner.apps.len(),
            device_pairings: inner.ownership.len(),
            active_webrtc_sessions: inner.active_slot.len(),
            routed_webrtc_sessions: inner.sessions.len(),
            users_in_grace: inner.grace.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use actix::{Actor, Context, Handler};

    use super::*;
    use crate::manager::webrtc::SessionRecord;

    /// A connection actor stand-in that records every frame it receives
    /// and whether it was ever told to disconnect, so manager tests can
    /// assert on outbound traffic without a real WebSocket.
    struct RecordingConn {
        frames: Arc<StdMutex<Vec<Value>>>,
        disconnected: Arc<StdMutex<bool>>,
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
            *self.disconnected.lock().unwrap() = true;
            ctx.stop();
        }
    }

    fn recording_handle() -> (ConnHandle, Arc<StdMutex<Vec<Value>>>, Arc<StdMutex<bool>>) {
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let disconnected = Arc::new(StdMutex::new(false));
        let addr = RecordingConn { frames: frames.clone(), disconnected: disconnected.clone() }
            .start();
        let handle = ConnHandle { frame: addr.clone().recipient(), disconnect: addr.recipient() };
        (handle, frames, disconnected)
    }

    async fn settle() {
        actix_rt::time::sleep(Duration::from_millis(20)).await;
    }

    fn device(s: &str) -> DeviceId {
        DeviceId(s.to_owned())
    }
    fn user(s: &str) -> UserId {
        UserId(s.to_owned())
    }

    #[actix_rt::test]
    async fn second_robot_connect_displaces_first() {
        let mgr = ConnectionManager::new();
        let (h1, _frames1, disconnected1) = recording_handle();
        let (h2, _frames2, _disconnected2) = recording_handle();

        let id1 = mgr.register_robot(device("d1"), h1, "1.1.1.1".into());
        let id2 = mgr.register_robot(device("d1"), h2, "2.2.2.2".into());
        settle().await;

        assert_ne!(id1, id2);
        assert!(*disconnected1.lock().unwrap());
        assert!(mgr.is_robot_online(&device("d1")));

        // a late disconnect from the displaced connection must not evict
        // the replacement
        assert!(!mgr.unregister_robot(&device("d1"), id1));
        assert!(mgr.is_robot_online(&device("d1")));
    }

    #[actix_rt::test]
    async fn forward_command_discriminates_not_owned_offline_and_success() {
        let mgr = ConnectionManager::new();
        mgr.set_device_owner(device("d1"), user("u1"));

        // offline: owned but no connection
        assert_eq!(
            mgr.forward_command(&user("u1"), &device("d1"), serde_json::json!({})),
            Err(ForwardCommandError::Offline)
        );

        // not owned
        assert_eq!(
            mgr.forward_command(&user("u2"), &device("d1"), serde_json::json!({})),
            Err(ForwardCommandError::NotOwned)
        );

        let (h, frames, _d) = recording_handle();
        mgr.register_robot(device("d1"), h, "1.2.3.4".into());
        assert_eq!(
            mgr.forward_command(
                &user("u1"),
                &device("d1"),
                serde_json::json!({"command": "motor"})
            ),
            Ok(())
        );
        settle().await;
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn webrtc_handoff_closes_superseded_session_before_new_one() {
        let mgr = ConnectionManager::new();
        let (h, frames, _d) = recording_handle();
        mgr.register_robot(device("d1"), h, "1.1.1.1".into());

        let s1 = mgr.create_webrtc_session(&device("d1"));
        mgr.insert_session_record(SessionRecord {
            session_id: s1.clone(),
            device_id: device("d1"),
            user_id: user("u1"),
            app_conn_id: 1,
            created_at: Utc::now(),
        });
        assert_eq!(mgr.active_session_for_device(&device("d1")), Some(s1.clone()));

        let s2 = mgr.create_webrtc_session(&device("d1"));
        mgr.purge_stale_sessions_for_device(&device("d1"));
        mgr.insert_session_record(SessionRecord {
            session_id: s2.clone(),
            device_id: device("d1"),
            user_id: user("u1"),
            app_conn_id: 2,
            created_at: Utc::now(),
        });
        settle().await;

        assert_eq!(mgr.active_session_for_device(&device("d1")), Some(s2.clone()));
        assert!(mgr.get_session(&s1).is_none());
        assert!(mgr.get_session(&s2).is_some());

        let received = frames.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "webrtc_close");
        assert_eq!(received[0]["session_id"], s1.as_str());

        // a late close of the superseded session is a no-op: no second
        // webrtc_close is sent and the active slot is unchanged
        mgr.close_webrtc_session(&s1, &device("d1"));
        settle().await;
        assert_eq!(frames.lock().unwrap().len(), 1);
        assert_eq!(mgr.active_session_for_device(&device("d1")), Some(s2));
    }

    #[actix_rt::test]
    async fn rate_limit_allows_exactly_n_then_rejects() {
        let mgr = ConnectionManager::new();
        let cfg = RateLimitSettings {
            max_commands: 3,
            window_seconds: 60,
            diversity_threshold: 100,
            diversity_window_seconds: 60,
        };
        let u = user("u1");
        for _ in 0..3 {
            assert!(mgr.check_rate_limit(&u, "motor", "1.2.3.4", &cfg).is_none());
        }
        let rejection = mgr.check_rate_limit(&u, "motor", "1.2.3.4", &cfg);
        assert!(rejection.is_some());
        assert_eq!(rejection.unwrap().count, 3);
    }

    #[actix_rt::test]
    async fn rate_limit_diversity_spike_warns_but_never_rejects() {
        let mgr = ConnectionManager::new();
        let cfg = RateLimitSettings {
            max_commands: 100,
            window_seconds: 60,
            diversity_threshold: 2,
            diversity_window_seconds: 60,
        };
        let u = user("u1");
        for cmd in ["motor", "turn", "honk", "lights", "speaker"] {
            assert!(mgr.check_rate_limit(&u, cmd, "1.2.3.4", &cfg).is_none());
        }
    }

    #[actix_rt::test]
    async fn grace_start_then_cancel_restores_sessions_without_teardown() {
        let mgr = ConnectionManager::new();
        let (h, frames, _d) = recording_handle();
        mgr.register_robot(device("d1"), h, "1.1.1.1".into());

        let s1 = mgr.create_webrtc_session(&device("d1"));
        mgr.insert_session_record(SessionRecord {
            session_id: s1.clone(),
            device_id: device("d1"),
            user_id: user("u1"),
            app_conn_id: 1,
            created_at: Utc::now(),
        });
        settle().await;
        frames.lock().unwrap().clear();

        mgr.start_grace_period(
            user("u1"),
            vec![(s1.clone(), device("d1"))],
            Duration::from_secs(600),
        );
        let restored = mgr.cancel_grace_period(&user("u1"));
        assert_eq!(restored, Some(vec![(s1.clone(), device("d1"))]));

        // cancellation must not have torn anything down
        assert!(mgr.get_session(&s1).is_some());
        assert_eq!(mgr.active_session_for_device(&device("d1")), Some(s1));
        settle().await;
        assert!(frames.lock().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn pair_then_unpair_round_trips_to_no_ownership() {
        let mgr = ConnectionManager::new();
        mgr.set_device_owner(device("d1"), user("u1"));
        assert_eq!(mgr.get_device_owner(&device("d1")), Some(user("u1")));
        mgr.remove_device_owner(&device("d1"));
        assert_eq!(mgr.get_device_owner(&device("d1")), None);
    }
}
