//! Wire frame classification and construction.
//!
//! spec.md §9 calls the router's dispatch "polymorphism over message
//! shape": every inbound frame is a JSON object discriminated by its
//! `type` field (falling back to `event`/`command`), classified once into
//! an [`InboundFrame`] and handled via the generated
//! [`InboundFrameHandler`] trait (spec.md §4.2's dispatch table).

use chrono::Utc;
use relay_macro::dispatchable;
use serde_json::{Map, Value};

/// A parsed, classified inbound frame, tagged by the table in spec.md
/// §4.2. Each variant still carries the raw JSON object so handlers can
/// pull out whatever fields they need without a second parse pass.
#[dispatchable]
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// `ping` — either role, answered inline with `pong`.
    Ping,
    /// `auth` — only valid as the first frame on the generic path.
    Auth(Map<String, Value>),
    /// `webrtc_request` — app, §4.3 step A.
    WebrtcRequest(Map<String, Value>),
    /// `webrtc_offer` — robot⇒app, §4.3 step C.
    WebrtcOffer(Map<String, Value>),
    /// `webrtc_answer` — app⇒robot, §4.3 step D.
    WebrtcAnswer(Map<String, Value>),
    /// `webrtc_ice` — either⇒peer, §4.3 step E.
    WebrtcIce(Map<String, Value>),
    /// `webrtc_close` — either, §4.3 step F.
    WebrtcClose(Map<String, Value>),
    /// `status_update` — robot⇒app.
    StatusUpdate(Map<String, Value>),
    /// `upload_complete`/`upload_error`/`upload_result` — robot⇒app.
    UploadNotice(Map<String, Value>),
    /// `audio_state` — robot⇒app.
    AudioState(Map<String, Value>),
    /// `schedule_created`/`schedule_updated`/`schedule_deleted` —
    /// robot⇒app.
    ScheduleEvent(Map<String, Value>),
    /// `metric_event` — robot, persisted then forwarded.
    MetricEvent(Map<String, Value>),
    /// `get_status` — app, answered inline.
    GetStatus(Map<String, Value>),
    /// `debug_log` — app, recorded server-side, never forwarded.
    DebugLog(Map<String, Value>),
    /// Has an `event` field but no recognized `type` — legacy robot⇒app.
    LegacyEvent(Map<String, Value>),
    /// Has a `command` field but no `type`/`event` — app⇒robot (§4.2.1).
    Command(Map<String, Value>),
    /// `type` present but not one of the recognized tags — robot⇒app
    /// catch-all.
    CatchAll(Map<String, Value>),
}

/// Classifies a raw JSON object into an [`InboundFrame`], following the
/// priority order of spec.md §4.2's dispatch table: `type` first (with an
/// unrecognized value falling through to [`InboundFrame::CatchAll`]), then
/// `event`, then `command`. Returns `None` if none of the three
/// discriminators are present — such a frame is unroutable and is logged
/// and skipped by the caller (spec.md §7).
#[must_use]
pub fn classify(obj: Map<String, Value>) -> Option<InboundFrame> {
    if let Some(type_tag) = obj.get("type").and_then(Value::as_str) {
        return Some(match type_tag {
            "ping" => InboundFrame::Ping,
            "auth" => InboundFrame::Auth(obj),
            "webrtc_request" => InboundFrame::WebrtcRequest(obj),
            "webrtc_offer" => InboundFrame::WebrtcOffer(obj),
            "webrtc_answer" => InboundFrame::WebrtcAnswer(obj),
            "webrtc_ice" => InboundFrame::WebrtcIce(obj),
            "webrtc_close" => InboundFrame::WebrtcClose(obj),
            "status_update" => InboundFrame::StatusUpdate(obj),
            "upload_complete" | "upload_error" | "upload_result" => {
                InboundFrame::UploadNotice(obj)
            }
            "audio_state" => InboundFrame::AudioState(obj),
            "schedule_created" | "schedule_updated" | "schedule_deleted" => {
                InboundFrame::ScheduleEvent(obj)
            }
            "metric_event" => InboundFrame::MetricEvent(obj),
            "get_status" => InboundFrame::GetStatus(obj),
            "debug_log" => InboundFrame::DebugLog(obj),
            _ => InboundFrame::CatchAll(obj),
        });
    }
    if obj.contains_key("event") {
        return Some(InboundFrame::LegacyEvent(obj));
    }
    if obj.contains_key("command") {
        return Some(InboundFrame::Command(obj));
    }
    None
}

/// Reads a string field out of a frame object.
#[must_use]
pub fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Reads an integer (millisecond-timestamp-shaped) field out of a frame
/// object.
#[must_use]
pub fn i64_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

/// Stamps `device_id` onto `obj` if it is absent, per spec.md §6
/// ("`device_id` is stamped on every robot-to-app frame that lacks it").
pub fn stamp_device_id(obj: &mut Map<String, Value>, device_id: &str) {
    obj.entry("device_id")
        .or_insert_with(|| Value::String(device_id.to_owned()));
}

/// Stamps an ISO-8601 UTC `timestamp` onto `obj` if it is absent, per
/// spec.md §6 / §9 ("implementers should always stamp, overwriting absent
/// fields only").
pub fn stamp_timestamp(obj: &mut Map<String, Value>) {
    obj.entry("timestamp")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
}

/// Strips routing fields (`device_id`, `target_device`) before forwarding
/// a command to a robot, per spec.md §4.2.1 step 4.
pub fn strip_routing_fields(obj: &mut Map<String, Value>) {
    obj.remove("device_id");
    obj.remove("target_device");
}

/// Commands exempt from the staleness check (spec.md §4.2.1 step 3):
/// uploads can legitimately take a while to reach the relay.
#[must_use]
pub fn is_upload_command(cmd: &str) -> bool {
    matches!(
        cmd,
        "upload_song" | "audio_upload" | "upload_audio" | "upload_file"
    )
}

/// Builders for frames the relay itself originates (replies, notices).
/// Each returns a plain [`Value`]; there is no benefit to a typed enum here
/// since every shape is sent exactly once, at a single call site.
pub mod out {
    use serde_json::{json, Value};

    use crate::error::ErrorCode;
    use crate::ids::SessionId;

    #[must_use]
    pub fn pong() -> Value {
        json!({ "type": "pong" })
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: &str) -> Value {
        json!({ "type": "error", "code": code.as_str(), "message": message })
    }

    #[must_use]
    pub fn auth_result(success: bool) -> Value {
        json!({ "type": "auth_result", "success": success })
    }

    #[must_use]
    pub fn robot_status(device_id: &str, online: bool) -> Value {
        json!({ "type": "robot_status", "device_id": device_id, "online": online })
    }

    #[must_use]
    pub fn robot_connected(device_id: &str) -> Value {
        json!({ "event": "robot_connected", "device_id": device_id })
    }

    #[must_use]
    pub fn robot_disconnected(device_id: &str) -> Value {
        json!({ "event": "robot_disconnected", "device_id": device_id })
    }

    #[must_use]
    pub fn user_connected(user_id: &str) -> Value {
        json!({ "type": "user_connected", "user_id": user_id })
    }

    #[must_use]
    pub fn user_disconnected(user_id: &str) -> Value {
        json!({ "type": "user_disconnected", "user_id": user_id })
    }

    #[must_use]
    pub fn session_restored(session_id: &SessionId) -> Value {
        json!({ "type": "session_restored", "session_id": session_id.as_str() })
    }

    #[must_use]
    pub fn metrics_sync(dog_id: &str, dog_name: &str, metrics: Value) -> Value {
        json!({
            "type": "metrics_sync",
            "dog_id": dog_id,
            "dog_name": dog_name,
            "metrics": metrics,
        })
    }

    #[must_use]
    pub fn webrtc_credentials(session_id: &SessionId, ice_servers: Value) -> Value {
        json!({
            "type": "webrtc_credentials",
            "session_id": session_id.as_str(),
            "ice_servers": ice_servers,
        })
    }

    #[must_use]
    pub fn webrtc_request(session_id: &SessionId, ice_servers: Value) -> Value {
        json!({
            "type": "webrtc_request",
            "session_id": session_id.as_str(),
            "ice_servers": ice_servers,
        })
    }

    #[must_use]
    pub fn webrtc_close(session_id: &SessionId) -> Value {
        json!({ "type": "webrtc_close", "session_id": session_id.as_str() })
    }

    #[must_use]
    pub fn get_status_reply(
        device_id: &str,
        is_paired: bool,
        is_online: bool,
    ) -> Value {
        json!({
            "type": "status",
            "device_id": device_id,
            "is_paired": is_paired,
            "is_online": is_online,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn classifies_known_type_tags() {
        assert!(matches!(
            classify(obj(json!({"type": "ping"}))),
            Some(InboundFrame::Ping)
        ));
        assert!(matches!(
            classify(obj(json!({"type": "webrtc_offer", "session_id": "s1"}))),
            Some(InboundFrame::WebrtcOffer(_))
        ));
        assert!(matches!(
            classify(obj(json!({"type": "upload_error"}))),
            Some(InboundFrame::UploadNotice(_))
        ));
    }

    #[test]
    fn unrecognized_type_falls_to_catch_all() {
        assert!(matches!(
            classify(obj(json!({"type": "something_new"}))),
            Some(InboundFrame::CatchAll(_))
        ));
    }

    #[test]
    fn falls_back_to_event_then_command() {
        assert!(matches!(
            classify(obj(json!({"event": "battery_low"}))),
            Some(InboundFrame::LegacyEvent(_))
        ));
        assert!(matches!(
            classify(obj(json!({"command": "motor"}))),
            Some(InboundFrame::Command(_))
        ));
    }

    #[test]
    fn frame_with_no_discriminator_is_unroutable() {
        assert!(classify(obj(json!({"foo": "bar"}))).is_none());
    }

    #[test]
    fn stamps_only_when_absent() {
        let mut m = obj(json!({"timestamp": "keep-me"}));
        stamp_timestamp(&mut m);
        assert_eq!(m.get("timestamp").unwrap(), "keep-me");

        let mut m = obj(json!({}));
        stamp_device_id(&mut m, "robot-1");
        assert_eq!(m.get("device_id").unwrap(), "robot-1");
    }

    #[test]
    fn upload_commands_are_exempt_from_staleness() {
        assert!(is_upload_command("upload_song"));
        assert!(is_upload_command("audio_upload"));
        assert!(!is_upload_command("motor"));
        assert!(!is_upload_command(""));
    }

    #[test]
    fn strip_routing_fields_removes_both_and_leaves_rest() {
        let mut m = obj(json!({
            "command": "motor",
            "device_id": "d1",
            "target_device": "d1",
            "speed": 5,
        }));
        strip_routing_fields(&mut m);
        assert!(!m.contains_key("device_id"));
        assert!(!m.contains_key("target_device"));
        assert_eq!(m.get("command").unwrap(), "motor");
        assert_eq!(m.get("speed").unwrap(), 5);
    }
}
