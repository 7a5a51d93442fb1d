//! Credential extraction for the three WS accept paths (spec.md §6).

use std::collections::HashMap;

use actix_web::{web::Query, HttpRequest};

use crate::ids::DeviceId;

/// Robot auth parameters pulled from `/ws/device`'s query string or
/// headers.
pub struct DeviceAuthParams {
    pub device_id: DeviceId,
    pub signature: String,
    pub timestamp: Option<String>,
}

/// Looks up `key` in the request's headers, falling back to `None` if it
/// is absent or not valid UTF-8.
fn header_str<'a>(req: &'a HttpRequest, key: &str) -> Option<&'a str> {
    req.headers().get(key)?.to_str().ok()
}

/// Parses `device_id`, `sig`/`signature` and an optional `timestamp` out
/// of the request's query string, falling back to the equivalent request
/// headers for whichever of the three is missing from the query (spec.md
/// §6: "via URL query or request headers"). `None` means the required
/// params are missing from both, which the caller closes with code 4000.
#[must_use]
pub fn device_auth(req: &HttpRequest) -> Option<DeviceAuthParams> {
    let query: HashMap<String, String> =
        Query::<HashMap<String, String>>::from_query(req.query_string())
            .map(Query::into_inner)
            .unwrap_or_default();

    let device_id = query
        .get("device_id")
        .cloned()
        .or_else(|| header_str(req, "device_id").map(ToOwned::to_owned))?;
    let signature = query
        .get("sig")
        .or_else(|| query.get("signature"))
        .cloned()
        .or_else(|| header_str(req, "sig").map(ToOwned::to_owned))
        .or_else(|| header_str(req, "signature").map(ToOwned::to_owned))?;
    let timestamp = query
        .get("timestamp")
        .cloned()
        .or_else(|| header_str(req, "timestamp").map(ToOwned::to_owned));

    Some(DeviceAuthParams { device_id: DeviceId(device_id), signature, timestamp })
}

/// Parses the `token` query parameter out of `/ws/app`'s query string.
#[must_use]
pub fn app_token(req: &HttpRequest) -> Option<String> {
    let query: HashMap<String, String> =
        Query::<HashMap<String, String>>::from_query(req.query_string())
            .ok()?
            .into_inner();
    query.get("token").cloned()
}

/// What a `type: auth` frame on the generic path (`/ws`) carries: either
/// a device id + signature (+ optional timestamp) for a robot, or a bare
/// token for an app (spec.md §4.2/§6).
pub enum GenericAuthFrame {
    Robot(DeviceAuthParams),
    App(String),
}

/// Classifies a parsed `auth` frame's fields into [`GenericAuthFrame`].
/// Returns `None` if neither shape is present — the caller closes with
/// code 4000 ("malformed first frame").
#[must_use]
pub fn generic_auth_frame(
    obj: &serde_json::Map<String, serde_json::Value>,
) -> Option<GenericAuthFrame> {
    use crate::protocol::str_field;

    if let Some(token) = str_field(obj, "token") {
        return Some(GenericAuthFrame::App(token.to_owned()));
    }
    if let Some(device_id) = str_field(obj, "device_id") {
        let signature = str_field(obj, "sig")
            .or_else(|| str_field(obj, "signature"))?
            .to_owned();
        return Some(GenericAuthFrame::Robot(DeviceAuthParams {
            device_id: DeviceId(device_id.to_owned()),
            signature,
            timestamp: str_field(obj, "timestamp").map(ToOwned::to_owned),
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;
    use serde_json::json;

    use super::*;

    fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn device_auth_reads_device_id_sig_and_timestamp_from_the_query_string() {
        let req = TestRequest::default()
            .uri("/ws/device?device_id=d1&sig=abc&timestamp=123")
            .to_http_request();
        let params = device_auth(&req).unwrap();
        assert_eq!(params.device_id.as_str(), "d1");
        assert_eq!(params.signature, "abc");
        assert_eq!(params.timestamp.as_deref(), Some("123"));
    }

    #[test]
    fn device_auth_falls_back_to_headers_when_the_query_string_is_absent() {
        let req = TestRequest::default()
            .uri("/ws/device")
            .insert_header(("device_id", "d1"))
            .insert_header(("sig", "abc"))
            .insert_header(("timestamp", "123"))
            .to_http_request();
        let params = device_auth(&req).unwrap();
        assert_eq!(params.device_id.as_str(), "d1");
        assert_eq!(params.signature, "abc");
        assert_eq!(params.timestamp.as_deref(), Some("123"));
    }

    #[test]
    fn device_auth_accepts_the_signature_header_name_too() {
        let req = TestRequest::default()
            .uri("/ws/device")
            .insert_header(("device_id", "d1"))
            .insert_header(("signature", "abc"))
            .to_http_request();
        let params = device_auth(&req).unwrap();
        assert_eq!(params.signature, "abc");
    }

    #[test]
    fn device_auth_can_mix_query_device_id_with_a_header_signature() {
        let req = TestRequest::default()
            .uri("/ws/device?device_id=d1")
            .insert_header(("sig", "abc"))
            .to_http_request();
        let params = device_auth(&req).unwrap();
        assert_eq!(params.device_id.as_str(), "d1");
        assert_eq!(params.signature, "abc");
    }

    #[test]
    fn device_auth_query_values_take_priority_over_headers() {
        let req = TestRequest::default()
            .uri("/ws/device?device_id=from-query&sig=from-query-sig")
            .insert_header(("device_id", "from-header"))
            .insert_header(("sig", "from-header-sig"))
            .to_http_request();
        let params = device_auth(&req).unwrap();
        assert_eq!(params.device_id.as_str(), "from-query");
        assert_eq!(params.signature, "from-query-sig");
    }

    #[test]
    fn device_auth_missing_from_both_query_and_headers_is_rejected() {
        let req = TestRequest::default().uri("/ws/device").to_http_request();
        assert!(device_auth(&req).is_none());

        let req = TestRequest::default()
            .uri("/ws/device?device_id=d1")
            .to_http_request();
        assert!(device_auth(&req).is_none());
    }

    #[test]
    fn app_token_frame_takes_priority_over_device_fields() {
        // a frame carrying both `token` and `device_id` is treated as an
        // app login — `token` is checked first.
        let frame = generic_auth_frame(&obj(json!({
            "token": "abc",
            "device_id": "d1",
            "sig": "xyz",
        })));
        assert!(matches!(frame, Some(GenericAuthFrame::App(t)) if t == "abc"));
    }

    #[test]
    fn robot_frame_accepts_either_sig_or_signature_key() {
        let frame = generic_auth_frame(&obj(json!({"device_id": "d1", "sig": "s"})));
        assert!(matches!(frame, Some(GenericAuthFrame::Robot(_))));

        let frame = generic_auth_frame(&obj(json!({"device_id": "d1", "signature": "s"})));
        assert!(matches!(frame, Some(GenericAuthFrame::Robot(_))));
    }

    #[test]
    fn device_id_without_any_signature_key_is_rejected() {
        assert!(generic_auth_frame(&obj(json!({"device_id": "d1"}))).is_none());
    }

    #[test]
    fn frame_with_neither_shape_is_rejected() {
        assert!(generic_auth_frame(&obj(json!({"foo": "bar"}))).is_none());
    }
}
