//! WebRTC session-table data types (spec.md §3, §4.3).

use chrono::{DateTime, Utc};

use crate::ids::{DeviceId, SessionId, UserId};
use crate::manager::ConnId;

/// One negotiated WebRTC session between an app connection and a robot.
///
/// Stored in the routing index (`SessionId -> SessionRecord`); the
/// device's *active slot* (`DeviceId -> SessionId`) is a second, disjoint
/// index that merely points at one of these records (spec.md §9
/// "Ownership cycles": the active slot is non-owning).
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    /// Non-owning handle to the app connection that requested this
    /// session; invalidated when that connection disconnects (spec.md §9).
    pub app_conn_id: ConnId,
    pub created_at: DateTime<Utc>,
}
