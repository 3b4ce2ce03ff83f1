//! Health endpoint payload.

use serde::Serialize;

/// Response body of the health endpoint.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok" while the process serves traffic.
    pub status: &'static str,
    /// Number of live rooms.
    pub rooms: usize,
}

impl HealthResponse {
    /// Healthy payload with the current room count.
    pub fn ok(rooms: usize) -> Self {
        Self { status: "ok", rooms }
    }
}
