use serde::{Deserialize, Serialize};

/// Reply prefix of a successful maintenance call
pub const SUCCESS_TAG: &str = "SUCCESS:";
/// Marks the sender's shortest known distance to a full-capability node
pub const DISTANCE_TO_SERVER_TAG: &str = "D2S:";
/// Marks the sender's SSL mode
pub const SSL_MODE_TAG: &str = "SSL:";
/// Marks the first maintenance call on a connection
pub const INIT_TAG: &str = "INIT";
/// Reply when the connection is healthy but must be maintained by the other side
pub const WRONG_DIRECTION_MESSAGE: &str = "Connection already established in opposite direction";

/// Request sent to a peer's maintenance endpoint each heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    pub node_id: String,
    pub user: String,
    pub password: String,
    pub extra_info: String,
}

impl MaintenanceRequest {
    /// Build the extra-info text: `INIT,` on the first call, then SSL mode and distance
    pub fn extra_info(first_call: bool, ssl_mode: Option<&str>, distance_to_server: i32) -> String {
        let mut info = String::new();
        if first_call {
            info.push_str(INIT_TAG);
            info.push(',');
        }
        if let Some(mode) = ssl_mode {
            info.push_str(&format!("{}{},", SSL_MODE_TAG, mode));
        }
        info.push_str(&format!("{}{}", DISTANCE_TO_SERVER_TAG, distance_to_server));
        info
    }

    pub fn is_init(&self) -> bool {
        self.extra_info.split(',').any(|t| t == INIT_TAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceResponse {
    pub message: Option<String>,
}

impl MaintenanceResponse {
    pub fn success(distance_to_server: i32) -> Self {
        Self {
            message: Some(format!("{}{}{}", SUCCESS_TAG, DISTANCE_TO_SERVER_TAG, distance_to_server)),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// True for a null reply or one carrying the success prefix
pub fn is_two_way_reply(reply: Option<&str>) -> bool {
    reply.map_or(true, |m| m.starts_with(SUCCESS_TAG))
}

/// Extract the distance-to-server value from a reply or extra-info string
pub fn parse_distance_to_server(info: &str) -> Option<i32> {
    let start = info.find(DISTANCE_TO_SERVER_TAG)? + DISTANCE_TO_SERVER_TAG.len();
    let rest = &info[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub statement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ok: bool,
    pub node_id: String,
}
