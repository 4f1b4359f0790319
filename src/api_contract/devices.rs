use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize, Serialize)]
pub struct PairDeviceRequest {
    pub device_name: String,
}

#[derive(Deserialize, Serialize)]
pub struct PairDeviceResponse {
    pub device_id: Uuid,
    pub device_token: String,
}

#[derive(Deserialize, Serialize)]
pub struct DeviceResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_online: bool,
}

#[derive(Deserialize, Serialize)]
pub struct DeleteDeviceResponse {
    pub ok: bool,
}

/// Handshake query of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct RelayConnectQuery {
    pub token: Option<String>,
    pub device_token: Option<String>,
}
