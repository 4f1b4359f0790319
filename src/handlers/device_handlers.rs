use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use log::{info, warn};
use uuid::Uuid;

use crate::api_contract::devices::{
    DeleteDeviceResponse, DeviceResponse, PairDeviceRequest, PairDeviceResponse, RelayConnectQuery,
};
use crate::error::AppError;
use crate::models::AuthenticatedUser;
use crate::services::identity_store::IdentityStore;
use crate::services::relay_hub::RelayHub;
use crate::services::relay_ws::RelaySocket;
use crate::services::token_verifier::{Credentials, TokenVerifier};

/// Pair a desktop device to the caller's account
pub async fn pair_device_handler(
    identity: web::Data<IdentityStore>,
    user: AuthenticatedUser,
    body: web::Json<PairDeviceRequest>,
) -> Result<HttpResponse, AppError> {
    let (device, device_token) = identity.pair_device(user.user_id, &body.device_name)?;

    Ok(HttpResponse::Ok().json(PairDeviceResponse {
        device_id: device.device_id,
        device_token,
    }))
}

/// List paired devices with live presence
pub async fn list_devices_handler(
    identity: web::Data<IdentityStore>,
    hub: web::Data<RelayHub>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let devices: Vec<DeviceResponse> = identity
        .list_devices(&user.user_id)
        .into_iter()
        .map(|device| DeviceResponse {
            is_online: hub.is_device_online(&user.user_id, &device.device_id),
            id: device.device_id,
            name: device.device_name,
            created_at: device.created_at,
            last_seen: device.last_seen,
        })
        .collect();

    Ok(HttpResponse::Ok().json(devices))
}

/// Unpair a device and disconnect it if it is live
pub async fn delete_device_handler(
    identity: web::Data<IdentityStore>,
    hub: web::Data<RelayHub>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    identity.remove_device(&user.user_id, &device_id)?;

    if hub.evict_device(&user.user_id, &device_id) {
        info!("Disconnected live desktop for unpaired device {}", device_id);
    }

    Ok(HttpResponse::Ok().json(DeleteDeviceResponse { ok: true }))
}

/// WebSocket handshake. Credentials are checked before the upgrade, so a
/// rejected client gets a plain 401 and never a `welcome`.
pub async fn relay_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<RelayConnectQuery>,
    verifier: web::Data<dyn TokenVerifier>,
    hub: web::Data<RelayHub>,
) -> Result<HttpResponse, actix_web::Error> {
    let credentials = Credentials::from_query(query.token.as_deref(), query.device_token.as_deref())
        .map_err(AppError::from)?;

    let principal = match verifier.verify(&credentials).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!("Relay handshake rejected: {}", e);
            return Err(AppError::from(e).into());
        }
    };

    info!(
        "Starting relay WebSocket for account {} as {}",
        principal.account_id, principal.role
    );
    ws::start(RelaySocket::new(principal, hub.into_inner()), &req, stream)
}
