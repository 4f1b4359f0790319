use actix::prelude::*;
use actix_web_actors::{ws, ws::CloseCode, ws::CloseReason, ws::Message};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::api_contract::relay::{Envelope, EnvelopeError, ServerMessage, error_codes};
use crate::models::Principal;
use crate::services::relay_hub::{ConnectionHandle, ConnectionId, Outbound, OutboundQueue, QueueDepth, RelayHub};
use crate::services::relay_router;

/// Token bucket rate limiter for per-connection rate limiting
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_per_sec: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis();
        let add = elapsed_ms * u128::from(self.refill_per_sec) / 1000;
        if add > 0 {
            let add = u32::try_from(add).unwrap_or(u32::MAX);
            self.tokens = self.tokens.saturating_add(add).min(self.capacity);
            self.last_refill = now;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// One relay WebSocket connection. The principal is fixed at handshake.
pub struct RelaySocket {
    connection_id: Option<ConnectionId>,
    principal: Principal,
    hub: Arc<RelayHub>,
    depth: QueueDepth,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    rate: TokenBucket,
}

impl RelaySocket {
    pub fn new(principal: Principal, hub: Arc<RelayHub>) -> Self {
        let config = hub.config().clone();
        Self {
            connection_id: None,
            principal,
            hub,
            depth: QueueDepth::default(),
            last_heartbeat: Instant::now(),
            heartbeat_interval: config.heartbeat_interval(),
            client_timeout: config.client_timeout(),
            rate: TokenBucket::new(config.rate_limit_burst, config.rate_limit_per_sec),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    connection_id = ?act.connection_id,
                    account_id = %act.principal.account_id,
                    role = %act.principal.role,
                    "relay_client_heartbeat_timeout"
                );
                ctx.stop();
                return;
            }

            ctx.ping(b"heartbeat");
        });
    }

    fn send(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message.to_json() {
            Ok(text) => ctx.text(text),
            Err(e) => error!(connection_id = ?self.connection_id, error = %e, "reply_encode_failed"),
        }
    }

    fn policy_close(reason: &str, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.close(Some(CloseReason {
            code: CloseCode::Policy,
            description: Some(reason.to_string()),
        }));
        ctx.stop();
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(connection_id) = self.connection_id else {
            return;
        };

        if !self.rate.allow() {
            warn!(
                connection_id = %connection_id,
                account_id = %self.principal.account_id,
                "relay_rate_limit_exceeded"
            );
            let reply = ServerMessage::error(
                error_codes::RATE_LIMITED,
                "rate limit exceeded",
                Envelope::peek_id(text),
            );
            self.send(&reply, ctx);
            return;
        }

        if let Some(reply) = relay_router::route(&self.hub, connection_id, &self.principal, text) {
            self.send(&reply, ctx);
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let queue = OutboundQueue::new(
            ctx.address().recipient(),
            self.depth.clone(),
            self.hub.config().send_queue_capacity,
        );
        let handle = ConnectionHandle::new(self.principal.clone(), queue);

        match self.hub.register(handle) {
            Ok(connection_id) => {
                self.connection_id = Some(connection_id);
                info!(
                    connection_id = %connection_id,
                    account_id = %self.principal.account_id,
                    role = %self.principal.role,
                    device_id = ?self.principal.device_id,
                    "relay_socket_started"
                );
                self.start_heartbeat(ctx);
            }
            Err(err) => {
                warn!(
                    account_id = %self.principal.account_id,
                    role = %self.principal.role,
                    error = %err,
                    "relay_socket_refused"
                );
                Self::policy_close(err.close_reason(), ctx);
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(connection_id) = self.connection_id {
            self.hub.deregister(&connection_id);
            info!(
                connection_id = %connection_id,
                account_id = %self.principal.account_id,
                role = %self.principal.role,
                "relay_socket_stopped"
            );
        }
    }
}

impl Handler<Outbound> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(text) => {
                self.depth.drained();
                ctx.text(text);
            }
            Outbound::Close(reason) => {
                info!(connection_id = ?self.connection_id, reason = %reason, "relay_socket_closed_by_hub");
                Self::policy_close(&reason, ctx);
            }
        }
    }
}

impl StreamHandler<Result<Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                debug!(connection_id = ?self.connection_id, "binary_frame_rejected");
                self.send(&ServerMessage::invalid(&EnvelopeError::Binary, None), ctx);
            }
            Ok(Message::Close(reason)) => {
                info!(
                    connection_id = ?self.connection_id,
                    reason = ?reason,
                    "relay_close_received"
                );
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                error!(
                    connection_id = ?self.connection_id,
                    error = %e,
                    "relay_protocol_error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}
