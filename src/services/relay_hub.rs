use actix::prelude::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api_contract::relay::{Envelope, MessageFamily, ServerMessage};
use crate::config::{DesktopConflictPolicy, OverflowPolicy, RelayConfig, ResponseRouting};
use crate::models::Principal;

pub type ConnectionId = Uuid;

/// Outstanding command ids tracked per account for originator routing
pub const MAX_PENDING_REQUESTS: usize = 1024;

pub mod close_reasons {
    pub const REPLACED: &str = "replaced by a newer desktop connection";
    pub const DESKTOP_ALREADY_CONNECTED: &str = "desktop already connected";
    pub const TOO_MANY_CONNECTIONS: &str = "too many connections for account";
    pub const SEND_QUEUE_OVERFLOW: &str = "send queue overflow";
    pub const DEVICE_UNPAIRED: &str = "device unpaired";
}

/// Frames the hub pushes into a connection's actor.
#[derive(Message, Debug, Clone, PartialEq, Eq)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(String),
    /// Close the socket with a policy close code and this reason
    Close(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("desktop already connected")]
    DesktopAlreadyConnected,
    #[error("too many connections for account (limit {0})")]
    TooManyConnections(usize),
    #[error("desktop is not connected")]
    DesktopOffline,
    #[error("desktop send queue is full")]
    DesktopBusy,
    #[error("connection is not registered")]
    NotRegistered,
}

impl HubError {
    /// Reason sent with the policy close when a registration is refused
    pub fn close_reason(&self) -> &'static str {
        match self {
            HubError::DesktopAlreadyConnected => close_reasons::DESKTOP_ALREADY_CONNECTED,
            HubError::TooManyConnections(_) => close_reasons::TOO_MANY_CONNECTIONS,
            HubError::DesktopOffline | HubError::DesktopBusy | HubError::NotRegistered => {
                "connection refused"
            }
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("send queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Number of text frames queued for one connection and not yet written.
#[derive(Clone, Debug, Default)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    /// Called by the owning actor once a queued text frame has been written
    pub fn drained(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Bounded outbound queue in front of a connection actor's mailbox.
#[derive(Clone)]
pub struct OutboundQueue {
    recipient: Recipient<Outbound>,
    depth: QueueDepth,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(recipient: Recipient<Outbound>, depth: QueueDepth, capacity: usize) -> Self {
        Self {
            recipient,
            depth,
            capacity,
        }
    }

    pub fn push_text(&self, text: String) -> Result<(), DeliveryError> {
        if !self.recipient.connected() {
            return Err(DeliveryError::Closed);
        }
        let reserved = self
            .depth
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(DeliveryError::Full);
        }
        self.recipient.do_send(Outbound::Text(text));
        Ok(())
    }

    /// Close frames bypass the bound so a full queue can still be shut down.
    pub fn push_close(&self, reason: &str) {
        self.recipient.do_send(Outbound::Close(reason.to_string()));
    }
}

/// A registered connection as the hub sees it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub principal: Principal,
    pub queue: OutboundQueue,
    pub created_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(principal: Principal, queue: OutboundQueue) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            queue,
            created_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct AccountGroup {
    desktop: Option<ConnectionHandle>,
    mobiles: HashMap<ConnectionId, ConnectionHandle>,
    /// command id -> originating mobile, used with originator routing
    pending: HashMap<String, ConnectionId>,
}

impl AccountGroup {
    fn len(&self) -> usize {
        self.mobiles.len() + usize::from(self.desktop.is_some())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mobile_targets(&self) -> Vec<(ConnectionId, OutboundQueue)> {
        self.mobiles
            .values()
            .map(|conn| (conn.id, conn.queue.clone()))
            .collect()
    }

    fn take_desktop(&mut self) -> Option<ConnectionHandle> {
        self.pending.clear();
        self.desktop.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub accounts: usize,
    pub desktops: usize,
    pub mobiles: usize,
}

/// Process-wide table of account groups.
///
/// Each account's entry in `groups` is that account's critical section.
/// Target queues are collected while the entry is held and pushed to after it
/// is released. The one exception is a new connection's `welcome`. Pushing
/// never touches a socket.
pub struct RelayHub {
    groups: DashMap<Uuid, AccountGroup>,
    index: DashMap<ConnectionId, Uuid>,
    config: RelayConfig,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            groups: DashMap::new(),
            index: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a connection. It is sent `welcome` first; a desktop is also
    /// announced to the account's mobiles.
    pub fn register(&self, conn: ConnectionHandle) -> Result<ConnectionId, HubError> {
        let account_id = conn.principal.account_id;
        let conn_id = conn.id;
        let is_desktop = conn.principal.is_desktop();
        let queue = conn.queue.clone();
        let presence = (conn.principal.device_id, conn.principal.device_name.clone());

        let admitted = {
            let mut group = self.groups.entry(account_id).or_default();
            let replacing = is_desktop && group.desktop.is_some();

            if replacing && self.config.desktop_conflict == DesktopConflictPolicy::Reject {
                Err(HubError::DesktopAlreadyConnected)
            } else if group.len() - usize::from(replacing) >= self.config.max_connections_per_account {
                Err(HubError::TooManyConnections(self.config.max_connections_per_account))
            } else {
                // Queued before the entry is released so nothing can overtake it
                if let Some(welcome) = encode(&ServerMessage::welcome(conn_id)) {
                    if let Err(err) = queue.push_text(welcome) {
                        debug!(connection_id = %conn_id, error = %err, "welcome_not_queued");
                    }
                }
                let replaced = if is_desktop {
                    let old = group.take_desktop();
                    group.desktop = Some(conn);
                    old
                } else {
                    group.mobiles.insert(conn_id, conn);
                    None
                };
                self.index.insert(conn_id, account_id);
                Ok(replaced)
            }
        };

        let replaced = match admitted {
            Ok(replaced) => replaced,
            Err(err) => {
                self.groups.remove_if(&account_id, |_, group| group.is_empty());
                warn!(account_id = %account_id, connection_id = %conn_id, error = %err, "relay_registration_refused");
                return Err(err);
            }
        };

        if let Some(old) = replaced {
            self.index.remove(&old.id);
            info!(
                account_id = %account_id,
                old_connection_id = %old.id,
                new_connection_id = %conn_id,
                "desktop_replaced"
            );
            old.queue.push_close(close_reasons::REPLACED);
        }

        info!(
            account_id = %account_id,
            connection_id = %conn_id,
            desktop = is_desktop,
            "relay_connection_registered"
        );

        if is_desktop {
            self.broadcast_desktop_status(&account_id, true, presence.0, presence.1);
        }

        let stats = self.stats();
        debug!(
            accounts = stats.accounts,
            desktops = stats.desktops,
            mobiles = stats.mobiles,
            "relay_hub_stats"
        );
        Ok(conn_id)
    }

    /// Remove a connection. Only the first call for a given id has any effect.
    pub fn deregister(&self, conn_id: &ConnectionId) -> bool {
        // Removal from the index is the once-only guard
        let Some((_, account_id)) = self.index.remove(conn_id) else {
            return false;
        };

        let mut departed_desktop = None;
        if let Some(mut group) = self.groups.get_mut(&account_id) {
            if group.desktop.as_ref().map(|d| d.id) == Some(*conn_id) {
                departed_desktop = group.take_desktop();
            } else if group.mobiles.remove(conn_id).is_some() {
                group.pending.retain(|_, origin| origin != conn_id);
            }
        }
        self.groups.remove_if(&account_id, |_, group| group.is_empty());

        info!(account_id = %account_id, connection_id = %conn_id, "relay_connection_deregistered");

        if let Some(desktop) = departed_desktop {
            self.broadcast_desktop_status(
                &account_id,
                false,
                desktop.principal.device_id,
                desktop.principal.device_name,
            );
        }
        true
    }

    /// Send `desktop_status` to every mobile of the account. Returns the number
    /// of mobiles the frame was queued for.
    pub fn broadcast_desktop_status(
        &self,
        account_id: &Uuid,
        online: bool,
        device_id: Option<Uuid>,
        device_name: Option<String>,
    ) -> usize {
        let targets = self
            .groups
            .get(account_id)
            .map(|group| group.mobile_targets())
            .unwrap_or_default();
        if targets.is_empty() {
            return 0;
        }

        let status = ServerMessage::DesktopStatus {
            online,
            device_id,
            device_name,
        };
        match encode(&status) {
            Some(text) => {
                debug!(account_id = %account_id, online, mobiles = targets.len(), "desktop_status_broadcast");
                self.deliver(&targets, &text)
            }
            None => 0,
        }
    }

    /// Forward a mobile's command to the account's desktop.
    ///
    /// Fails with `DesktopOffline` when there is no desktop or it went away
    /// during delivery, and with `DesktopBusy` when its queue is full and the
    /// overflow policy keeps it connected. A command that was not queued is
    /// never tracked for originator routing.
    pub fn forward_to_desktop(&self, sender: &ConnectionId, envelope: &Envelope) -> Result<(), HubError> {
        let account_id = self.account_of(sender)?;

        let (desktop_id, queue) = {
            let mut group = self.groups.get_mut(&account_id).ok_or(HubError::NotRegistered)?;
            if !group.mobiles.contains_key(sender) {
                return Err(HubError::NotRegistered);
            }
            let desktop = group
                .desktop
                .as_ref()
                .map(|d| (d.id, d.queue.clone()))
                .ok_or(HubError::DesktopOffline)?;

            if self.config.response_routing == ResponseRouting::Originator
                && envelope.family() == MessageFamily::Command
            {
                if let Some(id) = &envelope.id {
                    if group.pending.len() < MAX_PENDING_REQUESTS || group.pending.contains_key(id) {
                        group.pending.insert(id.clone(), *sender);
                    } else {
                        debug!(account_id = %account_id, "pending_request_table_full");
                    }
                }
            }
            desktop
        };

        debug!(
            account_id = %account_id,
            connection_id = %sender,
            message_type = %envelope.kind,
            "command_forwarded"
        );
        match self.deliver_to(&desktop_id, &queue, &envelope.raw) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(id) = &envelope.id {
                    self.forget_pending(&account_id, id, sender);
                }
                Err(match err {
                    DeliveryError::Full if self.config.overflow_policy == OverflowPolicy::DropNewest => {
                        HubError::DesktopBusy
                    }
                    _ => HubError::DesktopOffline,
                })
            }
        }
    }

    fn forget_pending(&self, account_id: &Uuid, request_id: &str, sender: &ConnectionId) {
        if let Some(mut group) = self.groups.get_mut(account_id) {
            if group.pending.get(request_id) == Some(sender) {
                group.pending.remove(request_id);
            }
        }
    }

    /// Forward a desktop's response or event to the account's mobiles.
    /// Returns how many mobiles it was queued for.
    pub fn forward_to_mobiles(&self, sender: &ConnectionId, envelope: &Envelope) -> Result<usize, HubError> {
        let account_id = self.account_of(sender)?;

        let targets = {
            let mut group = self.groups.get_mut(&account_id).ok_or(HubError::NotRegistered)?;
            if group.desktop.as_ref().map(|d| d.id) != Some(*sender) {
                return Err(HubError::NotRegistered);
            }

            let origin = match (&envelope.id, envelope.family(), self.config.response_routing) {
                (Some(id), MessageFamily::Response, ResponseRouting::Originator) => {
                    group.pending.remove(id)
                }
                _ => None,
            };
            match origin.and_then(|id| group.mobiles.get(&id)) {
                Some(mobile) => vec![(mobile.id, mobile.queue.clone())],
                None => group.mobile_targets(),
            }
        };

        debug!(
            account_id = %account_id,
            message_type = %envelope.kind,
            mobiles = targets.len(),
            "desktop_message_forwarded"
        );
        Ok(self.deliver(&targets, &envelope.raw))
    }

    /// Close the live desktop bound to an unpaired device.
    pub fn evict_device(&self, account_id: &Uuid, device_id: &Uuid) -> bool {
        let evicted = match self.groups.get_mut(account_id) {
            Some(mut group) => {
                let bound = group
                    .desktop
                    .as_ref()
                    .is_some_and(|d| d.principal.device_id.as_ref() == Some(device_id));
                if bound { group.take_desktop() } else { None }
            }
            None => None,
        };
        let Some(desktop) = evicted else {
            return false;
        };

        self.index.remove(&desktop.id);
        self.groups.remove_if(account_id, |_, group| group.is_empty());
        info!(account_id = %account_id, device_id = %device_id, connection_id = %desktop.id, "desktop_evicted");

        desktop.queue.push_close(close_reasons::DEVICE_UNPAIRED);
        self.broadcast_desktop_status(
            account_id,
            false,
            desktop.principal.device_id,
            desktop.principal.device_name,
        );
        true
    }

    pub fn has_desktop(&self, account_id: &Uuid) -> bool {
        self.groups
            .get(account_id)
            .is_some_and(|group| group.desktop.is_some())
    }

    pub fn is_device_online(&self, account_id: &Uuid, device_id: &Uuid) -> bool {
        self.groups.get(account_id).is_some_and(|group| {
            group
                .desktop
                .as_ref()
                .is_some_and(|d| d.principal.device_id.as_ref() == Some(device_id))
        })
    }

    pub fn is_registered(&self, conn_id: &ConnectionId) -> bool {
        self.index.contains_key(conn_id)
    }

    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            accounts: 0,
            desktops: 0,
            mobiles: 0,
        };
        for group in self.groups.iter() {
            stats.accounts += 1;
            stats.desktops += usize::from(group.desktop.is_some());
            stats.mobiles += group.mobiles.len();
        }
        stats
    }

    fn account_of(&self, conn_id: &ConnectionId) -> Result<Uuid, HubError> {
        self.index
            .get(conn_id)
            .map(|entry| *entry.value())
            .ok_or(HubError::NotRegistered)
    }

    /// Queue `text` for every target. Must be called with no map entry held.
    fn deliver(&self, targets: &[(ConnectionId, OutboundQueue)], text: &str) -> usize {
        targets
            .iter()
            .filter(|(conn_id, queue)| self.deliver_to(conn_id, queue, text).is_ok())
            .count()
    }

    /// Queue `text` for one connection, applying the overflow policy on failure.
    fn deliver_to(&self, conn_id: &ConnectionId, queue: &OutboundQueue, text: &str) -> Result<(), DeliveryError> {
        let result = queue.push_text(text.to_string());
        match result {
            Ok(()) => {}
            Err(DeliveryError::Closed) => {
                warn!(connection_id = %conn_id, "delivery_to_closed_connection");
                self.deregister(conn_id);
            }
            Err(DeliveryError::Full) => match self.config.overflow_policy {
                OverflowPolicy::Close => {
                    warn!(connection_id = %conn_id, "send_queue_overflow_closing");
                    queue.push_close(close_reasons::SEND_QUEUE_OVERFLOW);
                    self.deregister(conn_id);
                }
                OverflowPolicy::DropNewest => {
                    warn!(connection_id = %conn_id, "send_queue_overflow_dropped_frame");
                }
            },
        }
        result
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match message.to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            error!(error = %e, "server_message_encode_failed");
            None
        }
    }
}
