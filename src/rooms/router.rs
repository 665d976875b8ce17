//! Room membership and event fan-out.
//!
//! Local delivery walks the room's member set directly. Every delivery is also
//! published on the tenant's bus channel; other nodes replay it to their own
//! members. The authoring node ignores its own envelopes on receipt, so its
//! members are delivered exactly once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::backoff::{with_retry, RetryPolicy};
use crate::cluster::{
    tenant_admin_room, tenant_channel, Bus, BusEnvelope, DeliveryTarget, SubscriptionId,
};
use crate::connection_manager::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState, DeviceKey, Namespace,
};
use crate::metrics::{BusMetrics, PresenceMetrics};
use crate::protocol::{EventMessage, Frame, Packet};

use super::room::{validate_room_id, RoomError, RoomKey};

/// Event whose `id` becomes the room's replay cursor.
pub const MESSAGE_NEW_EVENT: &str = "message.new";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Rooms implicitly left (client namespace only)
    pub left: Vec<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub local_delivered: usize,
    pub published: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub rooms: usize,
    pub members: usize,
    pub tenant_subscriptions: usize,
}

struct TenantSubscription {
    refs: usize,
    id: SubscriptionId,
}

/// Bounded set of recently seen envelope ids.
struct RecentIds {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the id was already seen.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct RoomRouter {
    server_id: String,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn Bus>,
    channel_prefix: String,
    /// room -> member connection ids
    rooms: DashMap<RoomKey, HashSet<ConnectionId>>,
    /// connection id -> rooms it is in
    memberships: DashMap<ConnectionId, HashSet<RoomKey>>,
    /// (tenant_id, room_id) -> last `message.new` id
    cursors: DashMap<RoomKey, String>,
    tenant_subscriptions: DashMap<String, TenantSubscription>,
    recent: Mutex<RecentIds>,
    retry: RetryPolicy,
}

impl RoomRouter {
    pub fn new(
        server_id: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn Bus>,
        channel_prefix: impl Into<String>,
        dedupe_capacity: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            registry,
            bus,
            channel_prefix: channel_prefix.into(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            cursors: DashMap::new(),
            tenant_subscriptions: DashMap::new(),
            recent: Mutex::new(RecentIds::new(dedupe_capacity)),
            retry,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn bus_backend(&self) -> &'static str {
        self.bus.backend_name()
    }

    // ------------------------------------------------------------------
    // Tenant channel subscriptions
    // ------------------------------------------------------------------

    /// Count one more local connection for `tenant_id`, subscribing to the
    /// tenant channel on the first.
    pub fn track_tenant(self: &Arc<Self>, tenant_id: &str) {
        let mut entry = self
            .tenant_subscriptions
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                let weak = Arc::downgrade(self);
                let channel = tenant_channel(&self.channel_prefix, tenant_id);
                let id = self.bus.subscribe(
                    &channel,
                    Arc::new(move |_channel: &str, payload: Bytes| {
                        if let Some(router) = weak.upgrade() {
                            router.on_bus_message(&payload);
                        }
                    }),
                );
                tracing::debug!(tenant_id = %tenant_id, channel = %channel, "Subscribed to tenant channel");
                TenantSubscription { refs: 0, id }
            });
        entry.refs += 1;
    }

    /// Drop one local connection for `tenant_id`, unsubscribing after the last.
    pub fn release_tenant(&self, tenant_id: &str) {
        if let Entry::Occupied(mut entry) = self.tenant_subscriptions.entry(tenant_id.to_string()) {
            entry.get_mut().refs = entry.get().refs.saturating_sub(1);
            if entry.get().refs == 0 {
                let (_, subscription) = entry.remove_entry();
                self.bus.unsubscribe(subscription.id);
                tracing::debug!(tenant_id = %tenant_id, "Unsubscribed from tenant channel");
            }
        }
    }

    pub fn is_tracking(&self, tenant_id: &str) -> bool {
        self.tenant_subscriptions.contains_key(tenant_id)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a connection to a room.
    ///
    /// Client connections have a single focus: joining leaves every other room.
    /// Admin connections accumulate rooms.
    pub fn join(
        &self,
        handle: &ConnectionHandle,
        room_id: &str,
        cursor: Option<String>,
    ) -> Result<JoinOutcome, RoomError> {
        validate_room_id(room_id)?;
        let key = RoomKey::new(handle.tenant_id(), handle.namespace(), room_id);
        self.join_key(handle, key, cursor)
    }

    /// Put an admin connection in its tenant's broadcast room.
    ///
    /// The room name is derived from the tenant id, which is not bound by the
    /// room id charset, so it bypasses [`validate_room_id`].
    pub fn join_tenant_admins(&self, handle: &ConnectionHandle) -> Result<JoinOutcome, RoomError> {
        let key = RoomKey::new(
            handle.tenant_id(),
            Namespace::Admin,
            tenant_admin_room(handle.tenant_id()),
        );
        self.join_key(handle, key, None)
    }

    fn join_key(
        &self,
        handle: &ConnectionHandle,
        key: RoomKey,
        cursor: Option<String>,
    ) -> Result<JoinOutcome, RoomError> {
        let mut left = Vec::new();
        {
            // Serialize with remove_connection on the same connection id
            let mut joined = self.memberships.entry(handle.id).or_default();
            if handle.state() != ConnectionState::Open {
                let empty = joined.is_empty();
                drop(joined);
                if empty {
                    self.memberships.remove_if(&handle.id, |_, rooms| rooms.is_empty());
                }
                return Err(RoomError::ConnectionClosed);
            }

            if handle.namespace() == Namespace::Client {
                let previous: Vec<RoomKey> =
                    joined.iter().filter(|k| **k != key).cloned().collect();
                for old in previous {
                    joined.remove(&old);
                    self.remove_member(&old, handle.id);
                    left.push(old.room_id);
                }
            }

            joined.insert(key.clone());
            self.rooms.entry(key.clone()).or_default().insert(handle.id);
        }

        PresenceMetrics::set_rooms_active(self.rooms.len());

        let cursor = cursor.or_else(|| self.room_cursor(&key));

        tracing::debug!(
            connection_id = %handle.id,
            room_id = %key.room_id,
            left = ?left,
            "Joined room"
        );

        Ok(JoinOutcome { left, cursor })
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub fn leave(&self, handle: &ConnectionHandle, room_id: &str) -> bool {
        let key = RoomKey::new(handle.tenant_id(), handle.namespace(), room_id);
        let removed = match self.memberships.get_mut(&handle.id) {
            Some(mut joined) => joined.remove(&key),
            None => false,
        };
        if removed {
            self.remove_member(&key, handle.id);
            self.memberships
                .remove_if(&handle.id, |_, rooms| rooms.is_empty());
            PresenceMetrics::set_rooms_active(self.rooms.len());
            tracing::debug!(connection_id = %handle.id, room_id = %room_id, "Left room");
        }
        removed
    }

    /// Drop every membership of a closing connection.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let Some((_, joined)) = self.memberships.remove(&connection_id) else {
            return 0;
        };
        for key in &joined {
            self.remove_member(key, connection_id);
        }
        PresenceMetrics::set_rooms_active(self.rooms.len());
        joined.len()
    }

    fn remove_member(&self, key: &RoomKey, connection_id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(key) {
            members.remove(&connection_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove_if(key, |_, m| m.is_empty());
            }
        }
    }

    pub fn is_member(&self, connection_id: ConnectionId, key: &RoomKey) -> bool {
        self.memberships
            .get(&connection_id)
            .map(|joined| joined.contains(key))
            .unwrap_or(false)
    }

    pub fn room_members(&self, key: &RoomKey) -> Vec<ConnectionId> {
        self.rooms
            .get(key)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<String> {
        self.memberships
            .get(&connection_id)
            .map(|joined| joined.iter().map(|k| k.room_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Last `message.new` id delivered to the room.
    pub fn room_cursor(&self, key: &RoomKey) -> Option<String> {
        self.cursors.get(key).map(|c| c.clone())
    }

    fn record_cursor(&self, tenant_id: &str, target: &DeliveryTarget, event: &EventMessage) {
        if event.name != MESSAGE_NEW_EVENT {
            return;
        }
        let DeliveryTarget::Room { namespaces, room_id } = target else {
            return;
        };
        let id = match event.payload().and_then(|p| p.get("id")) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return,
        };
        for namespace in namespaces {
            self.cursors
                .insert(RoomKey::new(tenant_id, *namespace, room_id.as_str()), id.clone());
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Enqueue an event to every matching local connection.
    pub fn deliver_local(
        &self,
        tenant_id: &str,
        target: &DeliveryTarget,
        event: &EventMessage,
        exclude: &[ConnectionId],
    ) -> usize {
        let mut delivered = 0;
        match target {
            DeliveryTarget::Room {
                namespaces,
                room_id,
            } => {
                for namespace in namespaces {
                    let key = RoomKey::new(tenant_id, *namespace, room_id.as_str());
                    let members = self.room_members(&key);
                    if members.is_empty() {
                        continue;
                    }
                    let text = encode_event(*namespace, event);
                    for id in members {
                        if exclude.contains(&id) {
                            continue;
                        }
                        if let Some(handle) = self.registry.get(id) {
                            if handle.send_text(text.clone()).is_ok() {
                                delivered += 1;
                            }
                        }
                    }
                }
            }
            DeliveryTarget::Device { device_id } => {
                let device = DeviceKey::new(tenant_id, device_id.as_str());
                let connections = self.registry.device_connections(&device);
                if !connections.is_empty() {
                    let text = encode_event(Namespace::Client, event);
                    for handle in connections {
                        if exclude.contains(&handle.id) {
                            continue;
                        }
                        if handle.send_text(text.clone()).is_ok() {
                            delivered += 1;
                        }
                    }
                }
            }
        }
        PresenceMetrics::record_deliveries(delivered);
        delivered
    }

    /// Deliver locally, then publish for the other nodes.
    ///
    /// Publish failures are retried and then degrade to local-only delivery.
    pub async fn deliver(
        &self,
        tenant_id: &str,
        target: DeliveryTarget,
        event: EventMessage,
        exclude: Vec<ConnectionId>,
    ) -> DeliveryReport {
        self.record_cursor(tenant_id, &target, &event);
        let local_delivered = self.deliver_local(tenant_id, &target, &event, &exclude);

        let envelope = BusEnvelope::new(&self.server_id, tenant_id, target, exclude, event);
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize bus envelope");
                return DeliveryReport {
                    local_delivered,
                    published: false,
                };
            }
        };
        self.recent_insert(envelope.id);

        let channel = tenant_channel(&self.channel_prefix, tenant_id);
        let published = match with_retry(&self.retry, "bus.publish", || {
            self.bus.publish(&channel, payload.clone())
        })
        .await
        {
            Ok(()) => {
                BusMetrics::record_published();
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    channel = %channel,
                    envelope_id = %envelope.id,
                    "Bus publish failed, delivered to local connections only"
                );
                BusMetrics::record_degraded();
                false
            }
        };

        DeliveryReport {
            local_delivered,
            published,
        }
    }

    fn recent_insert(&self, id: Uuid) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id)
    }

    /// Replay an envelope received from the bus to local members.
    pub fn on_bus_message(&self, payload: &[u8]) -> usize {
        BusMetrics::record_received();

        let envelope = match BusEnvelope::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed bus envelope");
                BusMetrics::record_dropped("malformed");
                return 0;
            }
        };

        if envelope.origin == self.server_id {
            BusMetrics::record_dropped("own_origin");
            return 0;
        }

        if !self.recent_insert(envelope.id) {
            tracing::debug!(envelope_id = %envelope.id, "Dropping duplicate bus envelope");
            BusMetrics::record_dropped("duplicate");
            return 0;
        }

        self.record_cursor(&envelope.tenant_id, &envelope.target, &envelope.event);
        self.deliver_local(
            &envelope.tenant_id,
            &envelope.target,
            &envelope.event,
            &envelope.exclude,
        )
    }

    pub async fn deliver_to_room(
        &self,
        tenant_id: &str,
        namespaces: &[Namespace],
        room_id: &str,
        event: EventMessage,
    ) -> Result<DeliveryReport, RoomError> {
        validate_room_id(room_id)?;
        Ok(self
            .deliver(
                tenant_id,
                DeliveryTarget::room(namespaces, room_id),
                event,
                Vec::new(),
            )
            .await)
    }

    pub async fn deliver_to_device(
        &self,
        tenant_id: &str,
        device_id: &str,
        event: EventMessage,
    ) -> DeliveryReport {
        self.deliver(
            tenant_id,
            DeliveryTarget::Device {
                device_id: device_id.to_string(),
            },
            event,
            Vec::new(),
        )
        .await
    }

    pub async fn deliver_to_tenant_admins(
        &self,
        tenant_id: &str,
        event: EventMessage,
    ) -> DeliveryReport {
        self.deliver(
            tenant_id,
            DeliveryTarget::admin_room(tenant_id),
            event,
            Vec::new(),
        )
        .await
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            rooms: self.rooms.len(),
            members: self.rooms.iter().map(|r| r.value().len()).sum(),
            tenant_subscriptions: self.tenant_subscriptions.len(),
        }
    }
}

fn encode_event(namespace: Namespace, event: &EventMessage) -> String {
    Frame::Message(Packet::event(namespace.path(), event.clone())).encode()
}
