//! In-process store for lite mode and tests.
//!
//! All maps live behind one `RwLock`, so each trait call is atomic with
//! respect to every other. The conditional operations check and write under
//! the same write guard, which gives them the same compare-and-swap
//! semantics as the `UPDATE … WHERE` statements of the PostgreSQL backend.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use meridian_common::models::{
    BridgeConnection, BridgeStatus, ChannelMapping, ControlAction, DeliveryReceipt,
    DeliveryStatus, Instance, KeyAuditEntry, MappingDirection, NewBridgeConnection,
    NewInstance, NewKeyAuditEntry, NewReceipt, NewVirtualUser, PeerControl, PeerRelationship,
    PeerStatus, ReceiptFilter, ReceiptUpdate, VirtualUser,
};
use meridian_common::ids::generate_id;

use crate::store::{
    BridgeStore, KeyAuditStore, PeerStore, ReceiptStore, RelayDirection, SigningKeyStore,
    StoreError, StoreResult, StoredSigningKey,
};

type PeerKey = (Uuid, Uuid);

#[derive(Default)]
struct State {
    instances: HashMap<Uuid, Instance>,
    relationships: HashMap<PeerKey, PeerRelationship>,
    controls: HashMap<PeerKey, PeerControl>,
    txn_log: HashSet<(String, String)>,
    receipts: HashMap<Uuid, DeliveryReceipt>,
    audits: HashMap<Uuid, KeyAuditEntry>,
    connections: HashMap<Uuid, BridgeConnection>,
    mappings: HashMap<Uuid, ChannelMapping>,
    virtual_users: HashMap<Uuid, VirtualUser>,
    signing_keys: Vec<StoredSigningKey>,
}

/// Process-local implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_update(receipt: &mut DeliveryReceipt, update: &ReceiptUpdate) {
    receipt.status = update.status;
    if update.increment_attempts {
        receipt.attempts += 1;
    }
    if let Some(at) = update.last_attempt_at {
        receipt.last_attempt_at = Some(at);
    }
    if let Some(at) = update.delivered_at {
        receipt.delivered_at = Some(at);
    }
    if let Some(message) = &update.error_message {
        receipt.error_message = message.clone();
    }
    if let Some(permanent) = update.permanent_failure {
        receipt.permanent_failure = permanent;
    }
    if let Some(next) = update.next_attempt_at {
        receipt.next_attempt_at = next;
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, Uuid)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

// ─── Peers ───────────────────────────────────────────────────────────────────

#[async_trait]
impl PeerStore for MemoryStore {
    async fn upsert_instance(&self, new: NewInstance) -> StoreResult<Instance> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        if let Some(existing) = state.instances.values_mut().find(|i| i.domain == new.domain) {
            if new.software_name.is_some() {
                existing.software_name = new.software_name;
            }
            if new.protocol_version.is_some() {
                existing.protocol_version = new.protocol_version;
            }
            if !new.capabilities.is_empty() {
                existing.capabilities = new.capabilities;
            }
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let instance = Instance {
            id: generate_id(),
            domain: new.domain,
            public_key_fingerprint: None,
            public_key: None,
            software_name: new.software_name,
            protocol_version: new.protocol_version,
            capabilities: new.capabilities,
            created_at: now,
            updated_at: now,
        };
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<Instance>> {
        Ok(self.state.read().await.instances.get(&id).cloned())
    }

    async fn find_instance(&self, domain: &str) -> StoreResult<Option<Instance>> {
        let state = self.state.read().await;
        Ok(state.instances.values().find(|i| i.domain == domain).cloned())
    }

    async fn list_instances(&self) -> StoreResult<Vec<Instance>> {
        let state = self.state.read().await;
        let mut all: Vec<Instance> = state.instances.values().cloned().collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(all)
    }

    async fn pin_key_if_unset(
        &self,
        instance_id: Uuid,
        fingerprint: &str,
        public_key: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or(StoreError::NotFound("Instance"))?;
        if instance.public_key_fingerprint.is_some() {
            return Ok(false);
        }
        instance.public_key_fingerprint = Some(fingerprint.to_owned());
        instance.public_key = Some(public_key.to_owned());
        instance.updated_at = Utc::now();
        Ok(true)
    }

    async fn replace_pinned_key(
        &self,
        instance_id: Uuid,
        fingerprint: &str,
        public_key: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or(StoreError::NotFound("Instance"))?;
        instance.public_key_fingerprint = Some(fingerprint.to_owned());
        instance.public_key = public_key.map(str::to_owned);
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn ensure_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
        initial: PeerStatus,
    ) -> StoreResult<PeerRelationship> {
        let mut state = self.state.write().await;
        let rel = state.relationships.entry((local, remote)).or_insert_with(|| PeerRelationship {
            id: generate_id(),
            local_instance_id: local,
            remote_instance_id: remote,
            status: initial,
            established_at: Utc::now(),
            last_synced_at: None,
            handshake_completed_at: None,
        });
        Ok(rel.clone())
    }

    async fn get_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
    ) -> StoreResult<Option<PeerRelationship>> {
        Ok(self.state.read().await.relationships.get(&(local, remote)).cloned())
    }

    async fn list_relationships(
        &self,
        local: Uuid,
        status: Option<PeerStatus>,
    ) -> StoreResult<Vec<PeerRelationship>> {
        let state = self.state.read().await;
        let mut rels: Vec<PeerRelationship> = state
            .relationships
            .values()
            .filter(|r| r.local_instance_id == local)
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        newest_first(&mut rels, |r| (r.established_at, r.id));
        Ok(rels)
    }

    async fn transition_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
        expected: Option<PeerStatus>,
        to: PeerStatus,
        complete_handshake: bool,
    ) -> StoreResult<Option<PeerRelationship>> {
        let mut state = self.state.write().await;
        let Some(rel) = state.relationships.get_mut(&(local, remote)) else {
            return Ok(None);
        };
        if expected.is_some_and(|e| rel.status != e) {
            return Ok(None);
        }
        rel.status = to;
        if complete_handshake && rel.handshake_completed_at.is_none() {
            rel.handshake_completed_at = Some(Utc::now());
        }
        Ok(Some(rel.clone()))
    }

    async fn touch_relationship(&self, local: Uuid, remote: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(rel) = state.relationships.get_mut(&(local, remote)) {
            rel.last_synced_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn upsert_control(
        &self,
        local: Uuid,
        remote: Uuid,
        action: ControlAction,
        reason: Option<String>,
        created_by: Option<Uuid>,
    ) -> StoreResult<PeerControl> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let control = state
            .controls
            .entry((local, remote))
            .and_modify(|c| {
                c.action = action;
                c.reason = reason.clone();
                c.created_by = created_by;
                c.updated_at = now;
            })
            .or_insert_with(|| PeerControl {
                id: generate_id(),
                local_instance_id: local,
                remote_instance_id: remote,
                action,
                reason: reason.clone(),
                created_by,
                created_at: now,
                updated_at: now,
            });
        Ok(control.clone())
    }

    async fn get_control(&self, local: Uuid, remote: Uuid) -> StoreResult<Option<PeerControl>> {
        Ok(self.state.read().await.controls.get(&(local, remote)).cloned())
    }

    async fn delete_control(&self, local: Uuid, remote: Uuid) -> StoreResult<bool> {
        Ok(self.state.write().await.controls.remove(&(local, remote)).is_some())
    }

    async fn record_inbound_transaction(&self, origin: &str, txn_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.txn_log.insert((origin.to_owned(), txn_id.to_owned())))
    }
}

// ─── Receipts ────────────────────────────────────────────────────────────────

#[async_trait]
impl ReceiptStore for MemoryStore {
    async fn insert_receipt(&self, new: NewReceipt) -> StoreResult<(DeliveryReceipt, bool)> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .receipts
            .values()
            .find(|r| r.message_id == new.message_id && r.target_instance == new.target_instance)
        {
            return Ok((existing.clone(), false));
        }

        let receipt = DeliveryReceipt {
            id: generate_id(),
            message_id: new.message_id,
            source_instance: new.source_instance,
            target_instance: new.target_instance,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            delivered_at: None,
            error_message: None,
            permanent_failure: false,
            next_attempt_at: None,
            created_at: Utc::now(),
            payload: new.payload,
        };
        state.receipts.insert(receipt.id, receipt.clone());
        Ok((receipt, true))
    }

    async fn get_receipt(&self, id: Uuid) -> StoreResult<Option<DeliveryReceipt>> {
        Ok(self.state.read().await.receipts.get(&id).cloned())
    }

    async fn update_receipt_if(
        &self,
        id: Uuid,
        expected: DeliveryStatus,
        update: &ReceiptUpdate,
    ) -> StoreResult<Option<DeliveryReceipt>> {
        let mut state = self.state.write().await;
        match state.receipts.get_mut(&id) {
            Some(receipt) if receipt.status == expected => {
                apply_update(receipt, update);
                Ok(Some(receipt.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_receipts(&self, filter: &ReceiptFilter) -> StoreResult<Vec<DeliveryReceipt>> {
        let state = self.state.read().await;
        let mut matched: Vec<DeliveryReceipt> =
            state.receipts.values().filter(|r| filter.matches(r)).cloned().collect();
        newest_first(&mut matched, |r| (r.created_at, r.id));
        matched.truncate(filter.effective_limit() as usize);
        Ok(matched)
    }

    async fn due_receipts(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: u32,
    ) -> StoreResult<Vec<DeliveryReceipt>> {
        let state = self.state.read().await;
        let mut due: Vec<DeliveryReceipt> = state
            .receipts
            .values()
            .filter(|r| r.status == DeliveryStatus::Failed && !r.permanent_failure)
            .filter(|r| r.attempts < max_attempts)
            .filter(|r| r.next_attempt_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.next_attempt_at, r.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn stranded_receipts(
        &self,
        now: DateTime<Utc>,
        unleased_before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<DeliveryReceipt>> {
        let state = self.state.read().await;
        let mut stranded: Vec<DeliveryReceipt> = state
            .receipts
            .values()
            .filter(|r| r.status.is_attemptable())
            .filter(|r| match r.next_attempt_at {
                Some(lease) => lease <= now,
                None => r.created_at <= unleased_before,
            })
            .cloned()
            .collect();
        stranded.sort_by_key(|r| (r.created_at, r.id));
        stranded.truncate(limit as usize);
        Ok(stranded)
    }
}

// ─── Key audit ───────────────────────────────────────────────────────────────

#[async_trait]
impl KeyAuditStore for MemoryStore {
    async fn open_entry(&self, new: NewKeyAuditEntry) -> StoreResult<(KeyAuditEntry, bool)> {
        let mut state = self.state.write().await;
        if let Some(open) = state.audits.values().find(|e| {
            e.is_open() && e.instance_id == new.instance_id && e.new_fingerprint == new.new_fingerprint
        }) {
            return Ok((open.clone(), false));
        }

        let entry = KeyAuditEntry {
            id: generate_id(),
            instance_id: new.instance_id,
            old_fingerprint: new.old_fingerprint,
            new_fingerprint: new.new_fingerprint,
            new_public_key: new.new_public_key,
            detected_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
        };
        state.audits.insert(entry.id, entry.clone());
        Ok((entry, true))
    }

    async fn get_entry(&self, id: Uuid) -> StoreResult<Option<KeyAuditEntry>> {
        Ok(self.state.read().await.audits.get(&id).cloned())
    }

    async fn acknowledge_entry(
        &self,
        id: Uuid,
        by: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<KeyAuditEntry>> {
        let mut state = self.state.write().await;
        match state.audits.get_mut(&id) {
            Some(entry) if entry.is_open() => {
                entry.acknowledged_by = Some(by);
                entry.acknowledged_at = Some(at);
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_entries(
        &self,
        instance_id: Option<Uuid>,
        open_only: bool,
    ) -> StoreResult<Vec<KeyAuditEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<KeyAuditEntry> = state
            .audits
            .values()
            .filter(|e| instance_id.is_none_or(|id| e.instance_id == id))
            .filter(|e| !open_only || e.is_open())
            .cloned()
            .collect();
        newest_first(&mut entries, |e| (e.detected_at, e.id));
        Ok(entries)
    }
}

// ─── Bridges ─────────────────────────────────────────────────────────────────

#[async_trait]
impl BridgeStore for MemoryStore {
    async fn create_connection(&self, new: NewBridgeConnection) -> StoreResult<BridgeConnection> {
        let mut state = self.state.write().await;
        let duplicate = state.connections.values().any(|c| {
            c.guild_id == new.guild_id && c.bridge_type == new.bridge_type && c.remote_id == new.remote_id
        });
        if duplicate {
            return Err(StoreError::Conflict("Bridge connection"));
        }

        let now = Utc::now();
        let conn = BridgeConnection {
            id: generate_id(),
            guild_id: new.guild_id,
            bridge_type: new.bridge_type,
            remote_id: new.remote_id,
            display_name: new.display_name,
            status: BridgeStatus::Disconnected,
            config: new.config,
            last_error: None,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        state.connections.insert(conn.id, conn.clone());
        Ok(conn)
    }

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<BridgeConnection>> {
        Ok(self.state.read().await.connections.get(&id).cloned())
    }

    async fn list_connections(&self, guild_id: Uuid) -> StoreResult<Vec<BridgeConnection>> {
        let state = self.state.read().await;
        let mut conns: Vec<BridgeConnection> =
            state.connections.values().filter(|c| c.guild_id == guild_id).cloned().collect();
        conns.sort_by_key(|c| (c.created_at, c.id));
        Ok(conns)
    }

    async fn connections_with_status(&self, status: BridgeStatus) -> StoreResult<Vec<BridgeConnection>> {
        let state = self.state.read().await;
        let mut conns: Vec<BridgeConnection> =
            state.connections.values().filter(|c| c.status == status).cloned().collect();
        conns.sort_by_key(|c| (c.created_at, c.id));
        Ok(conns)
    }

    async fn set_connection_status(
        &self,
        id: Uuid,
        status: BridgeStatus,
        last_error: Option<String>,
    ) -> StoreResult<Option<BridgeConnection>> {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.get_mut(&id) else {
            return Ok(None);
        };
        conn.status = status;
        conn.last_error = last_error;
        conn.updated_at = Utc::now();
        Ok(Some(conn.clone()))
    }

    async fn delete_connection(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.connections.remove(&id).is_none() {
            return Ok(false);
        }
        state.mappings.retain(|_, m| m.bridge_id != id);
        state.virtual_users.retain(|_, v| v.bridge_id != id);
        Ok(true)
    }

    async fn create_mapping(
        &self,
        bridge_id: Uuid,
        local_channel_id: Uuid,
        remote_channel_id: &str,
        direction: MappingDirection,
    ) -> StoreResult<ChannelMapping> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&bridge_id) {
            return Err(StoreError::NotFound("Bridge connection"));
        }
        let duplicate = state.mappings.values().any(|m| {
            m.bridge_id == bridge_id
                && m.local_channel_id == local_channel_id
                && m.remote_channel_id == remote_channel_id
        });
        if duplicate {
            return Err(StoreError::Conflict("Channel mapping"));
        }

        let mapping = ChannelMapping {
            id: generate_id(),
            bridge_id,
            local_channel_id,
            remote_channel_id: remote_channel_id.to_owned(),
            direction,
            inbound_count: 0,
            outbound_count: 0,
            created_at: Utc::now(),
        };
        state.mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    async fn get_mapping(&self, id: Uuid) -> StoreResult<Option<ChannelMapping>> {
        Ok(self.state.read().await.mappings.get(&id).cloned())
    }

    async fn delete_mapping(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.state.write().await.mappings.remove(&id).is_some())
    }

    async fn list_mappings(&self, bridge_id: Uuid) -> StoreResult<Vec<ChannelMapping>> {
        let state = self.state.read().await;
        let mut maps: Vec<ChannelMapping> =
            state.mappings.values().filter(|m| m.bridge_id == bridge_id).cloned().collect();
        maps.sort_by_key(|m| (m.created_at, m.id));
        Ok(maps)
    }

    async fn mappings_for_local_channel(
        &self,
        local_channel_id: Uuid,
    ) -> StoreResult<Vec<ChannelMapping>> {
        let state = self.state.read().await;
        let mut maps: Vec<ChannelMapping> = state
            .mappings
            .values()
            .filter(|m| m.local_channel_id == local_channel_id)
            .cloned()
            .collect();
        maps.sort_by_key(|m| (m.created_at, m.id));
        Ok(maps)
    }

    async fn mappings_for_remote_channel(
        &self,
        bridge_id: Uuid,
        remote_channel_id: &str,
    ) -> StoreResult<Vec<ChannelMapping>> {
        let state = self.state.read().await;
        let mut maps: Vec<ChannelMapping> = state
            .mappings
            .values()
            .filter(|m| m.bridge_id == bridge_id && m.remote_channel_id == remote_channel_id)
            .cloned()
            .collect();
        maps.sort_by_key(|m| (m.created_at, m.id));
        Ok(maps)
    }

    async fn increment_mapping_counter(
        &self,
        id: Uuid,
        direction: RelayDirection,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(m) = state.mappings.get_mut(&id) {
            match direction {
                RelayDirection::Inbound => m.inbound_count += 1,
                RelayDirection::Outbound => m.outbound_count += 1,
            }
        }
        Ok(())
    }

    async fn upsert_virtual_user(&self, new: NewVirtualUser) -> StoreResult<VirtualUser> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        if let Some(existing) = state
            .virtual_users
            .values_mut()
            .find(|v| v.bridge_id == new.bridge_id && v.remote_user_id == new.remote_user_id)
        {
            existing.display_name = new.display_name;
            existing.avatar_url = new.avatar_url;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let user = VirtualUser {
            id: generate_id(),
            bridge_id: new.bridge_id,
            remote_user_id: new.remote_user_id,
            display_name: new.display_name,
            avatar_url: new.avatar_url,
            created_at: now,
            updated_at: now,
        };
        state.virtual_users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_virtual_user(&self, id: Uuid) -> StoreResult<Option<VirtualUser>> {
        Ok(self.state.read().await.virtual_users.get(&id).cloned())
    }
}

// ─── Signing keys ────────────────────────────────────────────────────────────

#[async_trait]
impl SigningKeyStore for MemoryStore {
    async fn active_signing_key(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<StoredSigningKey>> {
        let state = self.state.read().await;
        Ok(state.signing_keys.iter().rev().find(|k| k.expires_at > now).cloned())
    }

    async fn insert_signing_key(
        &self,
        key: &StoredSigningKey,
        _public_key_b64: &str,
    ) -> StoreResult<()> {
        self.state.write().await.signing_keys.push(key.clone());
        Ok(())
    }
}
