//! Storage contracts.
//!
//! The peer registry and the receipt table are the only shared mutable state
//! in the federation subsystem. Every mutation here is narrow and, where a
//! race matters, conditional on the value the caller last observed. Backends
//! must never implement these as read-modify-write of a whole row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use meridian_common::models::{
    BridgeConnection, BridgeStatus, ChannelMapping, ControlAction, DeliveryReceipt,
    DeliveryStatus, Instance, KeyAuditEntry, MappingDirection, NewBridgeConnection,
    NewInstance, NewKeyAuditEntry, NewReceipt, NewVirtualUser, PeerControl, PeerRelationship,
    PeerStatus, ReceiptFilter, ReceiptUpdate, VirtualUser,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("{0} already exists")]
    Conflict(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Which counter of a channel mapping to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    Inbound,
    Outbound,
}

/// Instances, peer relationships, administrator controls and the inbound
/// transaction log.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Insert the instance if its domain is unknown, otherwise refresh the
    /// descriptive fields that were supplied. Never touches the pinned key.
    async fn upsert_instance(&self, new: NewInstance) -> StoreResult<Instance>;

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<Instance>>;

    async fn find_instance(&self, domain: &str) -> StoreResult<Option<Instance>>;

    async fn list_instances(&self) -> StoreResult<Vec<Instance>>;

    /// Pin a key on first use. Returns `false` if a key was already pinned.
    async fn pin_key_if_unset(
        &self,
        instance_id: Uuid,
        fingerprint: &str,
        public_key: &str,
    ) -> StoreResult<bool>;

    /// Replace the pinned key. Only the key auditor calls this, after an
    /// administrator acknowledged the change.
    async fn replace_pinned_key(
        &self,
        instance_id: Uuid,
        fingerprint: &str,
        public_key: Option<&str>,
    ) -> StoreResult<()>;

    /// Create the relationship in `initial` status unless one exists.
    /// Concurrent callers converge on a single row.
    async fn ensure_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
        initial: PeerStatus,
    ) -> StoreResult<PeerRelationship>;

    async fn get_relationship(&self, local: Uuid, remote: Uuid)
    -> StoreResult<Option<PeerRelationship>>;

    async fn list_relationships(
        &self,
        local: Uuid,
        status: Option<PeerStatus>,
    ) -> StoreResult<Vec<PeerRelationship>>;

    /// Move the relationship to `to` if its status equals `expected`
    /// (`None` matches any status). Returns `None` when nothing matched.
    async fn transition_relationship(
        &self,
        local: Uuid,
        remote: Uuid,
        expected: Option<PeerStatus>,
        to: PeerStatus,
        complete_handshake: bool,
    ) -> StoreResult<Option<PeerRelationship>>;

    /// Record a successful exchange with the peer.
    async fn touch_relationship(&self, local: Uuid, remote: Uuid) -> StoreResult<()>;

    async fn upsert_control(
        &self,
        local: Uuid,
        remote: Uuid,
        action: ControlAction,
        reason: Option<String>,
        created_by: Option<Uuid>,
    ) -> StoreResult<PeerControl>;

    async fn get_control(&self, local: Uuid, remote: Uuid) -> StoreResult<Option<PeerControl>>;

    async fn delete_control(&self, local: Uuid, remote: Uuid) -> StoreResult<bool>;

    /// Log an inbound `(origin, txn_id)`. Returns `false` for a replay.
    async fn record_inbound_transaction(&self, origin: &str, txn_id: &str) -> StoreResult<bool>;
}

/// Outbound delivery receipts.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Create the receipt for `(message_id, target)`, or return the existing
    /// one. The flag is `true` when a new row was written.
    async fn insert_receipt(&self, new: NewReceipt) -> StoreResult<(DeliveryReceipt, bool)>;

    async fn get_receipt(&self, id: Uuid) -> StoreResult<Option<DeliveryReceipt>>;

    /// Compare-and-swap on status: apply `update` only if the receipt is
    /// currently `expected`. Returns `None` when another writer got there first.
    async fn update_receipt_if(
        &self,
        id: Uuid,
        expected: DeliveryStatus,
        update: &ReceiptUpdate,
    ) -> StoreResult<Option<DeliveryReceipt>>;

    /// Newest first.
    async fn list_receipts(&self, filter: &ReceiptFilter) -> StoreResult<Vec<DeliveryReceipt>>;

    /// `failed`, non-permanent receipts under `max_attempts` whose
    /// `next_attempt_at` is at or before `now`, oldest schedule first.
    async fn due_receipts(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: u32,
    ) -> StoreResult<Vec<DeliveryReceipt>>;

    /// `pending` or `retrying` receipts whose attempt never recorded an
    /// outcome: those with a lease (`next_attempt_at`) at or before `now`,
    /// and lease-less ones created at or before `unleased_before`.
    async fn stranded_receipts(
        &self,
        now: DateTime<Utc>,
        unleased_before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<DeliveryReceipt>>;
}

/// Append-only key change audit log.
#[async_trait]
pub trait KeyAuditStore: Send + Sync {
    /// Open an entry unless an unacknowledged one already exists for
    /// `(instance_id, new_fingerprint)`. The flag is `true` for a new row.
    async fn open_entry(&self, new: NewKeyAuditEntry) -> StoreResult<(KeyAuditEntry, bool)>;

    async fn get_entry(&self, id: Uuid) -> StoreResult<Option<KeyAuditEntry>>;

    /// Acknowledge an open entry. Returns `None` if it is missing or was
    /// already acknowledged.
    async fn acknowledge_entry(
        &self,
        id: Uuid,
        by: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<KeyAuditEntry>>;

    /// Newest first.
    async fn list_entries(
        &self,
        instance_id: Option<Uuid>,
        open_only: bool,
    ) -> StoreResult<Vec<KeyAuditEntry>>;
}

/// Bridge connections, channel mappings and virtual users.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    /// Fails with `Conflict` for a duplicate `(guild, type, remote_id)`.
    async fn create_connection(&self, new: NewBridgeConnection) -> StoreResult<BridgeConnection>;

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<BridgeConnection>>;

    async fn list_connections(&self, guild_id: Uuid) -> StoreResult<Vec<BridgeConnection>>;

    /// Connections in `status` across every guild, oldest first.
    async fn connections_with_status(&self, status: BridgeStatus) -> StoreResult<Vec<BridgeConnection>>;

    async fn set_connection_status(
        &self,
        id: Uuid,
        status: BridgeStatus,
        last_error: Option<String>,
    ) -> StoreResult<Option<BridgeConnection>>;

    /// Removes the connection with its mappings and virtual users.
    async fn delete_connection(&self, id: Uuid) -> StoreResult<bool>;

    /// Fails with `Conflict` for a duplicate `(bridge, local, remote)`.
    async fn create_mapping(
        &self,
        bridge_id: Uuid,
        local_channel_id: Uuid,
        remote_channel_id: &str,
        direction: MappingDirection,
    ) -> StoreResult<ChannelMapping>;

    async fn get_mapping(&self, id: Uuid) -> StoreResult<Option<ChannelMapping>>;

    async fn delete_mapping(&self, id: Uuid) -> StoreResult<bool>;

    async fn list_mappings(&self, bridge_id: Uuid) -> StoreResult<Vec<ChannelMapping>>;

    async fn mappings_for_local_channel(
        &self,
        local_channel_id: Uuid,
    ) -> StoreResult<Vec<ChannelMapping>>;

    async fn mappings_for_remote_channel(
        &self,
        bridge_id: Uuid,
        remote_channel_id: &str,
    ) -> StoreResult<Vec<ChannelMapping>>;

    async fn increment_mapping_counter(
        &self,
        id: Uuid,
        direction: RelayDirection,
    ) -> StoreResult<()>;

    /// Create or refresh the projection for `(bridge_id, remote_user_id)`.
    async fn upsert_virtual_user(&self, new: NewVirtualUser) -> StoreResult<VirtualUser>;

    async fn get_virtual_user(&self, id: Uuid) -> StoreResult<Option<VirtualUser>>;
}

/// A persisted server signing key.
#[derive(Debug, Clone)]
pub struct StoredSigningKey {
    pub key_id: String,
    pub seed: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

/// This server's own Ed25519 signing keys.
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    /// Newest active key that has not expired.
    async fn active_signing_key(&self, now: DateTime<Utc>) -> StoreResult<Option<StoredSigningKey>>;

    async fn insert_signing_key(
        &self,
        key: &StoredSigningKey,
        public_key_b64: &str,
    ) -> StoreResult<()>;
}

impl From<StoreError> for meridian_common::error::MeridianError {
    fn from(e: StoreError) -> Self {
        use meridian_common::error::MeridianError;
        match e {
            StoreError::Conflict(what) => MeridianError::conflict(format!("{what} already exists")),
            StoreError::NotFound(what) => MeridianError::not_found(what),
            StoreError::Database(err) => MeridianError::Storage(err.to_string()),
        }
    }
}
