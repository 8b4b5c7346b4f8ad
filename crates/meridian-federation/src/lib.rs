//! # meridian-federation
//!
//! Server-to-server trust and delivery for Meridian.
//!
//! ```text
//!  inbound request ─► gate ─► key auditor ─► trust policy ─► local pipeline
//!                                                │
//!  outbound message ─► delivery engine ─► workers ─► client ─► peer
//!                           ▲
//!                     retry scanner
//! ```
//!
//! ## Key concepts
//!
//! - **Server keys** (`keys.rs`, `key_manager.rs`): each server holds an Ed25519
//!   pair, published at `/_meridian/key/v2/server`.
//! - **Signed requests** (`signatures.rs`): every S2S request carries a
//!   `MeridianFederation` authorization over canonical JSON.
//! - **Peer registry** (`registry.rs`) records instances on first contact and
//!   negotiates capabilities; the **trust state machine** (`trust.rs`) owns
//!   relationship status and administrator controls.
//! - **Key auditor** (`key_audit.rs`) pins fingerprints on first use and opens
//!   audit entries on change.
//! - **Delivery engine** (`delivery.rs`, `scheduler.rs`) tracks each outbound
//!   message per target as a receipt, with conditional status updates.

pub mod client;
pub mod delivery;
pub mod discovery;
pub mod error;
pub mod gate;
pub mod key_audit;
pub mod key_manager;
pub mod keys;
pub mod registry;
pub mod scheduler;
pub mod signatures;
pub mod trust;
pub mod types;

pub use client::FederationClient;
pub use discovery::DiscoveryCache;
pub use delivery::{AttemptOutcome, DeliveryEngine, DeliveryTransport, RetryPolicy, TargetPolicy};
pub use error::{DeliveryError, FederationError};
pub use gate::{Admission, InboundGate, KeyResolver, VerifiedOrigin};
pub use key_audit::{KeyAuditor, KeyCheck};
pub use key_manager::KeyManager;
pub use keys::ServerKeyPair;
pub use registry::{ContactOutcome, PeerContact, PeerRegistry, PeerView};
pub use scheduler::RetryScanner;
pub use trust::{ControlOutcome, TrustPolicy, TrustStateMachine};
pub use types::{FederatedMessage, FederationTransaction, HandshakeRequest, HandshakeResponse};
