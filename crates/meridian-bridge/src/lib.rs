//! # meridian-bridge
//!
//! Bridges between Meridian channels and external chat protocols.
//!
//! Each [`BridgeConnection`](meridian_common::models::BridgeConnection)
//! belongs to a guild and speaks one protocol through a [`BridgeConnector`].
//! The [`BridgeManager`] owns the connection lifecycle, channel mappings,
//! virtual users and the relay rules. Outbound relays are delivery receipts
//! like any federated message; [`TargetRouter`] lets one
//! [`DeliveryEngine`](meridian_federation::DeliveryEngine) serve both.

pub mod connector;
pub mod connectors;
pub mod dispatch;
pub mod error;
pub mod manager;

pub use connector::{BridgeConnector, ConnectorRegistry, InboundSink, OutboundMessage, RemoteEvent, SessionEvent};
pub use dispatch::{BridgeDelivery, BridgePayload, BridgeTarget, TargetRouter};
pub use error::BridgeError;
pub use manager::{BridgeManager, OutboundReport, RelayAuthor, RelayReport};
