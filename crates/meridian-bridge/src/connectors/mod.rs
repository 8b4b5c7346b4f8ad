//! Built-in connectors. XMPP has none; its connections stay in `error`.

mod discord;
mod irc;
mod matrix;
mod slack;
mod telegram;

pub use discord::{DiscordConfig, DiscordConnector};
pub use irc::{parse_line, IrcConfig, IrcConnector, IrcLine};
pub use matrix::{MatrixConfig, MatrixConnector, MatrixEvent, MatrixTransaction};
pub use slack::{SlackConfig, SlackConnector};
pub use telegram::{TelegramConfig, TelegramConnector};

#[cfg(test)]
pub(crate) fn test_connection(
    bridge_type: meridian_common::models::BridgeType,
    config: serde_json::Value,
) -> meridian_common::models::BridgeConnection {
    use meridian_common::models::{BridgeConnection, BridgeStatus};
    let now = chrono::Utc::now();
    BridgeConnection {
        id: uuid::Uuid::new_v4(),
        guild_id: uuid::Uuid::new_v4(),
        bridge_type,
        remote_id: "remote".into(),
        display_name: "test bridge".into(),
        status: BridgeStatus::Connected,
        config,
        last_error: None,
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}
