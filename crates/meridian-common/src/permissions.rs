//! Operator permissions.
//!
//! Permissions are a bitfield. Role masks are merged in role-position order:
//! each role first clears its `deny` bits, then sets its `allow` bits, so a
//! higher-positioned role has the last word. Computation is a pure function of
//! its inputs and never touches storage.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permissions: i64 {
        /// View channels and read messages
        const VIEW_CHANNEL          = 1 << 0;
        /// Manage guild settings, channels, roles
        const MANAGE_GUILD          = 1 << 1;
        /// Manage specific channels (edit, delete)
        const MANAGE_CHANNELS       = 1 << 2;
        /// Send messages in text channels
        const SEND_MESSAGES         = 1 << 12;
        /// Manage bridge connections and channel mappings for a guild
        const MANAGE_BRIDGES        = 1 << 41;
        /// Approve, block and mute peers; inspect receipts; acknowledge key changes
        const MANAGE_FEDERATION     = 1 << 42;
        /// View federation state without changing it
        const VIEW_FEDERATION       = 1 << 43;

        /// Server owner / administrator (all permissions)
        const ADMINISTRATOR         = 1 << 40;
    }
}

impl Permissions {
    /// Check if administrator (overrides all other checks).
    pub fn is_admin(&self) -> bool {
        self.contains(Self::ADMINISTRATOR)
    }

    /// Check if a holder of these permissions can perform an action.
    pub fn has(&self, required: Permissions) -> bool {
        self.is_admin() || self.contains(required)
    }
}

/// Allow/deny masks contributed by one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMask {
    /// Role position; higher positions are applied later.
    pub position: i32,
    pub allow: i64,
    pub deny: i64,
}

/// Compute effective permissions.
///
/// 1. Owners and administrators get everything.
/// 2. Start from `default_mask`.
/// 3. Apply each role in ascending position: clear `deny`, then set `allow`.
/// 4. If the result carries `ADMINISTRATOR`, return everything.
///
/// `ordered_roles` need not be pre-sorted; ties keep their input order.
pub fn compute_permissions(
    is_owner: bool,
    is_admin: bool,
    default_mask: Permissions,
    ordered_roles: &[RoleMask],
) -> Permissions {
    if is_owner || is_admin {
        return Permissions::all();
    }

    let mut roles = ordered_roles.to_vec();
    roles.sort_by_key(|r| r.position);

    let perms = roles.iter().fold(default_mask, |acc, role| {
        (acc & !Permissions::from_bits_truncate(role.deny))
            | Permissions::from_bits_truncate(role.allow)
    });

    if perms.is_admin() { Permissions::all() } else { perms }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(position: i32, allow: Permissions, deny: Permissions) -> RoleMask {
        RoleMask { position, allow: allow.bits(), deny: deny.bits() }
    }

    #[test]
    fn owner_and_admin_flags_short_circuit() {
        assert_eq!(compute_permissions(true, false, Permissions::empty(), &[]), Permissions::all());
        assert_eq!(compute_permissions(false, true, Permissions::empty(), &[]), Permissions::all());
    }

    #[test]
    fn higher_role_overrides_lower_deny() {
        let low = role(1, Permissions::empty(), Permissions::MANAGE_FEDERATION);
        let high = role(5, Permissions::MANAGE_FEDERATION, Permissions::empty());
        // Input order must not matter, only position.
        let perms = compute_permissions(false, false, Permissions::VIEW_CHANNEL, &[high, low]);
        assert!(perms.contains(Permissions::MANAGE_FEDERATION));
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn higher_role_deny_wins() {
        let low = role(1, Permissions::MANAGE_BRIDGES, Permissions::empty());
        let high = role(2, Permissions::empty(), Permissions::MANAGE_BRIDGES);
        let perms = compute_permissions(false, false, Permissions::empty(), &[low, high]);
        assert!(!perms.has(Permissions::MANAGE_BRIDGES));
    }

    #[test]
    fn administrator_bit_from_role_grants_all() {
        let r = role(1, Permissions::ADMINISTRATOR, Permissions::empty());
        assert_eq!(compute_permissions(false, false, Permissions::empty(), &[r]), Permissions::all());
    }
}
