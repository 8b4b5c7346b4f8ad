//! Row identifiers.
//!
//! Every Meridian record is keyed by a UUID v7 so that listings ordered by id
//! come back in creation order.

use uuid::Uuid;

pub fn generate_id() -> Uuid {
    Uuid::now_v7()
}
