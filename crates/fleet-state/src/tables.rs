//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Tracked fleet members keyed by `{member_id}`.
pub const MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("members");

/// Scaling activities keyed by zero-padded `{seq}`.
pub const ACTIVITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("activities");
