//! Table and log-group naming, plus the redb table definitions behind them.
//!
//! Tables are split per namespace and kind rather than partitioned by key:
//! listing everything of one kind in one namespace is a single scan, and
//! environments are fully isolated. Writes are rare, so no key salting.

use redb::TableDefinition;

use div_core::Kind;

/// Prefix of every table and log group.
pub const TABLE_PREFIX: &str = "div-";

/// Primary key attribute of every resource item.
pub const HASH_KEY: &str = "name_hash_key";

/// `<prefix><database>-<namespace>-<kind>`, or `<prefix><database>-<kind>`
/// for the kind-definition table.
pub fn table_name(database: &str, namespace: &str, resource: &str) -> String {
    if resource == Kind::CustomResourceDefinition.resource_name() {
        global_table_name(database, resource)
    } else {
        format!("{TABLE_PREFIX}{database}-{namespace}-{resource}")
    }
}

pub fn global_table_name(database: &str, resource: &str) -> String {
    format!("{TABLE_PREFIX}{database}-{resource}")
}

/// One log group per (database, namespace, kind).
pub fn log_group_name(database: &str, namespace: &str, resource: &str) -> String {
    format!("{TABLE_PREFIX}{database}-{namespace}-{resource}")
}

// ── redb layout ────────────────────────────────────────────────────

/// Name of the change-record table behind `table`.
pub fn stream_table_name(table: &str) -> String {
    format!("{table}#stream")
}

/// Name of the event table behind a log group.
pub fn log_events_table_name(group: &str) -> String {
    format!("log#{group}")
}

/// Name of the stream registry behind a log group.
pub fn log_streams_table_name(group: &str) -> String {
    format!("log#{group}#streams")
}

/// Items keyed by `name_hash_key`, JSON values.
pub fn items(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Change records keyed by sequence number, JSON values.
pub fn stream(name: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(name)
}

/// Log events keyed by `{stream}/{seq:020}`, JSON values.
pub fn log_events(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Log stream name to its next sequence number.
pub fn log_streams(name: &str) -> TableDefinition<'_, &'static str, u64> {
    TableDefinition::new(name)
}
