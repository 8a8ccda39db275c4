//! Redb table definitions for range and registry storage.

use redb::TableDefinition;

// IP range tables
// Key: range start address, Value: bincode-encoded Vec of rows sharing that start
pub const COUNTRY_IP: TableDefinition<u32, &[u8]> = TableDefinition::new("country_ip");
pub const LOCATION_IP: TableDefinition<u32, &[u8]> = TableDefinition::new("location_ip");
pub const P2PGUARD_IP: TableDefinition<u32, &[u8]> = TableDefinition::new("p2pguard_ip");

// Registry
// Key: registry entry name, Value: integer value (file timestamps)
pub const REGISTRY: TableDefinition<&str, u64> = TableDefinition::new("registry");
