//! Shard storage
//!
//! - Pluggable ordered key-value stores (RocksDB by default)
//! - Series/timestamp key encoding
//! - One engine per shard directory, opened lazily
//! - Offline repair of the whole data root

pub mod codec;
pub mod kv;
pub mod repair;
pub mod shard;
pub mod shards;

pub use codec::{FieldValue, Fields, SeriesPoint, VersionedPoint};
pub use kv::{backend_from_config, KvBackend, KvStore, MemBackend, RocksBackend};
pub use repair::{repair_data_dir, RepairReport};
pub use shard::{SeriesScan, ShardEngine, VersionedScan};
pub use shards::LocalShards;
