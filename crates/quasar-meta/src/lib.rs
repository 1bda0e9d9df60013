pub mod document;
pub mod etcd;
pub mod memory;
pub mod store;

pub use document::{DocumentStore, Index, Versioned};
pub use etcd::EtcdMetaStore;
pub use memory::MemoryMetaStore;
pub use store::{MetaStore, WatchEvent, WatchStream};
