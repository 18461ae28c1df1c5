pub mod config;
pub mod db;
pub mod dump;
pub mod ipc;
pub mod lookup;
pub mod mapping;
pub mod migrate;
pub mod resolver;
pub mod snapshot;
pub mod store;
