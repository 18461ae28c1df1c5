pub mod core;
pub mod migration;
