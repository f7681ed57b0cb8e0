pub mod api;
pub mod blob;
pub mod config;
pub mod database;
pub mod identifier;
pub mod media_type;
pub mod probe;
pub mod storage;
pub mod upload;
