pub mod checkpoint_store;
pub mod config_service;
pub mod delivery_service;
pub mod eventstream_client;
pub mod health_service;
pub mod kobo_service;
pub mod log_store;
pub mod streaming_service;
pub mod webhook_service;
