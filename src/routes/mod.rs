pub mod configuration;
pub mod eventstream;
pub mod health;
pub mod kobo;
pub mod logs;
pub mod webhook;
