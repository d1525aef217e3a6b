pub mod delivery_record;
pub mod settings;
pub mod stats;
pub mod streaming_session;
