pub mod config_dto;
pub mod log_dto;
pub mod streaming_dto;
