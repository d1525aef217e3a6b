pub mod clock;
pub mod signature;
pub mod time;
pub mod validation;
