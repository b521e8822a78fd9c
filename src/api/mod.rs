pub mod auth;
pub mod source;
pub mod ytm;
