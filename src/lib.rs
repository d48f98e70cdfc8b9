pub mod config;
pub mod error;
pub mod gateway;
pub mod remote_auth;
pub mod transport;
pub mod voice;
