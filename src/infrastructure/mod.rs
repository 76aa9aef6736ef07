//! Infrastructure: configuration, logging, signing, gateway, HTTP surface.

pub mod config;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod signing;

pub use config::ConfigLoader;
pub use gateway::{validate_gateway_url, GatewayClient};
pub use signing::{KeyDerivation, MessageSigner, MessageVerifier, ReplayCache};
