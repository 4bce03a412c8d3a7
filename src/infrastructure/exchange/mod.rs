pub mod client;
pub mod mock;
pub mod protocol;

pub use client::{WsClientConfig, WsExchangeClient};
pub use mock::MockExchange;
