//! Outbound message transports for the broadcast engine.

pub mod telegram;

pub use telegram::TelegramGateway;
