pub mod aead;
pub mod auth;
pub mod chunk;
pub mod client;
pub mod config;
pub mod crypto;
pub mod pool;
pub mod protocol;
pub mod redirector;
pub mod rewind;
pub mod server;
pub mod shake;
pub mod user;

#[cfg(test)]
pub mod test_utils;

pub use client::{Client, OutboundConn};
pub use config::Config;
pub use protocol::{Address, Metadata, Security};
pub use server::{InboundConn, Server};
