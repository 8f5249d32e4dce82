//! MSRP media transport: wire codec, session engine and TCP connection.

pub mod codec;
pub mod connection;
pub mod session;
