//! The framed TCP transport.
//!
//! Both directions carry length-delimited frames described in [crate::proto]. Requests and
//! responses on one connection are multiplexed by `seq`.

mod client;
pub use client::TcpClient;

mod server;
pub use server::TcpServer;
