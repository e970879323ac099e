//! The HTTP/1.1 transport.
//!
//! Each request is a `POST` whose body is the codec payload of [RpcRequest](crate::proto::RpcRequest)
//! (without the frame header), and the response body is the codec payload of
//! [RpcResponse](crate::proto::RpcResponse). Pings are POSTs as well.
//!
//! `GET /services` on the server lists the services of the invoker in html, for diagnostics.

mod client;
pub use client::HttpClient;

mod server;
pub use server::HttpServer;

/// The diagnostic path listing services
pub const SERVICES_PATH: &str = "/services";

pub const CONTENT_TYPE_PAYLOAD: &str = "application/octet-stream";
