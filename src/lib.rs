#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # razor-mesh
//!
//! This crate provides the transport and coordination core for `razor-rpc`:
//! publishing endpoints to a registry, discovering endpoints published by others,
//! and exchanging request / response frames over pooled connections.
//!
//! ## Components
//!
//! - [registry](crate::registry): [RegistryClient](crate::registry::RegistryClient) keeps our
//!   published entries alive and maintains a local discovery cache, refreshed by a long-poll
//!   `monitor` on the [RegistryBackend](crate::registry::RegistryBackend).
//! - [client](crate::client): [RpcClient](crate::client::RpcClient) with a per-address connection
//!   pool and a correlation table, supporting four [CallType](crate::proto::CallType)s.
//! - [server](crate::server): [RpcServer](crate::server::RpcServer) decoding requests and running
//!   them on a bounded [WorkerPool](crate::server::dispatch::WorkerPool).
//! - [transport](crate::transport): a framed TCP transport, and an HTTP/1.1 transport for
//!   interoperability.
//! - [codec](crate::codec): the pluggable serializer, `msgpack` by default.
//!
//! ## The Design
//!
//! Each TCP connection is full-duplex and multiplexed. Every request carries a `seq` ID, and
//! responses are matched by `seq` only, so they may arrive in any order.
//! The timeout of pending requests is checked in batches every second, besides the
//! caller-side timeout of a blocking call.
//!
//! Writes to one connection go through a single writer coroutine fed by a
//! [crossfire](https://docs.rs/crossfire) channel. When the writer is idle for a heartbeat interval,
//! it sends a ping (seq 0). The server answers pings, and closes a connection which stays
//! silent for three heartbeat intervals.
//!
//! On the server side, the reader of a connection never runs business logic. Decoded requests
//! are handed to the worker pool, and the worker writes the response (or an error response when
//! the [ServiceInvoker](crate::server::ServiceInvoker) fails) back through the connection writer.
//!
//! ## Protocol
//!
//! The details are described in [crate::proto].
//!

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod proto;
pub mod registry;
pub mod server;
pub mod transport;

pub use codec::Codec;
pub use config::*;
pub use error::*;
