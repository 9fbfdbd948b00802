//! muxrpc-core - Transport-agnostic RPC endpoint runtime
//!
//! This crate implements the gRPC-style call semantics (unary,
//! server-streaming, client-streaming, bidirectional) on top of a pluggable
//! [`transport::Transport`], with ZERO dependency on any concrete wire
//! format (HTTP/2, WebSocket, in-process channel — whatever a transport
//! crate implements).
//!
//! # Architecture
//!
//! - [`transport`] — the pluggable boundary; ships [`transport::inmemory`]
//!   as a reference implementation.
//! - [`mux`] — routes inbound frames from one transport connection into
//!   per-stream inboxes and allocates stream IDs.
//! - [`call`] — the one state machine (§9) behind all four interaction
//!   patterns, and the caller/responder adaptors over it.
//! - [`contract`] / [`registry`] / [`dispatch`] — typed method metadata and
//!   the handler-dispatch table built from it.
//! - [`middleware`] — the four-hook interception chain, plus the
//!   standalone retry/circuit-breaker resilience policies.
//! - [`endpoint`] — the `Endpoint` aggregate an application actually holds.
//!
//! # Example
//!
//! ```no_run
//! use muxrpc_core::codec::{BoxedCodec, FnCodec};
//! use muxrpc_core::call::unary::UnaryHandler;
//! use muxrpc_core::endpoint::{Endpoint, EndpointConfig};
//! use muxrpc_core::transport::inmemory::InMemoryTransport;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn run() -> muxrpc_core::Result<()> {
//! fn string_codec() -> BoxedCodec<String> {
//!     Arc::new(FnCodec::new(
//!         |s: &String| Ok(Bytes::copy_from_slice(s.as_bytes())),
//!         |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|e| muxrpc_core::Error::Codec(e.to_string())),
//!     ))
//! }
//!
//! let (caller_transport, responder_transport) = InMemoryTransport::pair();
//! let caller = Endpoint::new(Arc::new(caller_transport), EndpointConfig::default());
//! let responder = Endpoint::new(Arc::new(responder_transport), EndpointConfig::default());
//!
//! responder.responder().register_unary(
//!     "Echo",
//!     "Say",
//!     UnaryHandler::new(string_codec(), string_codec(), |req: String| async move {
//!         Ok(format!("Echo: {req}"))
//!     }),
//! )?;
//!
//! let response = caller
//!     .caller()
//!     .unary::<String, String>("Echo", "Say", "hi".to_string(), string_codec(), string_codec())
//!     .await?;
//! assert_eq!(response, "Echo: hi");
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod caller;
pub mod cancel;
pub mod codec;
pub mod contract;
pub(crate) mod dispatch;
pub mod endpoint;
pub mod error;
pub mod metadata;
pub mod middleware;
pub mod mux;
pub mod registry;
pub mod responder;
pub mod status;
pub mod transport;
pub mod wire;

pub use caller::CallerEndpoint;
pub use codec::{BoxedCodec, Codec, FnCodec};
pub use contract::{MethodContract, Pattern, ServiceContract};
pub use endpoint::{Endpoint, EndpointConfig};
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use middleware::{Middleware, MiddlewareChain};
pub use mux::{Multiplexer, MultiplexerConfig};
pub use registry::ContractRegistry;
pub use responder::ResponderEndpoint;
pub use status::{Status, StatusCode};
pub use transport::Transport;
pub use wire::{Frame, StreamId, TransportMessage};
