#![forbid(unsafe_code)]
//! Asynchronous 9P2000 protocol engine for Rust.
//!
//! This crate provides a tokio-based implementation of both endpoints of the
//! Plan 9 filesystem protocol: a server connection that dispatches requests
//! to a pluggable handler, and a client connection that multiplexes tagged
//! transactions over a single byte stream.
//!
//! # Overview
//!
//! 9P is a request/response protocol. Every request carries a 16-bit tag;
//! responses may arrive in any order and are correlated by tag, so many
//! transactions can be in flight on one connection. The engine takes care of
//! the binary codec, frame assembly, the version/attach handshake, and the
//! concurrency bookkeeping on both sides; what a file server actually serves
//! is supplied through the [`srv::Handler`] trait.
//!
//! # Serving
//!
//! 1. Implement [`srv::Handler`] for your filesystem type
//! 2. Start a listener with [`srv::srv`], or drive a single byte stream with
//!    [`srv::accept`]
//!
//! ```no_run
//! use async_trait::async_trait;
//! use styx::{srv::{ConnInfo, Handler, srv}, FCall, Result, error::string};
//!
//! #[derive(Clone)]
//! struct Hellofs;
//!
//! #[async_trait]
//! impl Handler for Hellofs {
//!     async fn rpc(&self, _info: &ConnInfo, req: FCall) -> Result<FCall> {
//!         match req {
//!             FCall::TClunk { .. } => Ok(FCall::RClunk),
//!             _ => Err(string::EPERM.into()),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv(Hellofs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Mounting
//!
//! [`client::Client`] runs the matching handshake and exposes both raw
//! transactions ([`client::Client::call`]) and the usual file operations
//! (`walk`, `open`, `read`, ...). Cancelling an in-flight transaction is the
//! protocol-level `Tflush` exchange, available as [`client::Call::cancel`].
//!
//! # Protocol details
//!
//! ## Message flow
//!
//! 1. **Version negotiation**: client sends `Tversion` at `NOTAG`, the
//!    server answers `Rversion` with `min(msize)` of the two sides
//! 2. **Attach**: the client binds a fid to the served tree's root
//! 3. **Operations**: tagged requests, served concurrently
//! 4. **Cleanup**: fids are released with `Tclunk`
//!
//! ## Errors
//!
//! 9P2000 reports errors as strings: a handler returning `Err` produces an
//! `Rerror` whose `ename` is the error's string form, and a client call that
//! receives an `Rerror` resolves to [`error::Error::Ename`].
//!
//! # Transport
//!
//! Any `AsyncRead + AsyncWrite` byte stream works; the listener fronts
//! accept dial strings in Plan 9 style:
//! - **TCP**: `"tcp!host!port"` (e.g. `"tcp!0.0.0.0!564"`)
//! - **Unix domain sockets**: `"unix!path"` (e.g. `"unix!/tmp/styx.sock"`)
pub mod client;
pub mod error;
pub mod fcall;
pub mod framing;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::DecodeError;
pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
