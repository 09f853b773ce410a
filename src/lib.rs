//! Core runtime of a multi-worker HTTP/1.1 web server: event loop,
//! connection lifecycle, virtual-request state machine, chunk-queue
//! streaming, stat cache, throttling, and the angel/module framework.
//!
//! The crate is organized the way the teacher's own `hyper` workspace is:
//! a small set of always-on primitives at the root (`chunk`, `stream`,
//! `event_loop`, `error`, `trace`), with everything that needs an external
//! crate — TLS, structured logging, the TCP-facing runtime glue — gated
//! behind a cargo feature so a caller who only wants the stream graph and
//! chunk queue for embedding elsewhere doesn't pull in `rustls` or
//! `tracing-subscriber` for free. See `SPEC_FULL.md` for the full module map
//! and `DESIGN.md` for what each module is grounded on.

#![deny(unsafe_code)]

#[macro_use]
mod trace;

pub mod error;

pub mod chunk;
pub mod event_loop;
pub mod stream;
pub mod wait_queue;

pub mod io_stream;
pub mod mempool;
pub mod radix;

pub mod fetch_cache;
pub mod stat_cache;
pub mod throttle;

pub mod proxy_protocol;

pub mod config;
pub mod plugin;
pub mod vrequest;

pub mod balancer;
pub mod connection;
pub mod worker;

// `sni` only reaches for `idna` when the `tls` feature pulls it in (see its
// own `normalize_hostname` cfg-split); the parser itself is useful wherever
// PROXY-protocol-style stream filters are, so it stays unconditional.
pub mod sni;
#[cfg(feature = "tls")]
pub mod tls_filter;

#[cfg(feature = "layers")]
pub mod log_target;

#[cfg(feature = "runtime")]
pub mod angel;

pub use error::{Error, Result};
