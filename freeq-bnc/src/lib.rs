//! IRC bouncer: one upstream server connection shared by many clients.
//!
//! Every line the server sends is broadcast to all connected clients, and
//! every line a client sends is forwarded upstream, except for:
//! - `PING` from either side, answered locally with `PONG`
//! - `NICK`, honored only for the first client to send one
//! - `QUIT`, which ends that client's session without reaching the server
//!
//! Data flow:
//!
//! ```text
//! client sockets ─▶ LineFramer ─▶ ClientCommandInterceptor ─┐
//!                                                          ├─▶ upstream writer
//!                           UpstreamKeepaliveFilter (PONG) ─┘
//! upstream socket ─▶ LineFramer ─▶ UpstreamKeepaliveFilter ─▶ ClientSet::broadcast
//! ```

pub mod clients;
pub mod config;
pub mod error;
pub mod framer;
pub mod intercept;
pub mod keepalive;
pub mod line;
pub mod relay;
