//! Session multiplexing over a single link.
//!
//! Many logical streams share one outer connection. Each logical session is
//! a 16-bit id; frames carry session lifecycle (new/keep/end/keepalive) plus
//! optional payload chunks. The client side packs dispatches into bundles
//! keyed by target so repeated connections to one destination reuse the
//! outer transport.

mod client;
mod frame;
mod reader;
mod server;
mod session;
mod writer;

pub use client::MuxClient;
pub use frame::{FrameMetadata, MuxError, SessionId, SessionOptions, SessionStatus};
pub use server::MuxServer;
