//! The VMess session protocol.
//!
//! A client seals an AEAD-authenticated request header keyed off the user's
//! command key, then streams chunked, authenticated body payload in either
//! direction. The server side validates users through a rolling time-hash
//! index and an authid decoder ring with replay defense, and drains a
//! deterministic number of bytes before hanging up on bad authentication so
//! probes cannot tell failure modes apart.

mod authid;
mod chunk;
mod client;
mod commands;
mod crypto;
mod drain;
mod header;
mod kdf;
mod replay;
mod server;
mod user;
mod validator;

pub use authid::{AuthIdRing, seal_auth_id};
pub use client::VmessClient;
pub use drain::Drainer;
pub use header::{RequestCommand, RequestHeader, RequestOptions};
pub use kdf::{kdf, kdf16};
pub use replay::ReplayWindow;
pub use server::{SessionHistory, VmessServer};
pub use user::{Id, Security, User};
pub use validator::{UserValidator, ValidatorError};
