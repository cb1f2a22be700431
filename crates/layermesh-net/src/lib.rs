//! `layermesh-net` — transport for the stage protocol.
//!
//! Plain TCP with `[u32 BE length][bincode]` frames. Every node runs one
//! [`serve`] loop in front of its [`RequestHandler`]; peers talk to it with a
//! [`StageClient`].

pub mod client;
pub mod codec;
pub mod error;
pub mod server;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use client::StageClient;
pub use codec::{decode, encode, read_frame, read_message, write_frame, write_message};
pub use error::{NetError, Result};
pub use server::{serve, RequestHandler};
