//! HTTP implementation of the rewards store traits.
//!
//! Talks to a PostgREST-style backend: balance and ledger tables over REST,
//! the atomic adjustment and watch-session operations as RPCs, and row
//! changes as server-sent events.

mod client;
mod error;
mod feed;
mod types;

pub use client::RewardsApiClient;
pub use error::{ApiRetryClass, RemoteError, Result};
pub use types::*;
