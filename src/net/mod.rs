//! Requests, responses and the network the worker talks to.

mod client;
#[cfg(test)]
pub mod testing;
mod types;

pub use client::{HttpNetwork, Network, OfflineNetwork};
pub use types::{cache_key, Destination, Request, Response, ResponseSource};
