//! TCP front end for the `netfs` file store.

pub mod cli;
mod error;
pub mod protocol;
mod server;

pub use error::ServerError;
pub use server::{ConnectionGate, Permit, Server};
