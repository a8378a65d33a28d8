//! treekv — a network front end to an in-process hierarchical
//! key/value store.
//!
//! Clients open a TCP connection, send length-prefixed command frames
//! (`"<cmdName>\n<arg>\n<arg>"`, value-escaped), and receive
//! length-prefixed JSON replies. One server multiplexes many clients,
//! routes requests through a declarative command registry, manages a
//! set of named stores, and periodically checkpoints them to disk.
//!
//! The [`server::Server`] type is the entry point; [`Server::dispatch`]
//! offers the same command surface without a socket.
//!
//! [`Server::dispatch`]: server::Server::dispatch

pub mod client;
pub mod command;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod escape;
pub mod frame;
mod handlers;
pub mod server;
pub mod store_set;
pub mod tree;
pub mod value;

pub use config::Config;
pub use dispatch::OpLog;
pub use server::{Server, ServerError};
