//! A modular key-value server speaking RESP.
//!
//! The engine itself knows nothing about data types. Every command and every
//! value type comes from a plugin registered at startup:
//!
//! - Hash tables (HSET, HGET, HDEL, HLEN, HGETALL)
//! - Strings (SET, GET, INCRBY)
//! - JSON documents (JSET, JGET, JQUERY)
//! - Server commands (PING, INFO, SAVE)
//! - Master-slave replication (SYNC, LOAD, SLAVEOF)
//!
//! Each client connection gets a [`session::Session`] that decouples socket
//! I/O from command execution through bounded queues, and a replica applies
//! its master's stream through a session that never replies.

pub mod command;
pub mod config;
pub mod connection;
pub mod dump;
pub mod engine;
pub mod input;
pub mod plugins;
pub mod replication;
pub mod resp;
pub mod server;
pub mod session;
