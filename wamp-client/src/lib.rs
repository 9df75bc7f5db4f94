//! Asynchronous client for the Web Application Messaging Protocol (WAMP).
//!
//! A [`connection::Connection`] selects a transport, joins a realm, and keeps a
//! [`session::SessionHandle`] alive across transport loss, reconnecting with exponential backoff.

pub mod connection;
pub mod core;
pub mod message;
pub mod serializer;
pub mod session;
pub mod transport;
