//! Common test utilities and helper modules
//!
//! Shared sample messages for every kind plus a scripted TCP peer used by
//! the connection tests.

#![allow(dead_code)]

pub mod scripted_peer;
pub mod test_data;
