//! Common utilities used across the relay.

pub mod system;
