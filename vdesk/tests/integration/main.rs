//! Integration tests for the vdesk library.
//!
//! These tests spawn real processes and bind real loopback sockets. They run
//! slower than the unit suite and can be invoked separately with
//! `cargo test --test integration`.

mod lifecycle;
mod tunnels;
