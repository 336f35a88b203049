//! Unit tests for the vdesk library.
//!
//! These tests use mocked backends and run fast without touching real
//! hypervisors, clusters, or cloud accounts.

mod desktop_lifecycle;
mod helpers;
mod key_service;
mod mocks;
mod property_tests;
mod provider_config;
