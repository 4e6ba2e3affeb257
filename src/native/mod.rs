//! Abstraction layer for the tracing subsystem
//!
//! This module holds the types shared with the transport (the component that actually receives
//! registrations and events), the transport traits, and the in-process loopback transport.
//! Modules from the crate level provide a safe API to interact with the crate.
pub mod etw_types;
pub mod loopback;
pub mod time;
pub mod transport;
