//! # Event Tracing for Windows, from the provider side
//! This crate provides safe Rust abstractions to *emit* ETW events: register a provider, react to
//! controllers enabling or disabling it, and write events only when someone is listening.
//!
//! # What's ETW
//! Event Tracing for Windows (ETW) is an efficient kernel-level tracing facility that lets you log
//! kernel or application-defined events to a log file. You can consume the events in real time or
//! from a log file and use them to debug an application or to determine where performance issues
//! are occurring in the application.
//!
//! ETW is made out of three components:
//! * Controllers
//! * Providers
//! * Consumers
//!
//! This crate implements the provider part.<br/>
//! The tracing subsystem itself sits behind the
//! [`EventTransport`](native::transport::EventTransport) trait. The crate ships an in-process
//! [loopback transport](native::loopback) that plays the controller and consumer roles. It is
//! used by default and is handy in tests.
//!
//! # Getting started
//! The following example registers a provider, enables it from a loopback session, and writes an
//! event.
//!
//! ```
//! use std::sync::Arc;
//! use ferrisetw_provider::{EventArg, EventDescriptor, EventProvider, Level, LoopbackTransport};
//! use ferrisetw_provider::native::loopback::EnableParameters;
//!
//! let transport = Arc::new(LoopbackTransport::new());
//! let provider = EventProvider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F")
//!     .transport(transport.clone())
//!     .add_callback(|command, _args, session_change, _session_id| {
//!         println!("{:?} (session change: {})", command, session_change);
//!         Ok(())
//!     })
//!     .register()
//!     .unwrap();
//!
//! // Nobody listens yet, the write is skipped
//! let descriptor = EventDescriptor::new(1, Level::Informational, 0x1);
//! assert!(provider.write_event(&descriptor, &[EventArg::from(42u32), EventArg::from("hello")]));
//! assert_eq!(transport.write_count(), 0);
//!
//! // A controller enables the provider
//! let session = transport.start_session();
//! let params = EnableParameters::new(Level::Verbose as u8);
//! transport.enable_provider(session, &provider.provider_id(), params);
//! assert!(provider.is_enabled());
//!
//! assert!(provider.write_event(&descriptor, &[EventArg::from(42u32), EventArg::from("hello")]));
//! let events = transport.events();
//! assert_eq!(events[0].field_u32(0), Some(42));
//! assert_eq!(events[0].field_string(1).as_deref(), Some("hello"));
//! ```
//!
//! # Logging
//! This crate uses the [`log`](https://docs.rs/log) facade. Failures that cannot be reported to the
//! caller (e.g. a controller command handler returning an error) are logged, unless an error sink
//! is set with [`ProviderBuilder::on_handler_error`](provider::ProviderBuilder::on_handler_error).

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate num_derive;
extern crate num_traits;

pub mod encoder;
pub mod guid;
pub mod native;
pub mod provider;
mod utils;

pub use encoder::EventArg;
pub use guid::Guid;
pub use native::etw_types::{EventDescriptor, Level, Opcode};
pub use native::loopback::LoopbackTransport;
pub use provider::{EventProvider, WriteEventErrorCode};
