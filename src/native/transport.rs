//! Transport boundary
//!
//! A transport is whatever actually receives provider registrations and events: the OS tracing
//! subsystem, or the [loopback](crate::native::loopback) transport shipped with this crate.
//! Every call is synchronous and returns a Win32-style status code (`0` on success).
use std::sync::Arc;

use widestring::U16CStr;

use super::etw_types::{EventDataDescriptor, EventDescriptor, FilterData, RegistrationHandle};
use crate::guid::Guid;

/// Receives control notifications for a registered provider
///
/// # Preconditions
///
/// A transport must never run two `on_control` calls for the same registration at the same time.
/// Transports running on hosts without that guarantee must serialize the calls themselves
/// (the loopback transport runs one controller operation at a time).
pub trait ControlCallback: Send + Sync {
    fn on_control(
        &self,
        source_id: &Guid,
        control_code: u32,
        level: u8,
        match_any_keyword: u64,
        match_all_keyword: u64,
        filter_data: Option<FilterData<'_>>,
    );
}

/// The operations a provider consumes from the tracing subsystem
pub trait EventTransport: Send + Sync {
    /// Registers `callback` for `provider_id`.
    ///
    /// The transport may invoke the callback before this function returns, when sessions already
    /// have the provider enabled.
    fn register(
        &self,
        provider_id: &Guid,
        callback: Arc<dyn ControlCallback>,
    ) -> Result<RegistrationHandle, u32>;

    fn unregister(&self, handle: RegistrationHandle) -> u32;

    fn write(
        &self,
        handle: RegistrationHandle,
        descriptor: &EventDescriptor,
        data: &[EventDataDescriptor<'_>],
    ) -> u32;

    fn write_transfer(
        &self,
        handle: RegistrationHandle,
        descriptor: &EventDescriptor,
        activity_id: Option<&Guid>,
        related_activity_id: Option<&Guid>,
        data: &[EventDataDescriptor<'_>],
    ) -> u32;

    fn write_string(
        &self,
        handle: RegistrationHandle,
        level: u8,
        keywords: u64,
        message: &U16CStr,
    ) -> u32;

    /// Every session on the host currently listening to `provider_id`, as
    /// `(session_id, match_all_keyword)` pairs
    fn enumerate_sessions(&self, provider_id: &Guid) -> Result<Vec<(u32, u64)>, u32>;

    /// Controller data persisted for `provider_id` and `session_id`, for controllers that
    /// configured the provider before it was registered
    fn controller_data(&self, provider_id: &Guid, session_id: u32) -> Option<Vec<u8>>;
}
