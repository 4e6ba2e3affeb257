//! ETW Providers abstraction.
//!
//! An [`EventProvider`] is the emitting side of ETW: it registers a GUID with a transport, gets
//! notified when controllers enable or disable it, and writes events when (and only when) someone
//! is listening.
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use widestring::U16CString;

use crate::encoder::{EncodeError, EncodedPayload, EventArg};
use crate::guid::Guid;
use crate::native::etw_types::{
    status_message, EventDataDescriptor, EventDescriptor, Level, RegistrationHandle,
    ERROR_ARITHMETIC_OVERFLOW, ERROR_MORE_DATA, ERROR_NOT_ENOUGH_MEMORY, ERROR_SUCCESS,
};
use crate::native::loopback;
use crate::native::transport::EventTransport;

mod control;
mod controller_data;
pub mod session;

use control::{ErrorSink, ProviderControl};
pub use controller_data::ControllerArguments;
pub use session::{SessionChange, SessionInfo, SessionMask, SessionTracker};

/// Provider module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The transport refused the registration
    Registration {
        provider_id: Guid,
        status: u32,
        message: String,
    },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration {
                provider_id,
                status,
                message,
            } => write!(
                f,
                "unable to register provider {} (status {}): {}",
                provider_id, status, message
            ),
        }
    }
}

impl std::error::Error for ProviderError {}

type ProviderResult<T> = Result<T, ProviderError>;

/// Outcome of the last failed write on the current thread
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Default)]
pub enum WriteEventErrorCode {
    #[default]
    NoError = 0,
    NoFreeBuffers = 1,
    EventTooBig = 2,
    NullInput = 3,
    TooManyArgs = 4,
    Other = 5,
}

impl WriteEventErrorCode {
    /// Translates a non-zero transport status
    pub fn from_status(status: u32) -> Self {
        match status {
            ERROR_SUCCESS => WriteEventErrorCode::NoError,
            ERROR_ARITHMETIC_OVERFLOW | ERROR_MORE_DATA => WriteEventErrorCode::EventTooBig,
            ERROR_NOT_ENOUGH_MEMORY => WriteEventErrorCode::NoFreeBuffers,
            _ => WriteEventErrorCode::Other,
        }
    }
}

impl From<&EncodeError> for WriteEventErrorCode {
    fn from(err: &EncodeError) -> Self {
        match err {
            EncodeError::TooManyArguments(_) => WriteEventErrorCode::TooManyArgs,
            EncodeError::NullArgument(_) => WriteEventErrorCode::NullInput,
            EncodeError::EventTooBig(_) => WriteEventErrorCode::EventTooBig,
        }
    }
}

thread_local! {
    static LAST_WRITE_ERROR: Cell<WriteEventErrorCode> = Cell::new(WriteEventErrorCode::NoError);
}

fn set_last_write_error(code: WriteEventErrorCode) {
    LAST_WRITE_ERROR.with(|last| last.set(code));
}

/// A command a controller sends to a provider
///
/// Negative values are shared commands, strictly positive ones are provider-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerCommand {
    Update,
    SendManifest,
    Enable,
    Disable,
    /// Provider-specific command
    Custom(i32),
}

impl ControllerCommand {
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => ControllerCommand::Update,
            -1 => ControllerCommand::SendManifest,
            -2 => ControllerCommand::Enable,
            -3 => ControllerCommand::Disable,
            other if other > 0 => ControllerCommand::Custom(other),
            other => {
                log::debug!("unknown shared controller command {}, treated as an update", other);
                ControllerCommand::Update
            }
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            ControllerCommand::Update => 0,
            ControllerCommand::SendManifest => -1,
            ControllerCommand::Enable => -2,
            ControllerCommand::Disable => -3,
            ControllerCommand::Custom(value) => *value,
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type HandlerResult = Result<(), HandlerError>;

/// Why a controller command handler did not complete
#[derive(Debug)]
pub enum HandlerFailure {
    Error(HandlerError),
    Panic(String),
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "error: {}", err),
            Self::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// Hook called for every controller command a provider receives
///
/// `session_change` is the slot of the session that was added (positive) or removed (negative),
/// or `0` for commands that are not tied to a session. Errors and panics are caught and never
/// reach the transport.
pub trait ControllerCommandHandler: Send + Sync {
    fn on_controller_command(
        &self,
        command: ControllerCommand,
        arguments: Option<&ControllerArguments>,
        session_change: i32,
        etw_session_id: u32,
    ) -> HandlerResult;
}

struct CallbackHandler<F>(F);

impl<F> ControllerCommandHandler for CallbackHandler<F>
where
    F: Fn(ControllerCommand, Option<&ControllerArguments>, i32, u32) -> HandlerResult
        + Send
        + Sync,
{
    fn on_controller_command(
        &self,
        command: ControllerCommand,
        arguments: Option<&ControllerArguments>,
        session_change: i32,
        etw_session_id: u32,
    ) -> HandlerResult {
        (self.0)(command, arguments, session_change, etw_session_id)
    }
}

/// A registered ETW provider
///
/// # Example
/// ```
/// use ferrisetw_provider::provider::EventProvider;
/// use ferrisetw_provider::native::etw_types::{EventDescriptor, Level};
/// use ferrisetw_provider::encoder::EventArg;
///
/// let provider = EventProvider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F")
///     .register()
///     .unwrap();
///
/// // Nobody is listening yet: this is a no-op
/// let descriptor = EventDescriptor::new(1, Level::Informational, 0x1);
/// assert!(provider.write_event(&descriptor, &[EventArg::from("hello")]));
/// ```
pub struct EventProvider {
    control: Arc<ProviderControl>,
    registration_handle: AtomicU64,
}

/// A Builder for an [`EventProvider`]
///
/// See [`EventProvider::by_guid`].
pub struct ProviderBuilder {
    guid: Guid,
    transport: Option<Arc<dyn EventTransport>>,
    handlers: Vec<Arc<dyn ControllerCommandHandler>>,
    error_sink: Option<ErrorSink>,
}

impl fmt::Debug for ProviderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderBuilder")
            .field("guid", &self.guid)
            .field("custom_transport", &self.transport.is_some())
            .field("n_handlers", &self.handlers.len())
            .finish()
    }
}

impl EventProvider {
    /// Create a provider builder for the given GUID
    ///
    /// `Guid` and `&str` are acceptable as argument.
    pub fn by_guid<G: Into<Guid>>(guid: G) -> ProviderBuilder {
        ProviderBuilder {
            guid: guid.into(),
            transport: None,
            handlers: Vec::new(),
            error_sink: None,
        }
    }

    pub fn provider_id(&self) -> Guid {
        self.control.provider_id()
    }

    /// The transport handle, `0` once the provider is disposed
    pub fn registration_handle(&self) -> RegistrationHandle {
        self.registration_handle.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.registration_handle() != 0
    }

    /// Whether any session currently has this provider enabled
    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    /// Whether an event with this level and these keywords would be written
    ///
    /// The level passes when it is lower or equal to the enabled level, or when the enabled level
    /// is `0`. The keywords pass when they are `0`, or when they match at least one bit of the
    /// `any` mask and every bit of the `all` mask.
    pub fn is_enabled_for(&self, level: u8, keywords: u64) -> bool {
        self.control.is_enabled_for(level, keywords)
    }

    pub fn level(&self) -> u8 {
        self.control.level()
    }

    pub fn match_any_keyword(&self) -> u64 {
        self.control.match_any_keyword()
    }

    pub fn match_all_keyword(&self) -> u64 {
        self.control.match_all_keyword()
    }

    /// Overrides the enabled level until the next enable notification
    pub fn set_level(&self, level: u8) {
        self.control.set_level(level)
    }

    /// Overrides the `any` keyword mask until the next enable notification
    pub fn set_match_any_keyword(&self, keywords: u64) {
        self.control.set_match_any_keyword(keywords)
    }

    /// Overrides the `all` keyword mask until the next enable notification
    pub fn set_match_all_keyword(&self, keywords: u64) {
        self.control.set_match_all_keyword(keywords)
    }

    /// Sessions that were listening at the last enable notification
    pub fn live_sessions(&self) -> Arc<Vec<SessionInfo>> {
        self.control.live_sessions()
    }

    /// The error code of the last failed write on the current thread
    pub fn last_write_error() -> WriteEventErrorCode {
        LAST_WRITE_ERROR.with(|last| last.get())
    }

    /// Disables and unregisters the provider.
    ///
    /// Only the first call has an effect, even when racing with other threads (or with `Drop`).
    pub fn dispose(&self) {
        if !self.control.begin_dispose() {
            return;
        }

        let handle = self.registration_handle.swap(0, Ordering::AcqRel);
        if handle != 0 {
            let status = self.control.transport().unregister(handle);
            if status != ERROR_SUCCESS {
                log::warn!(
                    "unable to unregister provider {}: {}",
                    self.control.provider_id(),
                    status_message(status)
                );
            }
        }
    }

    /// Same as [`Self::dispose`]
    pub fn close(&self) {
        self.dispose()
    }

    /// Writes an event, if the provider is enabled for its level and keywords.
    ///
    /// Returns `true` when the event was written or filtered out, `false` when it could not be
    /// written. In that case, [`Self::last_write_error`] tells why.
    pub fn write_event(&self, descriptor: &EventDescriptor, args: &[EventArg<'_>]) -> bool {
        self.write_event_with_transfer(descriptor, None, args)
    }

    /// Writes an event that transfers to the `child_activity_id` activity.
    ///
    /// # Panics
    ///
    /// Activity transfers are only supported for events with the `Send` or `Receive` opcode.
    pub fn write_event_transfer(
        &self,
        descriptor: &EventDescriptor,
        child_activity_id: &Guid,
        args: &[EventArg<'_>],
    ) -> bool {
        self.write_event_with_transfer(descriptor, Some(child_activity_id), args)
    }

    fn write_event_with_transfer(
        &self,
        descriptor: &EventDescriptor,
        child_activity_id: Option<&Guid>,
        args: &[EventArg<'_>],
    ) -> bool {
        if child_activity_id.is_some() {
            assert_transfer_opcode(descriptor);
        }
        if !self.is_enabled_for(descriptor.level, descriptor.keyword) {
            return true;
        }

        let payload = match EncodedPayload::encode(args) {
            Ok(payload) => payload,
            Err(err) => {
                set_last_write_error(WriteEventErrorCode::from(&err));
                return false;
            }
        };

        self.submit(descriptor, child_activity_id, &payload.descriptors())
    }

    /// Writes pre-encoded event data, bypassing the encoder.
    ///
    /// Gating and error reporting are the same as [`Self::write_event`].
    ///
    /// # Panics
    ///
    /// Activity transfers are only supported for events with the `Send` or `Receive` opcode.
    pub fn write_event_raw(
        &self,
        descriptor: &EventDescriptor,
        child_activity_id: Option<&Guid>,
        data: &[EventDataDescriptor<'_>],
    ) -> bool {
        if child_activity_id.is_some() {
            assert_transfer_opcode(descriptor);
        }
        if !self.is_enabled_for(descriptor.level, descriptor.keyword) {
            return true;
        }

        self.submit(descriptor, child_activity_id, data)
    }

    /// Writes a single string as an event
    pub fn write_event_string(&self, level: Level, keywords: u64, message: &str) -> bool {
        if !self.is_enabled_for(level as u8, keywords) {
            return true;
        }

        let message = U16CString::from_str_truncate(message);
        let status = self.control.transport().write_string(
            self.registration_handle(),
            level as u8,
            keywords,
            &message,
        );
        check_status(status)
    }

    fn submit(
        &self,
        descriptor: &EventDescriptor,
        child_activity_id: Option<&Guid>,
        data: &[EventDataDescriptor<'_>],
    ) -> bool {
        let transport = self.control.transport();
        let handle = self.registration_handle();
        let status = match child_activity_id {
            None => transport.write(handle, descriptor, data),
            Some(child) => transport.write_transfer(handle, descriptor, None, Some(child), data),
        };
        check_status(status)
    }
}

fn assert_transfer_opcode(descriptor: &EventDescriptor) {
    assert!(
        descriptor
            .typed_opcode()
            .map_or(false, |opcode| opcode.allows_transfer()),
        "activity transfers require the Send or Receive opcode, got {}",
        descriptor.opcode
    );
}

fn check_status(status: u32) -> bool {
    if status != ERROR_SUCCESS {
        set_last_write_error(WriteEventErrorCode::from_status(status));
        return false;
    }
    true
}

impl Drop for EventProvider {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for EventProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProvider")
            .field("provider_id", &self.provider_id())
            .field("registration_handle", &self.registration_handle())
            .field("enabled", &self.is_enabled())
            .field("level", &self.level())
            .field("any", &self.match_any_keyword())
            .field("all", &self.match_all_keyword())
            .field("live_sessions", &self.live_sessions().len())
            .finish()
    }
}

impl ProviderBuilder {
    /// Use a specific transport instead of the process-wide
    /// [loopback](crate::native::loopback::global) one
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a handler that will be called for every controller command
    ///
    /// Adding several handlers calls all of them, in order.
    pub fn add_handler<H>(mut self, handler: H) -> Self
    where
        H: ControllerCommandHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Add a closure that will be called for every controller command
    ///
    /// # Example
    /// ```
    /// # use ferrisetw_provider::provider::{ControllerArguments, ControllerCommand, EventProvider};
    /// let provider = EventProvider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F")
    ///     .add_callback(
    ///         |command: ControllerCommand,
    ///          args: Option<&ControllerArguments>,
    ///          session: i32,
    ///          _: u32| {
    ///             println!("{:?} for session slot {} with {:?}", command, session, args);
    ///             Ok(())
    ///         },
    ///     )
    ///     .register()
    ///     .unwrap();
    /// ```
    pub fn add_callback<F>(self, callback: F) -> Self
    where
        F: Fn(ControllerCommand, Option<&ControllerArguments>, i32, u32) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.add_handler(CallbackHandler(callback))
    }

    /// Where handler failures are reported. They are logged as warnings by default.
    pub fn on_handler_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&HandlerFailure) + Send + Sync + 'static,
    {
        self.error_sink = Some(Box::new(sink));
        self
    }

    /// Register the provider with its transport
    ///
    /// Sessions that already enable this provider are notified to the handlers before this
    /// function returns.
    pub fn register(self) -> ProviderResult<EventProvider> {
        let transport: Arc<dyn EventTransport> = match self.transport {
            Some(transport) => transport,
            None => loopback::global(),
        };
        let guid = self.guid;
        let control = Arc::new(ProviderControl::new(
            guid,
            transport.clone(),
            self.handlers,
            self.error_sink,
        ));

        let handle = transport
            .register(&guid, control.clone())
            .map_err(|status| ProviderError::Registration {
                provider_id: guid,
                status,
                message: status_message(status).to_string(),
            })?;

        log::debug!("registered provider {} with handle {:#x}", guid, handle);
        Ok(EventProvider {
            control,
            registration_handle: AtomicU64::new(handle),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::Opcode;
    use crate::native::loopback::{EnableParameters, LoopbackTransport};

    const GUID: &str = "8f7a2b3c-1d4e-4f50-9a6b-7c8d9e0f1a2b";

    fn loopback_provider() -> (Arc<LoopbackTransport>, EventProvider) {
        let transport = Arc::new(LoopbackTransport::new());
        let provider = EventProvider::by_guid(GUID)
            .transport(transport.clone())
            .register()
            .unwrap();
        (transport, provider)
    }

    #[test]
    fn test_controller_command_raw_values() {
        for command in [
            ControllerCommand::Update,
            ControllerCommand::SendManifest,
            ControllerCommand::Enable,
            ControllerCommand::Disable,
            ControllerCommand::Custom(7),
        ] {
            assert_eq!(ControllerCommand::from_raw(command.as_raw()), command);
        }
        assert_eq!(ControllerCommand::from_raw(-42), ControllerCommand::Update);
    }

    #[test]
    fn test_status_translation() {
        assert_eq!(
            WriteEventErrorCode::from_status(ERROR_ARITHMETIC_OVERFLOW),
            WriteEventErrorCode::EventTooBig
        );
        assert_eq!(
            WriteEventErrorCode::from_status(ERROR_MORE_DATA),
            WriteEventErrorCode::EventTooBig
        );
        assert_eq!(
            WriteEventErrorCode::from_status(ERROR_NOT_ENOUGH_MEMORY),
            WriteEventErrorCode::NoFreeBuffers
        );
        assert_eq!(WriteEventErrorCode::from_status(31), WriteEventErrorCode::Other);
    }

    #[test]
    fn test_registration_failure() {
        let transport = Arc::new(LoopbackTransport::new());
        let err = EventProvider::by_guid("definitely not a guid")
            .transport(transport)
            .register()
            .unwrap_err();
        assert!(matches!(err, ProviderError::Registration { status: 87, .. }));
    }

    #[test]
    fn test_last_error_is_per_thread() {
        let (transport, provider) = loopback_provider();
        let session = transport.start_session();
        transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(5));

        let descriptor = EventDescriptor::new(1, Level::Error, 0);
        assert!(!provider.write_event(&descriptor, &[EventArg::Null]));
        assert_eq!(EventProvider::last_write_error(), WriteEventErrorCode::NullInput);

        let other_thread = std::thread::spawn(EventProvider::last_write_error).join().unwrap();
        assert_eq!(other_thread, WriteEventErrorCode::NoError);
    }

    #[test]
    #[should_panic(expected = "Send or Receive")]
    fn test_transfer_requires_send_or_receive() {
        let (_transport, provider) = loopback_provider();
        let descriptor = EventDescriptor::new(1, Level::Error, 0).with_opcode(Opcode::Start);
        provider.write_event_transfer(&descriptor, &Guid::from_u128(3), &[]);
    }

    #[test]
    fn test_drop_unregisters() {
        let (transport, provider) = loopback_provider();
        assert!(provider.is_registered());
        drop(provider);
        assert_eq!(transport.unregister_count(), 1);
        assert_eq!(transport.registration_count(), 0);
    }
}
