//! Basic ETW types
//!
//! The `etw_types` module provides the provider-side ETW types exchanged with a transport: event
//! descriptors, data descriptors, control codes and status codes.
//!
//! In most cases a user of the crate won't have to deal with the raw values and can use the typed
//! wrappers ([`Level`], [`Opcode`]) instead.
use std::fmt;
use std::marker::PhantomData;

use num_traits::FromPrimitive;
use zerocopy::AsBytes;

/// Maximum number of arguments of a single event
pub const MAX_EVENT_ARGUMENTS: usize = 32;
/// Maximum total size (in bytes) of the payload of a single event
pub const MAX_EVENT_SIZE: usize = 65482;
/// Maximum size (in bytes) of the data a controller may pass inline with an enable notification
pub const MAX_FILTER_DATA_SIZE: usize = 1024;

// Control codes, see https://learn.microsoft.com/en-us/windows/win32/api/evntprov/nc-evntprov-penablecallback
pub const EVENT_CONTROL_CODE_DISABLE_PROVIDER: u32 = 0;
pub const EVENT_CONTROL_CODE_ENABLE_PROVIDER: u32 = 1;
pub const EVENT_CONTROL_CODE_CAPTURE_STATE: u32 = 2;

// Win32 status codes a transport may return
pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_MORE_DATA: u32 = 234;
pub const ERROR_ARITHMETIC_OVERFLOW: u32 = 534;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_ACCESS_DENIED: u32 = 5;

/// Human readable description of a transport status code
pub fn status_message(status: u32) -> &'static str {
    match status {
        ERROR_SUCCESS => "The operation completed successfully.",
        ERROR_ACCESS_DENIED => "Access is denied.",
        ERROR_INVALID_HANDLE => "The handle is invalid.",
        ERROR_NOT_ENOUGH_MEMORY => {
            "Not enough memory resources are available to process this command."
        }
        ERROR_INVALID_PARAMETER => "The parameter is incorrect.",
        ERROR_INSUFFICIENT_BUFFER => "The data area passed to a system call is too small.",
        ERROR_MORE_DATA => "More data is available.",
        ERROR_ARITHMETIC_OVERFLOW => "Arithmetic result exceeded 32 bits.",
        _ => "Unknown error.",
    }
}

/// Opaque registration handle returned by a transport. `0` is never a valid handle.
pub type RegistrationHandle = u64;

/// Event severity level
///
/// See [EVENT_DESCRIPTOR](https://learn.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_descriptor)
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Level {
    /// Always logged. Also used by controllers to mean "all levels"
    LogAlways = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    #[default]
    Verbose = 5,
}

/// Event opcode
#[repr(u8)]
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Opcode {
    #[default]
    Info = 0,
    Start = 1,
    Stop = 2,
    DataCollectionStart = 3,
    DataCollectionStop = 4,
    Extension = 5,
    Reply = 6,
    Resume = 7,
    Suspend = 8,
    Send = 9,
    Receive = 240,
}

impl Opcode {
    /// Activity transfers are only meaningful for these opcodes
    pub fn allows_transfer(self) -> bool {
        matches!(self, Opcode::Send | Opcode::Receive)
    }
}

/// Provider-side equivalent of an [EVENT_DESCRIPTOR](https://learn.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_descriptor)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EventDescriptor {
    pub id: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub opcode: u8,
    pub task: u16,
    pub keyword: u64,
}

impl EventDescriptor {
    pub const fn new(id: u16, level: Level, keyword: u64) -> Self {
        EventDescriptor {
            id,
            version: 0,
            channel: 0,
            level: level as u8,
            opcode: Opcode::Info as u8,
            task: 0,
            keyword,
        }
    }

    pub const fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode as u8;
        self
    }

    pub const fn with_task(mut self, task: u16) -> Self {
        self.task = task;
        self
    }

    pub const fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub const fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// The typed level, if `level` holds a well-known value
    pub fn typed_level(&self) -> Option<Level> {
        FromPrimitive::from_u8(self.level)
    }

    /// The typed opcode, if `opcode` holds a well-known value
    pub fn typed_opcode(&self) -> Option<Opcode> {
        FromPrimitive::from_u8(self.opcode)
    }
}

/// Describes one block of event payload, like an [EVENT_DATA_DESCRIPTOR](https://learn.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_data_descriptor)
///
/// The lifetime ties the descriptor to the memory it points to, so that a descriptor can be
/// handed to a transport and read back safely.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventDataDescriptor<'a> {
    ptr: u64,
    size: u32,
    reserved: u32,
    lifetime: PhantomData<&'a [u8]>,
}

impl<'a> EventDataDescriptor<'a> {
    /// An empty descriptor (zero size, null pointer)
    pub const fn zero() -> Self {
        EventDataDescriptor {
            ptr: 0,
            size: 0,
            reserved: 0,
            lifetime: PhantomData,
        }
    }

    /// A descriptor pointing at `bytes`.
    ///
    /// Sizes above `u32::MAX` are truncated by design of the native structure, callers are
    /// expected to have validated the total size beforehand.
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        EventDataDescriptor {
            ptr: bytes.as_ptr() as usize as u64,
            size: bytes.len() as u32,
            reserved: 0,
            lifetime: PhantomData,
        }
    }

    /// A descriptor pointing at a plain-old-data value
    pub fn from_value<T: AsBytes + ?Sized>(value: &'a T) -> Self {
        Self::from_bytes(value.as_bytes())
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// The bytes this descriptor points to
    pub fn as_bytes(&self) -> &'a [u8] {
        if self.ptr == 0 || self.size == 0 {
            return &[];
        }
        unsafe {
            // Safety:
            //  * descriptors can only be built from a `&'a [u8]` (or a type viewed as bytes), so
            //    `ptr` points to `size` initialized bytes that outlive `'a`
            std::slice::from_raw_parts(self.ptr as usize as *const u8, self.size as usize)
        }
    }
}

impl fmt::Debug for EventDataDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDataDescriptor")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

/// Data a controller may pass inline with a control notification, like an
/// [EVENT_FILTER_DESCRIPTOR](https://learn.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_filter_descriptor)
#[derive(Debug, Clone, Copy)]
pub struct FilterData<'a> {
    /// The controller command, see [`ControllerCommand`](crate::provider::ControllerCommand)
    pub ty: i32,
    pub data: &'a [u8],
}
