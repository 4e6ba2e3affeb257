//! Event payload encoding
//!
//! Turns a list of heterogeneous [`EventArg`]s into the sized data descriptors a transport writes
//! in a single call.
//!
//! # Example
//! ```
//! use ferrisetw_provider::encoder::{EncodedPayload, EventArg};
//!
//! let args = [EventArg::from(42u32), EventArg::from("hello"), EventArg::from(true)];
//! let payload = EncodedPayload::encode(&args).unwrap();
//!
//! let sizes: Vec<u32> = payload.descriptors().iter().map(|d| d.size()).collect();
//! assert_eq!(sizes, vec![4, 12, 4]);
//! ```
use std::borrow::Cow;
use std::fmt;
use std::iter;
use std::time::SystemTime;

use num_traits::ToPrimitive;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::guid::Guid;
use crate::native::etw_types::{EventDataDescriptor, MAX_EVENT_ARGUMENTS, MAX_EVENT_SIZE};
use crate::native::time::FileTime;

/// Scalars are copied to a fixed-size inline slot, large enough for the widest one (GUID, decimal)
const SCALAR_SLOT_SIZE: usize = 16;
/// Events with at most this many text arguments keep their side table inline-sized
const INLINE_STRING_COUNT: usize = 8;

/// Encoder errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// More than [`MAX_EVENT_ARGUMENTS`] arguments were given
    TooManyArguments(usize),
    /// The argument at this index is [`EventArg::Null`]
    NullArgument(usize),
    /// The payload would exceed [`MAX_EVENT_SIZE`] bytes
    EventTooBig(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyArguments(count) => write!(
                f,
                "too many arguments ({}, at most {} are allowed)",
                count, MAX_EVENT_ARGUMENTS
            ),
            Self::NullArgument(index) => write!(f, "argument {} is null", index),
            Self::EventTooBig(size) => write!(
                f,
                "event payload is {} bytes, at most {} are allowed",
                size, MAX_EVENT_SIZE
            ),
        }
    }
}

impl std::error::Error for EncodeError {}

/// A 96-bit scaled decimal, laid out like the .NET `System.Decimal`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, AsBytes, FromBytes, FromZeroes)]
pub struct Decimal {
    flags: u32,
    hi: u32,
    lo: u32,
    mid: u32,
}

const DECIMAL_SIGN_MASK: u32 = 0x8000_0000;
const DECIMAL_SCALE_SHIFT: u32 = 16;
const DECIMAL_MAX_SCALE: u8 = 28;
const DECIMAL_MAX_MANTISSA: u128 = (1 << 96) - 1;

impl Decimal {
    /// `mantissa * 10^-scale`. Returns `None` if the mantissa does not fit in 96 bits or the scale
    /// exceeds 28.
    pub fn new(mantissa: i128, scale: u8) -> Option<Self> {
        let magnitude = mantissa.unsigned_abs();
        if magnitude > DECIMAL_MAX_MANTISSA || scale > DECIMAL_MAX_SCALE {
            return None;
        }
        let mut flags = (scale as u32) << DECIMAL_SCALE_SHIFT;
        if mantissa < 0 {
            flags |= DECIMAL_SIGN_MASK;
        }
        Some(Decimal {
            flags,
            hi: (magnitude >> 64) as u32,
            lo: magnitude as u32,
            mid: (magnitude >> 32) as u32,
        })
    }

    pub fn mantissa(&self) -> i128 {
        let magnitude =
            ((self.hi as i128) << 64) | ((self.mid as i128) << 32) | (self.lo as i128);
        if self.flags & DECIMAL_SIGN_MASK != 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn scale(&self) -> u8 {
        (self.flags >> DECIMAL_SCALE_SHIFT) as u8
    }
}

/// One event argument
#[derive(Debug, Clone, PartialEq)]
pub enum EventArg<'a> {
    /// The "missing value" sentinel. Always rejected by the encoder.
    Null,
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    /// Pointer-sized signed integer
    ISize(isize),
    /// Pointer-sized unsigned integer
    USize(usize),
    /// A single UTF-16 code unit
    Char(u16),
    F32(f32),
    F64(f64),
    /// Written as a 4-byte Win32 `BOOL`
    Bool(bool),
    Guid(Guid),
    Decimal(Decimal),
    /// Absolute timestamp
    FileTime(FileTime),
    Str(Cow<'a, str>),
}

impl<'a> EventArg<'a> {
    /// Widens an enumeration value to its integer representation: `i32` when it fits, `i64`
    /// otherwise. Values with no integer representation are written as text.
    ///
    /// ```
    /// # use ferrisetw_provider::encoder::EventArg;
    /// #[derive(num_derive::ToPrimitive)]
    /// enum Color { Red = 1, Blue = 4 }
    ///
    /// impl std::fmt::Display for Color {
    ///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    ///         match self {
    ///             Color::Red => f.write_str("Red"),
    ///             Color::Blue => f.write_str("Blue"),
    ///         }
    ///     }
    /// }
    ///
    /// assert_eq!(EventArg::from_enum(&Color::Blue), EventArg::I32(4));
    /// ```
    pub fn from_enum<E: ToPrimitive + fmt::Display>(value: &E) -> Self {
        if let Some(v) = value.to_i32() {
            EventArg::I32(v)
        } else if let Some(v) = value.to_i64() {
            EventArg::I64(v)
        } else if let Some(v) = value.to_u64() {
            EventArg::U64(v)
        } else {
            EventArg::display(value)
        }
    }

    /// Any other value is written as its textual representation
    pub fn display<T: fmt::Display + ?Sized>(value: &T) -> Self {
        EventArg::Str(Cow::Owned(value.to_string()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EventArg::Null)
    }

    fn is_text(&self) -> bool {
        matches!(self, EventArg::Str(_))
    }
}

macro_rules! impl_from_for_event_arg {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl<'a> From<$ty> for EventArg<'a> {
                fn from(value: $ty) -> Self {
                    EventArg::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_event_arg!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    isize => ISize,
    usize => USize,
    f32 => F32,
    f64 => F64,
    bool => Bool,
    Guid => Guid,
    Decimal => Decimal,
    FileTime => FileTime,
);

impl<'a> From<char> for EventArg<'a> {
    fn from(value: char) -> Self {
        let mut buf = [0u16; 2];
        match value.encode_utf16(&mut buf) {
            [unit] => EventArg::Char(*unit),
            // Characters outside of the BMP do not fit in a single code unit
            _ => EventArg::Str(Cow::Owned(value.to_string())),
        }
    }
}

impl<'a> From<&'a str> for EventArg<'a> {
    fn from(value: &'a str) -> Self {
        EventArg::Str(Cow::Borrowed(value))
    }
}

impl<'a> From<String> for EventArg<'a> {
    fn from(value: String) -> Self {
        EventArg::Str(Cow::Owned(value))
    }
}

impl<'a> From<SystemTime> for EventArg<'a> {
    fn from(value: SystemTime) -> Self {
        EventArg::FileTime(FileTime::from(value))
    }
}

#[cfg(feature = "time_rs")]
impl<'a> From<time::OffsetDateTime> for EventArg<'a> {
    fn from(value: time::OffsetDateTime) -> Self {
        EventArg::FileTime(FileTime::from(value))
    }
}

impl<'a, T: Into<EventArg<'a>>> From<Option<T>> for EventArg<'a> {
    fn from(value: Option<T>) -> Self {
        value.map_or(EventArg::Null, Into::into)
    }
}

#[derive(Debug, Clone)]
enum EncodedArg {
    Scalar {
        bytes: [u8; SCALAR_SLOT_SIZE],
        len: usize,
    },
    /// Index in the string side table
    Text(usize),
}

impl EncodedArg {
    fn scalar<T: AsBytes + ?Sized>(value: &T) -> Self {
        let src = value.as_bytes();
        let mut bytes = [0u8; SCALAR_SLOT_SIZE];
        bytes[..src.len()].copy_from_slice(src);
        EncodedArg::Scalar {
            bytes,
            len: src.len(),
        }
    }
}

/// The encoded form of an event payload: fixed-size scalars plus a side table of UTF-16 strings
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    args: Vec<EncodedArg>,
    strings: Vec<Vec<u16>>,
    total_size: usize,
}

impl EncodedPayload {
    /// Encodes `args`. Nothing is returned unless every argument could be encoded.
    pub fn encode(args: &[EventArg<'_>]) -> Result<Self, EncodeError> {
        if args.len() > MAX_EVENT_ARGUMENTS {
            return Err(EncodeError::TooManyArguments(args.len()));
        }

        let text_count = args.iter().filter(|arg| arg.is_text()).count();
        let mut strings = if text_count <= INLINE_STRING_COUNT {
            Vec::with_capacity(INLINE_STRING_COUNT)
        } else {
            Vec::with_capacity(text_count)
        };
        let mut encoded = Vec::with_capacity(args.len());
        let mut total_size = 0usize;

        for (index, arg) in args.iter().enumerate() {
            let encoded_arg = match arg {
                EventArg::Null => return Err(EncodeError::NullArgument(index)),
                EventArg::I8(v) => EncodedArg::scalar(v),
                EventArg::U8(v) => EncodedArg::scalar(v),
                EventArg::I16(v) => EncodedArg::scalar(v),
                EventArg::U16(v) => EncodedArg::scalar(v),
                EventArg::I32(v) => EncodedArg::scalar(v),
                EventArg::U32(v) => EncodedArg::scalar(v),
                EventArg::I64(v) => EncodedArg::scalar(v),
                EventArg::U64(v) => EncodedArg::scalar(v),
                EventArg::ISize(v) => EncodedArg::scalar(v),
                EventArg::USize(v) => EncodedArg::scalar(v),
                EventArg::Char(v) => EncodedArg::scalar(v),
                EventArg::F32(v) => EncodedArg::scalar(v),
                EventArg::F64(v) => EncodedArg::scalar(v),
                EventArg::Bool(v) => EncodedArg::scalar(&i32::from(*v)),
                EventArg::Guid(v) => EncodedArg::scalar(v),
                EventArg::Decimal(v) => EncodedArg::scalar(v),
                EventArg::FileTime(v) => EncodedArg::scalar(&v.as_quad()),
                EventArg::Str(s) => {
                    strings.push(to_utf16_with_nul(s));
                    EncodedArg::Text(strings.len() - 1)
                }
            };

            total_size += match &encoded_arg {
                EncodedArg::Scalar { len, .. } => *len,
                EncodedArg::Text(i) => strings[*i].len() * 2,
            };
            encoded.push(encoded_arg);
        }

        if total_size > MAX_EVENT_SIZE {
            return Err(EncodeError::EventTooBig(total_size));
        }

        Ok(EncodedPayload {
            args: encoded,
            strings,
            total_size,
        })
    }

    /// One descriptor per argument, in argument order
    pub fn descriptors(&self) -> Vec<EventDataDescriptor<'_>> {
        self.args
            .iter()
            .map(|arg| match arg {
                EncodedArg::Scalar { bytes, len } => {
                    EventDataDescriptor::from_bytes(&bytes[..*len])
                }
                EncodedArg::Text(i) => {
                    EventDataDescriptor::from_bytes(self.strings[*i].as_bytes())
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sum of the sizes of every descriptor
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// How many text arguments the payload holds
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }
}

fn to_utf16_with_nul(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}
