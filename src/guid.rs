//! Portable GUID
//!
//! Providers, sessions and activities are identified by 128-bit GUIDs that share the layout of
//! the Windows `GUID` structure, so that a GUID event argument can be copied to a data descriptor
//! as-is.
use std::fmt;
use std::str::FromStr;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// GUID parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuidParseError {
    /// The string does not have the `8-4-4-4-12` shape (braces are optional)
    InvalidLength(usize),
    /// A dash is missing at the given position
    MissingDash(usize),
    /// A non-hexadecimal character was found at the given position
    InvalidDigit(usize),
}

impl fmt::Display for GuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(len) => write!(f, "invalid GUID length {}", len),
            Self::MissingDash(pos) => write!(f, "expected '-' at position {}", pos),
            Self::InvalidDigit(pos) => write!(f, "invalid hex digit at position {}", pos),
        }
    }
}

impl std::error::Error for GuidParseError {}

/// A GUID, laid out like the Windows `GUID` structure
#[repr(C)]
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, AsBytes, FromBytes, FromZeroes,
)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

impl Guid {
    /// The all-zero GUID. No transport accepts it as a provider id.
    pub const fn zeroed() -> Self {
        Self::from_values(0, 0, 0, [0; 8])
    }

    pub const fn from_values(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Guid {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Builds a GUID from its big-endian textual representation, as a `u128`
    ///
    /// ```
    /// # use ferrisetw_provider::Guid;
    /// let guid = Guid::from_u128(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716);
    /// assert_eq!(guid, Guid::from("22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716"));
    /// ```
    pub const fn from_u128(value: u128) -> Self {
        let bytes = value.to_be_bytes();
        Guid {
            data1: (value >> 96) as u32,
            data2: (value >> 80) as u16,
            data3: (value >> 64) as u16,
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        }
    }

    pub const fn to_u128(&self) -> u128 {
        ((self.data1 as u128) << 96)
            | ((self.data2 as u128) << 80)
            | ((self.data3 as u128) << 64)
            | (u64::from_be_bytes(self.data4) as u128)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zeroed()
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .strip_prefix('{')
            .and_then(|inner| inner.strip_suffix('}'))
            .unwrap_or(s);
        let bytes = trimmed.as_bytes();
        if bytes.len() != 36 {
            return Err(GuidParseError::InvalidLength(bytes.len()));
        }

        let mut value: u128 = 0;
        for (pos, &c) in bytes.iter().enumerate() {
            if DASH_POSITIONS.contains(&pos) {
                if c != b'-' {
                    return Err(GuidParseError::MissingDash(pos));
                }
                continue;
            }
            let digit = (c as char)
                .to_digit(16)
                .ok_or(GuidParseError::InvalidDigit(pos))?;
            value = (value << 4) | digit as u128;
        }

        Ok(Guid::from_u128(value))
    }
}

/// Lenient conversion, for builder APIs.
///
/// An unparseable string yields the zero GUID, which transports refuse to register.
impl From<&str> for Guid {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|err| {
            log::error!("invalid GUID string {:?}: {}", s, err);
            Guid::zeroed()
        })
    }
}

impl From<u128> for Guid {
    fn from(value: u128) -> Self {
        Guid::from_u128(value)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for byte in &self.data4[2..] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
