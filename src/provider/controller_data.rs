//! Arguments passed by controllers along with enable notifications
use std::collections::HashMap;

use crate::guid::Guid;
use crate::native::etw_types::{FilterData, MAX_FILTER_DATA_SIZE};
use crate::native::transport::EventTransport;

use super::ControllerCommand;

/// Key/value arguments sent by a controller
pub type ControllerArguments = HashMap<String, String>;

/// Raw data obtained from a controller, along with the command it comes with
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControllerData {
    pub command: ControllerCommand,
    pub data: Vec<u8>,
}

/// Gets the data a controller passed to this provider for `session_id`.
///
/// Inline data is only present when the provider was registered at the time the controller issued
/// its command. Otherwise, the data persisted by the controller is looked up. Persisted data is
/// only ever used for updates.
pub(crate) fn data_from_controller(
    transport: &dyn EventTransport,
    provider_id: &Guid,
    session_id: u32,
    filter_data: Option<FilterData<'_>>,
) -> Option<ControllerData> {
    match filter_data {
        Some(filter) => {
            let data = if !filter.data.is_empty() && filter.data.len() <= MAX_FILTER_DATA_SIZE {
                filter.data.to_vec()
            } else {
                Vec::new()
            };
            Some(ControllerData {
                command: ControllerCommand::from_raw(filter.ty),
                data,
            })
        }
        None => transport
            .controller_data(provider_id, session_id)
            .map(|data| ControllerData {
                command: ControllerCommand::Update,
                data,
            }),
    }
}

/// Parses a sequence of NUL-terminated UTF-8 `key`, `value` strings.
///
/// A trailing key without a terminated value is dropped.
pub(crate) fn parse_arguments(data: &[u8]) -> ControllerArguments {
    let mut args = ControllerArguments::with_capacity(4);
    let mut key_start = 0;

    while key_start < data.len() {
        let key_end = find_null(data, key_start);
        let value_start = key_end + 1;
        let value_end = find_null(data, value_start);
        if value_end < data.len() {
            let key = String::from_utf8_lossy(&data[key_start..key_end]).into_owned();
            let value = String::from_utf8_lossy(&data[value_start..value_end]).into_owned();
            args.insert(key, value);
        }
        key_start = value_end + 1;
    }

    args
}

fn find_null(buffer: &[u8], from: usize) -> usize {
    buffer
        .get(from..)
        .and_then(|rest| rest.iter().position(|&b| b == 0))
        .map_or(buffer.len(), |pos| from + pos)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let args = parse_arguments(b"Level\x005\x00Filter\x00abc\x00");
        assert_eq!(args.len(), 2);
        assert_eq!(args["Level"], "5");
        assert_eq!(args["Filter"], "abc");
    }

    #[test]
    fn test_truncated_trailer_is_dropped() {
        let args = parse_arguments(b"Key\x00Value\x00Dangling\x00NoTerminator");
        assert_eq!(args.len(), 1);
        assert_eq!(args["Key"], "Value");

        let args = parse_arguments(b"KeyOnly");
        assert!(args.is_empty());
        assert!(parse_arguments(b"").is_empty());
    }

    #[test]
    fn test_empty_values_and_lossy_utf8() {
        let args = parse_arguments(b"\x00\x00k\xff\x00v\x00");
        assert_eq!(args[""], "");
        assert_eq!(args["k\u{fffd}"], "v");
    }
}
