#![cfg(feature = "serde")]

use ferrisetw_provider::encoder::EventArg;
use ferrisetw_provider::native::loopback::EnableParameters;
use ferrisetw_provider::{EventDescriptor, Guid, Level, Opcode};

mod utils;
use utils::loopback_provider;

#[test]
fn guid_serializes_as_string() {
    let guid: Guid = "1edeee53-0afe-4609-b846-d8c0b2075b1f".parse().unwrap();
    let json = serde_json::to_value(guid).unwrap();
    assert_eq!(json, serde_json::json!("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F"));
}

#[test]
fn recorded_events_serialize() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    let descriptor = EventDescriptor::new(7, Level::Warning, 0x40).with_opcode(Opcode::Send);
    let child = Guid::from_u128(42);
    assert!(provider.write_event_transfer(&descriptor, &child, &[EventArg::from(5u8)]));

    let events = transport.events();
    let json = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(json["provider_id"], serde_json::json!(provider.provider_id().to_string()));
    assert_eq!(json["descriptor"]["id"], 7);
    assert_eq!(json["descriptor"]["opcode"], Opcode::Send as u8);
    assert_eq!(json["related_activity_id"], serde_json::json!(child.to_string()));
    assert_eq!(json["activity_id"], serde_json::Value::Null);
    assert_eq!(json["fields"], serde_json::json!([[5]]));
    assert_eq!(json["sessions"], serde_json::json!([session]));
}

#[test]
fn enums_serialize_by_name() {
    assert_eq!(serde_json::to_value(Level::Critical).unwrap(), "Critical");
    assert_eq!(serde_json::to_value(Opcode::Receive).unwrap(), "Receive");
}
