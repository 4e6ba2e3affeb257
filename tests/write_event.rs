//! Writes through the loopback transport: gating, encoding and error reporting

use std::sync::Arc;

use ferrisetw_provider::encoder::EventArg;
use ferrisetw_provider::native::etw_types::{
    EventDataDescriptor, ERROR_ARITHMETIC_OVERFLOW, ERROR_MORE_DATA, ERROR_NOT_ENOUGH_MEMORY,
};
use ferrisetw_provider::native::loopback::EnableParameters;
use ferrisetw_provider::{
    EventDescriptor, EventProvider, Guid, Level, LoopbackTransport, Opcode, WriteEventErrorCode,
};
use rand::Rng;

mod utils;
use utils::{loopback_provider, random_guid};

const EVENT: EventDescriptor = EventDescriptor::new(10, Level::Informational, 0x2);

#[test]
fn nothing_is_written_while_disabled() {
    let (transport, provider, _log) = loopback_provider();

    assert!(!provider.is_enabled());
    assert!(provider.write_event(&EVENT, &[EventArg::from(1u32)]));
    assert!(provider.write_event_string(Level::Critical, 0, "unheard"));
    assert!(provider.write_event_raw(&EVENT, None, &[]));

    // Even malformed events are accepted: they are never encoded
    assert!(provider.write_event(&EVENT, &[EventArg::Null]));
    assert_eq!(transport.write_count(), 0);
}

#[test]
fn gate_matches_level_and_keyword_rules() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let level: u8 = rng.gen_range(0..=6);
        let any: u64 = rng.gen::<u64>() & 0xff;
        let all: u64 = rng.gen::<u64>() & any & 0x0f;
        transport.enable_provider(
            session,
            &provider.provider_id(),
            EnableParameters::new(level).with_keywords(any, all),
        );

        for _ in 0..20 {
            let event_level: u8 = rng.gen_range(0..=6);
            let keywords: u64 = if rng.gen_bool(0.2) { 0 } else { rng.gen::<u64>() & 0xff };

            let level_ok = event_level <= level || level == 0;
            let keywords_ok = keywords == 0 || ((keywords & any) != 0 && (keywords & all) == all);
            assert_eq!(
                provider.is_enabled_for(event_level, keywords),
                level_ok && keywords_ok,
                "level {} keywords {:#x} against level {} any {:#x} all {:#x}",
                event_level,
                keywords,
                level,
                any,
                all
            );
        }
    }
}

#[test]
fn filtered_events_are_skipped() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(
        session,
        &provider.provider_id(),
        EnableParameters::new(Level::Warning as u8).with_keywords(0x2, 0),
    );

    // Level too verbose
    assert!(provider.write_event(&EVENT, &[]));
    // Keyword not enabled
    let other_keyword = EventDescriptor::new(11, Level::Error, 0x4);
    assert!(provider.write_event(&other_keyword, &[]));
    assert_eq!(transport.write_count(), 0);

    let accepted = EventDescriptor::new(12, Level::Error, 0x2);
    assert!(provider.write_event(&accepted, &[EventArg::from(-3i64)]));
    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].descriptor.id, 12);
    assert_eq!(events[0].sessions, vec![session]);
    assert_eq!(events[0].field_i64(0), Some(-3));

    transport.disable_provider(session, &provider.provider_id());
    assert!(provider.write_event(&accepted, &[]));
    assert_eq!(transport.write_count(), 1);
}

#[test]
fn payload_encoding() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    let activity = Guid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
    assert!(provider.write_event(
        &EVENT,
        &[
            EventArg::from(7i32),
            EventArg::from("résumé"),
            EventArg::from(true),
            EventArg::from(2.5f64),
            EventArg::from(activity),
            EventArg::from(String::new()),
            EventArg::from('x'),
        ],
    ));

    let events = transport.events();
    let event = &events[0];
    assert_eq!(event.field_count(), 7);
    assert_eq!(event.field_i32(0), Some(7));
    assert_eq!(event.field_string(1).as_deref(), Some("résumé"));
    assert_eq!(event.field(1).unwrap().len(), ("résumé".encode_utf16().count() + 1) * 2);
    assert_eq!(event.field_u32(2), Some(1));
    assert_eq!(event.field_f64(3), Some(2.5));
    assert_eq!(event.field(4).unwrap().len(), 16);
    assert_eq!(event.field(5).unwrap(), &[0, 0]);
    assert_eq!(event.field(6).unwrap(), &(b'x' as u16).to_ne_bytes());
}

#[test]
fn invalid_arguments_are_reported() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    let too_many: Vec<EventArg> = (0..33u32).map(EventArg::from).collect();
    assert!(!provider.write_event(&EVENT, &too_many));
    assert_eq!(EventProvider::last_write_error(), WriteEventErrorCode::TooManyArgs);

    assert!(!provider.write_event(&EVENT, &[EventArg::from(1u8), EventArg::Null]));
    assert_eq!(EventProvider::last_write_error(), WriteEventErrorCode::NullInput);

    let huge = "a".repeat(40_000);
    assert!(!provider.write_event(&EVENT, &[EventArg::from(huge.as_str())]));
    assert_eq!(EventProvider::last_write_error(), WriteEventErrorCode::EventTooBig);

    assert_eq!(transport.write_count(), 0);

    // The last error survives successful writes
    assert!(provider.write_event(&EVENT, &too_many[..32]));
    assert_eq!(EventProvider::last_write_error(), WriteEventErrorCode::EventTooBig);
    assert_eq!(transport.write_count(), 1);
}

#[test]
fn transport_failures_are_translated() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    let cases = [
        (ERROR_ARITHMETIC_OVERFLOW, WriteEventErrorCode::EventTooBig),
        (ERROR_MORE_DATA, WriteEventErrorCode::EventTooBig),
        (ERROR_NOT_ENOUGH_MEMORY, WriteEventErrorCode::NoFreeBuffers),
        (1784, WriteEventErrorCode::Other),
    ];
    for (status, expected) in cases.iter() {
        transport.fail_writes(Some(*status));
        assert!(!provider.write_event(&EVENT, &[]));
        assert_eq!(EventProvider::last_write_error(), *expected);
    }

    transport.fail_writes(None);
    let big = vec![0u8; 70_000];
    assert!(!provider.write_event_raw(&EVENT, None, &[EventDataDescriptor::from_bytes(&big)]));
    assert_eq!(EventProvider::last_write_error(), WriteEventErrorCode::EventTooBig);
    assert_eq!(transport.write_count(), 0);
}

#[test]
fn string_events() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    let params = EnableParameters::new(Level::Warning as u8);
    transport.enable_provider(session, &provider.provider_id(), params);

    assert!(provider.write_event_string(Level::Verbose, 0, "filtered"));
    assert!(provider.write_event_string(Level::Error, 0x8, "disk almost full"));

    let events = transport.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message.as_deref(), Some("disk almost full"));
    assert_eq!(events[0].descriptor.level, Level::Error as u8);
    assert_eq!(events[0].descriptor.keyword, 0x8);
    assert_eq!(events[0].field_string(0).as_deref(), Some("disk almost full"));
}

#[test]
fn activity_transfers() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    let child = Guid::from_u128(0xc0ffee);
    let send = EVENT.with_opcode(Opcode::Send);
    let receive = EVENT.with_opcode(Opcode::Receive);
    assert!(provider.write_event_transfer(&send, &child, &[EventArg::from(1u16)]));
    assert!(provider.write_event_transfer(&receive, &child, &[]));

    let events = transport.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].related_activity_id, Some(child));
    assert_eq!(events[0].activity_id, None);
    assert_eq!(events[1].descriptor.opcode, Opcode::Receive as u8);
}

#[test]
#[should_panic]
fn transfer_with_another_opcode_panics_even_when_disabled() {
    let (_transport, provider, _log) = loopback_provider();
    provider.write_event_transfer(&EVENT.with_opcode(Opcode::Start), &Guid::from_u128(1), &[]);
}

#[test]
fn writes_after_dispose_are_skipped() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    provider.dispose();
    assert!(!provider.is_enabled());
    assert!(provider.write_event(&EVENT, &[]));
    assert_eq!(transport.write_count(), 0);

    assert_eq!(transport.registration_count(), 0);
}

#[test]
fn filters_can_be_overridden() {
    let (transport, provider, _log) = loopback_provider();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(5));
    assert!(provider.is_enabled_for(Level::Informational as u8, 0x2));

    provider.set_level(Level::Error as u8);
    provider.set_match_any_keyword(0x1);
    provider.set_match_all_keyword(0x1);
    assert_eq!(provider.level(), Level::Error as u8);
    assert!(!provider.is_enabled_for(Level::Informational as u8, 0x1));
    assert!(!provider.is_enabled_for(Level::Error as u8, 0x2));
    assert!(provider.is_enabled_for(Level::Error as u8, 0x1));

    // The next notification restores the session filters
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(5));
    assert!(provider.is_enabled_for(Level::Informational as u8, 0x2));
}

#[test]
fn recorded_events_are_bounded() {
    let transport = Arc::new(LoopbackTransport::with_capacity(10));
    let provider = EventProvider::by_guid(random_guid())
        .transport(transport.clone())
        .register()
        .unwrap();
    let session = transport.start_session();
    transport.enable_provider(session, &provider.provider_id(), EnableParameters::new(0));

    for i in 0..25u32 {
        assert!(provider.write_event(&EVENT, &[i.into()]));
    }
    assert_eq!(transport.write_count(), 25);

    let kept: Vec<u32> = transport
        .events()
        .iter()
        .filter_map(|e| e.field_u32(0))
        .collect();
    assert_eq!(kept, (15..25).collect::<Vec<u32>>());
}
