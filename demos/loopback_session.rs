use ferrisetw_provider::native::loopback::{self, EnableParameters};
use ferrisetw_provider::provider::*;
use ferrisetw_provider::{EventArg, EventDescriptor, Level, Opcode};
use std::time::{Duration, SystemTime};

const REQUEST_RECEIVED: EventDescriptor =
    EventDescriptor::new(1, Level::Informational, 0x1).with_opcode(Opcode::Receive);
const REQUEST_FAILED: EventDescriptor = EventDescriptor::new(2, Level::Error, 0x2);

fn main() {
    env_logger::init();

    let provider = EventProvider::by_guid("7a1f5a3e-31c5-4a4e-9f0b-2d9c8e6b1f40")
        .add_callback(
            |command: ControllerCommand,
             args: Option<&ControllerArguments>,
             session: i32,
             id: u32| {
                println!(
                    "Controller command {:?} (session slot {}, id {}), arguments: {:?}",
                    command, session, id, args
                );
                Ok(())
            },
        )
        .register()
        .unwrap();

    let transport = loopback::global();
    let session = transport.start_named_session("demo-session");
    transport.enable_provider_with_filter(
        session,
        &provider.provider_id(),
        EnableParameters::new(Level::Informational as u8).with_session_slot(1),
        ControllerCommand::Enable.as_raw(),
        b"SampleRate\x0010\x00",
    );

    for i in 0..5u32 {
        provider.write_event(
            &REQUEST_RECEIVED,
            &[
                EventArg::from(i),
                EventArg::from(format!("/api/item/{}", i)),
                EventArg::from(SystemTime::now()),
            ],
        );
        if i % 2 == 1 {
            provider.write_event(&REQUEST_FAILED, &[EventArg::from(i), EventArg::from(503u16)]);
        }
        provider.write_event_string(Level::Verbose, 0, "filtered out by the session level");
        std::thread::sleep(Duration::from_millis(100));
    }

    for event in transport.events_for(&provider.provider_id()) {
        println!(
            "event {} level {} with {} fields ({} bytes), first field: {:?}",
            event.descriptor.id,
            event.descriptor.level,
            event.field_count(),
            event.payload_size(),
            event.field_u32(0)
        );
    }

    transport.stop_session(session);
    provider.dispose();
}
