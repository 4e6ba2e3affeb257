#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::mpsc::{RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrisetw_provider::provider::{
    ControllerArguments, ControllerCommand, ControllerCommandHandler, HandlerResult,
};
use ferrisetw_provider::{EventProvider, Guid, LoopbackTransport};
use rand::Rng;

#[derive(Clone, Debug)]
pub enum TestKind {
    /// Test will pass if a success has been notified in the test duration
    ExpectSuccess,
    /// Test will pass if no failure has been notified in the test duration
    ExpectNoFailure,
}

#[derive(Clone, Debug)] // mpsc channels are clone-able to be shared between threads
pub struct StatusNotifier {
    kind: TestKind,
    tx: mpsc::SyncSender<()>,
}

impl StatusNotifier {
    pub fn notify_success(&self) {
        if let TestKind::ExpectSuccess = self.kind {
            self.notify();
        }
    }

    pub fn notify_failure(&self) {
        if let TestKind::ExpectNoFailure = self.kind {
            self.notify();
        }
    }

    fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => (), // a signal has been sent already, we don't care
            Err(TrySendError::Disconnected(_)) => (), // the test is over, handlers may outlive it
        }
    }
}

#[derive(Debug)]
pub struct Status {
    notifier: StatusNotifier,
    rx: mpsc::Receiver<()>,
}

impl Status {
    pub fn new(kind: TestKind) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self {
            notifier: StatusNotifier { kind, tx },
            rx,
        }
    }

    pub fn notifier(&self) -> StatusNotifier {
        self.notifier.clone()
    }

    pub fn assert_passed(&self) {
        let timeout = Duration::from_secs(2);

        match self.notifier.kind {
            TestKind::ExpectSuccess => match self.rx.recv_timeout(timeout) {
                Ok(()) => (),
                Err(RecvTimeoutError::Timeout) => {
                    panic!("Test did not pass within the allowed timeout")
                }
                _ => panic!("Should not happen, the sending end has not hung up."),
            },
            TestKind::ExpectNoFailure => match self.rx.recv_timeout(timeout) {
                Ok(()) => panic!("Test failed within the allowed timeout"),
                Err(RecvTimeoutError::Timeout) => (),
                _ => panic!("Should not happen, the sending end has not hung up."),
            },
        }
    }
}

/// One call received by a [`CommandLog`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub command: ControllerCommand,
    pub arguments: Option<ControllerArguments>,
    pub session_change: i32,
    pub etw_session_id: u32,
}

/// A controller command handler that remembers every call
#[derive(Clone, Default)]
pub struct CommandLog {
    calls: Arc<Mutex<Vec<ReceivedCommand>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ReceivedCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<ReceivedCommand> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl ControllerCommandHandler for CommandLog {
    fn on_controller_command(
        &self,
        command: ControllerCommand,
        arguments: Option<&ControllerArguments>,
        session_change: i32,
        etw_session_id: u32,
    ) -> HandlerResult {
        self.calls.lock().unwrap().push(ReceivedCommand {
            command,
            arguments: arguments.cloned(),
            session_change,
            etw_session_id,
        });
        Ok(())
    }
}

/// A GUID no other test uses
pub fn random_guid() -> Guid {
    let mut rng = rand::thread_rng();
    Guid::from_u128(rng.gen::<u128>() | 1)
}

/// A provider registered on a private loopback transport, with a [`CommandLog`]
pub fn loopback_provider() -> (Arc<LoopbackTransport>, EventProvider, CommandLog) {
    let transport = Arc::new(LoopbackTransport::new());
    let log = CommandLog::new();
    let provider = EventProvider::by_guid(random_guid())
        .transport(transport.clone())
        .add_handler(log.clone())
        .register()
        .unwrap();
    (transport, provider, log)
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
