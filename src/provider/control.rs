//! Control state of a registered provider
//!
//! The enabled flag, level and keyword masks are only written from the control callback, and read
//! from any thread emitting events. They live in atomics: a reader may briefly observe a stale
//! value during an enable/disable transition. Once the provider is disposed, it stays disabled.
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::guid::Guid;
use crate::native::etw_types::{
    FilterData, EVENT_CONTROL_CODE_CAPTURE_STATE, EVENT_CONTROL_CODE_DISABLE_PROVIDER,
    EVENT_CONTROL_CODE_ENABLE_PROVIDER,
};
use crate::native::transport::{ControlCallback, EventTransport};

use super::controller_data::{data_from_controller, parse_arguments, ControllerArguments};
use super::session::{SessionInfo, SessionTracker};
use super::{ControllerCommand, ControllerCommandHandler, HandlerFailure};

pub(crate) type ErrorSink = Box<dyn Fn(&HandlerFailure) + Send + Sync + 'static>;

/// State shared between a provider and the transport it is registered with
pub(crate) struct ProviderControl {
    provider_id: Guid,
    transport: Arc<dyn EventTransport>,
    enabled: AtomicBool,
    level: AtomicU8,
    any_keyword_mask: AtomicU64,
    all_keyword_mask: AtomicU64,
    disposed: AtomicBool,
    sessions: SessionTracker,
    handlers: Vec<Arc<dyn ControllerCommandHandler>>,
    error_sink: Option<ErrorSink>,
}

impl ProviderControl {
    pub(crate) fn new(
        provider_id: Guid,
        transport: Arc<dyn EventTransport>,
        handlers: Vec<Arc<dyn ControllerCommandHandler>>,
        error_sink: Option<ErrorSink>,
    ) -> Self {
        ProviderControl {
            provider_id,
            transport,
            enabled: AtomicBool::new(false),
            level: AtomicU8::new(0),
            any_keyword_mask: AtomicU64::new(0),
            all_keyword_mask: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            sessions: SessionTracker::new(),
            handlers,
            error_sink,
        }
    }

    pub(crate) fn provider_id(&self) -> Guid {
        self.provider_id
    }

    pub(crate) fn transport(&self) -> &dyn EventTransport {
        &*self.transport
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn is_enabled_for(&self, level: u8, keywords: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }

        // A current level of 0 accepts every level
        let current_level = self.level.load(Ordering::Relaxed);
        if level > current_level && current_level != 0 {
            return false;
        }

        if keywords == 0 {
            return true;
        }
        let any = self.any_keyword_mask.load(Ordering::Relaxed);
        let all = self.all_keyword_mask.load(Ordering::Relaxed);
        (keywords & any) != 0 && (keywords & all) == all
    }

    pub(crate) fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub(crate) fn match_any_keyword(&self) -> u64 {
        self.any_keyword_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn match_all_keyword(&self) -> u64 {
        self.all_keyword_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn set_level(&self, level: u8) {
        self.level.store(level, Ordering::Relaxed);
    }

    pub(crate) fn set_match_any_keyword(&self, keywords: u64) {
        self.any_keyword_mask.store(keywords, Ordering::Relaxed);
    }

    pub(crate) fn set_match_all_keyword(&self, keywords: u64) {
        self.all_keyword_mask.store(keywords, Ordering::Relaxed);
    }

    pub(crate) fn live_sessions(&self) -> Arc<Vec<SessionInfo>> {
        self.sessions.live_sessions()
    }

    /// Marks the provider as disposed and disabled. Returns `false` if it already was.
    pub(crate) fn begin_dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.enabled.store(false, Ordering::SeqCst);
        true
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn enable(&self, level: u8, match_any_keyword: u64, match_all_keyword: u64) {
        self.level.store(level, Ordering::Relaxed);
        self.any_keyword_mask.store(match_any_keyword, Ordering::Relaxed);
        self.all_keyword_mask.store(match_all_keyword, Ordering::Relaxed);
        self.enabled.store(true, Ordering::SeqCst);

        // A dispose that ran since the notification arrived stays in effect
        if self.disposed.load(Ordering::SeqCst) {
            self.enabled.store(false, Ordering::SeqCst);
        }
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.level.store(0, Ordering::Relaxed);
        self.any_keyword_mask.store(0, Ordering::Relaxed);
        self.all_keyword_mask.store(0, Ordering::Relaxed);
        self.sessions.clear();
    }

    fn current_sessions(&self) -> Vec<(u32, u64)> {
        match self.transport.enumerate_sessions(&self.provider_id) {
            Ok(sessions) => sessions,
            Err(status) => {
                log::warn!(
                    "unable to enumerate the sessions of provider {}: status {}",
                    self.provider_id,
                    status
                );
                Vec::new()
            }
        }
    }

    /// Calls every handler, never letting a failure escape
    fn dispatch(
        &self,
        command: ControllerCommand,
        arguments: Option<&ControllerArguments>,
        session_change: i32,
        etw_session_id: u32,
    ) {
        for handler in &self.handlers {
            if self.is_disposed() {
                log::debug!(
                    "provider {} was disposed, {:?} is not dispatched",
                    self.provider_id,
                    command
                );
                return;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                handler.on_controller_command(command, arguments, session_change, etw_session_id)
            }));

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => HandlerFailure::Error(err),
                Err(payload) => HandlerFailure::Panic(panic_message(payload)),
            };

            match &self.error_sink {
                Some(sink) => sink(&failure),
                None => log::warn!(
                    "controller command handler of provider {} failed on {:?}: {}",
                    self.provider_id,
                    command,
                    failure
                ),
            }
        }
    }
}

impl ControlCallback for ProviderControl {
    fn on_control(
        &self,
        source_id: &Guid,
        control_code: u32,
        level: u8,
        match_any_keyword: u64,
        match_all_keyword: u64,
        filter_data: Option<FilterData<'_>>,
    ) {
        if self.is_disposed() {
            return;
        }

        log::trace!(
            "control callback for {} (source {}): code {}, level {}, any {:#x}, all {:#x}",
            self.provider_id,
            source_id,
            control_code,
            level,
            match_any_keyword,
            match_all_keyword
        );

        let command = match control_code {
            EVENT_CONTROL_CODE_ENABLE_PROVIDER => {
                self.enable(level, match_any_keyword, match_all_keyword);

                let changes = self.sessions.compute_delta(self.current_sessions());
                if !changes.is_empty() {
                    // With several sessions changing at once, there is no way to tell which one the
                    // inline data belongs to
                    let filter_data = if changes.len() > 1 { None } else { filter_data };

                    for change in &changes {
                        let etw_session_id = change.session.etw_session_id;
                        log::debug!(
                            "provider {}: session changed {}:{}:{}",
                            self.provider_id,
                            change.session.session_id_bit,
                            etw_session_id,
                            change.enabling
                        );

                        let mut command = ControllerCommand::Update;
                        let mut arguments = None;
                        // Arguments are only read for sessions being added
                        if change.enabling {
                            if let Some(data) = data_from_controller(
                                &*self.transport,
                                &self.provider_id,
                                etw_session_id,
                                filter_data,
                            ) {
                                command = data.command;
                                arguments = Some(parse_arguments(&data.data));
                            }
                        }

                        self.dispatch(
                            command,
                            arguments.as_ref(),
                            change.signed_slot(),
                            etw_session_id,
                        );
                    }
                    return;
                }
                ControllerCommand::Update
            }
            EVENT_CONTROL_CODE_DISABLE_PROVIDER => {
                self.disable();
                ControllerCommand::Update
            }
            EVENT_CONTROL_CODE_CAPTURE_STATE => ControllerCommand::SendManifest,
            // Unknown control codes are ignored
            _ => return,
        };

        self.dispatch(command, None, 0, 0);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::loopback::LoopbackTransport;
    use crate::provider::{CallbackHandler, HandlerResult};
    use std::sync::atomic::AtomicUsize;

    fn control() -> ProviderControl {
        ProviderControl::new(
            Guid::from_u128(1),
            Arc::new(LoopbackTransport::new()),
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_level_gate() {
        let c = control();
        assert!(!c.is_enabled_for(0, 0));

        c.enable(4, u64::MAX, 0);
        assert!(c.is_enabled_for(1, 0));
        assert!(c.is_enabled_for(4, 0));
        assert!(!c.is_enabled_for(5, 0));

        c.enable(0, u64::MAX, 0);
        assert!(c.is_enabled_for(255, 0));
    }

    #[test]
    fn test_keyword_gate() {
        let c = control();
        c.enable(5, 0b0110, 0b0100);
        assert!(c.is_enabled_for(5, 0));
        assert!(c.is_enabled_for(5, 0b0100));
        assert!(c.is_enabled_for(5, 0b1100));
        assert!(!c.is_enabled_for(5, 0b0010));
        assert!(!c.is_enabled_for(5, 0b1000));
    }

    #[test]
    fn test_disable_resets_filters() {
        let c = control();
        c.enable(5, 0xff, 0x1);
        c.disable();
        assert!(!c.is_enabled());
        assert_eq!(c.level(), 0);
        assert_eq!(c.match_any_keyword(), 0);
        assert_eq!(c.match_all_keyword(), 0);
        assert!(c.live_sessions().is_empty());
    }

    #[test]
    fn test_dispose_wins_once() {
        let c = control();
        c.enable(5, 0xff, 0);
        assert!(c.begin_dispose());
        assert!(!c.begin_dispose());
        assert!(!c.is_enabled());

        // A late enable notification must not revive a disposed provider
        c.on_control(&Guid::zeroed(), EVENT_CONTROL_CODE_ENABLE_PROVIDER, 5, 0xff, 0, None);
        assert!(!c.is_enabled());
    }

    #[test]
    fn test_enable_after_dispose() {
        // The notification passed its disposed check before dispose ran
        let c = control();
        assert!(c.begin_dispose());
        c.enable(5, 0xff, 0);
        assert!(!c.is_enabled());
        assert!(!c.is_enabled_for(1, 0));
    }

    #[test]
    fn test_no_dispatch_after_dispose() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = CallbackHandler(
            move |_: ControllerCommand,
                  _: Option<&ControllerArguments>,
                  _: i32,
                  _: u32|
                  -> HandlerResult {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
        );
        let handlers: Vec<Arc<dyn ControllerCommandHandler>> = vec![Arc::new(handler)];
        let c = ProviderControl::new(
            Guid::from_u128(1),
            Arc::new(LoopbackTransport::new()),
            handlers,
            None,
        );

        c.dispatch(ControllerCommand::Update, None, 0, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        c.begin_dispose();
        c.dispatch(ControllerCommand::Update, None, 0, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload), "boom 42");
    }
}
