//! In-process tracing subsystem
//!
//! The loopback transport plays both roles of the tracing subsystem: controllers start sessions
//! and enable providers on it, and it records the events providers write. It is the default
//! transport of [`EventProvider`](crate::provider::EventProvider) and what the test-suite drives.
//!
//! Control notifications are delivered synchronously, from the thread issuing the controller
//! operation, without holding the transport state lock. Controller operations are serialized from
//! the state change to the last delivered notification, so providers observe them in order. A
//! handler must not issue controller operations, nor register providers, on the transport that
//! notifies it.
//!
//! Recorded events are kept in a bounded buffer: once it is full, the oldest event is dropped.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use widestring::{U16CStr, U16Str};

use super::etw_types::{
    EventDataDescriptor, EventDescriptor, FilterData, RegistrationHandle,
    ERROR_ARITHMETIC_OVERFLOW, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_SUCCESS,
    EVENT_CONTROL_CODE_CAPTURE_STATE, EVENT_CONTROL_CODE_DISABLE_PROVIDER,
    EVENT_CONTROL_CODE_ENABLE_PROVIDER, MAX_EVENT_SIZE,
};
use super::time::FileTime;
use super::transport::{ControlCallback, EventTransport};
use crate::guid::Guid;
use crate::provider::SessionMask;
use crate::utils;

static GLOBAL_TRANSPORT: Lazy<Arc<LoopbackTransport>> =
    Lazy::new(|| Arc::new(LoopbackTransport::new()));

/// How many events a transport keeps unless built with [`LoopbackTransport::with_capacity`]
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// The process-wide loopback transport, used by providers built without an explicit transport
pub fn global() -> Arc<LoopbackTransport> {
    GLOBAL_TRANSPORT.clone()
}

/// Identifier of a loopback session
pub type SessionId = u32;

/// How a session enables a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EnableParameters {
    pub level: u8,
    pub match_any_keyword: u64,
    pub match_all_keyword: u64,
}

impl EnableParameters {
    /// Enable every keyword up to `level`
    pub fn new(level: u8) -> Self {
        EnableParameters {
            level,
            match_any_keyword: u64::MAX,
            match_all_keyword: 0,
        }
    }

    pub fn with_keywords(mut self, match_any_keyword: u64, match_all_keyword: u64) -> Self {
        self.match_any_keyword = match_any_keyword;
        self.match_all_keyword = match_all_keyword;
        self
    }

    /// Claim an activity-tracing session slot (`1..=4`), replacing any previous claim
    pub fn with_session_slot(mut self, slot: i32) -> Self {
        self.match_all_keyword = (self.match_all_keyword & !SessionMask::ALL.to_keywords())
            | SessionMask::from_slot(slot).to_keywords();
        self
    }

    /// The `MatchAllKeyword` used for event filtering: the session slot bits are reserved
    fn filter_all_keyword(&self) -> u64 {
        self.match_all_keyword & !SessionMask::ALL.to_keywords()
    }

    fn accepts(&self, level: u8, keywords: u64) -> bool {
        if level > self.level && self.level != 0 {
            return false;
        }
        let all = self.filter_all_keyword();
        keywords == 0 || ((keywords & self.match_any_keyword) != 0 && (keywords & all) == all)
    }
}

impl Default for EnableParameters {
    fn default() -> Self {
        EnableParameters::new(0)
    }
}

/// An event written to the loopback transport
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecordedEvent {
    pub provider_id: Guid,
    pub descriptor: EventDescriptor,
    pub activity_id: Option<Guid>,
    pub related_activity_id: Option<Guid>,
    /// One entry per data descriptor
    pub fields: Vec<Vec<u8>>,
    /// Set for events written as a single string
    pub message: Option<String>,
    /// The sessions whose filters accepted the event
    pub sessions: Vec<SessionId>,
    pub timestamp: FileTime,
}

impl RecordedEvent {
    pub fn field(&self, index: usize) -> Option<&[u8]> {
        self.fields.get(index).map(|f| f.as_slice())
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn payload_size(&self) -> usize {
        self.fields.iter().map(|f| f.len()).sum()
    }

    pub fn field_i32(&self, index: usize) -> Option<i32> {
        let bytes = self.field(index)?;
        Some(i32::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn field_u32(&self, index: usize) -> Option<u32> {
        let bytes = self.field(index)?;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn field_i64(&self, index: usize) -> Option<i64> {
        let bytes = self.field(index)?;
        Some(i64::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn field_u64(&self, index: usize) -> Option<u64> {
        let bytes = self.field(index)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn field_f64(&self, index: usize) -> Option<f64> {
        let bytes = self.field(index)?;
        Some(f64::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Decodes a NUL-terminated UTF-16 field
    pub fn field_string(&self, index: usize) -> Option<String> {
        let bytes = self.field(index)?;
        if bytes.len() % 2 != 0 {
            return None;
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Some(U16Str::from_slice(&units).to_string_lossy())
    }
}

struct Registration {
    provider_id: Guid,
    callback: Arc<dyn ControlCallback>,
}

struct Session {
    name: String,
    providers: HashMap<Guid, EnableParameters>,
}

#[derive(Default)]
struct LoopbackState {
    registrations: HashMap<RegistrationHandle, Registration>,
    sessions: BTreeMap<SessionId, Session>,
    next_session_id: SessionId,
    controller_data: HashMap<(Guid, SessionId), Vec<u8>>,
    events: VecDeque<RecordedEvent>,
    registration_failure: Option<u32>,
    write_failure: Option<u32>,
}

impl LoopbackState {
    /// Combined filters of every session enabling `provider_id`
    ///
    /// The most verbose level wins (`0` meaning every level), `any` masks are OR-ed and `all`
    /// masks AND-ed.
    fn aggregate(&self, provider_id: &Guid) -> Option<EnableParameters> {
        self.sessions
            .values()
            .filter_map(|s| s.providers.get(provider_id))
            .fold(None, |acc: Option<EnableParameters>, p| {
                Some(match acc {
                    None => EnableParameters {
                        level: p.level,
                        match_any_keyword: p.match_any_keyword,
                        match_all_keyword: p.filter_all_keyword(),
                    },
                    Some(acc) => EnableParameters {
                        level: if acc.level == 0 || p.level == 0 {
                            0
                        } else {
                            acc.level.max(p.level)
                        },
                        match_any_keyword: acc.match_any_keyword | p.match_any_keyword,
                        match_all_keyword: acc.match_all_keyword & p.filter_all_keyword(),
                    },
                })
            })
    }

    fn registrations_of(&self, provider_id: &Guid) -> Vec<Arc<dyn ControlCallback>> {
        self.registrations
            .values()
            .filter(|r| r.provider_id == *provider_id)
            .map(|r| r.callback.clone())
            .collect()
    }

    /// The notification telling the registrations of `provider_id` about its current state
    fn state_notification(&self, provider_id: &Guid, source_id: Guid) -> Notification {
        match self.aggregate(provider_id) {
            Some(params) => Notification {
                source_id,
                control_code: EVENT_CONTROL_CODE_ENABLE_PROVIDER,
                params,
                filter: None,
                targets: self.registrations_of(provider_id),
            },
            None => Notification {
                source_id,
                control_code: EVENT_CONTROL_CODE_DISABLE_PROVIDER,
                params: EnableParameters::new(0).with_keywords(0, 0),
                filter: None,
                targets: self.registrations_of(provider_id),
            },
        }
    }

    fn provider_of(&self, handle: RegistrationHandle) -> Option<Guid> {
        self.registrations.get(&handle).map(|r| r.provider_id)
    }

    fn listening_sessions(&self, provider_id: &Guid, level: u8, keywords: u64) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| {
                s.providers
                    .get(provider_id)
                    .map_or(false, |p| p.accepts(level, keywords))
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

/// A control notification, computed under the state lock and delivered outside of it
struct Notification {
    source_id: Guid,
    control_code: u32,
    params: EnableParameters,
    filter: Option<(i32, Vec<u8>)>,
    targets: Vec<Arc<dyn ControlCallback>>,
}

impl Notification {
    fn deliver(self) {
        let filter = self.filter.as_ref().map(|(ty, data)| FilterData {
            ty: *ty,
            data: data.as_slice(),
        });
        for callback in &self.targets {
            callback.on_control(
                &self.source_id,
                self.control_code,
                self.params.level,
                self.params.match_any_keyword,
                self.params.match_all_keyword,
                filter,
            );
        }
    }
}

fn session_source_id(session: SessionId) -> Guid {
    Guid::from_u128(session as u128)
}

/// An in-process [`EventTransport`] with a controller API
pub struct LoopbackTransport {
    /// Held by controller operations until their notifications are delivered
    control: Mutex<()>,
    state: Mutex<LoopbackState>,
    event_capacity: usize,
    next_handle: AtomicU64,
    write_count: AtomicUsize,
    unregister_count: AtomicUsize,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("LoopbackTransport")
            .field("registrations", &state.registrations.len())
            .field("sessions", &state.sessions.len())
            .field("events", &state.events.len())
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// A transport keeping at most `event_capacity` recorded events
    pub fn with_capacity(event_capacity: usize) -> Self {
        LoopbackTransport {
            control: Mutex::new(()),
            state: Mutex::new(LoopbackState::default()),
            event_capacity,
            next_handle: AtomicU64::new(utils::random_handle_base()),
            write_count: AtomicUsize::new(0),
            unregister_count: AtomicUsize::new(0),
        }
    }

    /// Starts a session with a random name
    pub fn start_session(&self) -> SessionId {
        self.start_named_session(&utils::random_session_name())
    }

    pub fn start_named_session(&self, name: &str) -> SessionId {
        let mut state = self.state.lock().unwrap();
        state.next_session_id += 1;
        let id = state.next_session_id;
        state.sessions.insert(
            id,
            Session {
                name: name.to_string(),
                providers: HashMap::new(),
            },
        );
        log::debug!("started loopback session {} ({})", id, name);
        id
    }

    pub fn session_name(&self, session: SessionId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.sessions.get(&session).map(|s| s.name.clone())
    }

    /// Stops a session, which disables every provider it had enabled
    pub fn stop_session(&self, session: SessionId) -> u32 {
        let _control = self.control.lock().unwrap();
        let notifications = {
            let mut state = self.state.lock().unwrap();
            let stopped = match state.sessions.remove(&session) {
                Some(stopped) => stopped,
                None => return ERROR_INVALID_PARAMETER,
            };
            state.controller_data.retain(|(_, id), _| *id != session);
            stopped
                .providers
                .keys()
                .map(|provider_id| {
                    state.state_notification(provider_id, session_source_id(session))
                })
                .collect::<Vec<_>>()
        };

        log::debug!("stopped loopback session {}", session);
        notifications.into_iter().for_each(Notification::deliver);
        ERROR_SUCCESS
    }

    /// Enables (or updates) `provider_id` in `session`
    pub fn enable_provider(
        &self,
        session: SessionId,
        provider_id: &Guid,
        params: EnableParameters,
    ) -> u32 {
        self.enable_provider_impl(session, provider_id, params, None)
    }

    /// Enables `provider_id` in `session`, passing inline data to registered providers
    pub fn enable_provider_with_filter(
        &self,
        session: SessionId,
        provider_id: &Guid,
        params: EnableParameters,
        filter_type: i32,
        data: &[u8],
    ) -> u32 {
        self.enable_provider_impl(session, provider_id, params, Some((filter_type, data.to_vec())))
    }

    fn enable_provider_impl(
        &self,
        session: SessionId,
        provider_id: &Guid,
        params: EnableParameters,
        filter: Option<(i32, Vec<u8>)>,
    ) -> u32 {
        let _control = self.control.lock().unwrap();
        let notification = {
            let mut state = self.state.lock().unwrap();
            match state.sessions.get_mut(&session) {
                Some(s) => {
                    s.providers.insert(*provider_id, params);
                }
                None => return ERROR_INVALID_PARAMETER,
            }
            let mut notification =
                state.state_notification(provider_id, session_source_id(session));
            notification.filter = filter;
            notification
        };

        notification.deliver();
        ERROR_SUCCESS
    }

    /// Removes `provider_id` from `session`
    pub fn disable_provider(&self, session: SessionId, provider_id: &Guid) -> u32 {
        let _control = self.control.lock().unwrap();
        let notification = {
            let mut state = self.state.lock().unwrap();
            let removed = state
                .sessions
                .get_mut(&session)
                .and_then(|s| s.providers.remove(provider_id));
            if removed.is_none() {
                return ERROR_INVALID_PARAMETER;
            }
            state.state_notification(provider_id, session_source_id(session))
        };

        notification.deliver();
        ERROR_SUCCESS
    }

    /// Asks the providers enabled by `session` to log their state
    pub fn capture_state(&self, session: SessionId, provider_id: &Guid) -> u32 {
        let _control = self.control.lock().unwrap();
        let notification = {
            let state = self.state.lock().unwrap();
            let params = match state
                .sessions
                .get(&session)
                .and_then(|s| s.providers.get(provider_id))
            {
                Some(params) => *params,
                None => return ERROR_INVALID_PARAMETER,
            };
            Notification {
                source_id: session_source_id(session),
                control_code: EVENT_CONTROL_CODE_CAPTURE_STATE,
                params,
                filter: None,
                targets: state.registrations_of(provider_id),
            }
        };

        notification.deliver();
        ERROR_SUCCESS
    }

    /// Sends an arbitrary control notification to the registrations of `provider_id`.
    ///
    /// Session state is left untouched.
    pub fn send_control(
        &self,
        provider_id: &Guid,
        control_code: u32,
        params: EnableParameters,
        filter: Option<FilterData<'_>>,
    ) {
        let _control = self.control.lock().unwrap();
        let targets = self.state.lock().unwrap().registrations_of(provider_id);
        Notification {
            source_id: Guid::zeroed(),
            control_code,
            params,
            filter: filter.map(|f| (f.ty, f.data.to_vec())),
            targets,
        }
        .deliver();
    }

    /// Persists controller data, for providers that register after the session was configured
    pub fn set_controller_data(&self, provider_id: &Guid, session: SessionId, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.controller_data.insert((*provider_id, session), data);
    }

    pub fn clear_controller_data(&self, provider_id: &Guid, session: SessionId) {
        let mut state = self.state.lock().unwrap();
        state.controller_data.remove(&(*provider_id, session));
    }

    /// Makes every following registration fail with `status`, until called with `None`
    pub fn fail_registrations(&self, status: Option<u32>) {
        self.state.lock().unwrap().registration_failure = status;
    }

    /// Makes every following write fail with `status`, until called with `None`
    pub fn fail_writes(&self, status: Option<u32>) {
        self.state.lock().unwrap().write_failure = status;
    }

    /// The recorded events still held, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.iter().cloned().collect()
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    pub fn events_for(&self, provider_id: &Guid) -> Vec<RecordedEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.provider_id == *provider_id)
            .cloned()
            .collect()
    }

    pub fn clear_events(&self) {
        self.state.lock().unwrap().events.clear();
    }

    /// How many writes reached the transport successfully
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }

    /// How many registrations were successfully unregistered
    pub fn unregister_count(&self) -> usize {
        self.unregister_count.load(Ordering::Relaxed)
    }

    pub fn registration_count(&self) -> usize {
        self.state.lock().unwrap().registrations.len()
    }

    fn record(
        &self,
        handle: RegistrationHandle,
        descriptor: &EventDescriptor,
        activity_id: Option<&Guid>,
        related_activity_id: Option<&Guid>,
        fields: Vec<Vec<u8>>,
        message: Option<String>,
    ) -> u32 {
        let mut state = self.state.lock().unwrap();
        let provider_id = match state.provider_of(handle) {
            Some(provider_id) => provider_id,
            None => return ERROR_INVALID_HANDLE,
        };
        if let Some(status) = state.write_failure {
            return status;
        }
        if fields.iter().map(|f| f.len()).sum::<usize>() > MAX_EVENT_SIZE {
            return ERROR_ARITHMETIC_OVERFLOW;
        }

        self.write_count.fetch_add(1, Ordering::Relaxed);
        if self.event_capacity == 0 {
            return ERROR_SUCCESS;
        }
        if state.events.len() >= self.event_capacity {
            state.events.pop_front();
        }
        let sessions = state.listening_sessions(&provider_id, descriptor.level, descriptor.keyword);
        state.events.push_back(RecordedEvent {
            provider_id,
            descriptor: *descriptor,
            activity_id: activity_id.copied(),
            related_activity_id: related_activity_id.copied(),
            fields,
            message,
            sessions,
            timestamp: FileTime::now(),
        });
        ERROR_SUCCESS
    }
}

impl EventTransport for LoopbackTransport {
    fn register(
        &self,
        provider_id: &Guid,
        callback: Arc<dyn ControlCallback>,
    ) -> Result<RegistrationHandle, u32> {
        let _control = self.control.lock().unwrap();
        let (handle, notification) = {
            let mut state = self.state.lock().unwrap();
            if let Some(status) = state.registration_failure {
                return Err(status);
            }
            if provider_id.is_zero() {
                return Err(ERROR_INVALID_PARAMETER);
            }

            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            state.registrations.insert(
                handle,
                Registration {
                    provider_id: *provider_id,
                    callback: callback.clone(),
                },
            );

            // Sessions that enabled the provider before it registered
            let notification = state.aggregate(provider_id).map(|params| Notification {
                source_id: Guid::zeroed(),
                control_code: EVENT_CONTROL_CODE_ENABLE_PROVIDER,
                params,
                filter: None,
                targets: vec![callback],
            });
            (handle, notification)
        };

        if let Some(notification) = notification {
            notification.deliver();
        }
        Ok(handle)
    }

    fn unregister(&self, handle: RegistrationHandle) -> u32 {
        let removed = self.state.lock().unwrap().registrations.remove(&handle);
        match removed {
            Some(registration) => {
                log::debug!(
                    "unregistered provider {} (handle {:#x})",
                    registration.provider_id,
                    handle
                );
                self.unregister_count.fetch_add(1, Ordering::Relaxed);
                ERROR_SUCCESS
            }
            None => ERROR_INVALID_HANDLE,
        }
    }

    fn write(
        &self,
        handle: RegistrationHandle,
        descriptor: &EventDescriptor,
        data: &[EventDataDescriptor<'_>],
    ) -> u32 {
        self.write_transfer(handle, descriptor, None, None, data)
    }

    fn write_transfer(
        &self,
        handle: RegistrationHandle,
        descriptor: &EventDescriptor,
        activity_id: Option<&Guid>,
        related_activity_id: Option<&Guid>,
        data: &[EventDataDescriptor<'_>],
    ) -> u32 {
        let fields = data.iter().map(|d| d.as_bytes().to_vec()).collect();
        self.record(
            handle,
            descriptor,
            activity_id,
            related_activity_id,
            fields,
            None,
        )
    }

    fn write_string(
        &self,
        handle: RegistrationHandle,
        level: u8,
        keywords: u64,
        message: &U16CStr,
    ) -> u32 {
        let descriptor = EventDescriptor {
            level,
            keyword: keywords,
            ..Default::default()
        };
        let field = message
            .as_slice_with_nul()
            .iter()
            .flat_map(|u| u.to_ne_bytes())
            .collect();
        self.record(
            handle,
            &descriptor,
            None,
            None,
            vec![field],
            Some(message.to_string_lossy()),
        )
    }

    fn enumerate_sessions(&self, provider_id: &Guid) -> Result<Vec<(u32, u64)>, u32> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .filter_map(|(id, s)| s.providers.get(provider_id).map(|p| (*id, p.match_all_keyword)))
            .collect())
    }

    fn controller_data(&self, provider_id: &Guid, session_id: u32) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.controller_data.get(&(*provider_id, session_id)).cloned()
    }
}
