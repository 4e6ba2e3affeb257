//! Tracking of the controller sessions listening to a provider
//!
//! Activity-tracing-aware sessions identify themselves by setting exactly one bit of a reserved
//! range of the `MatchAllKeyword` value they enable the provider with. Sessions that set none of
//! these bits are "legacy" sessions, and share a dedicated slot.
use std::sync::Arc;

use arc_swap::ArcSwap;

/// First keyword bit of the reserved session range
pub const SESSION_MASK_SHIFT: u32 = 44;

bitflags! {
    /// The reserved session bits of a keyword mask, shifted down to bit 0
    pub struct SessionMask: u32 {
        const SESSION_1 = 0x1;
        const SESSION_2 = 0x2;
        const SESSION_3 = 0x4;
        const SESSION_4 = 0x8;
        const ALL = Self::SESSION_1.bits
            | Self::SESSION_2.bits
            | Self::SESSION_3.bits
            | Self::SESSION_4.bits;
    }
}

impl SessionMask {
    /// Extracts the reserved session bits of `keywords`
    pub fn from_keywords(keywords: u64) -> Self {
        SessionMask::from_bits_truncate((keywords >> SESSION_MASK_SHIFT) as u32)
    }

    /// Places these bits back in the reserved range of a keyword mask
    pub fn to_keywords(self) -> u64 {
        (self.bits() as u64) << SESSION_MASK_SHIFT
    }

    /// The mask for a 1-based session slot. Legacy and out of range slots map to an empty mask.
    pub fn from_slot(slot: i32) -> Self {
        if slot < 1 || slot > Self::max_slots() {
            return SessionMask::empty();
        }
        SessionMask::from_bits_truncate(1 << (slot - 1))
    }

    /// How many activity-tracing-aware sessions can be told apart
    pub fn max_slots() -> i32 {
        SessionMask::ALL.bits().count_ones() as i32
    }

    /// The slot shared by every legacy session
    pub fn legacy_slot() -> i32 {
        Self::max_slots() + 1
    }
}

/// One controller session watching this provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionInfo {
    /// 1-based index of the reserved keyword bit used by the session, or
    /// [`SessionMask::legacy_slot`]
    pub session_id_bit: i32,
    /// The machine-wide session id assigned by the transport
    pub etw_session_id: u32,
}

impl SessionInfo {
    pub fn new(session_id_bit: i32, etw_session_id: u32) -> Self {
        SessionInfo {
            session_id_bit,
            etw_session_id,
        }
    }

    /// Derives the session slot from the `MatchAllKeyword` a session enabled the provider with.
    ///
    /// Returns `None` for sessions that set more than one reserved bit: these cannot be attributed
    /// to a single slot and are ignored.
    pub fn from_keywords(etw_session_id: u32, match_all_keyword: u64) -> Option<Self> {
        let mask = SessionMask::from_keywords(match_all_keyword);
        match mask.bits().count_ones() {
            0 => Some(SessionInfo::new(SessionMask::legacy_slot(), etw_session_id)),
            1 => Some(SessionInfo::new(
                mask.bits().trailing_zeros() as i32 + 1,
                etw_session_id,
            )),
            _ => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.session_id_bit == SessionMask::legacy_slot()
    }
}

/// A session that appeared in, or disappeared from, the set of live sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionChange {
    pub session: SessionInfo,
    /// `true` when the session was added, `false` when it went away
    pub enabling: bool,
}

impl SessionChange {
    /// The slot, negated for removed sessions
    pub fn signed_slot(&self) -> i32 {
        if self.enabling {
            self.session.session_id_bit
        } else {
            -self.session.session_id_bit
        }
    }
}

/// Keeps the last known set of live sessions and computes what changed since then
///
/// The set is an immutable snapshot, replaced as a whole on every update, so that readers always
/// observe a consistent list.
#[derive(Debug, Default)]
pub struct SessionTracker {
    live: ArcSwap<Vec<SessionInfo>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// The sessions seen by the last update
    pub fn live_sessions(&self) -> Arc<Vec<SessionInfo>> {
        self.live.load_full()
    }

    /// Forgets every live session
    pub fn clear(&self) {
        self.live.store(Arc::new(Vec::new()));
    }

    /// Replaces the live sessions with `current` and returns the differences.
    ///
    /// `current` yields `(etw_session_id, match_all_keyword)` pairs. Removed (or changed) sessions
    /// come first, followed by added (or changed) ones.
    ///
    /// Must not be called concurrently with itself, which the control callback contract guarantees.
    pub fn compute_delta<I>(&self, current: I) -> Vec<SessionChange>
    where
        I: IntoIterator<Item = (u32, u64)>,
    {
        let new_sessions: Vec<SessionInfo> = current
            .into_iter()
            .filter_map(|(etw_session_id, match_all_keyword)| {
                let session = SessionInfo::from_keywords(etw_session_id, match_all_keyword);
                if session.is_none() {
                    log::debug!(
                        "ignoring session {} with ambiguous keywords {:#x}",
                        etw_session_id,
                        match_all_keyword
                    );
                }
                session
            })
            .collect();

        let previous = self.live.load_full();
        let mut changes = Vec::new();

        for old in previous.iter() {
            if !contains_same(&new_sessions, old) {
                changes.push(SessionChange {
                    session: *old,
                    enabling: false,
                });
            }
        }
        for new in new_sessions.iter() {
            if !contains_same(&previous, new) {
                changes.push(SessionChange {
                    session: *new,
                    enabling: true,
                });
            }
        }

        self.live.store(Arc::new(new_sessions));
        changes
    }
}

/// Whether `sessions` has a session with the same id *and* the same slot
fn contains_same(sessions: &[SessionInfo], session: &SessionInfo) -> bool {
    sessions
        .iter()
        .find(|s| s.etw_session_id == session.etw_session_id)
        .map_or(false, |s| s.session_id_bit == session.session_id_bit)
}
