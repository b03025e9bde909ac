//! Live signing sessions for long-running services.
//!
//! Sessions sit in an arena of generation-checked slots behind one lock. A
//! [`SessionId`] names a slot *and* the generation it was issued for, so an id
//! whose session was closed or evicted can never resolve to a newer session
//! that reused the slot.
//!
//! Each session is handed out as `Arc<Mutex<SigningSession>>`: the store lock
//! only guards lookup, insert and eviction, and operations on one session are
//! serialized by that session's own mutex.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use bitcoin::{Transaction, TxOut};

use crate::error::ThreshError;
use crate::policy::MultiSigPolicy;
use crate::session::SigningSession;

/// Inactivity timeout after which a session is evicted.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub type SharedSession = Arc<Mutex<SigningSession>>;

/// Opaque handle to a stored session. Displays as 16 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:08x}", self.index, self.generation)
    }
}

impl FromStr for SessionId {
    type Err = ThreshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ThreshError::Serialization(format!("invalid session id: {}", s));
        if s.len() != 16 || !s.is_ascii() {
            return Err(invalid());
        }
        let index = u32::from_str_radix(&s[..8], 16).map_err(|_| invalid())?;
        let generation = u32::from_str_radix(&s[8..], 16).map_err(|_| invalid())?;
        Ok(Self { index, generation })
    }
}

struct Stored {
    session: SharedSession,
    last_access: Instant,
}

struct Slot {
    generation: u32,
    entry: Option<Stored>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    fn insert(&mut self, stored: Stored) -> SessionId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(stored);
            return SessionId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(stored),
        });
        SessionId {
            index,
            generation: 0,
        }
    }

    fn slot_mut(&mut self, id: SessionId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.entry.is_some())
    }

    fn session(&mut self, id: SessionId) -> Option<SharedSession> {
        self.slot_mut(id)?
            .entry
            .as_ref()
            .map(|stored| stored.session.clone())
    }

    fn remove(&mut self, id: SessionId) -> Option<SharedSession> {
        let slot = self.slot_mut(id)?;
        let stored = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(stored.session)
    }

    fn expired(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let stored = slot.entry.as_ref()?;
                (now.saturating_duration_since(stored.last_access) > timeout).then_some(SessionId {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect()
    }
}

/// Thread-safe table of signing sessions with inactivity eviction.
pub struct SessionStore {
    timeout: Duration,
    arena: Mutex<Arena>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("timeout", &self.timeout)
            .field("live", &self.len())
            .finish()
    }
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            arena: Mutex::new(Arena::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a new session for `tx` and return its id.
    ///
    /// Expired sessions are evicted first; any whose lock is currently held
    /// are left for a later pass.
    pub fn create(
        &self,
        policy: Arc<MultiSigPolicy>,
        tx: Transaction,
        prevouts: Vec<TxOut>,
    ) -> Result<SessionId, ThreshError> {
        let session = SigningSession::new(policy, tx, prevouts)?;
        Ok(self.insert(session))
    }

    /// Store an already configured session, evicting expired ones as
    /// [`create`](Self::create) does.
    pub fn insert(&self, session: SigningSession) -> SessionId {
        self.insert_at(session, Instant::now())
    }

    fn insert_at(&self, session: SigningSession, now: Instant) -> SessionId {
        self.evict_expired_at(now);
        let id = self.lock().insert(Stored {
            session: Arc::new(Mutex::new(session)),
            last_access: now,
        });
        log::info!("session {} created", id);
        id
    }

    /// Look up a live session and refresh its inactivity timer.
    pub fn get(&self, id: SessionId) -> Result<SharedSession, ThreshError> {
        self.get_at(id, Instant::now())
    }

    fn get_at(&self, id: SessionId, now: Instant) -> Result<SharedSession, ThreshError> {
        let mut arena = self.lock();
        let slot = arena.slot_mut(id).ok_or(ThreshError::SessionNotFound(id))?;
        let stored = slot.entry.as_mut().ok_or(ThreshError::SessionNotFound(id))?;

        if now.saturating_duration_since(stored.last_access) > self.timeout {
            let session = stored.session.clone();
            if try_discard(&session) {
                arena.remove(id);
                log::debug!("session {} expired on access", id);
            } else {
                log::debug!("session {} expired while in use; eviction deferred", id);
            }
            return Err(ThreshError::SessionNotFound(id));
        }

        stored.last_access = now;
        Ok(stored.session.clone())
    }

    /// Remove a session and wipe its remaining private nonces.
    ///
    /// Must not be called while holding that session's lock.
    pub fn close(&self, id: SessionId) -> Result<(), ThreshError> {
        let session = self.lock().remove(id).ok_or(ThreshError::SessionNotFound(id))?;
        discard(&session);
        log::info!("session {} closed", id);
        Ok(())
    }

    /// Close every session idle for longer than the timeout.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    /// Sessions whose lock is held elsewhere are skipped and retried on a
    /// later pass, so the calling thread may still hold a session guard.
    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut arena = self.lock();
        let mut evicted = 0;
        for id in arena.expired(now, self.timeout) {
            let Some(session) = arena.session(id) else {
                continue;
            };
            if !try_discard(&session) {
                log::debug!("session {} expired while in use; eviction deferred", id);
                continue;
            }
            arena.remove(id);
            evicted += 1;
            log::debug!("session {} evicted after {:?} idle", id, self.timeout);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wipe private nonces only if nobody holds the session's lock.
fn try_discard(session: &SharedSession) -> bool {
    match session.try_lock() {
        Ok(mut guard) => guard.discard_secrets(),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().discard_secrets(),
        Err(TryLockError::WouldBlock) => return false,
    }
    true
}

fn discard(session: &SharedSession) {
    session
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .discard_secrets();
}
