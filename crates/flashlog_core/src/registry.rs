//! The set of live sessions and guarded access to their staging state.
//!
//! ## Locking
//!
//! Two lock domains are involved:
//!
//! - the registry lock guards session existence, status and the reference
//!   counts of producers inside a session
//! - each session's `active` lock guards its staging buffer
//!
//! Access takes the registry lock, checks the session and counts a
//! reference, releases the registry lock and only then takes the session
//! lock. Release runs the other way: with the session lock still held it
//! retakes the registry lock, drops the reference and, if the session was
//! finished meanwhile and this was the last reference, tears the staging
//! state down. The registry only ever takes a session lock itself when the
//! count is zero, so nobody can be holding it.
//!
//! The flash engine's lock is a leaf below both.

use crate::buffer::ActiveBuffer;
use crate::comm::CommState;
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::storage::{FileHeader, StorageEngine};
use crate::types::{
    BufferMode, CreateParams, OwnerTask, SessionHandle, SessionId, SessionMeta, SessionStatus,
};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Staging state of a session that still accepts records.
#[derive(Debug)]
pub struct ActiveState {
    buffer: Option<ActiveBuffer>,
    flush_pending: bool,
}

impl ActiveState {
    /// Returns the staging buffer, if the session is buffered.
    pub fn buffer(&self) -> Option<&ActiveBuffer> {
        self.buffer.as_ref()
    }

    /// Returns true while a flush job is queued.
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }
}

/// A live session.
#[derive(Debug)]
pub struct Session {
    meta: SessionMeta,
    active: Mutex<Option<ActiveState>>,
    comm: Mutex<CommState>,
}

impl Session {
    /// Returns the immutable session description.
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Returns the session id.
    pub fn id(&self) -> SessionId {
        self.meta.id
    }

    /// Locks the host communication state.
    ///
    /// Callers may take the registry and engine locks while holding it, never
    /// the other way round.
    pub fn comm(&self) -> MutexGuard<'_, CommState> {
        self.comm.lock()
    }

    /// Returns the number of bytes staged in memory and not yet on flash.
    pub fn staged_bytes(&self) -> usize {
        self.active
            .lock()
            .as_ref()
            .and_then(ActiveState::buffer)
            .map_or(0, ActiveBuffer::len)
    }
}

/// Result of a successful `log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    /// The records went straight to flash.
    Written,
    /// The records were staged in memory.
    Buffered {
        /// True if the caller must queue a flush job. At most one is
        /// requested until that job runs.
        schedule_flush: bool,
    },
}

/// How [`SessionRegistry::find_or_create`] satisfied a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// No Active session had the tag and owner; a new one was created.
    Created(SessionMeta),
    /// The Active session with the same tag, owner and item type is reused.
    Resumed(SessionMeta),
    /// The Active session with the same tag and owner was finished and a
    /// new one created in its place.
    Replaced {
        /// The new session.
        meta: SessionMeta,
        /// The session that was finished.
        finished: SessionMeta,
    },
}

impl CreateOutcome {
    /// Returns the session the caller should use.
    #[must_use]
    pub fn meta(&self) -> &SessionMeta {
        match self {
            Self::Created(meta) | Self::Resumed(meta) | Self::Replaced { meta, .. } => meta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// A producer call. The session must be Active.
    Producer,
    /// The deferred flush. The staging state must still exist.
    Flush,
}

#[derive(Debug)]
struct Entry {
    session: Arc<Session>,
    status: SessionStatus,
    refs: u32,
    teardown_pending: bool,
    has_active: bool,
}

struct RegistryState {
    entries: BTreeMap<SessionId, Entry>,
    rng: Box<dyn RngCore + Send>,
    next_serial: u64,
}

/// Owns every live session, keyed and iterated by id.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    engine: Arc<StorageEngine>,
    config: EngineConfig,
}

impl SessionRegistry {
    /// Creates an empty registry drawing ids from an entropy-seeded RNG.
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self::with_rng(engine, StdRng::from_entropy())
    }

    /// Creates an empty registry drawing ids from `rng`.
    pub fn with_rng(engine: Arc<StorageEngine>, rng: impl RngCore + Send + 'static) -> Self {
        let config = engine.config().clone();
        Self {
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                rng: Box::new(rng),
                next_serial: 1,
            }),
            engine,
            config,
        }
    }

    /// Returns the storage engine sessions write to.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Creates an Active session.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Validation`] for an invalid item type or buffer choice
    /// - [`CoreError::ResourceExhausted`] if the session limit is reached
    ///
    /// # Panics
    ///
    /// Panics if no free id is found within the configured number of draws,
    /// which means the RNG cannot reach the free ids.
    pub fn create(&self, mut params: CreateParams, timestamp: u32) -> CoreResult<SessionMeta> {
        let buffer = self.prepare_buffer(&mut params)?;
        let mut state = self.state.lock();
        self.insert_session(&mut state, params, buffer, timestamp)
    }

    /// Creates a session unless an Active one with the same tag and owner
    /// exists, all under one registry lock.
    ///
    /// With `resume` set and a matching item type the existing session is
    /// returned. Otherwise it is finished, as by [`SessionRegistry::finish`],
    /// and a new session takes its place.
    ///
    /// # Errors
    ///
    /// Same as [`SessionRegistry::create`]. A session limit error leaves the
    /// existing session untouched.
    pub fn find_or_create(
        &self,
        mut params: CreateParams,
        timestamp: u32,
        resume: bool,
    ) -> CoreResult<CreateOutcome> {
        let buffer = self.prepare_buffer(&mut params)?;
        let mut state = self.state.lock();
        let existing = state
            .entries
            .values()
            .find(|entry| {
                entry.status == SessionStatus::Active
                    && entry.session.meta.tag == params.tag
                    && entry.session.meta.owner == params.owner
            })
            .map(|entry| entry.session.meta.clone());
        let Some(existing) = existing else {
            return self
                .insert_session(&mut state, params, buffer, timestamp)
                .map(CreateOutcome::Created);
        };
        if resume && existing.item == params.item {
            debug!(session = %existing.id, "resuming existing session");
            return Ok(CreateOutcome::Resumed(existing));
        }

        Self::check_capacity(&state, self.config.max_sessions)?;
        if let Some(entry) = state.entries.get_mut(&existing.id) {
            self.close_entry(entry);
        }
        let meta = self.insert_session(&mut state, params, buffer, timestamp)?;
        info!(session = %meta.id, replaced = %existing.id, "session replaced");
        Ok(CreateOutcome::Replaced {
            meta,
            finished: existing,
        })
    }

    /// Validates the item type and buffer choice and takes the buffer out of
    /// `params`.
    fn prepare_buffer(&self, params: &mut CreateParams) -> CoreResult<Option<ActiveBuffer>> {
        params.item.validate(params.buffer.is_buffered(), &self.config)?;
        let item_size = usize::from(params.item.size);
        let buffer = match std::mem::replace(&mut params.buffer, BufferMode::Unbuffered) {
            BufferMode::Unbuffered => None,
            BufferMode::EngineAllocated => {
                if params.task != OwnerTask::System {
                    return Err(CoreError::validation(
                        "engine-allocated buffers are reserved for system owners",
                    ));
                }
                Some(ActiveBuffer::with_capacity(
                    self.config.engine_buffer_size.max(item_size),
                ))
            }
            BufferMode::Provided(memory) => {
                if memory.len() < item_size {
                    return Err(CoreError::validation(format!(
                        "buffer of {} bytes cannot hold one {item_size}-byte item",
                        memory.len()
                    )));
                }
                Some(ActiveBuffer::new(memory))
            }
        };
        Ok(buffer)
    }

    fn check_capacity(state: &RegistryState, max_sessions: usize) -> CoreResult<()> {
        if state.entries.len() >= max_sessions {
            return Err(CoreError::resource_exhausted(format!(
                "{} sessions already live",
                state.entries.len()
            )));
        }
        Ok(())
    }

    fn insert_session(
        &self,
        state: &mut RegistryState,
        params: CreateParams,
        buffer: Option<ActiveBuffer>,
        timestamp: u32,
    ) -> CoreResult<SessionMeta> {
        Self::check_capacity(state, self.config.max_sessions)?;
        let buffered = buffer.is_some();
        let id = Self::allocate_id(state, self.config.id_attempts);
        let serial = state.next_serial;
        state.next_serial += 1;

        let meta = SessionMeta {
            id,
            serial,
            tag: params.tag,
            owner: params.owner,
            task: params.task,
            item: params.item,
            timestamp,
            buffered,
        };
        self.engine.register(FileHeader {
            session_id: id,
            timestamp,
            tag: meta.tag,
            owner: meta.owner,
            item: meta.item,
        });
        state.entries.insert(
            id,
            Entry {
                session: Arc::new(Session {
                    meta: meta.clone(),
                    active: Mutex::new(Some(ActiveState {
                        buffer,
                        flush_pending: false,
                    })),
                    comm: Mutex::new(CommState::new()),
                }),
                status: SessionStatus::Active,
                refs: 0,
                teardown_pending: false,
                has_active: true,
            },
        );
        info!(session = %id, tag = meta.tag, buffered, "session created");
        Ok(meta)
    }

    fn allocate_id(state: &mut RegistryState, attempts: u32) -> SessionId {
        for _ in 0..attempts {
            let id = SessionId::new(state.rng.gen::<u8>());
            if !state.entries.contains_key(&id) {
                return id;
            }
        }
        panic!("no free session id after {attempts} draws");
    }

    /// Adds an Inactive session for a log restored from flash.
    ///
    /// The owning task is unknown after a restart; restored sessions only
    /// deliver their remaining bytes.
    pub fn restore(&self, header: &FileHeader) -> SessionMeta {
        let mut state = self.state.lock();
        let serial = state.next_serial;
        state.next_serial += 1;
        let meta = SessionMeta {
            id: header.session_id,
            serial,
            tag: header.tag,
            owner: header.owner,
            task: OwnerTask::App,
            item: header.item,
            timestamp: header.timestamp,
            buffered: false,
        };
        state.entries.insert(
            meta.id,
            Entry {
                session: Arc::new(Session {
                    meta: meta.clone(),
                    active: Mutex::new(None),
                    comm: Mutex::new(CommState::new()),
                }),
                status: SessionStatus::Inactive,
                refs: 0,
                teardown_pending: false,
                has_active: false,
            },
        );
        debug!(session = %meta.id, tag = meta.tag, "session restored");
        meta
    }

    /// Returns the session with `id`.
    pub fn find(&self, id: SessionId) -> Option<Arc<Session>> {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Returns the session a handle refers to, unless it was deleted.
    pub fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.find(handle.id)
            .filter(|session| session.meta.serial == handle.serial)
    }

    /// Returns the Active session with `tag` and `owner`.
    pub fn find_active(&self, tag: u32, owner: &Uuid) -> Option<SessionMeta> {
        self.state
            .lock()
            .entries
            .values()
            .find(|entry| {
                entry.status == SessionStatus::Active
                    && entry.session.meta.tag == tag
                    && entry.session.meta.owner == *owner
            })
            .map(|entry| entry.session.meta.clone())
    }

    /// Returns true if the handle refers to a live session.
    pub fn is_valid(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Returns a session's status.
    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        self.state.lock().entries.get(&id).map(|entry| entry.status)
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every live session in id order.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| Arc::clone(&entry.session))
            .collect()
    }

    /// Calls `f` for every live session in id order.
    ///
    /// Runs over a snapshot without the registry lock, so `f` may call back
    /// into the registry.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        for session in self.sessions() {
            f(&session);
        }
    }

    /// Appends records to a session.
    ///
    /// `data` must hold whole items. Unbuffered sessions write to flash
    /// before returning.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Validation`] for empty or misaligned data, or data
    ///   that can never fit the staging buffer; the buffer is unchanged
    /// - [`CoreError::Busy`] if the staging buffer is too full right now
    /// - [`CoreError::UnknownSession`] or [`CoreError::SessionClosed`] for
    ///   stale handles and finished sessions
    /// - [`CoreError::ResourceExhausted`] if an unbuffered write cannot fit
    pub fn log(&self, handle: SessionHandle, data: &[u8]) -> CoreResult<LogOutcome> {
        self.with_active(handle, Access::Producer, |session, state| {
            let id = session.meta.id;
            let item = usize::from(session.meta.item.size);
            if data.is_empty() {
                return Err(CoreError::validation("no records given"));
            }
            if data.len() % item != 0 {
                return Err(CoreError::validation(format!(
                    "{} bytes is not a whole number of {item}-byte items",
                    data.len()
                )));
            }
            let Some(buffer) = state.buffer.as_mut() else {
                self.engine.write(id, data)?;
                return Ok(LogOutcome::Written);
            };
            if data.len() > buffer.capacity() {
                return Err(CoreError::validation(format!(
                    "{} bytes exceed the {}-byte staging buffer",
                    data.len(),
                    buffer.capacity()
                )));
            }
            if !buffer.push(data) {
                debug!(session = %id, bytes = data.len(), "staging buffer full");
                return Err(CoreError::Busy { session: id.as_u8() });
            }
            let schedule_flush = !state.flush_pending;
            state.flush_pending = true;
            Ok(LogOutcome::Buffered { schedule_flush })
        })?
    }

    /// Moves a session's staged records to flash. Returns the bytes moved.
    ///
    /// A session finished in the meantime has already been drained; that is
    /// reported as zero bytes.
    pub fn flush(&self, handle: SessionHandle) -> usize {
        let flushed = self.with_active(handle, Access::Flush, |session, state| {
            state.flush_pending = false;
            state
                .buffer
                .as_mut()
                .map_or(0, |buffer| self.write_staged(session.meta.id, buffer))
        });
        flushed.unwrap_or(0)
    }

    /// Closes a session to producers.
    ///
    /// Staged records reach flash before this returns unless another
    /// producer is inside the session, in which case that producer drains
    /// them on its way out.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownSession`] or [`CoreError::SessionClosed`]
    /// for stale handles and finished sessions.
    pub fn finish(&self, handle: SessionHandle) -> CoreResult<()> {
        self.with_active(handle, Access::Producer, |session, _| {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(&session.meta.id) {
                entry.status = SessionStatus::Inactive;
                entry.teardown_pending = true;
            }
        })?;
        info!(session = %handle.id, "session finished");
        Ok(())
    }

    /// Closes every Active session owned by `task`, which has terminated.
    ///
    /// System sessions outlive any task and are left alone. Returns the
    /// sessions closed.
    pub fn inactivate_sessions(&self, task: OwnerTask) -> Vec<SessionId> {
        if task == OwnerTask::System {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let mut closed = Vec::new();
        for (id, entry) in &mut state.entries {
            if entry.session.meta.task != task || entry.status != SessionStatus::Active {
                continue;
            }
            self.close_entry(entry);
            closed.push(*id);
        }
        if !closed.is_empty() {
            info!(?task, sessions = closed.len(), "inactivated sessions of exited task");
        }
        closed
    }

    /// Deletes a session once it is Inactive, torn down, unreferenced and
    /// fully delivered. Returns true if it was deleted.
    pub fn delete_if_drained(&self, id: SessionId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(&id) else {
            return false;
        };
        if entry.status != SessionStatus::Inactive
            || entry.has_active
            || entry.refs != 0
            || self.engine.num_bytes(id) != 0
        {
            return false;
        }
        state.entries.remove(&id);
        self.engine.remove(id);
        info!(session = %id, "session delivered and deleted");
        true
    }

    /// Runs `f` with the session's staging state locked and a reference
    /// counted.
    fn with_active<R>(
        &self,
        handle: SessionHandle,
        access: Access,
        f: impl FnOnce(&Session, &mut ActiveState) -> R,
    ) -> CoreResult<R> {
        let session = self.acquire(handle, access)?;
        let mut guard = ActiveGuard {
            registry: self,
            id: handle.id,
            active: session.active.lock(),
        };
        let result = match guard.active.as_mut() {
            Some(state) => Ok(f(&session, state)),
            None => Err(CoreError::SessionClosed {
                session: handle.id.as_u8(),
            }),
        };
        drop(guard);
        result
    }

    fn acquire(&self, handle: SessionHandle, access: Access) -> CoreResult<Arc<Session>> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&handle.id)
            .filter(|entry| entry.session.meta.serial == handle.serial)
            .ok_or(CoreError::UnknownSession {
                session: handle.id.as_u8(),
            })?;
        let allowed = match access {
            Access::Producer => entry.status == SessionStatus::Active,
            Access::Flush => entry.has_active,
        };
        if !allowed {
            return Err(CoreError::SessionClosed {
                session: handle.id.as_u8(),
            });
        }
        entry.refs += 1;
        Ok(Arc::clone(&entry.session))
    }

    /// Drops a reference, tearing the staging state down if it was the last
    /// one of a finished session. `active` is the caller's session lock.
    fn release(&self, id: SessionId, active: &mut Option<ActiveState>) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 && entry.teardown_pending {
            self.teardown(entry, active);
        }
    }

    /// Drains staged records to flash and destroys the staging state.
    /// Needs the registry lock and the session lock, with no references left.
    /// Marks an entry Inactive and releases its staging state now, or on
    /// the last producer's way out.
    fn close_entry(&self, entry: &mut Entry) {
        entry.status = SessionStatus::Inactive;
        entry.teardown_pending = true;
        if entry.refs == 0 {
            let session = Arc::clone(&entry.session);
            let mut active = session.active.lock();
            self.teardown(entry, &mut active);
        }
    }

    fn teardown(&self, entry: &mut Entry, active: &mut Option<ActiveState>) {
        debug_assert_eq!(entry.refs, 0);
        if let Some(mut state) = active.take() {
            if let Some(buffer) = state.buffer.as_mut() {
                self.write_staged(entry.session.meta.id, buffer);
            }
        }
        entry.has_active = false;
        entry.teardown_pending = false;
        debug!(session = %entry.session.meta.id, "staging state released");
    }

    fn write_staged(&self, id: SessionId, buffer: &mut ActiveBuffer) -> usize {
        let staged = buffer.drain();
        if staged.is_empty() {
            return 0;
        }
        match self.engine.write(id, &staged) {
            Ok(()) => staged.len(),
            Err(err) => {
                warn!(session = %id, bytes = staged.len(), error = %err, "staged records lost");
                self.engine.stats().record_drop(staged.len() as u64);
                0
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

/// A counted reference with the session lock held. Releases on drop, also
/// when the caller's closure panics.
struct ActiveGuard<'r, 's> {
    registry: &'r SessionRegistry,
    id: SessionId,
    active: MutexGuard<'s, Option<ActiveState>>,
}

impl Drop for ActiveGuard<'_, '_> {
    fn drop(&mut self) {
        self.registry.release(self.id, &mut self.active);
    }
}
