//! The public data logging service.
//!
//! `DataLogService` ties the storage engine, the session registry and the
//! sync endpoint together. Producer calls run on the caller's thread; flash
//! flushes, host traffic and sweeps are submitted to the scheduler and run
//! one at a time.

use crate::config::SyncConfig;
use crate::endpoint::SyncEndpoint;
use crate::error::{SyncError, SyncResult};
use crate::transport::HostTransport;
use flashlog_core::{
    BufferMode, Clock, CreateOutcome, CreateParams, EngineConfig, EngineStats, ItemType, LogOutcome,
    OwnerTask, Scheduler, SessionHandle, SessionId, SessionRegistry, StatsSnapshot,
    StorageEngine, SystemClock, ThreadScheduler, ThreadTimers, TimerId, TimerService,
};
use flashlog_protocol::Message;
use flashlog_storage::FileStore;
use rand::RngCore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supplies the identity of the code calling into the service.
pub trait OwnerResolver: Send + Sync {
    /// Returns the calling owner's uuid and task class.
    fn current_owner(&self) -> (Uuid, OwnerTask);
}

/// An [`OwnerResolver`] that always names the same owner.
#[derive(Debug, Clone, Copy)]
pub struct FixedOwner {
    /// Owner uuid.
    pub owner: Uuid,
    /// Owner task class.
    pub task: OwnerTask,
}

impl OwnerResolver for FixedOwner {
    fn current_owner(&self) -> (Uuid, OwnerTask) {
        (self.owner, self.task)
    }
}

/// Builder for [`DataLogService`].
pub struct DataLogServiceBuilder {
    store: Arc<dyn FileStore>,
    transport: Arc<dyn HostTransport>,
    engine_config: EngineConfig,
    sync_config: SyncConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    timers: Option<Arc<dyn TimerService>>,
    clock: Option<Arc<dyn Clock>>,
    owner: Option<Arc<dyn OwnerResolver>>,
    rng: Option<Box<dyn RngCore + Send>>,
}

impl DataLogServiceBuilder {
    /// Sets the engine configuration.
    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    /// Sets the sync configuration.
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    /// Sets the scheduler. Defaults to a [`ThreadScheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the timer service. Defaults to [`ThreadTimers`].
    pub fn timers(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Sets the clock. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the resolver used by `create_for_current_owner`.
    pub fn owner_resolver(mut self, owner: Arc<dyn OwnerResolver>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Sets the RNG session ids are drawn from.
    pub fn rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// Validates the configuration, restores session logs found in the
    /// store and starts the periodic sweep.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, an unreadable store or a
    /// runtime collaborator that cannot be started.
    pub fn build(self) -> SyncResult<Arc<DataLogService>> {
        self.engine_config.validate()?;
        self.sync_config
            .validate(usize::from(self.engine_config.max_buffered_item_size))?;

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(ThreadScheduler::new()?),
        };
        let timers: Arc<dyn TimerService> = match self.timers {
            Some(timers) => timers,
            None => Arc::new(ThreadTimers::new()?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let owner: Arc<dyn OwnerResolver> = self.owner.unwrap_or_else(|| {
            Arc::new(FixedOwner {
                owner: Uuid::nil(),
                task: OwnerTask::System,
            })
        });

        let stats = Arc::new(EngineStats::new());
        let engine = Arc::new(StorageEngine::new(self.store, self.engine_config, stats));
        let restored = engine.rebuild()?;
        let registry = Arc::new(match self.rng {
            Some(rng) => SessionRegistry::with_rng(Arc::clone(&engine), rng),
            None => SessionRegistry::new(Arc::clone(&engine)),
        });
        for header in &restored {
            registry.restore(header);
        }

        let endpoint = SyncEndpoint::new(
            Arc::clone(&registry),
            self.transport,
            Arc::clone(&scheduler),
            Arc::clone(&timers),
            Arc::clone(&clock),
            self.sync_config.clone(),
        );

        let sweep_interval = self.sync_config.sweep_interval;
        let service = Arc::new_cyclic(|me: &Weak<DataLogService>| {
            let weak = me.clone();
            let job_scheduler = Arc::clone(&scheduler);
            let sweep_timer = timers.create(Arc::new(move || {
                let weak = weak.clone();
                job_scheduler.submit(Box::new(move || {
                    if let Some(service) = weak.upgrade() {
                        service.sweep();
                    }
                }));
            }));
            DataLogService {
                registry,
                endpoint,
                scheduler,
                timers,
                clock,
                owner,
                config: self.sync_config,
                sweep_timer,
                sweeps: AtomicU32::new(0),
            }
        });
        service
            .timers
            .start(service.sweep_timer, sweep_interval, true);
        info!(restored = restored.len(), "data logging service started");
        Ok(service)
    }
}

/// Facade over the data logging engine.
pub struct DataLogService {
    registry: Arc<SessionRegistry>,
    endpoint: Arc<SyncEndpoint>,
    scheduler: Arc<dyn Scheduler>,
    timers: Arc<dyn TimerService>,
    clock: Arc<dyn Clock>,
    owner: Arc<dyn OwnerResolver>,
    config: SyncConfig,
    sweep_timer: TimerId,
    sweeps: AtomicU32,
}

impl DataLogService {
    /// Starts building a service over `store` that talks to the host
    /// through `transport`.
    pub fn builder(
        store: Arc<dyn FileStore>,
        transport: Arc<dyn HostTransport>,
    ) -> DataLogServiceBuilder {
        DataLogServiceBuilder {
            store,
            transport,
            engine_config: EngineConfig::default(),
            sync_config: SyncConfig::default(),
            scheduler: None,
            timers: None,
            clock: None,
            owner: None,
            rng: None,
        }
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the sync endpoint.
    pub fn endpoint(&self) -> &Arc<SyncEndpoint> {
        &self.endpoint
    }

    /// Returns a snapshot of the engine statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.registry.engine().stats().snapshot()
    }

    /// Creates a session, or resumes the Active session with the same tag
    /// and owner.
    ///
    /// With resuming switched off, or a different item type, the existing
    /// session is finished and a new one created. Lookup and creation happen
    /// under one registry lock, so concurrent callers never both create.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Core`] with a validation or resource error.
    pub fn create(&self, params: CreateParams) -> SyncResult<SessionHandle> {
        let outcome = self.registry.find_or_create(
            params,
            self.clock.unix_time(),
            self.config.resume_existing,
        )?;
        match &outcome {
            CreateOutcome::Resumed(_) => {}
            CreateOutcome::Created(meta) => self.submit_send(meta.id, false),
            CreateOutcome::Replaced { meta, finished } => {
                self.after_finish(finished.id);
                self.submit_send(meta.id, false);
            }
        }
        Ok(outcome.meta().handle())
    }

    /// Creates a session owned by the caller, as named by the owner
    /// resolver.
    ///
    /// # Errors
    ///
    /// Same as [`DataLogService::create`].
    pub fn create_for_current_owner(
        &self,
        tag: u32,
        item: ItemType,
        buffer: BufferMode,
    ) -> SyncResult<SessionHandle> {
        let (owner, task) = self.owner.current_owner();
        self.create(CreateParams {
            tag,
            owner,
            task,
            item,
            buffer,
        })
    }

    /// Appends whole items to a session.
    ///
    /// Buffered sessions stage the records and get a flush job queued.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Core`]; a `Busy` error means the staging buffer
    /// is full and the call may be repeated later.
    pub fn log(&self, handle: SessionHandle, data: &[u8]) -> SyncResult<()> {
        if let LogOutcome::Buffered {
            schedule_flush: true,
        } = self.registry.log(handle, data)?
        {
            let registry = Arc::clone(&self.registry);
            self.scheduler.submit(Box::new(move || {
                let bytes = registry.flush(handle);
                debug!(session = %handle.id, bytes, "flushed staged records");
            }));
        }
        Ok(())
    }

    /// Finishes a session: staged records go to flash, the session stops
    /// accepting records and its remaining bytes are pushed to the host.
    ///
    /// A session with nothing left to deliver is deleted right away.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Core`] for stale handles and finished sessions.
    pub fn finish(&self, handle: SessionHandle) -> SyncResult<()> {
        self.registry.finish(handle)?;
        self.after_finish(handle.id);
        Ok(())
    }

    /// Deletes a just-finished session if nothing is left to deliver,
    /// otherwise queues a forced send of the rest.
    fn after_finish(&self, id: SessionId) {
        let deleted = match self.registry.find(id) {
            Some(session) => {
                let comm = session.comm();
                comm.is_idle() && self.registry.delete_if_drained(id)
            }
            None => false,
        };
        if deleted {
            let endpoint = Arc::clone(&self.endpoint);
            self.scheduler
                .submit(Box::new(move || endpoint.send_close(id)));
        } else {
            self.submit_send(id, true);
        }
    }

    /// Returns true if the handle refers to a live session.
    pub fn is_valid(&self, handle: SessionHandle) -> bool {
        self.registry.is_valid(handle)
    }

    /// Closes the sessions of a task that exited and pushes their data.
    pub fn inactivate_sessions(&self, task: OwnerTask) -> Vec<SessionId> {
        let closed = self.registry.inactivate_sessions(task);
        for id in &closed {
            self.submit_send(*id, true);
        }
        closed
    }

    /// Stops the periodic sweep.
    pub fn pause(&self) {
        self.timers.stop(self.sweep_timer);
        info!("periodic sweep paused");
    }

    /// Restarts the periodic sweep.
    pub fn resume(&self) {
        self.timers
            .start(self.sweep_timer, self.config.sweep_interval, true);
        info!("periodic sweep resumed");
    }

    /// Queues a send attempt for every session.
    pub fn send_all(&self, force: bool) {
        let endpoint = Arc::clone(&self.endpoint);
        self.scheduler
            .submit(Box::new(move || endpoint.send_all(force)));
    }

    /// Sets the power/run-level send switch. Logging is never gated.
    pub fn set_run_enabled(&self, enabled: bool) {
        self.endpoint.set_run_enabled(enabled);
        if enabled {
            self.send_all(false);
        }
    }

    /// Accepts bytes received from the host. Processing is queued.
    pub fn on_host_message(&self, bytes: &[u8]) {
        match Message::decode(bytes) {
            Ok(message) => {
                let endpoint = Arc::clone(&self.endpoint);
                self.scheduler
                    .submit(Box::new(move || endpoint.handle_message(message)));
            }
            Err(err) => warn!(error = %SyncError::from(err), len = bytes.len(), "dropping undecodable host message"),
        }
    }

    /// Reports that the host link came up.
    pub fn on_transport_connected(&self) {
        let endpoint = Arc::clone(&self.endpoint);
        self.scheduler
            .submit(Box::new(move || endpoint.on_connected()));
    }

    /// Reports that the host link went down.
    pub fn on_transport_disconnected(&self) {
        let endpoint = Arc::clone(&self.endpoint);
        self.scheduler
            .submit(Box::new(move || endpoint.on_disconnected()));
    }

    /// One periodic sweep. Every `forced_sweep_every`-th sweep ignores the
    /// batching threshold.
    fn sweep(&self) {
        let count = self.sweeps.fetch_add(1, Ordering::SeqCst) + 1;
        let force = count % self.config.forced_sweep_every == 0;
        debug!(sweep = count, force, "periodic sweep");
        self.endpoint.send_all(force);
    }

    fn submit_send(&self, id: SessionId, force: bool) {
        let endpoint = Arc::clone(&self.endpoint);
        let registry = Arc::clone(&self.registry);
        self.scheduler.submit(Box::new(move || {
            let Some(session) = registry.find(id) else {
                return;
            };
            if let Err(err) = endpoint.send_session(&session, force) {
                debug!(session = %id, error = %err, "send deferred to next sweep");
            }
        }));
    }
}

impl Drop for DataLogService {
    fn drop(&mut self) {
        self.timers.delete(self.sweep_timer);
    }
}

impl std::fmt::Debug for DataLogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLogService")
            .field("sessions", &self.registry.len())
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use flashlog_core::{ManualScheduler, ManualTimers, SessionStatus};
    use flashlog_storage::InMemoryStore;
    use rand::rngs::mock::StepRng;
    use std::time::Duration;

    struct Fixture {
        service: Arc<DataLogService>,
        transport: Arc<MockTransport>,
        scheduler: Arc<ManualScheduler>,
        timers: Arc<ManualTimers>,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let timers = Arc::new(ManualTimers::default());
        let service = DataLogService::builder(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&transport) as Arc<dyn HostTransport>,
        )
        .sync_config(config)
        .scheduler(Arc::clone(&scheduler) as Arc<dyn Scheduler>)
        .timers(Arc::clone(&timers) as Arc<dyn TimerService>)
        .clock(Arc::clone(&timers) as Arc<dyn Clock>)
        .owner_resolver(Arc::new(FixedOwner {
            owner: Uuid::from_u128(77),
            task: OwnerTask::App,
        }))
        .rng(StepRng::new(1, 1))
        .build()
        .unwrap();
        Fixture {
            service,
            transport,
            scheduler,
            timers,
        }
    }

    #[test]
    fn create_resumes_matching_session() {
        let f = fixture(SyncConfig::new());
        let first = f
            .service
            .create_for_current_owner(5, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        let again = f
            .service
            .create_for_current_owner(5, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(f.service.registry().len(), 1);
    }

    #[test]
    fn create_without_resume_finishes_old_session() {
        let f = fixture(SyncConfig::new().with_resume_existing(false));
        let first = f
            .service
            .create_for_current_owner(5, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        f.service.log(first, &[1]).unwrap();
        let second = f
            .service
            .create_for_current_owner(5, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(
            f.service.registry().status(first.id),
            Some(SessionStatus::Inactive)
        );
    }

    #[test]
    fn buffered_log_is_flushed_by_the_worker() {
        let f = fixture(SyncConfig::new());
        let handle = f
            .service
            .create_for_current_owner(1, ItemType::unsigned(2), BufferMode::Provided(vec![0; 32]))
            .unwrap();
        f.service.log(handle, &[1, 0, 2, 0]).unwrap();
        let engine = f.service.registry().engine();
        assert_eq!(engine.num_bytes(handle.id), 0);

        f.scheduler.run_until_idle();
        assert_eq!(engine.num_bytes(handle.id), 4);
    }

    #[test]
    fn finishing_an_empty_session_deletes_it() {
        let f = fixture(SyncConfig::new());
        let handle = f
            .service
            .create_for_current_owner(1, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        f.service.finish(handle).unwrap();
        assert!(!f.service.is_valid(handle));
        f.scheduler.run_until_idle();
        assert_eq!(
            f.transport.take_sent(),
            vec![Message::Close {
                session_id: handle.id.as_u8()
            }]
        );
    }

    #[test]
    fn every_third_sweep_is_forced() {
        let f = fixture(SyncConfig::new().with_min_send_bytes(1000));
        let handle = f
            .service
            .create_for_current_owner(1, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        f.scheduler.run_until_idle();
        f.service.on_host_message(&Message::Ack { session_id: handle.id.as_u8() }.encode());
        f.scheduler.run_until_idle();
        f.service.log(handle, &[3; 10]).unwrap();
        f.transport.take_sent();

        let interval = SyncConfig::new().sweep_interval;
        for _ in 0..2 {
            f.timers.advance(interval);
            f.scheduler.run_until_idle();
        }
        assert!(f.transport.sent().is_empty());

        f.timers.advance(interval);
        f.scheduler.run_until_idle();
        assert!(matches!(f.transport.take_sent().as_slice(), [Message::Data(_)]));
    }

    #[test]
    fn pause_stops_sweeps() {
        let f = fixture(SyncConfig::new().with_min_send_bytes(0));
        f.service.pause();
        f.service
            .create_for_current_owner(1, ItemType::unsigned(1), BufferMode::Unbuffered)
            .unwrap();
        f.transport.set_connected(false);
        f.scheduler.run_until_idle();
        f.transport.set_connected(true);

        f.timers.advance(Duration::from_secs(3600));
        f.scheduler.run_until_idle();
        assert!(f.transport.sent().is_empty());

        f.service.resume();
        f.timers.advance(SyncConfig::new().sweep_interval);
        f.scheduler.run_until_idle();
        assert!(matches!(f.transport.sent().as_slice(), [Message::Open(_)]));
    }

    #[test]
    fn undecodable_host_message_is_dropped() {
        let f = fixture(SyncConfig::new());
        f.service.on_host_message(&[0x42, 1, 2]);
        assert_eq!(f.scheduler.pending(), 0);
    }
}
