//! Unit of work: transaction boundary, identity map and change tracking.
//!
//! # Responsibility
//! - Open, join, commit and roll back store transactions.
//! - Track managed entities with their last persisted column snapshot and
//!   flush diverging ones before queries and at commit.
//! - Hand out typed repositories bound to this session.
//!
//! # Invariants
//! - Transactions never nest: an operation joins the active one or opens
//!   its own for the duration of the call.
//! - The identity map lives exactly as long as the transaction; commit and
//!   rollback detach every handle.
//! - Entities loaded under the read-only hint are never flushed.
//! - A call-time failure inside an explicit transaction rolls the store
//!   transaction back at once; later calls fail with `TransactionAborted`.

use crate::audit::{ActorProvider, Auditor, Clock, SystemClock};
use crate::config::QueryConfig;
use crate::engine::persist::Writer;
use crate::engine::Executor;
use crate::error::{RepoError, RepoResult};
use crate::model::entity::Entity;
use crate::model::projection::ProjectedRow;
use crate::model::value::{EntityId, Value};
use crate::query::registry::QueryRegistry;
use crate::repository::Repository;
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Shared handle to an entity instance.
///
/// Inside a transaction every lookup of the same key returns a handle to the
/// same instance, and changes made through [`Managed::borrow_mut`] are
/// flushed on commit. After the transaction ends the handle is detached: it
/// still holds the last state but nothing tracks it.
pub struct Managed<E>(Rc<RefCell<E>>);

impl<E: Entity> Managed<E> {
    fn new(entity: E) -> Self {
        Self(Rc::new(RefCell::new(entity)))
    }

    pub fn borrow(&self) -> Ref<'_, E> {
        self.0.borrow()
    }

    /// Mutable access. Must not be held across a repository call.
    pub fn borrow_mut(&self) -> RefMut<'_, E> {
        self.0.borrow_mut()
    }

    /// Copy of the current state.
    pub fn get(&self) -> E {
        self.0.borrow().clone()
    }

    pub fn id(&self) -> Option<EntityId> {
        self.0.borrow().id()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> Clone for Managed<E> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<E: Debug> Debug for Managed<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.try_borrow() {
            Ok(entity) => f.debug_tuple("Managed").field(&*entity).finish(),
            Err(_) => f.write_str("Managed(<borrowed>)"),
        }
    }
}

/// Counters of entity writes issued by a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub entity_inserts: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    /// Flush passes run, whether or not they wrote anything.
    pub flushes: u64,
}

trait TrackedEntry {
    /// Writes the entity back when it diverges from the snapshot.
    fn flush(&mut self, writer: &Writer<'_, '_>) -> RepoResult<bool>;

    fn as_any(&self) -> &dyn Any;
}

struct Tracked<E: Entity> {
    handle: Managed<E>,
    snapshot: Vec<Value>,
    read_only: bool,
}

impl<E: Entity> TrackedEntry for Tracked<E> {
    fn flush(&mut self, writer: &Writer<'_, '_>) -> RepoResult<bool> {
        if self.read_only {
            return Ok(false);
        }
        let mut entity = self.handle.0.try_borrow_mut().map_err(|_| {
            RepoError::Configuration(format!(
                "{} is borrowed while the session flushes",
                E::meta().name
            ))
        })?;
        let current = entity.column_values();
        if current == self.snapshot {
            return Ok(false);
        }
        writer.update(&mut *entity)?;
        self.snapshot = current;
        Ok(true)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type EntryKey = (&'static str, EntityId);

#[derive(Debug, Clone)]
struct TxState {
    id: Uuid,
    /// False when the store transaction belongs to someone else.
    began: bool,
    explicit: bool,
    aborted: bool,
    started_at: Instant,
}

#[derive(Default)]
struct UnitOfWork {
    tx: Option<TxState>,
    entries: BTreeMap<EntryKey, Box<dyn TrackedEntry>>,
    stats: SessionStats,
}

/// How a unit opens its transaction when none is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxMode {
    Deferred,
    /// Takes the store write lock before the first read.
    Immediate,
}

/// Configures and builds a [`Session`].
pub struct SessionBuilder {
    actor: Option<Arc<dyn ActorProvider>>,
    clock: Arc<dyn Clock>,
    registry: Arc<QueryRegistry>,
    config: QueryConfig,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            actor: None,
            clock: Arc::new(SystemClock),
            registry: QueryRegistry::empty(),
            config: QueryConfig::default(),
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Required: there is no default actor.
    pub fn actor_provider(mut self, actor: impl ActorProvider + 'static) -> Self {
        self.actor = Some(Arc::new(actor));
        self
    }

    pub fn shared_actor_provider(mut self, actor: Arc<dyn ActorProvider>) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(mut self, registry: Arc<QueryRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    /// - `Configuration` when no actor provider was set.
    pub fn build(self, conn: &Connection) -> RepoResult<Session<'_>> {
        let actor = self.actor.ok_or_else(|| {
            RepoError::Configuration("an actor provider is required".to_string())
        })?;
        Ok(Session {
            conn,
            registry: self.registry,
            auditor: Auditor::new(actor, self.clock),
            config: self.config,
            uow: RefCell::new(UnitOfWork::default()),
        })
    }
}

/// One caller's unit of work over a borrowed connection.
pub struct Session<'c> {
    conn: &'c Connection,
    registry: Arc<QueryRegistry>,
    auditor: Auditor,
    config: QueryConfig,
    uow: RefCell<UnitOfWork>,
}

impl<'c> Session<'c> {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn repository<E: Entity>(&self) -> Repository<'_, 'c, E> {
        Repository::new(self)
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.uow.borrow().stats
    }

    pub fn in_transaction(&self) -> bool {
        self.uow.borrow().tx.is_some()
    }

    /// Starts an explicit transaction. An open driver transaction owned by
    /// someone else is joined instead and never committed from here.
    ///
    /// # Errors
    /// - `Configuration` when a transaction is already active.
    pub fn begin(&self) -> RepoResult<()> {
        if self.in_transaction() {
            return Err(RepoError::Configuration(
                "a transaction is already active; transactions do not nest".to_string(),
            ));
        }
        let tx = self.open(TxMode::Deferred, true)?;
        self.uow.borrow_mut().tx = Some(tx);
        Ok(())
    }

    /// Flushes tracked changes and commits the explicit transaction.
    ///
    /// # Errors
    /// - `TransactionAborted` when an earlier failure already rolled it back.
    /// - Any flush or commit failure; the transaction is rolled back.
    pub fn commit(&self) -> RepoResult<()> {
        let tx = self.uow.borrow().tx.clone().ok_or_else(|| {
            RepoError::Configuration("commit called without an active transaction".to_string())
        })?;
        if tx.aborted {
            self.end();
            return Err(RepoError::TransactionAborted {
                tx_id: tx.id.to_string(),
            });
        }
        match self.flush_with(self.executor(None)).and_then(|_| self.close(&tx)) {
            Ok(()) => {
                self.end();
                info!(
                    "event=tx_commit module=session status=ok tx_id={} duration_ms={}",
                    tx.id,
                    tx.started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                self.abandon(&tx);
                self.end();
                error!(
                    "event=tx_commit module=session status=error tx_id={} error_code={}",
                    tx.id,
                    err.code()
                );
                Err(err)
            }
        }
    }

    /// Discards tracked changes and rolls back the explicit transaction.
    /// Without an active transaction this does nothing.
    pub fn rollback(&self) -> RepoResult<()> {
        let Some(tx) = self.uow.borrow().tx.clone() else {
            return Ok(());
        };
        let result = if tx.began && !tx.aborted && !self.conn.is_autocommit() {
            self.conn
                .execute_batch("ROLLBACK")
                .map_err(RepoError::from)
        } else {
            Ok(())
        };
        self.end();
        info!(
            "event=tx_rollback module=session status={} tx_id={}",
            if result.is_ok() { "ok" } else { "error" },
            tx.id
        );
        result
    }

    /// Runs `body` in one transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T, F>(&self, body: F) -> RepoResult<T>
    where
        F: FnOnce(&Self) -> RepoResult<T>,
    {
        self.begin()?;
        match body(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(
                        "event=tx_rollback module=session status=error error_code={}",
                        rollback_err.code()
                    );
                }
                Err(err)
            }
        }
    }

    /// Writes every tracked change now.
    pub fn flush(&self) -> RepoResult<()> {
        self.unit("flush", TxMode::Deferred, |exec| self.flush_with(exec).map(|_| ()))
    }

    /// Detaches every managed handle without writing anything.
    pub fn clear(&self) {
        self.uow.borrow_mut().entries.clear();
    }

    pub(crate) fn executor(&self, timeout: Option<Duration>) -> Executor<'c> {
        let deadline = timeout
            .or_else(|| self.config.default_timeout())
            .map(|timeout| Instant::now() + timeout);
        Executor::new(self.conn, deadline)
    }

    /// Runs one facade operation inside the active transaction, or inside a
    /// transaction of its own that commits when `body` succeeds.
    pub(crate) fn unit_with<T, F>(
        &self,
        operation: &str,
        mode: TxMode,
        timeout: Option<Duration>,
        body: F,
    ) -> RepoResult<T>
    where
        F: FnOnce(Executor<'c>) -> RepoResult<T>,
    {
        let exec = self.executor(timeout);
        let active = self.uow.borrow().tx.clone();
        if let Some(tx) = active {
            if tx.aborted {
                return Err(RepoError::TransactionAborted {
                    tx_id: tx.id.to_string(),
                });
            }
            return body(exec).inspect_err(|err| {
                if tx.explicit {
                    self.abort(&tx, operation, err);
                }
            });
        }

        let tx = self.open(mode, false)?;
        self.uow.borrow_mut().tx = Some(tx.clone());
        let result = body(exec).and_then(|value| {
            self.flush_with(exec)?;
            self.close(&tx)?;
            Ok(value)
        });
        if let Err(err) = &result {
            self.abandon(&tx);
            debug!(
                "event=unit_execute module=session status=error tx_id={} operation={operation} error_code={}",
                tx.id,
                err.code()
            );
        }
        self.end();
        result
    }

    pub(crate) fn unit<T, F>(&self, operation: &str, mode: TxMode, body: F) -> RepoResult<T>
    where
        F: FnOnce(Executor<'c>) -> RepoResult<T>,
    {
        self.unit_with(operation, mode, None, body)
    }

    fn open(&self, mode: TxMode, explicit: bool) -> RepoResult<TxState> {
        let began = self.conn.is_autocommit();
        if began {
            let statement = match mode {
                TxMode::Deferred => "BEGIN",
                TxMode::Immediate => "BEGIN IMMEDIATE",
            };
            self.conn.execute_batch(statement)?;
        }
        let tx = TxState {
            id: Uuid::new_v4(),
            began,
            explicit,
            aborted: false,
            started_at: Instant::now(),
        };
        if explicit {
            info!(
                "event=tx_begin module=session status=ok tx_id={} joined={}",
                tx.id, !began
            );
        }
        Ok(tx)
    }

    fn close(&self, tx: &TxState) -> RepoResult<()> {
        if tx.began {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn abandon(&self, tx: &TxState) {
        if tx.began && !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(
                    "event=tx_rollback module=session status=error tx_id={} error={}",
                    tx.id, err
                );
            }
        }
    }

    /// Rolls back an explicit transaction after a failed operation and keeps
    /// it marked until the caller ends it.
    fn abort(&self, tx: &TxState, operation: &str, err: &RepoError) {
        self.abandon(tx);
        let mut uow = self.uow.borrow_mut();
        uow.entries.clear();
        if let Some(active) = uow.tx.as_mut() {
            active.aborted = true;
        }
        warn!(
            "event=tx_abort module=session status=error tx_id={} operation={operation} error_code={}",
            tx.id,
            err.code()
        );
    }

    fn end(&self) {
        let mut uow = self.uow.borrow_mut();
        uow.tx = None;
        uow.entries.clear();
    }

    pub(crate) fn flush_with(&self, exec: Executor<'c>) -> RepoResult<()> {
        let writer = Writer::new(exec, &self.auditor);
        let mut uow = self.uow.borrow_mut();
        let mut written = 0_u64;
        for entry in uow.entries.values_mut() {
            if entry.flush(&writer)? {
                written += 1;
            }
        }
        uow.stats.entity_updates += written;
        uow.stats.flushes += 1;
        if written > 0 {
            debug!("event=session_flush module=session status=ok updated={written}");
        }
        Ok(())
    }

    /// Inserts a transient entity and starts tracking it.
    pub(crate) fn persist<E: Entity>(&self, exec: Executor<'c>, mut entity: E) -> RepoResult<Managed<E>> {
        Writer::new(exec, &self.auditor).insert(&mut entity)?;
        self.uow.borrow_mut().stats.entity_inserts += 1;
        Ok(self.track(entity, false))
    }

    /// Writes a detached or managed entity by identity and returns the
    /// managed handle, reusing the tracked instance when there is one.
    pub(crate) fn merge<E: Entity>(&self, exec: Executor<'c>, entity: E) -> RepoResult<Managed<E>> {
        let id = entity.id().ok_or(RepoError::TransientEntity {
            entity: E::meta().name,
        })?;
        let handle = match self.lookup::<E>(id) {
            Some(handle) => {
                *handle.borrow_mut() = entity;
                handle
            }
            None => Managed::new(entity),
        };
        {
            let mut current = handle.borrow_mut();
            Writer::new(exec, &self.auditor).update(&mut *current)?;
        }
        self.uow.borrow_mut().stats.entity_updates += 1;
        self.register(&handle, false);
        Ok(handle)
    }

    pub(crate) fn find<E: Entity>(
        &self,
        exec: Executor<'c>,
        id: EntityId,
    ) -> RepoResult<Option<Managed<E>>> {
        if let Some(handle) = self.lookup::<E>(id) {
            return Ok(Some(handle));
        }
        let loaded = Writer::new(exec, &self.auditor).load::<E>(id)?;
        Ok(loaded.map(|entity| self.track(entity, false)))
    }

    pub(crate) fn remove<E: Entity>(&self, exec: Executor<'c>, id: EntityId) -> RepoResult<usize> {
        let meta = E::meta();
        let affected = Writer::new(exec, &self.auditor).delete(meta, id)?;
        let mut uow = self.uow.borrow_mut();
        uow.entries.remove(&(meta.name, id));
        uow.stats.entity_deletes += affected as u64;
        Ok(affected)
    }

    /// Decodes entity rows, resolving each key through the identity map.
    pub(crate) fn materialize<E: Entity>(
        &self,
        rows: &[ProjectedRow],
        fetched: &[&'static str],
        read_only: bool,
    ) -> RepoResult<Vec<Managed<E>>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entity = E::from_row(row)?;
            for relation in fetched {
                entity.attach_fetched(relation, &row.with_prefix(relation))?;
            }
            let Some(id) = entity.id() else {
                return Err(RepoError::InvalidData(format!(
                    "{} row without a key",
                    E::meta().name
                )));
            };
            match self.lookup::<E>(id) {
                Some(handle) => {
                    if !fetched.is_empty() {
                        if let Ok(mut current) = handle.0.try_borrow_mut() {
                            for relation in fetched {
                                current.attach_fetched(relation, &row.with_prefix(relation))?;
                            }
                        }
                    }
                    out.push(handle);
                }
                None => out.push(self.track(entity, read_only)),
            }
        }
        Ok(out)
    }

    /// Detaches every tracked instance of `entity` after a bulk statement.
    pub(crate) fn evict_type(&self, entity: &'static str) -> usize {
        let mut uow = self.uow.borrow_mut();
        let before = uow.entries.len();
        uow.entries.retain(|(name, _), _| *name != entity);
        before - uow.entries.len()
    }

    fn lookup<E: Entity>(&self, id: EntityId) -> Option<Managed<E>> {
        let uow = self.uow.borrow();
        uow.entries
            .get(&(E::meta().name, id))
            .and_then(|entry| entry.as_any().downcast_ref::<Tracked<E>>())
            .map(|tracked| tracked.handle.clone())
    }

    fn track<E: Entity>(&self, entity: E, read_only: bool) -> Managed<E> {
        let handle = Managed::new(entity);
        self.register(&handle, read_only);
        handle
    }

    fn register<E: Entity>(&self, handle: &Managed<E>, read_only: bool) {
        let (id, snapshot) = {
            let entity = handle.borrow();
            (entity.id(), entity.column_values())
        };
        let Some(id) = id else {
            return;
        };
        let mut uow = self.uow.borrow_mut();
        if uow.tx.is_none() {
            return;
        }
        uow.entries.insert(
            (E::meta().name, id),
            Box::new(Tracked {
                handle: handle.clone(),
                snapshot,
                read_only,
            }),
        );
    }
}
