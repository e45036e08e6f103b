//! Typed repository facade.
//!
//! # Responsibility
//! - Expose CRUD, listing, paging, named-query and bulk operations for one
//!   entity type.
//! - Route writes through the auditing interceptor and every call through the
//!   session's unit of work.
//!
//! # Invariants
//! - Arguments are checked against the declared placeholders before any
//!   statement reaches the store.
//! - A named query is only invoked through an accessor matching its declared
//!   return shape.
//! - Bulk statements skip auditing and detach tracked instances of the type.

use crate::engine::compile::{compile, compile_count, compile_lock};
use crate::engine::Executor;
use crate::error::{RepoError, RepoResult};
use crate::model::entity::Entity;
use crate::model::member::MEMBER_META;
use crate::model::projection::{ProjectedRow, Projection as View};
use crate::model::team::Team;
use crate::model::value::{EntityId, FromValue, Value};
use crate::query::args::Args;
use crate::query::descriptor::{
    LockMode, PageWindow, Projection, QueryBody, QueryDescriptor, ResultShape,
};
use crate::query::page::{Page, PageRequest, Sort};
use crate::session::{Managed, Session, TxMode};
use log::info;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Result of [`Repository::query`], shaped by the declaration.
#[derive(Debug)]
pub enum QueryResult<E> {
    List(Vec<Managed<E>>),
    Optional(Option<Managed<E>>),
    /// Rows of a column, constructor or native projection.
    Rows(Vec<ProjectedRow>),
    Scalar(Value),
    Affected(usize),
}

/// Repository over entity `E`, bound to one session.
pub struct Repository<'s, 'c, E: Entity> {
    session: &'s Session<'c>,
    timeout: Option<Duration>,
    _entity: PhantomData<fn() -> E>,
}

impl<'s, 'c, E: Entity> Repository<'s, 'c, E> {
    pub(crate) fn new(session: &'s Session<'c>) -> Self {
        Self {
            session,
            timeout: None,
            _entity: PhantomData,
        }
    }

    /// Deadline for each call made through the returned repository,
    /// replacing the configured default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn unit<T>(
        &self,
        operation: &str,
        mode: TxMode,
        body: impl FnOnce(Executor<'c>) -> RepoResult<T>,
    ) -> RepoResult<T> {
        self.session
            .unit_with(operation, mode, self.timeout, body)
    }

    /// Inserts a transient entity or updates a managed one, decided by
    /// identity alone.
    ///
    /// # Errors
    /// - `Configuration` when the actor provider fails.
    /// - `NotFound` when updating a key that no longer exists.
    pub fn save(&self, entity: E) -> RepoResult<Managed<E>> {
        self.unit("save", TxMode::Deferred, |exec| self.save_in(exec, entity))
    }

    /// Saves every entity in one transaction.
    pub fn save_all(&self, entities: impl IntoIterator<Item = E>) -> RepoResult<Vec<Managed<E>>> {
        self.unit("save_all", TxMode::Deferred, |exec| {
            entities
                .into_iter()
                .map(|entity| self.save_in(exec, entity))
                .collect()
        })
    }

    fn save_in(&self, exec: Executor<'c>, entity: E) -> RepoResult<Managed<E>> {
        match entity.id() {
            None => self.session.persist(exec, entity),
            Some(_) => self.session.merge(exec, entity),
        }
    }

    /// Deletes the entity's row. A row that is already gone is not an error.
    pub fn delete(&self, entity: &E) -> RepoResult<()> {
        let id = entity.id().ok_or(RepoError::TransientEntity {
            entity: E::meta().name,
        })?;
        self.unit("delete", TxMode::Deferred, |exec| {
            self.session.remove::<E>(exec, id).map(|_| ())
        })
    }

    /// # Errors
    /// - `NotFound` when no row has `id`.
    pub fn delete_by_id(&self, id: EntityId) -> RepoResult<()> {
        self.unit("delete_by_id", TxMode::Deferred, |exec| {
            match self.session.remove::<E>(exec, id)? {
                0 => Err(RepoError::NotFound {
                    entity: E::meta().name,
                    key: id.to_string(),
                }),
                _ => Ok(()),
            }
        })
    }

    pub fn find_by_id(&self, id: EntityId) -> RepoResult<Option<Managed<E>>> {
        self.unit("find_by_id", TxMode::Deferred, |exec| {
            self.session.find::<E>(exec, id)
        })
    }

    pub fn exists_by_id(&self, id: EntityId) -> RepoResult<bool> {
        let meta = E::meta();
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?)",
            meta.table, meta.id_column
        );
        self.unit("exists_by_id", TxMode::Deferred, |exec| {
            let rows = exec.rows_values(
                &format!("{}.existsById", meta.name),
                &sql,
                vec![Value::Integer(id)],
            )?;
            let value = rows
                .into_iter()
                .next()
                .and_then(|row| row.into_values().into_iter().next())
                .unwrap_or(Value::Null);
            bool::from_value(&value)
        })
    }

    pub fn count(&self) -> RepoResult<u64> {
        let meta = E::meta();
        let mut descriptor = QueryDescriptor::select_all(meta, format!("{}.count", meta.name));
        if let QueryBody::Select { projection, .. } = &mut descriptor.body {
            *projection = Projection::Count {
                distinct: false,
                operand: None,
            };
        }
        descriptor.shape = ResultShape::Scalar;
        let args = Args::new();
        self.unit("count", TxMode::Deferred, |exec| {
            let value = self.scalar_in(exec, &descriptor, &args)?;
            u64::from_value(&value)
        })
    }

    pub fn find_all(&self) -> RepoResult<Vec<Managed<E>>> {
        self.find_all_sorted(&Sort::unsorted())
    }

    pub fn find_all_sorted(&self, sort: &Sort) -> RepoResult<Vec<Managed<E>>> {
        let mut descriptor = self.all_descriptor();
        descriptor.apply_sort(sort)?;
        let args = Args::new();
        self.unit("find_all", TxMode::Deferred, |exec| {
            self.entities_in(exec, &descriptor, &args)
        })
    }

    pub fn find_all_page(&self, request: &PageRequest) -> RepoResult<Page<Managed<E>>> {
        let mut descriptor = self.all_descriptor();
        descriptor.shape = ResultShape::Page;
        self.page_descriptor(descriptor, &Args::new(), request)
    }

    fn all_descriptor(&self) -> QueryDescriptor {
        QueryDescriptor::select_all(E::meta(), format!("{}.findAll", E::meta().name))
    }

    fn named(&self, name: &str) -> RepoResult<&'s QueryDescriptor> {
        self.session.registry().require(E::meta(), name)
    }

    /// Invokes a named query and returns whatever its declaration yields.
    pub fn query(&self, name: &str, args: &Args) -> RepoResult<QueryResult<E>> {
        let descriptor = self.named(name)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        match descriptor.shape {
            ResultShape::Affected => self.execute_bulk(descriptor, args).map(QueryResult::Affected),
            ResultShape::Scalar => self
                .unit(&descriptor.name, lock_mode(descriptor), |exec| {
                    self.scalar_in(exec, descriptor, args)
                })
                .map(QueryResult::Scalar),
            _ if !descriptor.maps_entity() => self
                .unit(&descriptor.name, lock_mode(descriptor), |exec| {
                    self.rows_in(exec, descriptor, args)
                })
                .map(QueryResult::Rows),
            ResultShape::One => self.single(descriptor, args, true).map(QueryResult::Optional),
            ResultShape::Optional => self.single(descriptor, args, false).map(QueryResult::Optional),
            ResultShape::List | ResultShape::Page => self
                .unit(&descriptor.name, lock_mode(descriptor), |exec| {
                    self.entities_in(exec, descriptor, args)
                })
                .map(QueryResult::List),
        }
    }

    /// Runs a list or page query returning entities.
    pub fn list(&self, name: &str, args: &Args) -> RepoResult<Vec<Managed<E>>> {
        self.list_sorted(name, args, &Sort::unsorted())
    }

    /// Like [`Repository::list`], with `sort` applied after the declared order.
    pub fn list_sorted(&self, name: &str, args: &Args, sort: &Sort) -> RepoResult<Vec<Managed<E>>> {
        let declared = self.named(name)?;
        expect_shape(declared, &[ResultShape::List, ResultShape::Page], ResultShape::List)?;
        expect_entities(declared, ResultShape::List)?;
        args.check(&declared.name, &declared.parameters)?;
        let mut descriptor = declared.clone();
        descriptor.apply_sort(sort)?;
        self.unit(&descriptor.name, lock_mode(&descriptor), |exec| {
            self.entities_in(exec, &descriptor, args)
        })
    }

    /// Exactly one entity.
    ///
    /// # Errors
    /// - `NotFound` on zero rows, `NotUnique` on more than one.
    pub fn one(&self, name: &str, args: &Args) -> RepoResult<Managed<E>> {
        let descriptor = self.named(name)?;
        expect_shape(descriptor, &[ResultShape::One], ResultShape::One)?;
        expect_entities(descriptor, ResultShape::One)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        self.single(descriptor, args, true)?
            .ok_or_else(|| RepoError::NotFound {
                entity: E::meta().name,
                key: descriptor.name.clone(),
            })
    }

    /// Zero or one entity.
    ///
    /// # Errors
    /// - `NotUnique` on more than one row.
    pub fn optional(&self, name: &str, args: &Args) -> RepoResult<Option<Managed<E>>> {
        let descriptor = self.named(name)?;
        expect_shape(descriptor, &[ResultShape::Optional], ResultShape::Optional)?;
        expect_entities(descriptor, ResultShape::Optional)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        self.single(descriptor, args, false)
    }

    fn single(
        &self,
        descriptor: &QueryDescriptor,
        args: &Args,
        required: bool,
    ) -> RepoResult<Option<Managed<E>>> {
        self.unit(&descriptor.name, lock_mode(descriptor), |exec| {
            let mut found = self.entities_in(exec, descriptor, args)?;
            match found.len() {
                0 if required => Err(RepoError::NotFound {
                    entity: E::meta().name,
                    key: descriptor.name.clone(),
                }),
                0 => Ok(None),
                1 => Ok(found.pop()),
                rows => Err(RepoError::NotUnique {
                    query: descriptor.name.clone(),
                    rows,
                }),
            }
        })
    }

    /// One page of a query declared with a page result.
    pub fn page(&self, name: &str, args: &Args, request: &PageRequest) -> RepoResult<Page<Managed<E>>> {
        let descriptor = self.named(name)?;
        expect_shape(descriptor, &[ResultShape::Page], ResultShape::Page)?;
        expect_entities(descriptor, ResultShape::Page)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        self.page_descriptor(descriptor.clone(), args, request)
    }

    fn page_descriptor(
        &self,
        mut descriptor: QueryDescriptor,
        args: &Args,
        request: &PageRequest,
    ) -> RepoResult<Page<Managed<E>>> {
        let request = request.clamped(self.session.config().max_page_size);
        window(&mut descriptor, &request)?;
        self.unit(&descriptor.name, lock_mode(&descriptor), |exec| {
            let content = self.entities_in(exec, &descriptor, args)?;
            let total = self.total_in(exec, &descriptor, args)?;
            Ok(Page::new(content, &request, total))
        })
    }

    /// Raw labelled rows of any non-mutating query.
    pub fn rows(&self, name: &str, args: &Args) -> RepoResult<Vec<ProjectedRow>> {
        let descriptor = self.named(name)?;
        if descriptor.is_mutation() {
            return Err(shape_mismatch(descriptor, ResultShape::List));
        }
        args.check(&descriptor.name, &descriptor.parameters)?;
        self.unit(&descriptor.name, lock_mode(descriptor), |exec| {
            self.rows_in(exec, descriptor, args)
        })
    }

    /// Maps a list query into projection `P`. Entity selects are narrowed to
    /// `P::paths()`; column, constructor and native selects map as declared.
    /// Projections are copies and are never tracked.
    pub fn project<P: View>(&self, name: &str, args: &Args) -> RepoResult<Vec<P>> {
        let declared = self.named(name)?;
        expect_shape(declared, &[ResultShape::List, ResultShape::Page], ResultShape::List)?;
        args.check(&declared.name, &declared.parameters)?;
        let descriptor = view_of::<P>(declared)?;
        self.unit(&descriptor.name, lock_mode(&descriptor), |exec| {
            let rows = self.rows_in(exec, &descriptor, args)?;
            rows.iter().map(P::from_row).collect()
        })
    }

    pub fn project_page<P: View>(
        &self,
        name: &str,
        args: &Args,
        request: &PageRequest,
    ) -> RepoResult<Page<P>> {
        let declared = self.named(name)?;
        expect_shape(declared, &[ResultShape::Page], ResultShape::Page)?;
        args.check(&declared.name, &declared.parameters)?;
        let mut descriptor = view_of::<P>(declared)?;
        let request = request.clamped(self.session.config().max_page_size);
        window(&mut descriptor, &request)?;
        self.unit(&descriptor.name, lock_mode(&descriptor), |exec| {
            let rows = self.rows_in(exec, &descriptor, args)?;
            let content = rows.iter().map(P::from_row).collect::<RepoResult<Vec<P>>>()?;
            let total = self.total_in(exec, &descriptor, args)?;
            Ok(Page::new(content, &request, total))
        })
    }

    /// Single value of a count, exists or scalar column query.
    pub fn scalar<T: FromValue>(&self, name: &str, args: &Args) -> RepoResult<T> {
        let descriptor = self.named(name)?;
        expect_shape(descriptor, &[ResultShape::Scalar], ResultShape::Scalar)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        let value = self.unit(&descriptor.name, lock_mode(descriptor), |exec| {
            self.scalar_in(exec, descriptor, args)
        })?;
        T::from_value(&value)
    }

    /// Runs a registered update or delete as one set-based statement.
    ///
    /// Returns the affected-row count. Audit columns of the touched rows are
    /// not stamped.
    pub fn bulk_update(&self, name: &str, args: &Args) -> RepoResult<usize> {
        let descriptor = self.named(name)?;
        expect_shape(descriptor, &[ResultShape::Affected], ResultShape::Affected)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        self.execute_bulk(descriptor, args)
    }

    /// Runs a mutation descriptor built in code.
    pub fn bulk_update_with(&self, descriptor: &QueryDescriptor, args: &Args) -> RepoResult<usize> {
        if !std::ptr::eq(descriptor.entity, E::meta()) {
            return Err(RepoError::Configuration(format!(
                "query `{}` targets {} but was run on the {} repository",
                descriptor.name,
                descriptor.entity.name,
                E::meta().name
            )));
        }
        descriptor.validate()?;
        expect_shape(descriptor, &[ResultShape::Affected], ResultShape::Affected)?;
        args.check(&descriptor.name, &descriptor.parameters)?;
        self.execute_bulk(descriptor, args)
    }

    fn execute_bulk(&self, descriptor: &QueryDescriptor, args: &Args) -> RepoResult<usize> {
        let started_at = Instant::now();
        let affected = self.unit(&descriptor.name, TxMode::Deferred, |exec| {
            self.session.flush_with(exec)?;
            let compiled = compile(descriptor, args)?;
            let affected = exec.execute(&descriptor.name, &compiled)?;
            self.session.evict_type(E::meta().name);
            Ok(affected)
        })?;
        info!(
            "event=bulk_update module=repository status=ok entity={} query={} affected={affected} duration_ms={}",
            E::meta().name,
            descriptor.name,
            started_at.elapsed().as_millis()
        );
        Ok(affected)
    }

    /// Flushes, takes the row lock when asked, then runs the select.
    fn rows_in(
        &self,
        exec: Executor<'c>,
        descriptor: &QueryDescriptor,
        args: &Args,
    ) -> RepoResult<Vec<ProjectedRow>> {
        self.session.flush_with(exec)?;
        if descriptor.lock == LockMode::PessimisticWrite {
            let lock = compile_lock(descriptor, args)?;
            exec.execute(&format!("{}.lock", descriptor.name), &lock)?;
        }
        let compiled = compile(descriptor, args)?;
        exec.rows(&descriptor.name, &compiled)
    }

    fn entities_in(
        &self,
        exec: Executor<'c>,
        descriptor: &QueryDescriptor,
        args: &Args,
    ) -> RepoResult<Vec<Managed<E>>> {
        let rows = self.rows_in(exec, descriptor, args)?;
        let fetched: Vec<&'static str> = descriptor
            .joins()
            .iter()
            .filter(|join| join.fetch && join.from == 0)
            .map(|join| join.relation.name)
            .collect();
        self.session
            .materialize(&rows, &fetched, descriptor.lock == LockMode::ReadOnly)
    }

    fn scalar_in(
        &self,
        exec: Executor<'c>,
        descriptor: &QueryDescriptor,
        args: &Args,
    ) -> RepoResult<Value> {
        self.session.flush_with(exec)?;
        let compiled = compile(descriptor, args)?;
        exec.scalar(&descriptor.name, &compiled)
    }

    fn total_in(
        &self,
        exec: Executor<'c>,
        descriptor: &QueryDescriptor,
        args: &Args,
    ) -> RepoResult<u64> {
        let compiled = compile_count(descriptor, args)?;
        let value = exec.scalar(&format!("{}.count", descriptor.name), &compiled)?;
        u64::from_value(&value)
    }
}

impl Repository<'_, '_, Team> {
    /// Reloads the team's derived member index from the owning side.
    pub fn load_members(&self, team: &Managed<Team>) -> RepoResult<Vec<EntityId>> {
        let team_id = team.id().ok_or(RepoError::TransientEntity { entity: "Team" })?;
        let owner = MEMBER_META
            .relations
            .iter()
            .find(|relation| std::ptr::eq(relation.target, Team::meta()))
            .ok_or_else(|| {
                RepoError::Configuration(format!("{} has no relation to Team", MEMBER_META.name))
            })?;
        let sql = format!(
            "SELECT {id} FROM {table} WHERE {fk} = ? ORDER BY {id}",
            id = MEMBER_META.id_column,
            table = MEMBER_META.table,
            fk = owner.column
        );
        let members = self.unit("load_members", TxMode::Deferred, |exec| {
            self.session.flush_with(exec)?;
            exec.rows_values("Team.loadMembers", &sql, vec![Value::Integer(team_id)])?
                .iter()
                .map(|row| row.get_at::<EntityId>(0))
                .collect::<RepoResult<Vec<_>>>()
        })?;
        team.borrow_mut().replace_members(members.clone());
        Ok(members)
    }
}

fn lock_mode(descriptor: &QueryDescriptor) -> TxMode {
    match descriptor.lock {
        LockMode::PessimisticWrite => TxMode::Immediate,
        LockMode::None | LockMode::ReadOnly => TxMode::Deferred,
    }
}

fn window(descriptor: &mut QueryDescriptor, request: &PageRequest) -> RepoResult<()> {
    descriptor.apply_sort(&request.sort)?;
    descriptor.window = Some(PageWindow {
        offset: request.offset(),
        limit: request.size,
    });
    Ok(())
}

fn view_of<P: View>(declared: &QueryDescriptor) -> RepoResult<QueryDescriptor> {
    if declared.maps_entity() && !declared.is_native() {
        declared.clone().into_view(P::paths())
    } else {
        Ok(declared.clone())
    }
}

fn shape_mismatch(descriptor: &QueryDescriptor, requested: ResultShape) -> RepoError {
    RepoError::ShapeMismatch {
        query: descriptor.name.clone(),
        declared: descriptor.shape.name(),
        requested: requested.name(),
    }
}

fn expect_shape(
    descriptor: &QueryDescriptor,
    allowed: &[ResultShape],
    requested: ResultShape,
) -> RepoResult<()> {
    if allowed.contains(&descriptor.shape) {
        Ok(())
    } else {
        Err(shape_mismatch(descriptor, requested))
    }
}

fn expect_entities(descriptor: &QueryDescriptor, requested: ResultShape) -> RepoResult<()> {
    if descriptor.maps_entity() {
        return Ok(());
    }
    Err(RepoError::ShapeMismatch {
        query: descriptor.name.clone(),
        declared: "a column projection",
        requested: requested.name(),
    })
}
