//! Per entity type activity logger: configuration, lifecycle hooks, manual
//! logging and the activity finder.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::LoggerSettings;
use crate::entity::{dirty_snapshot, full_snapshot, Entity};
use crate::error::{ActivityError, BoxError};
use crate::fanout;
use crate::identity::{Identity, Repositories};
use crate::record::{Action, ActivityLog, Level, LogRecord, MessageBuilder, MessageContext};
use crate::scope::{Scope, ScopeMember, ScopeRegistry};
use crate::store::{ActivityFilter, LogStore, TableName};

/// Hooks the host persistence framework calls after its own write succeeds.
pub trait LifecycleHooks {
    /// Logs a create (when `is_new`) or an update of `changed_fields`.
    ///
    /// # Errors
    ///
    /// Propagates message builder and persistence failures. The host's own
    /// write is not rolled back.
    fn on_after_save(
        &self,
        entity: &dyn Entity,
        is_new: bool,
        changed_fields: &[&str],
    ) -> Result<Vec<ActivityLog>, ActivityError>;

    /// Logs a delete with the full pre-delete snapshot.
    ///
    /// # Errors
    ///
    /// Propagates message builder and persistence failures.
    fn on_after_delete(&self, entity: &dyn Entity) -> Result<Vec<ActivityLog>, ActivityError>;
}

/// Per-call options of [`ActivityLogger::log`].
#[derive(Default)]
pub struct LogContext<'a> {
    /// Subject of the entry.
    pub object: Option<&'a dyn Entity>,
    /// Issuer override; defaults to the configured issuer.
    pub issuer: Option<&'a dyn Entity>,
    /// Scope for this call only. Empty means the configured scope.
    pub scope: Vec<ScopeMember<'a>>,
    /// Action override; defaults to [`Action::Custom`].
    pub action: Option<Action>,
    /// Payload override; defaults to the full snapshot of `object`.
    pub data: Option<Map<String, Value>>,
}

impl<'a> LogContext<'a> {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(mut self, object: &'a dyn Entity) -> Self {
        self.object = Some(object);
        self
    }

    pub fn issuer(mut self, issuer: &'a dyn Entity) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn scope(mut self, members: impl IntoIterator<Item = ScopeMember<'a>>) -> Self {
        self.scope = members.into_iter().collect();
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

/// Activity logger for one logging-enabled entity type.
///
/// Owns the type's scope registry, issuer and message builder. Setters take
/// `&mut self`: the logger belongs to one unit of work (a request or a
/// transaction) at a time and is not meant for uncoordinated mutation from
/// several threads.
pub struct ActivityLogger<S> {
    store: S,
    repositories: Arc<Repositories>,
    type_name: String,
    log_table: TableName,
    scope: ScopeRegistry,
    issuer: Option<Arc<dyn Entity>>,
    message_builder: Option<MessageBuilder>,
}

impl<S: LogStore> ActivityLogger<S> {
    /// Creates a logger for `type_name` writing to `log_table`.
    ///
    /// An empty `declared_scope` defaults to the type's own scope.
    pub fn new(
        store: S,
        repositories: Arc<Repositories>,
        type_name: impl Into<String>,
        log_table: TableName,
        declared_scope: &[ScopeMember<'_>],
    ) -> Self {
        let type_name = type_name.into();
        let scope = ScopeRegistry::initialize(&repositories, &type_name, declared_scope);
        Self {
            store,
            repositories,
            type_name,
            log_table,
            scope,
            issuer: None,
            message_builder: None,
        }
    }

    /// Creates a logger from loaded configuration.
    pub fn from_settings(
        store: S,
        repositories: Arc<Repositories>,
        type_name: impl Into<String>,
        settings: &LoggerSettings,
    ) -> Self {
        let declared: Vec<ScopeMember<'_>> = settings
            .scope
            .iter()
            .map(|name| ScopeMember::ByType(name.clone()))
            .collect();
        Self::new(
            store,
            repositories,
            type_name,
            settings.log_table.clone(),
            &declared,
        )
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registered type name of the logged entity type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Log store target.
    pub fn log_table(&self) -> &TableName {
        &self.log_table
    }

    pub fn scope(&self) -> &Scope {
        self.scope.get()
    }

    /// Replaces the current scope.
    pub fn set_scope(&mut self, members: &[ScopeMember<'_>]) -> &mut Self {
        self.scope.set(&self.repositories, members);
        self
    }

    /// Restores the scope captured at construction.
    pub fn reset_scope(&mut self) -> &mut Self {
        self.scope.reset();
        self
    }

    pub fn issuer(&self) -> Option<&dyn Entity> {
        self.issuer.as_deref()
    }

    /// Sets the issuer of subsequent events. If the issuer's type is already
    /// a scope key, that key is bound to the issuer's id.
    pub fn set_issuer(&mut self, issuer: Arc<dyn Entity>) -> &mut Self {
        let identity = self.repositories.resolve(Some(&*issuer));
        if self.scope.bind_issuer(&identity) {
            tracing::debug!(
                type_name = %self.type_name,
                issuer_type = ?identity.type_name,
                "issuer bound into scope"
            );
        }
        self.issuer = Some(issuer);
        self
    }

    pub fn clear_issuer(&mut self) -> &mut Self {
        self.issuer = None;
        self
    }

    pub fn message_builder(&self) -> Option<&MessageBuilder> {
        self.message_builder.as_ref()
    }

    /// Registers the hook that renders messages for every record.
    pub fn set_message_builder<F>(&mut self, builder: F) -> &mut Self
    where
        F: Fn(&LogRecord, &MessageContext<'_>) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.message_builder = Some(Arc::new(builder));
        self
    }

    pub fn clear_message_builder(&mut self) -> &mut Self {
        self.message_builder = None;
        self
    }

    /// Writes a custom entry and returns the persisted rows.
    ///
    /// A scope in `context` applies to this call only. When the resolved
    /// issuer's type is a configured scope key, its id is bound into the
    /// per-call scope. Zero rows is not an error: with no resolvable scope
    /// entry the entry is dropped.
    ///
    /// # Errors
    ///
    /// Propagates message builder and persistence failures.
    pub fn log(
        &self,
        level: Level,
        message: &str,
        context: LogContext<'_>,
    ) -> Result<Vec<ActivityLog>, ActivityError> {
        let LogContext {
            object,
            issuer,
            scope,
            action,
            data,
        } = context;
        let issuer = issuer.or(self.issuer());

        let mut scope = if scope.is_empty() {
            self.scope.get().clone()
        } else {
            ScopeRegistry::normalize(&self.repositories, &scope)
        };

        let mut record = LogRecord::build(&self.repositories, object, issuer);
        record.action = action.unwrap_or(Action::Custom);
        record.data = data.or_else(|| full_snapshot(object));
        record.level = level;
        record.message = message.to_string();
        record.finalize_message(
            self.message_builder.as_ref(),
            &MessageContext {
                subject: object,
                issuer,
            },
        )?;

        let issuer_identity = record.issuer();
        if let (Some(issuer_type), Some(issuer_id)) =
            (&issuer_identity.type_name, issuer_identity.resolved_id())
        {
            if self.scope.get().contains(issuer_type) {
                scope.insert(issuer_type.clone(), Some(issuer_id.clone()));
            }
        }

        let subject = object.map(|_| record.subject());
        self.dispatch(&scope, &record, subject.as_ref())
    }

    /// Rows queryable under this entity type, or under `scope` when given,
    /// newest first.
    ///
    /// An object whose type or id does not resolve matches no rows.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn find_activity(
        &self,
        scope: Option<&dyn Entity>,
    ) -> Result<Vec<ActivityLog>, ActivityError> {
        let filter = match scope {
            None => ActivityFilter {
                scope_type: Some(self.type_name.clone()),
                ..Default::default()
            },
            Some(object) => {
                let identity = self.repositories.resolve(Some(object));
                let (Some(type_name), Some(id)) =
                    (identity.type_name.clone(), identity.resolved_id().cloned())
                else {
                    tracing::debug!(
                        type_name = %self.type_name,
                        source = object.source(),
                        "scope object did not resolve, no activity to find"
                    );
                    return Ok(Vec::new());
                };
                ActivityFilter {
                    scope_type: Some(type_name),
                    scope_id: Some(id),
                    ..Default::default()
                }
            }
        };
        Ok(self.store.find(&self.log_table, &filter)?)
    }

    fn record_for(&self, entity: &dyn Entity, action: Action) -> LogRecord {
        let mut record = LogRecord::build(&self.repositories, Some(entity), self.issuer());
        record.action = action;
        record
    }

    fn finish(
        &self,
        mut record: LogRecord,
        entity: &dyn Entity,
    ) -> Result<Vec<ActivityLog>, ActivityError> {
        record.finalize_message(
            self.message_builder.as_ref(),
            &MessageContext {
                subject: Some(entity),
                issuer: self.issuer(),
            },
        )?;
        let subject = record.subject();
        self.dispatch(self.scope.get(), &record, Some(&subject))
    }

    fn dispatch(
        &self,
        scope: &Scope,
        record: &LogRecord,
        subject: Option<&Identity>,
    ) -> Result<Vec<ActivityLog>, ActivityError> {
        let rows = fanout::expand(scope, record, &self.type_name, subject);
        if rows.is_empty() {
            tracing::debug!(
                type_name = %self.type_name,
                action = %record.action,
                scope_len = scope.len(),
                "no scope entry resolved to an id, dropping activity event"
            );
            return Ok(Vec::new());
        }

        let saved = self.store.save_atomic(&self.log_table, &rows)?;
        tracing::debug!(
            type_name = %self.type_name,
            action = %record.action,
            rows = saved.len(),
            "activity event logged"
        );
        Ok(saved)
    }
}

impl<S: LogStore> LifecycleHooks for ActivityLogger<S> {
    fn on_after_save(
        &self,
        entity: &dyn Entity,
        is_new: bool,
        changed_fields: &[&str],
    ) -> Result<Vec<ActivityLog>, ActivityError> {
        let (action, data) = if is_new {
            (Action::Create, full_snapshot(Some(entity)))
        } else {
            (Action::Update, dirty_snapshot(Some(entity), changed_fields))
        };
        let mut record = self.record_for(entity, action);
        record.data = data;
        self.finish(record, entity)
    }

    fn on_after_delete(&self, entity: &dyn Entity) -> Result<Vec<ActivityLog>, ActivityError> {
        let mut record = self.record_for(entity, Action::Delete);
        record.data = full_snapshot(Some(entity));
        self.finish(record, entity)
    }
}
