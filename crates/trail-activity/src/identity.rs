//! Identity resolution: domain object to `(type_name, id)`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId};

/// The `(type_name, id)` pair recorded for issuers, subjects and scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Registered type name of the owning repository.
    pub type_name: Option<String>,
    /// Primary key value.
    pub id: Option<EntityId>,
}

impl Identity {
    /// Creates a fully bound identity.
    pub fn new(type_name: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            id: Some(id.into()),
        }
    }

    /// The `(null, null)` identity of an absent object.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns the id when it is present and non-empty.
    pub fn resolved_id(&self) -> Option<&EntityId> {
        self.id.as_ref().filter(|id| !id.is_empty())
    }
}

/// How a repository is registered with the logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    /// Type name written to the `*_type` columns.
    pub alias: String,
    /// Field holding the primary key.
    pub primary_key: String,
}

/// Registry of repositories keyed by [`Entity::source`].
///
/// Resolution is best-effort: an absent entity or an unregistered source
/// yields [`Identity::none`] instead of an error.
#[derive(Debug, Clone, Default)]
pub struct Repositories {
    by_source: HashMap<String, RepositoryInfo>,
}

impl Repositories {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a repository, replacing any previous entry for `source`.
    pub fn register(
        &mut self,
        source: impl Into<String>,
        alias: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> &mut Self {
        self.by_source.insert(
            source.into(),
            RepositoryInfo {
                alias: alias.into(),
                primary_key: primary_key.into(),
            },
        );
        self
    }

    /// Builder form of [`Repositories::register`] where the alias equals the
    /// source key.
    pub fn with(mut self, source: &str, primary_key: &str) -> Self {
        self.register(source, source, primary_key);
        self
    }

    /// Looks up a repository by source key.
    pub fn get(&self, source: &str) -> Option<&RepositoryInfo> {
        self.by_source.get(source)
    }

    /// Resolves an entity to its identity pair.
    pub fn resolve(&self, entity: Option<&dyn Entity>) -> Identity {
        let Some(entity) = entity else {
            return Identity::none();
        };
        let Some(info) = self.get(entity.source()) else {
            tracing::debug!(
                source = entity.source(),
                "entity source is not a registered repository"
            );
            return Identity::none();
        };
        Identity {
            type_name: Some(info.alias.clone()),
            id: entity
                .field(&info.primary_key)
                .as_ref()
                .and_then(EntityId::from_value),
        }
    }
}
