//! Scope sets and the per-logger scope registry.
//!
//! A scope set names every entity under which one logical event should be
//! queryable. Entries are either bound to an id or unbound; unbound entries
//! only produce a row when fan-out can substitute the subject's own id.

use serde::Serialize;

use crate::entity::{Entity, EntityId};
use crate::identity::{Identity, Repositories};

/// Ordered mapping `type_name -> id-or-unbound`.
///
/// Inserting an existing type name overwrites its value in place, so the
/// first position of a key is kept and the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Scope {
    entries: Vec<(String, Option<EntityId>)>,
}

impl Scope {
    /// Creates an empty scope set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites an entry.
    pub fn insert(&mut self, type_name: impl Into<String>, id: Option<EntityId>) {
        let type_name = type_name.into();
        match self.entries.iter_mut().find(|(name, _)| *name == type_name) {
            Some((_, slot)) => *slot = id,
            None => self.entries.push((type_name, id)),
        }
    }

    /// Returns `true` when `type_name` is a key, bound or not.
    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == type_name)
    }

    /// The bound id for `type_name`, if any.
    pub fn id_of(&self, type_name: &str) -> Option<&EntityId> {
        self.entries
            .iter()
            .find(|(name, _)| name == type_name)
            .and_then(|(_, id)| id.as_ref())
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&EntityId>)> {
        self.entries
            .iter()
            .map(|(name, id)| (name.as_str(), id.as_ref()))
    }

    /// Type names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts the set back into members that normalise to the same set.
    pub fn members(&self) -> Vec<ScopeMember<'static>> {
        self.entries
            .iter()
            .map(|(name, id)| match id {
                Some(id) => ScopeMember::Bound(name.clone(), id.clone()),
                None => ScopeMember::ByType(name.clone()),
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, Option<EntityId>)> for Scope {
    fn from_iter<I: IntoIterator<Item = (S, Option<EntityId>)>>(iter: I) -> Self {
        let mut scope = Self::new();
        for (name, id) in iter {
            scope.insert(name, id);
        }
        scope
    }
}

/// One element of a scope declaration.
#[derive(Clone)]
pub enum ScopeMember<'a> {
    /// A type name with no bound id.
    ByType(String),
    /// A type name already bound to an id.
    Bound(String, EntityId),
    /// A live object, resolved through the repository registry.
    ByObject(&'a dyn Entity),
}

impl ScopeMember<'_> {
    /// Resolves the member to a scope entry. Objects that do not resolve to a
    /// registered type yield `None`.
    fn resolve(&self, repositories: &Repositories) -> Option<(String, Option<EntityId>)> {
        match self {
            Self::ByType(name) => Some((name.clone(), None)),
            Self::Bound(name, id) => Some((name.clone(), Some(id.clone()))),
            Self::ByObject(entity) => {
                let Identity { type_name, id } = repositories.resolve(Some(*entity));
                type_name.map(|name| (name, id))
            }
        }
    }
}

impl std::fmt::Debug for ScopeMember<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByType(name) => f.debug_tuple("ByType").field(name).finish(),
            Self::Bound(name, id) => f.debug_tuple("Bound").field(name).field(id).finish(),
            Self::ByObject(entity) => f.debug_tuple("ByObject").field(&entity.source()).finish(),
        }
    }
}

impl From<&str> for ScopeMember<'_> {
    fn from(name: &str) -> Self {
        Self::ByType(name.to_string())
    }
}

impl From<String> for ScopeMember<'_> {
    fn from(name: String) -> Self {
        Self::ByType(name)
    }
}

impl<'a, E: Entity> From<&'a E> for ScopeMember<'a> {
    fn from(entity: &'a E) -> Self {
        Self::ByObject(entity)
    }
}

/// Current and original scope of one logging-enabled entity type.
///
/// The registry is owned by its logger and mutated only through `&mut`
/// access, so one unit of work configures it at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRegistry {
    current: Scope,
    original: Scope,
}

impl ScopeRegistry {
    /// Builds the registry from the declared scope.
    ///
    /// An empty declaration defaults to `{self_type: unbound}`, which fan-out
    /// resolves to the subject's own id.
    pub fn initialize(
        repositories: &Repositories,
        self_type: &str,
        declared: &[ScopeMember<'_>],
    ) -> Self {
        let scope = if declared.is_empty() {
            std::iter::once((self_type, None)).collect()
        } else {
            Self::normalize(repositories, declared)
        };
        Self {
            current: scope.clone(),
            original: scope,
        }
    }

    /// Canonicalises heterogeneous members into a scope set.
    ///
    /// Later members with the same type name overwrite earlier ones.
    pub fn normalize(repositories: &Repositories, members: &[ScopeMember<'_>]) -> Scope {
        let mut scope = Scope::new();
        for member in members {
            match member.resolve(repositories) {
                Some((name, id)) => scope.insert(name, id),
                None => tracing::debug!(?member, "scope member did not resolve, ignoring"),
            }
        }
        scope
    }

    /// The scope applied to the next event.
    pub fn get(&self) -> &Scope {
        &self.current
    }

    /// The scope captured at initialisation.
    pub fn original(&self) -> &Scope {
        &self.original
    }

    /// Replaces the current scope.
    pub fn set(&mut self, repositories: &Repositories, members: &[ScopeMember<'_>]) {
        self.current = Self::normalize(repositories, members);
    }

    /// Restores the scope captured at initialisation.
    pub fn reset(&mut self) {
        self.current = self.original.clone();
    }

    /// Binds the issuer's id into the current scope when its type is already
    /// a key. Returns whether the scope changed.
    pub fn bind_issuer(&mut self, issuer: &Identity) -> bool {
        match &issuer.type_name {
            Some(name) if self.current.contains(name) => {
                self.current.insert(name.clone(), issuer.id.clone());
                true
            }
            _ => false,
        }
    }
}
