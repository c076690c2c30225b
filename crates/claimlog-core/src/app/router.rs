//! Multi-project router: which namespaces a caller may draw tasks from.
//!
//! Pure discovery over one backlog view. A namespace exists when its directory
//! exists under the tasks root; there is no registry to keep in sync.

use std::collections::BTreeSet;

use crate::backlog::Backlog;
use crate::domain::Namespace;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Every namespace present in the tree.
    #[default]
    All,

    /// Exactly one namespace.
    Pinned(Namespace),

    /// Any of these. An empty list allows nothing.
    AllowList(BTreeSet<Namespace>),
}

impl NamespaceScope {
    /// Scope for a caller with an optional namespace filter, inside an
    /// operator allow-list (empty = unrestricted).
    ///
    /// A filter outside the allow-list yields a scope that allows nothing.
    pub fn resolve(filter: Option<Namespace>, allow_list: &[Namespace]) -> Self {
        match filter {
            Some(ns) if allow_list.is_empty() || allow_list.contains(&ns) => {
                NamespaceScope::Pinned(ns)
            }
            Some(_) => NamespaceScope::AllowList(BTreeSet::new()),
            None if allow_list.is_empty() => NamespaceScope::All,
            None => NamespaceScope::AllowList(allow_list.iter().cloned().collect()),
        }
    }

    pub fn allows(&self, namespace: &Namespace) -> bool {
        match self {
            NamespaceScope::All => true,
            NamespaceScope::Pinned(ns) => ns == namespace,
            NamespaceScope::AllowList(allowed) => allowed.contains(namespace),
        }
    }
}

/// Namespaces present in `backlog` that `scope` allows, in name order.
pub fn discover(backlog: &Backlog, scope: &NamespaceScope) -> Vec<Namespace> {
    if let NamespaceScope::Pinned(ns) = scope {
        return if backlog.has_namespace(ns) { vec![ns.clone()] } else { Vec::new() };
    }
    backlog
        .namespaces()
        .filter(|ns| scope.allows(ns))
        .cloned()
        .collect()
}
