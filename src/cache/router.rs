//! Notification kind → cache namespace routing table.
//!
//! A kind invalidates whole namespace prefixes, never individual queries.

use tracing::trace;

use super::NamespaceKey;

struct Route {
    /// Exact kind, or `"namespace.*"` for every kind in a namespace.
    pattern: &'static str,
    keys: &'static [&'static [&'static str]],
}

const ROUTES: &[Route] = &[
    Route {
        pattern: "session.*",
        keys: &[&["sessions"], &["dashboard"]],
    },
    Route {
        pattern: "worker.*",
        keys: &[&["workers"]],
    },
    Route {
        pattern: "worker.completed",
        keys: &[&["dashboard"], &["missions"], &["duties"]],
    },
    Route {
        pattern: "worker.failed",
        keys: &[&["dashboard"], &["missions"], &["duties"]],
    },
    Route {
        pattern: "priority.*",
        keys: &[&["priorities"], &["dashboard"]],
    },
    Route {
        pattern: "mission.*",
        keys: &[&["missions"], &["dashboard"]],
    },
    Route {
        pattern: "duty.*",
        keys: &[&["duties"], &["calendar"]],
    },
    Route {
        pattern: "file.*",
        keys: &[&["files"]],
    },
    Route {
        pattern: "calendar.*",
        keys: &[&["calendar"], &["dashboard"]],
    },
    Route {
        pattern: "contact.*",
        keys: &[&["contacts"]],
    },
    Route {
        pattern: "message.*",
        keys: &[&["messages"], &["conversations"]],
    },
    Route {
        pattern: "email.*",
        keys: &[&["email"], &["dashboard"]],
    },
];

/// Whether `kind` matches a subscription/route pattern.
///
/// `"*"` matches everything, `"ns.*"` matches every kind in `ns`, anything
/// else must match exactly.
pub fn kind_matches(pattern: &str, kind: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(namespace) => kind
            .strip_prefix(namespace)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => pattern == kind,
    }
}

/// Static routing from notification kind to the namespaces it may have
/// made stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationRouter;

impl InvalidationRouter {
    pub fn new() -> Self {
        Self
    }

    /// Every namespace prefix `kind` invalidates, deduplicated, in table
    /// order. Unknown kinds route nowhere.
    pub fn route(&self, kind: &str) -> Vec<NamespaceKey> {
        let mut keys: Vec<NamespaceKey> = Vec::new();
        for route in ROUTES.iter().filter(|route| kind_matches(route.pattern, kind)) {
            for segments in route.keys {
                let key = NamespaceKey::from(*segments);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        if keys.is_empty() {
            trace!(kind, "no invalidation route");
        }
        keys
    }

    /// Namespace roots the table can ever produce.
    pub fn namespaces(&self) -> Vec<NamespaceKey> {
        let mut keys: Vec<NamespaceKey> = Vec::new();
        for route in ROUTES {
            for segments in route.keys {
                let key = NamespaceKey::from(*segments);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}
