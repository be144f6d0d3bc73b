//! Function Watches
//!
//! Process-wide registry mapping watched function identifiers to span
//! behavior. Mutated at configuration time, consulted by instrumentation
//! call sites at steady state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::span::Scalar;

/// Wrapper frames that only add noise; always ignored
pub const BUILTIN_IGNORE_FUNCTIONS: &[&str] = &["<main>", "<closure>"];

/// Default span category for watches registered without one
pub const DEFAULT_WATCH_CATEGORY: &str = "custom";

/// Call-site context handed to watch callbacks
#[derive(Debug)]
pub struct CallSite<'a> {
    /// The watched function identifier
    pub function: &'a str,
    /// Argument values supplied by the instrumentation layer
    pub args: &'a [Scalar],
}

/// Callback deciding whether and how to create a span for a watched call.
///
/// Returns the created span's id, or `None` when no span was created.
pub type WatchCallback = dyn Fn(&CallSite<'_>) -> Option<u64> + Send + Sync;

/// Registered behavior for one watched function
#[derive(Clone)]
pub enum WatchMode {
    /// Wrap every call in an auto-started span of this category
    Category(String),
    /// Invoke a custom callback in place of the default wrapping
    Callback(Arc<WatchCallback>),
}

/// Registry of watched function identifiers
pub struct WatchRegistry {
    watches: RwLock<HashMap<String, WatchMode>>,
    ignores: RwLock<HashSet<String>>,
}

impl WatchRegistry {
    /// Create a registry seeded with the built-in ignore list
    pub fn new() -> Self {
        Self {
            watches: RwLock::new(HashMap::new()),
            ignores: RwLock::new(
                BUILTIN_IGNORE_FUNCTIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    /// Watch a function, wrapping every call in a span of the given
    /// category. Argument values are not auto-captured.
    pub fn watch(&self, function: impl Into<String>, category: Option<&str>) {
        let function = function.into();
        let category = category.unwrap_or(DEFAULT_WATCH_CATEGORY).to_string();
        tracing::debug!(%function, %category, "watch registered");

        self.write_watches()
            .insert(function, WatchMode::Category(category));
    }

    /// Watch a function with a custom callback.
    ///
    /// Mutually exclusive with [`watch`](Self::watch) per identifier; the
    /// last registration wins.
    pub fn watch_callback<F>(&self, function: impl Into<String>, callback: F)
    where
        F: Fn(&CallSite<'_>) -> Option<u64> + Send + Sync + 'static,
    {
        let function = function.into();
        tracing::debug!(%function, "watch callback registered");

        self.write_watches()
            .insert(function, WatchMode::Callback(Arc::new(callback)));
    }

    /// Remove functions from instrumentation consideration entirely.
    ///
    /// Union with the built-in ignore list; repeated calls are idempotent.
    pub fn add_ignore_functions<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ignores = match self.ignores.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for name in names {
            ignores.insert(name.into());
        }
    }

    /// True when the function is on the ignore list
    pub fn is_ignored(&self, function: &str) -> bool {
        let ignores = match self.ignores.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ignores.contains(function)
    }

    /// The registered behavior for a function, unless it is ignored
    pub fn lookup(&self, function: &str) -> Option<WatchMode> {
        if self.is_ignored(function) {
            return None;
        }

        let watches = match self.watches.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watches.get(function).cloned()
    }

    /// Number of registered watches
    pub fn watch_count(&self) -> usize {
        let watches = match self.watches.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watches.len()
    }

    fn write_watches(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WatchMode>> {
        match self.watches.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_with_default_category() {
        let registry = WatchRegistry::new();
        registry.watch("mysql_query", None);

        match registry.lookup("mysql_query") {
            Some(WatchMode::Category(category)) => assert_eq!(category, DEFAULT_WATCH_CATEGORY),
            _ => panic!("expected a category watch"),
        }
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = WatchRegistry::new();

        registry.watch("mysql_query", Some("sql"));
        registry.watch_callback("mysql_query", |_site| None);

        assert!(matches!(
            registry.lookup("mysql_query"),
            Some(WatchMode::Callback(_))
        ));

        registry.watch("mysql_query", Some("sql"));
        assert!(matches!(
            registry.lookup("mysql_query"),
            Some(WatchMode::Category(c)) if c == "sql"
        ));
        assert_eq!(registry.watch_count(), 1);
    }

    #[test]
    fn test_builtin_ignores_present() {
        let registry = WatchRegistry::new();

        for name in BUILTIN_IGNORE_FUNCTIONS {
            assert!(registry.is_ignored(name));
        }
    }

    #[test]
    fn test_ignored_function_has_no_watch() {
        let registry = WatchRegistry::new();

        registry.watch("array_walk", Some("php"));
        registry.add_ignore_functions(["array_walk"]);

        assert!(registry.is_ignored("array_walk"));
        assert!(registry.lookup("array_walk").is_none());
    }

    #[test]
    fn test_add_ignore_functions_idempotent() {
        let registry = WatchRegistry::new();

        registry.add_ignore_functions(["foo", "bar"]);
        registry.add_ignore_functions(["foo"]);

        assert!(registry.is_ignored("foo"));
        assert!(registry.is_ignored("bar"));
    }

    #[test]
    fn test_callback_receives_call_site() {
        let registry = WatchRegistry::new();
        registry.watch_callback("pdo_query", |site| {
            assert_eq!(site.function, "pdo_query");
            Some(7)
        });

        let Some(WatchMode::Callback(callback)) = registry.lookup("pdo_query") else {
            panic!("expected a callback watch");
        };
        let args = [Scalar::from("SELECT 1")];
        let site = CallSite {
            function: "pdo_query",
            args: &args,
        };
        assert_eq!(callback(&site), Some(7));
    }
}
