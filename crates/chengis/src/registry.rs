//! Plugin registry (§4.E): a name → capability map for step executors,
//! notifiers, SCM providers, artifact handlers, pipeline formats, and SCM
//! status reporters.
//!
//! Per the design notes (§9), this is explicit injection rather than a
//! global: one [`PluginRegistry`] instance is built at startup with
//! [`PluginRegistry::init`] and handed to the executor by reference inside
//! a `BuildContext`-shaped value (here, [`crate::pipeline::ExecutionContext`]),
//! instead of being reached for as process-wide state.
//!
//! `register-step-executor!` (§8 idempotence) is last-write-wins per name;
//! [`NamedRegistry`] implements that once, generically, for every capability
//! kind this module tracks.

use std::collections::HashMap;
use std::sync::RwLock;

/// A name → value map with last-write-wins registration. Used for every
/// capability kind the plugin registry tracks: step executor types,
/// notifier types, SCM providers, artifact handler kinds, pipeline formats,
/// and SCM status reporters.
pub struct NamedRegistry<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Default for NamedRegistry<T> {
    fn default() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }
}

impl<T: Clone> NamedRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `name`. Idempotent: registering the same
    /// name twice overwrites the previous value rather than erroring.
    pub fn register(&self, name: impl Into<String>, value: T) {
        self.entries.write().expect("registry lock poisoned").insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.entries.read().expect("registry lock poisoned").get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().expect("registry lock poisoned").contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().expect("registry lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().expect("registry lock poisoned").remove(name).is_some()
    }
}

/// Marker value for capability kinds that don't carry per-entry data beyond
/// "this name is supported" — step executor and pipeline format kinds are
/// dispatched by the step executor / parser directly rather than through a
/// trait object stored here; the registry's job is to answer "is `docker`
/// registered" before dispatch is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability;

/// The plugin registry binding every pluggable subsystem together.
///
/// Lifecycle: [`PluginRegistry::init`] builds the default registrations at
/// startup (the built-in step types and SCM providers); [`PluginRegistry::shutdown`]
/// is a no-op hook reserved for a future implementation that owns external
/// resources (connection pools, subprocess handles) — none of the current
/// capability kinds do, but the hook is kept so a caller never has to
/// restructure around its absence later.
pub struct PluginRegistry {
    pub step_executors: NamedRegistry<Capability>,
    pub notifiers: NamedRegistry<Capability>,
    pub scm_providers: NamedRegistry<Capability>,
    pub artifact_handlers: NamedRegistry<Capability>,
    pub pipeline_formats: NamedRegistry<Capability>,
    pub scm_status_reporters: NamedRegistry<Capability>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            step_executors: NamedRegistry::new(),
            notifiers: NamedRegistry::new(),
            scm_providers: NamedRegistry::new(),
            artifact_handlers: NamedRegistry::new(),
            pipeline_formats: NamedRegistry::new(),
            scm_status_reporters: NamedRegistry::new(),
        }
    }

    /// Build a registry with the built-in capabilities this workspace ships
    /// registered: the `shell`/`docker`/`compose` step executors, the
    /// `slack`/`discord`/`generic` notifiers, the four detected SCM
    /// providers and their status reporters, the `workspace-copy` artifact
    /// handler, and the `yaml`/`json` pipeline formats (parsing itself is
    /// out of scope; this only records that the names are known).
    pub fn init() -> Self {
        let registry = Self::new();
        for name in ["shell", "docker", "compose"] {
            registry.step_executors.register(name, Capability);
        }
        for name in ["slack", "discord", "generic"] {
            registry.notifiers.register(name, Capability);
        }
        for name in ["github", "gitlab", "bitbucket", "gitea"] {
            registry.scm_providers.register(name, Capability);
            registry.scm_status_reporters.register(name, Capability);
        }
        registry.artifact_handlers.register("workspace-copy", Capability);
        for name in ["yaml", "json"] {
            registry.pipeline_formats.register(name, Capability);
        }
        registry
    }

    /// No-op today; see struct docs.
    pub fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_step_executor_is_idempotent_last_write_wins() {
        let registry: NamedRegistry<&'static str> = NamedRegistry::new();
        registry.register("docker", "v1");
        registry.register("docker", "v2");
        assert_eq!(registry.get("docker"), Some("v2"));
        assert_eq!(registry.names().len(), 1);
    }

    #[test]
    fn unregistered_capability_returns_none() {
        let registry: NamedRegistry<Capability> = NamedRegistry::new();
        assert_eq!(registry.get("nonexistent"), None);
        assert!(!registry.contains("nonexistent"));
    }

    #[test]
    fn init_registers_built_in_step_executors_and_scm_providers() {
        let registry = PluginRegistry::init();
        assert!(registry.step_executors.contains("shell"));
        assert!(registry.step_executors.contains("docker"));
        assert!(registry.step_executors.contains("compose"));
        assert!(registry.scm_providers.contains("github"));
        assert!(registry.scm_providers.contains("gitlab"));
        assert!(registry.scm_providers.contains("bitbucket"));
        assert!(registry.scm_providers.contains("gitea"));
        assert!(!registry.step_executors.contains("unknown-type"));
    }

    #[test]
    fn names_are_sorted() {
        let registry: NamedRegistry<Capability> = NamedRegistry::new();
        registry.register("zebra", Capability);
        registry.register("alpha", Capability);
        assert_eq!(registry.names(), vec!["alpha".to_string(), "zebra".to_string()]);
    }
}
