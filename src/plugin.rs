//! Module / plugin framework (spec §4.15): the registration and
//! config-reload machinery that the (out-of-scope, spec §1) individual
//! content-handler / logging / condition modules hang off of.
//!
//! Two tiers exist in the source: angel plugins (loaded by the supervisor)
//! and server plugins (loaded inside a server process). Both share the same
//! shape here — a [`Plugin`] is a named bundle of option schema entries,
//! action factories, setup directives, and lifecycle hooks; a [`Module`]
//! is the dlopen-able unit that owns one or more plugins. Since this core
//! never actually calls `dlopen` (modules are supplied as already-linked
//! trait objects), [`ModuleTable`] models "ref-counted, not unloaded while
//! referenced" directly via `Arc::strong_count`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::action::Action;
use crate::config::option::{OptionDef, OptionSet};
use crate::config::value::Value;
use crate::error::Error;

/// Lifecycle callbacks a plugin may implement (spec §4.15 "Plugins can
/// register hooks"). All are no-ops by default; a plugin overrides only
/// the ones it cares about.
pub trait PluginHooks: Send + Sync {
    /// A connection is closing.
    fn handle_close(&self) {}
    /// A VR is closing (spec: per-VR, distinct from per-connection).
    fn handle_vrclose(&self) {}
    /// The server is about to start accepting connections.
    fn handle_prepare(&self) {}
    /// A worker thread has just started.
    fn handle_prepare_worker(&self) {}
    /// The server is no longer listening (graceful shutdown).
    fn handle_stop_listen(&self) {}
    /// Validate a candidate config before it's activated. An `Err` aborts
    /// the reload; the currently active config is left untouched.
    fn handle_check_config(&self) -> Result<(), Error> {
        Ok(())
    }
    /// The previously-active config is being retired.
    fn handle_clean_config(&self) {}
    /// A checked config has been swapped in as the active one.
    fn handle_activate_config(&self) {}
}

type ActionFactory = Arc<dyn Fn(Value) -> Result<Arc<Action>, Error> + Send + Sync>;
type SetupFn = Arc<dyn Fn(Value) -> Result<(), Error> + Send + Sync>;

/// A named bundle of options, actions, setups, and hooks (spec `liPlugin`
/// / the server-side half of §4.15).
pub struct Plugin {
    pub name: &'static str,
    options: Vec<OptionDef>,
    actions: HashMap<&'static str, ActionFactory>,
    setups: HashMap<&'static str, SetupFn>,
    hooks: Option<Arc<dyn PluginHooks>>,
}

/// A ref-counted handle to a registered plugin; cheap to clone, shared
/// between the registry and every action tree it compiled.
pub type PluginRef = Arc<Plugin>;

impl Plugin {
    pub fn new(name: &'static str) -> Plugin {
        Plugin {
            name,
            options: Vec::new(),
            actions: HashMap::new(),
            setups: HashMap::new(),
            hooks: None,
        }
    }

    pub fn with_option(mut self, def: OptionDef) -> Plugin {
        self.options.push(def);
        self
    }

    pub fn with_action(mut self, name: &'static str, factory: impl Fn(Value) -> Result<Arc<Action>, Error> + Send + Sync + 'static) -> Plugin {
        self.actions.insert(name, Arc::new(factory));
        self
    }

    pub fn with_setup(mut self, name: &'static str, setup: impl Fn(Value) -> Result<(), Error> + Send + Sync + 'static) -> Plugin {
        self.setups.insert(name, Arc::new(setup));
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PluginHooks>) -> Plugin {
        self.hooks = Some(hooks);
        self
    }

    pub fn options(&self) -> &[OptionDef] {
        &self.options
    }

    pub fn action_names(&self) -> impl Iterator<Item = &&'static str> {
        self.actions.keys()
    }

    pub fn setup_names(&self) -> impl Iterator<Item = &&'static str> {
        self.setups.keys()
    }

    pub fn hooks(&self) -> Option<&Arc<dyn PluginHooks>> {
        self.hooks.as_ref()
    }

    fn create_action(&self, name: &str, param: Value) -> Option<Result<Arc<Action>, Error>> {
        self.actions.get(name).map(|factory| factory(param))
    }

    fn run_setup(&self, name: &str, param: Value) -> Option<Result<(), Error>> {
        self.setups.get(name).map(|setup| setup(param))
    }
}

/// `module.name` dotted key used throughout the registry (spec §6.6).
fn qualify(module: &str, name: &str) -> String {
    if module.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", module, name)
    }
}

/// The checked-in set of plugins for one compiled configuration (spec
/// §4.15 "registers liPluginOption... liPluginAction... liPluginSetup";
/// "Duplicate names across plugins are rejected with an error").
pub struct PluginRegistry {
    plugins: Vec<PluginRef>,
    actions: HashMap<String, PluginRef>,
    setups: HashMap<String, PluginRef>,
    option_index: HashMap<String, usize>,
    next_option_index: usize,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        PluginRegistry::new()
    }
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry {
            plugins: Vec::new(),
            actions: HashMap::new(),
            setups: HashMap::new(),
            option_index: HashMap::new(),
            next_option_index: 0,
        }
    }

    /// Register `plugin`, assigning a global option index to each of its
    /// option definitions and rejecting name collisions against whatever
    /// is already registered.
    pub fn register(&mut self, plugin: PluginRef) -> Result<(), Error> {
        for name in plugin.action_names() {
            let key = qualify(plugin.name, name);
            if self.actions.contains_key(&key) {
                return Err(Error::config_invalid(format!("duplicate action name {}", key)));
            }
        }
        for name in plugin.setup_names() {
            let key = qualify(plugin.name, name);
            if self.setups.contains_key(&key) {
                return Err(Error::config_invalid(format!("duplicate setup name {}", key)));
            }
        }
        for def in plugin.options() {
            let key = def.qualified_name();
            if self.option_index.contains_key(&key) {
                return Err(Error::config_invalid(format!("duplicate option name {}", key)));
            }
        }

        for name in plugin.action_names() {
            self.actions.insert(qualify(plugin.name, name), plugin.clone());
        }
        for name in plugin.setup_names() {
            self.setups.insert(qualify(plugin.name, name), plugin.clone());
        }
        for def in plugin.options() {
            self.option_index.insert(def.qualified_name(), self.next_option_index);
            self.next_option_index += 1;
        }
        self.plugins.push(plugin);
        Ok(())
    }

    /// Build the compiled action a directive `name(param)` refers to.
    pub fn create_action(&self, name: &str, param: Value) -> Result<Arc<Action>, Error> {
        let plugin = self.actions.get(name).ok_or_else(|| Error::config_invalid(format!("unknown action {}", name)))?;
        let short = name.rsplit('.').next().unwrap_or(name);
        plugin
            .create_action(short, param)
            .unwrap_or_else(|| Err(Error::config_invalid(format!("action {} vanished from its plugin", name))))
    }

    /// Run a registered setup directive (a global, non-per-request call).
    pub fn run_setup(&self, name: &str, param: Value) -> Result<(), Error> {
        let plugin = self.setups.get(name).ok_or_else(|| Error::config_invalid(format!("unknown setup {}", name)))?;
        let short = name.rsplit('.').next().unwrap_or(name);
        plugin
            .run_setup(short, param)
            .unwrap_or_else(|| Err(Error::config_invalid(format!("setup {} vanished from its plugin", name))))
    }

    /// The option index assigned to `name` (spec §4.15 `parse_option`
    /// producing an `OptionSet { index, value }`).
    pub fn option_index(&self, name: &str) -> Option<usize> {
        self.option_index.get(name).copied()
    }

    /// Validate and resolve a raw directive value against `name`'s schema.
    pub fn parse_option(&self, name: &str, value: Value) -> Result<OptionSet, Error> {
        let index = self.option_index(name).ok_or_else(|| Error::config_invalid(format!("unknown option {}", name)))?;
        for plugin in &self.plugins {
            if let Some(def) = plugin.options().iter().find(|d| d.qualified_name() == name) {
                let mut set = def.parse_option(value)?;
                set.index = index;
                return Ok(set);
            }
        }
        Err(Error::config_invalid(format!("unknown option {}", name)))
    }

    pub fn plugins(&self) -> &[PluginRef] {
        &self.plugins
    }

    fn plugins_with_hooks(&self) -> impl Iterator<Item = &Arc<dyn PluginHooks>> {
        self.plugins.iter().filter_map(|p| p.hooks())
    }
}

/// A dlopen-able unit owning one or more plugins (spec `liModule`). This
/// core never actually calls `dlopen`; modules are supplied pre-linked,
/// but ref-counting and "unchanged modules are not unloaded" (spec
/// §4.15) are still real: [`ModuleTable::unload_unreferenced`] only drops
/// a module once nothing outside the table still holds it.
pub struct Module {
    pub name: String,
    pub plugins: Vec<PluginRef>,
}

pub type ModuleRef = Arc<Module>;

/// Process-wide module table (spec §9 "Global state... init before
/// workers start, teardown after workers exit").
pub struct ModuleTable {
    modules: Mutex<HashMap<String, ModuleRef>>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        ModuleTable::new()
    }
}

impl ModuleTable {
    pub fn new() -> ModuleTable {
        ModuleTable {
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Load (or re-use) a module by name.
    pub fn load(&self, module: ModuleRef) {
        self.modules.lock().unwrap().entry(module.name.clone()).or_insert(module);
    }

    pub fn get(&self, name: &str) -> Option<ModuleRef> {
        self.modules.lock().unwrap().get(name).cloned()
    }

    /// Drop any module whose only remaining reference is the table's own
    /// (spec: "Module ref-counts are shared across configs — unchanged
    /// modules are not unloaded").
    pub fn unload_unreferenced(&self) {
        self.modules.lock().unwrap().retain(|_, module| Arc::strong_count(module) > 1);
    }

    pub fn len(&self) -> usize {
        self.modules.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One compiled configuration: a resolved plugin registry plus the
/// compiled root of `main_action`.
pub struct ConfigSet {
    pub registry: PluginRegistry,
    pub main_action: Arc<Action>,
}

/// Holds the currently-active [`ConfigSet`] and drives a reload through
/// the shadow-set swap sequence (spec §4.15 "Loading a new
/// configuration"): `check_config` on every plugin, then
/// `activate_config`, then an atomic swap, then `clean_config` on the
/// outgoing set.
pub struct ConfigManager {
    active: Mutex<Arc<ConfigSet>>,
}

impl ConfigManager {
    pub fn new(initial: Arc<ConfigSet>) -> ConfigManager {
        ConfigManager {
            active: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Arc<ConfigSet> {
        self.active.lock().unwrap().clone()
    }

    /// Attempt to swap in `shadow`. On a `check_config` failure, the
    /// active config is left untouched and the error is returned; no
    /// `activate_config`/`clean_config` calls happen for a rejected
    /// shadow set.
    pub fn reload(&self, shadow: Arc<ConfigSet>) -> Result<(), Error> {
        for plugin in shadow.registry.plugins_with_hooks() {
            plugin.handle_check_config()?;
        }
        for plugin in shadow.registry.plugins_with_hooks() {
            plugin.handle_activate_config();
        }
        let old = {
            let mut active = self.active.lock().unwrap();
            std::mem::replace(&mut *active, shadow)
        };
        for plugin in old.registry.plugins_with_hooks() {
            plugin.handle_clean_config();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::option::OptionType;

    fn dummy_action() -> Arc<Action> {
        Arc::new(Action::Setting { index: 0, value: Value::None })
    }

    #[test]
    fn registering_a_plugin_exposes_its_action_and_option() {
        let plugin = Arc::new(
            Plugin::new("static")
                .with_option(OptionDef::new("static", "exclude", OptionType::List, 0, Value::None))
                .with_action("serve", |_param| Ok(dummy_action())),
        );
        let mut registry = PluginRegistry::new();
        registry.register(plugin).unwrap();

        assert!(registry.create_action("static.serve", Value::None).is_ok());
        assert_eq!(registry.option_index("static.exclude"), Some(0));
    }

    #[test]
    fn duplicate_action_names_across_plugins_are_rejected() {
        let a = Arc::new(Plugin::new("mod_a").with_action("run", |_| Ok(dummy_action())));
        let b = Arc::new(Plugin::new("mod_a").with_action("run", |_| Ok(dummy_action())));
        let mut registry = PluginRegistry::new();
        registry.register(a).unwrap();
        let err = registry.register(b).unwrap_err();
        assert!(err.is_config_invalid());
    }

    #[test]
    fn option_indices_are_assigned_in_registration_order() {
        let plugin = Arc::new(
            Plugin::new("core")
                .with_option(OptionDef::new("core", "a", OptionType::Number, 0, Value::None))
                .with_option(OptionDef::new("core", "b", OptionType::Number, 0, Value::None)),
        );
        let mut registry = PluginRegistry::new();
        registry.register(plugin).unwrap();
        assert_eq!(registry.option_index("core.a"), Some(0));
        assert_eq!(registry.option_index("core.b"), Some(1));
    }

    #[test]
    fn unknown_action_is_a_config_error() {
        let registry = PluginRegistry::new();
        let err = registry.create_action("nope.nope", Value::None).unwrap_err();
        assert!(err.is_config_invalid());
    }

    struct RecordingHooks {
        order: Arc<Mutex<Vec<&'static str>>>,
        fail_check: bool,
    }

    impl PluginHooks for RecordingHooks {
        fn handle_check_config(&self) -> Result<(), Error> {
            self.order.lock().unwrap().push("check");
            if self.fail_check {
                Err(Error::config_invalid("rejected by test"))
            } else {
                Ok(())
            }
        }
        fn handle_activate_config(&self) {
            self.order.lock().unwrap().push("activate");
        }
        fn handle_clean_config(&self) {
            self.order.lock().unwrap().push("clean");
        }
    }

    #[test]
    fn reload_runs_check_then_activate_then_clean_on_the_old_set() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut initial_registry = PluginRegistry::new();
        initial_registry
            .register(Arc::new(Plugin::new("old").with_hooks(Arc::new(RecordingHooks {
                order: order.clone(),
                fail_check: false,
            }))))
            .unwrap();
        let manager = ConfigManager::new(Arc::new(ConfigSet {
            registry: initial_registry,
            main_action: dummy_action(),
        }));

        let mut shadow_registry = PluginRegistry::new();
        shadow_registry
            .register(Arc::new(Plugin::new("new").with_hooks(Arc::new(RecordingHooks {
                order: order.clone(),
                fail_check: false,
            }))))
            .unwrap();
        manager
            .reload(Arc::new(ConfigSet {
                registry: shadow_registry,
                main_action: dummy_action(),
            }))
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["check", "activate", "clean"]);
    }

    #[test]
    fn a_rejected_shadow_set_leaves_the_active_config_untouched() {
        let manager = ConfigManager::new(Arc::new(ConfigSet {
            registry: PluginRegistry::new(),
            main_action: dummy_action(),
        }));
        let original = manager.current();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bad_registry = PluginRegistry::new();
        bad_registry
            .register(Arc::new(Plugin::new("broken").with_hooks(Arc::new(RecordingHooks {
                order,
                fail_check: true,
            }))))
            .unwrap();

        let err = manager
            .reload(Arc::new(ConfigSet {
                registry: bad_registry,
                main_action: dummy_action(),
            }))
            .unwrap_err();
        assert!(err.is_config_invalid());
        assert!(Arc::ptr_eq(&original, &manager.current()));
    }

    #[test]
    fn module_table_keeps_still_referenced_modules_on_unload_sweep() {
        let table = ModuleTable::new();
        let held = Arc::new(Module {
            name: "held".to_string(),
            plugins: Vec::new(),
        });
        table.load(held.clone());
        table.load(Arc::new(Module {
            name: "orphan".to_string(),
            plugins: Vec::new(),
        }));
        assert_eq!(table.len(), 2);

        table.unload_unreferenced();
        assert_eq!(table.len(), 1);
        assert!(table.get("held").is_some());
        assert!(table.get("orphan").is_none());
    }
}
