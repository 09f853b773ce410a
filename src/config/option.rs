//! Option registry (spec §4.15 "Option evaluation", §6.6 "Option types").
//!
//! A plugin registers a schema of named, typed options (`liPluginOption`);
//! at config-compile time a `name = value` directive is resolved against
//! that schema into a flat `(index, Value)` pair and stored at `index` in
//! every VR's per-request option vector (spec §3.4). Values and value
//! pointers are two separate vectors — matching the source's
//! `vr->options`/`vr->optionptrs` split — because `SettingPtr` actions
//! carry ref-counted values that need an acquire/release discipline
//! distinct from a plain `Copy`-ish `Value`.

use std::fmt;
use std::sync::Arc;

use super::value::Value;
use crate::error::Error;

/// The value types spec §6.6 recognizes for a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    None,
    Boolean,
    Number,
    String,
    List,
    Hash,
    Action,
    Condition,
}

impl OptionType {
    /// Whether `value` matches this declared type (spec: "validates type
    /// against the registered schema").
    pub fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (OptionType::None, Value::None)
                | (OptionType::Boolean, Value::Boolean(_))
                | (OptionType::Number, Value::Number(_))
                | (OptionType::String, Value::String(_))
                | (OptionType::List, Value::List(_))
                | (OptionType::Hash, Value::Hash(_))
                | (OptionType::Action, Value::Action(_))
                | (OptionType::Condition, Value::Condition(_))
        )
    }
}

/// A registered plain-option schema entry (spec `liOptionDef`).
pub struct OptionDef {
    pub name: &'static str,
    pub module: &'static str,
    pub value_type: OptionType,
    pub index: usize,
    pub default: Value,
    parse: Option<Arc<dyn Fn(Value) -> Result<Value, Error> + Send + Sync>>,
}

impl fmt::Debug for OptionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionDef")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("value_type", &self.value_type)
            .field("index", &self.index)
            .finish()
    }
}

impl OptionDef {
    pub fn new(module: &'static str, name: &'static str, value_type: OptionType, index: usize, default: Value) -> OptionDef {
        OptionDef {
            name,
            module,
            value_type,
            index,
            default,
            parse: None,
        }
    }

    /// Attach a parse callback that validates/transforms the raw directive
    /// value beyond a bare type check (spec: "delegates to the plugin's
    /// parse callback, or copies the value if none").
    pub fn with_parse(mut self, parse: impl Fn(Value) -> Result<Value, Error> + Send + Sync + 'static) -> OptionDef {
        self.parse = Some(Arc::new(parse));
        self
    }

    /// Fully-qualified dotted key (spec §6.6: `core.*`, `mod_xxx.*`).
    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }

    /// Validate `value`'s type, then run the parse callback (if any),
    /// producing the `OptionSet` entry to install into a VR.
    pub fn parse_option(&self, value: Value) -> Result<OptionSet, Error> {
        if !self.value_type.matches(&value) {
            return Err(Error::config_invalid(format!(
                "option {} expects a {:?}, got a {}",
                self.qualified_name(),
                self.value_type,
                value.type_name()
            )));
        }
        let value = match &self.parse {
            Some(parse) => parse(value)?,
            None => value,
        };
        Ok(OptionSet { index: self.index, value })
    }
}

/// The resolved `(index, value)` pair an `Action::Setting` or
/// `Action::SettingPtr` node is built from (spec `liOptionSet`).
#[derive(Debug, Clone)]
pub struct OptionSet {
    pub index: usize,
    pub value: Value,
}
