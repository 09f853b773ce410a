//! Configuration `Value` (spec §6.6 "option types"): the dynamically typed
//! tree produced by parsing a config file and consumed by action/option
//! setup functions.
//!
//! Grounded in the teacher's C sibling `main/value.c`'s `liValue` union
//! (`LI_VALUE_NONE`/`BOOLEAN`/`NUMBER`/`STRING`/`LIST`/`HASH`/`ACTION`/
//! `CONDITION`). This crate hand-rolls the tree instead of using `serde`
//! (see `SPEC_FULL.md` §A.4): config values come from a lighttpd-style
//! directive language, not JSON/YAML, and carry two variants — `Action`,
//! `Condition` — that only make sense as crate-internal handles, not
//! something a generic deserializer could produce.
//!
//! Unlike the stream graph (spec §9: "present design does not require weak
//! refs" — a single worker's `Rc` graph), a compiled configuration is
//! loaded once and then executed by every worker thread concurrently (spec
//! §3.7, §5 "Module table... mutated only during config (re)load"). So the
//! tree here is `Arc`, not `Rc`: workers only ever read it (and bump a
//! refcount on VR entry/exit), matching "config-loaded actions are
//! copy-on-load; VRs hold ref-counts and are unaffected by a subsequent
//! reload".

use std::collections::HashMap;
use std::sync::Arc;

use super::action::Action;
use super::condition::Condition;

/// A parsed configuration value (spec `liValue`).
#[derive(Clone)]
pub enum Value {
    None,
    Boolean(bool),
    Number(i64),
    String(Arc<String>),
    List(Arc<Vec<Value>>),
    Hash(Arc<HashMap<String, Value>>),
    Action(Arc<Action>),
    Condition(Arc<Condition>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Action(_) => "action",
            Value::Condition(_) => "condition",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Hash(h) => Some(h.as_ref()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(l) => write!(f, "{:?}", l),
            Value::Hash(h) => write!(f, "{:?}", h),
            Value::Action(_) => write!(f, "<action>"),
            Value::Condition(_) => write!(f, "<condition>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_reject_the_wrong_variant() {
        let v = Value::Number(42);
        assert_eq!(v.as_number(), Some(42));
        assert_eq!(v.as_bool(), None);
        assert_eq!(v.type_name(), "number");
    }
}
