//! Configuration model (spec §3.6, §4.15, §6.6): the compiled-config
//! surface the core executes against — option schemas, the action tree,
//! and the per-VR action stack that walks it.
//!
//! The configuration-file *grammar* is an out-of-scope external
//! collaborator (spec §1); this module is what that parser compiles down
//! to, and what a VR actually runs.

pub mod action;
pub mod action_stack;
pub mod condition;
pub mod option;
pub mod value;

pub use action::{Action, ActionFunc, ActionResult};
pub use action_stack::ActionStack;
pub use condition::{Condition, ConditionEval, ConditionOutcome};
pub use option::{OptionDef, OptionSet, OptionType};
pub use value::Value;
