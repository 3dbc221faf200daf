//! Action registry for runtime dispatch.
//!
//! A name-indexed registry of boxed actions. The compiler only reads it
//! (existence and default timeouts); the executor dispatches against it.

use std::collections::HashMap;

use super::box_action::BoxAction;
use super::Action;

pub struct ActionRegistry {
    actions: HashMap<String, BoxAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action under its own name, replacing any previous one.
    pub fn register<T: Action + 'static>(&mut self, action: T) {
        let action = BoxAction::new(action);
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<&BoxAction> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Declared default timeout of `name`, if registered and declared.
    pub fn default_timeout(&self, name: &str) -> Option<u64> {
        self.actions.get(name).and_then(BoxAction::default_timeout_secs)
    }

    /// Sorted list of registered action names.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
