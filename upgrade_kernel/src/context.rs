//! Block execution context.
//!
//! Carries the current height, the block's working copy of the state and a
//! telemetry sink (structured events). Nothing here reads the wall clock:
//! everything a handler can observe is replicated state.

use crate::store::StateStore;

/// Structured telemetry emitted during block execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    height: u64,
    store: StateStore,
    events: Vec<Event>,
}

impl Context {
    pub fn new(height: u64, store: StateStore) -> Self {
        Self {
            height,
            store,
            events: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut StateStore {
        &mut self.store
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Independent copy for speculative execution. Nothing done on the
    /// branch is visible here until `merge` is called with it.
    pub fn branch(&self) -> Context {
        Context {
            height: self.height,
            store: self.store.clone(),
            events: Vec::new(),
        }
    }

    /// Adopt a branch's state and append its events.
    pub fn merge(&mut self, branch: Context) {
        self.store = branch.store;
        self.events.extend(branch.events);
    }

    pub fn into_parts(self) -> (StateStore, Vec<Event>) {
        (self.store, self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_is_isolated_until_merged() {
        let mut ctx = Context::new(7, StateStore::with_partitions(["p"]).unwrap());
        let mut branch = ctx.branch();
        branch.store_mut().set("p", b"k".to_vec(), b"v".to_vec()).unwrap();
        branch.emit(Event::new("touched").attr("key", "k"));

        assert_eq!(ctx.store().get("p", b"k").unwrap(), None);
        assert!(ctx.events().is_empty());

        ctx.merge(branch);
        assert_eq!(ctx.store().get("p", b"k").unwrap(), Some(b"v".as_slice()));
        assert_eq!(ctx.events()[0].get("key"), Some("k"));
        assert_eq!(ctx.height(), 7);
    }
}
