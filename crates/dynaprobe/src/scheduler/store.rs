use std::sync::Arc;

use tokio::sync::watch;

use crate::model::CheckDefinition;

/// Long-lived holder of the current definition set.
///
/// A pass borrows a snapshot and the store keeps ownership, so the same set
/// is available to the next pass unless it is replaced in between.
#[derive(Debug, Clone)]
pub struct DefinitionStore {
    tx: Arc<watch::Sender<Arc<[CheckDefinition]>>>,
}

impl DefinitionStore {
    pub fn new(definitions: Vec<CheckDefinition>) -> Self {
        let (tx, _) = watch::channel(Arc::from(definitions));
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current set
    pub fn borrow(&self) -> Arc<[CheckDefinition]> {
        self.tx.borrow().clone()
    }

    /// Swap in a new set; passes already running keep their snapshot
    pub fn replace(&self, definitions: Vec<CheckDefinition>) {
        self.tx.send_replace(Arc::from(definitions));
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DefinitionStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn definition(id: &str) -> CheckDefinition {
        CheckDefinition {
            id: id.to_string(),
            name: id.to_string(),
            group: String::new(),
            check_type: "noop".to_string(),
            score_weight: 1.0,
            attributes: HashMap::new(),
            definition: "{}".to_string(),
        }
    }

    #[test]
    fn test_borrow_keeps_set_for_next_pass() {
        let store = DefinitionStore::new(vec![definition("a"), definition("b")]);

        let first = store.borrow();
        let second = store.borrow();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_replace_leaves_snapshots_alone() {
        let store = DefinitionStore::new(vec![definition("a")]);
        let shared = store.clone();
        let snapshot = store.borrow();

        shared.replace(vec![definition("x"), definition("y"), definition("z")]);

        assert_eq!(store.len(), 3);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(store.borrow()[0].id, "x");
    }
}
