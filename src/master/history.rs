use std::collections::HashMap;
use std::sync::Mutex;

/// Access contract for the persistent job history store.
///
/// The reconciler writes each job description on push and deletes it on
/// terminal completion; whatever sits behind this trait decides how the
/// records persist.
pub trait JobHistory: Send + Sync {
    fn put(&self, key: i64, value: String) -> bool;
    fn get(&self, key: i64) -> Option<String>;
    fn delete(&self, key: i64) -> bool;
}

/// In-process history store. The default when no external store is wired.
#[derive(Debug, Default)]
pub struct MemHistory {
    records: Mutex<HashMap<i64, String>>,
}

impl MemHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobHistory for MemHistory {
    fn put(&self, key: i64, value: String) -> bool {
        self.records
            .lock()
            .expect("history lock poisoned")
            .insert(key, value);
        true
    }

    fn get(&self, key: i64) -> Option<String> {
        self.records
            .lock()
            .expect("history lock poisoned")
            .get(&key)
            .cloned()
    }

    fn delete(&self, key: i64) -> bool {
        self.records
            .lock()
            .expect("history lock poisoned")
            .remove(&key)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let history = MemHistory::new();
        assert!(history.put(1, "{}".into()));
        assert_eq!(history.get(1).as_deref(), Some("{}"));
        assert!(history.delete(1));
        assert!(history.get(1).is_none());
        assert!(!history.delete(1));
    }
}
