//! Meta-state table: per-identity state that survives graph swaps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use steward_types::{MetaState, PtrUid};

pub(crate) type SharedMeta = Arc<Mutex<MetaState>>;

/// Map from structural identity to its [`MetaState`]. Entries are created
/// when a worker starts and collected after a commit once no active resource
/// carries the identity anymore.
#[derive(Debug, Default)]
pub struct MetaTable {
    metas: Mutex<HashMap<PtrUid, SharedMeta>>,
}

impl MetaTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PtrUid, SharedMeta>> {
        self.metas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the entry for `uid`, creating it with `retry` retries.
    pub(crate) fn ensure(&self, uid: &PtrUid, retry: i16) -> SharedMeta {
        let mut metas = self.lock();
        Arc::clone(
            metas
                .entry(uid.clone())
                .or_insert_with(|| Arc::new(Mutex::new(MetaState::new(retry)))),
        )
    }

    pub fn get(&self, uid: &PtrUid) -> Option<MetaState> {
        let metas = self.lock();
        metas
            .get(uid)
            .map(|meta| meta.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn contains(&self, uid: &PtrUid) -> bool {
        self.lock().contains_key(uid)
    }

    /// Drop every entry whose identity is not in `active`. Returns the
    /// collected identities, sorted.
    pub(crate) fn collect_garbage(&self, active: &HashSet<PtrUid>) -> Vec<PtrUid> {
        let mut metas = self.lock();
        let mut collected: Vec<PtrUid> = metas
            .keys()
            .filter(|uid| !active.contains(*uid))
            .cloned()
            .collect();
        collected.sort();
        for uid in &collected {
            metas.remove(uid);
        }
        collected
    }

    pub fn snapshot(&self) -> BTreeMap<PtrUid, MetaState> {
        self.lock()
            .iter()
            .map(|(uid, meta)| {
                let state = meta.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (uid.clone(), state)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_returns_same_entry() {
        let table = MetaTable::new();
        let uid = PtrUid::new("noop", "a");

        let first = table.ensure(&uid, 3);
        first.lock().unwrap().starts += 1;
        let second = table.ensure(&uid, 9);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            table.get(&uid),
            Some(MetaState {
                check_apply_retry: 3,
                starts: 1
            })
        );
    }

    #[test]
    fn collect_garbage_drops_inactive() {
        let table = MetaTable::new();
        let a = PtrUid::new("noop", "a");
        let b = PtrUid::new("noop", "b");
        table.ensure(&a, 0);
        table.ensure(&b, 0);

        let active: HashSet<PtrUid> = [a.clone()].into_iter().collect();
        assert_eq!(table.collect_garbage(&active), vec![b.clone()]);
        assert!(table.contains(&a));
        assert!(!table.contains(&b));
        assert_eq!(table.len(), 1);

        assert!(table.collect_garbage(&active).is_empty());
        table.collect_garbage(&HashSet::new());
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_copy() {
        let table = MetaTable::new();
        table.ensure(&PtrUid::new("timer", "z"), 1);
        table.ensure(&PtrUid::new("noop", "a"), 2);
        let keys: Vec<String> = table.snapshot().keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["noop[a]", "timer[z]"]);
    }
}
