//! Named counting semaphores shared by every resource in the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use steward_types::{parse_sema, Result, StewardError};

/// Lazily created semaphores keyed by their full id (`name` or
/// `name:count`). A semaphore is created on first reference with the count
/// its id carries and is never removed.
#[derive(Debug, Default)]
pub struct SemaphoreRegistry {
    semas: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up, or create, the semaphore for `id`.
    pub fn get(&self, id: &str) -> Result<Arc<Semaphore>> {
        let (_, count) = parse_sema(id)?;
        let mut semas = self.semas.lock().unwrap_or_else(PoisonError::into_inner);
        let sema = semas
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(count)));
        Ok(Arc::clone(sema))
    }

    /// Acquire one permit from each listed semaphore.
    ///
    /// Ids are sorted and de-duplicated first so that two resources sharing
    /// semaphores always lock them in the same order.
    pub async fn acquire(&self, ids: &[String]) -> Result<Vec<OwnedSemaphorePermit>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut permits = Vec::with_capacity(ids.len());
        for id in &ids {
            let sema = self.get(id)?;
            let permit = sema
                .acquire_owned()
                .await
                .map_err(|_| StewardError::Closed)?;
            permits.push(permit);
        }
        Ok(permits)
    }

    /// Free permits of a semaphore that has been referenced.
    pub fn available(&self, id: &str) -> Option<usize> {
        let semas = self.semas.lock().unwrap_or_else(PoisonError::into_inner);
        semas.get(id).map(|sema| sema.available_permits())
    }

    pub fn len(&self) -> usize {
        self.semas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn created_with_count_from_id() {
        let semas = SemaphoreRegistry::new();
        assert!(semas.is_empty());

        let permits = semas.acquire(&["db:2".into()]).await.unwrap();
        assert_eq!(permits.len(), 1);
        assert_eq!(semas.available("db:2"), Some(1));
        drop(permits);
        assert_eq!(semas.available("db:2"), Some(2));
        assert_eq!(semas.available("other"), None);
    }

    #[tokio::test]
    async fn duplicates_are_acquired_once() {
        let semas = SemaphoreRegistry::new();
        let permits = semas
            .acquire(&["lock".into(), "lock".into()])
            .await
            .unwrap();
        assert_eq!(permits.len(), 1);
        assert_eq!(semas.len(), 1);
    }

    #[tokio::test]
    async fn second_holder_waits() {
        let semas = Arc::new(SemaphoreRegistry::new());
        let held = semas.acquire(&["lock".into()]).await.unwrap();

        let waiter = {
            let semas = Arc::clone(&semas);
            tokio::spawn(async move { semas.acquire(&["lock".into()]).await.map(|p| p.len()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_id_is_rejected() {
        let semas = SemaphoreRegistry::new();
        let err = semas.acquire(&["x:0".into()]).await.unwrap_err();
        assert!(matches!(err, StewardError::Semaphore(_)));
    }

    #[test]
    fn count_limit_matches_tokio() {
        assert_eq!(steward_types::MAX_SEMA_COUNT, Semaphore::MAX_PERMITS);

        let semas = SemaphoreRegistry::new();
        let huge = format!("lock:{}", Semaphore::MAX_PERMITS + 1);
        assert!(matches!(semas.get(&huge), Err(StewardError::Semaphore(_))));
        assert!(semas.is_empty());
    }
}
