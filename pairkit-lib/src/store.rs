//! Topic-keyed sequence store.
//!
//! One store instance per engine, generic over the sequence kind it holds.
//! All mutation goes through `create`/`update`/`delete`, which serialize
//! per-store so concurrent inbound frames for the same topic cannot
//! interleave partial writes. Expiry is lazy: an expired pending sequence
//! reads as absent and is evicted on access, no background sweep.
//!
//! Durable backends inject a [`SequenceHook`]; the store defines only the
//! mapping semantics, never the storage format.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::errors::{PairkitError, Result};
use crate::types::{unix_now, Topic};

/// A pairing or session lifecycle record addressable by topic.
pub trait Sequence: Clone + Send + Sync + 'static {
    fn topic(&self) -> &Topic;
    fn is_settled(&self) -> bool;
    /// Unix-seconds expiry, if the state carries one.
    fn expiry(&self) -> Option<u64>;
}

/// Persistence hooks for a durable backend: load-all-on-start and
/// save/remove-on-mutation.
#[async_trait]
pub trait SequenceHook<S>: Send + Sync {
    async fn load_all(&self) -> Result<Vec<S>>;
    async fn save(&self, sequence: &S) -> Result<()>;
    async fn remove(&self, topic: &Topic) -> Result<()>;
}

pub struct SequenceStore<S: Sequence> {
    entries: Mutex<HashMap<Topic, S>>,
    hook: Option<Arc<dyn SequenceHook<S>>>,
}

impl<S: Sequence> Default for SequenceStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Sequence> SequenceStore<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hook: None,
        }
    }

    pub fn with_hook(hook: Arc<dyn SequenceHook<S>>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hook: Some(hook),
        }
    }

    /// Load previously persisted sequences. Expired pending entries are
    /// dropped rather than resurrected.
    pub async fn hydrate(&self) -> Result<()> {
        let Some(hook) = &self.hook else {
            return Ok(());
        };
        let loaded = hook.load_all().await?;
        let mut entries = self.entries.lock().expect("sequence store lock");
        for sequence in loaded {
            if !is_expired(&sequence) {
                entries.insert(sequence.topic().clone(), sequence);
            }
        }
        Ok(())
    }

    /// Insert a new sequence. Fails with `DuplicateTopic` if a live sequence
    /// already occupies the topic.
    pub async fn create(&self, sequence: S) -> Result<()> {
        let topic = sequence.topic().clone();
        {
            let mut entries = self.entries.lock().expect("sequence store lock");
            if let Some(existing) = entries.get(&topic) {
                if !is_expired(existing) {
                    return Err(PairkitError::DuplicateTopic(topic.0));
                }
            }
            entries.insert(topic, sequence.clone());
        }
        self.persist(&sequence).await
    }

    /// Read a sequence. Expired entries are evicted and read as `NotFound`.
    pub async fn get(&self, topic: &Topic) -> Result<S> {
        let (found, evicted) = {
            let mut entries = self.entries.lock().expect("sequence store lock");
            match entries.get(topic) {
                Some(sequence) if is_expired(sequence) => {
                    entries.remove(topic);
                    (None, true)
                }
                Some(sequence) => (Some(sequence.clone()), false),
                None => (None, false),
            }
        };
        if evicted {
            self.unpersist(topic).await?;
        }
        found.ok_or_else(|| PairkitError::NotFound(topic.0.clone()))
    }

    /// Mutate a sequence in place and return the new value.
    pub async fn update<F>(&self, topic: &Topic, mutate: F) -> Result<S>
    where
        F: FnOnce(&mut S),
    {
        let updated = {
            let mut entries = self.entries.lock().expect("sequence store lock");
            let entry = entries
                .get_mut(topic)
                .filter(|s| !is_expired(*s))
                .ok_or_else(|| PairkitError::NotFound(topic.0.clone()))?;
            mutate(entry);
            entry.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Remove a sequence. Returns whether an entry was present; removing an
    /// absent topic is not an error, either peer may race to delete.
    pub async fn delete(&self, topic: &Topic) -> Result<bool> {
        let removed = self
            .entries
            .lock()
            .expect("sequence store lock")
            .remove(topic)
            .is_some();
        if removed {
            self.unpersist(topic).await?;
        }
        Ok(removed)
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.entries
            .lock()
            .expect("sequence store lock")
            .get(topic)
            .is_some_and(|s| !is_expired(s))
    }

    /// All settled, unexpired sequences.
    pub fn settled(&self) -> Vec<S> {
        self.entries
            .lock()
            .expect("sequence store lock")
            .values()
            .filter(|s| s.is_settled() && !is_expired(*s))
            .cloned()
            .collect()
    }

    async fn persist(&self, sequence: &S) -> Result<()> {
        match &self.hook {
            Some(hook) => hook.save(sequence).await,
            None => Ok(()),
        }
    }

    async fn unpersist(&self, topic: &Topic) -> Result<()> {
        match &self.hook {
            Some(hook) => hook.remove(topic).await,
            None => Ok(()),
        }
    }
}

fn is_expired<S: Sequence>(sequence: &S) -> bool {
    sequence.expiry().is_some_and(|at| at <= unix_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestSequence {
        topic: Topic,
        settled: bool,
        expiry: Option<u64>,
    }

    impl Sequence for TestSequence {
        fn topic(&self) -> &Topic {
            &self.topic
        }
        fn is_settled(&self) -> bool {
            self.settled
        }
        fn expiry(&self) -> Option<u64> {
            self.expiry
        }
    }

    fn pending(topic: &Topic) -> TestSequence {
        TestSequence {
            topic: topic.clone(),
            settled: false,
            expiry: Some(unix_now() + 300),
        }
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let store = SequenceStore::new();
        let topic = Topic::generate();
        store.create(pending(&topic)).await.unwrap();

        assert!(store.contains(&topic));
        let settled = store.update(&topic, |s| s.settled = true).await.unwrap();
        assert!(settled.settled);
        assert_eq!(store.settled(), vec![settled]);

        assert!(store.delete(&topic).await.unwrap());
        assert!(matches!(
            store.get(&topic).await,
            Err(PairkitError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_topic_rejected() {
        let store = SequenceStore::new();
        let topic = Topic::generate();
        store.create(pending(&topic)).await.unwrap();
        assert!(matches!(
            store.create(pending(&topic)).await,
            Err(PairkitError::DuplicateTopic(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = SequenceStore::<TestSequence>::new();
        let topic = Topic::generate();
        store.create(pending(&topic)).await.unwrap();

        assert!(store.delete(&topic).await.unwrap());
        assert!(!store.delete(&topic).await.unwrap());
    }

    #[tokio::test]
    async fn expired_pending_reads_as_not_found() {
        let store = SequenceStore::new();
        let topic = Topic::generate();
        store
            .create(TestSequence {
                topic: topic.clone(),
                settled: false,
                expiry: Some(unix_now().saturating_sub(1)),
            })
            .await
            .unwrap();

        assert!(matches!(
            store.get(&topic).await,
            Err(PairkitError::NotFound(_))
        ));
        assert!(matches!(
            store.update(&topic, |s| s.settled = true).await,
            Err(PairkitError::NotFound(_))
        ));
        // the topic is free again after eviction
        store.create(pending(&topic)).await.unwrap();
    }

    #[tokio::test]
    async fn settled_filters_pending() {
        let store = SequenceStore::new();
        let pending_topic = Topic::generate();
        let settled_topic = Topic::generate();
        store.create(pending(&pending_topic)).await.unwrap();
        store
            .create(TestSequence {
                topic: settled_topic.clone(),
                settled: true,
                expiry: None,
            })
            .await
            .unwrap();

        let settled = store.settled();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].topic, settled_topic);
    }

    struct RecordingHook {
        saved: Mutex<Vec<Topic>>,
        removed: Mutex<Vec<Topic>>,
    }

    #[async_trait]
    impl SequenceHook<TestSequence> for RecordingHook {
        async fn load_all(&self) -> Result<Vec<TestSequence>> {
            Ok(vec![])
        }
        async fn save(&self, sequence: &TestSequence) -> Result<()> {
            self.saved.lock().unwrap().push(sequence.topic.clone());
            Ok(())
        }
        async fn remove(&self, topic: &Topic) -> Result<()> {
            self.removed.lock().unwrap().push(topic.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn mutations_reach_the_hook() {
        let hook = Arc::new(RecordingHook {
            saved: Mutex::new(vec![]),
            removed: Mutex::new(vec![]),
        });
        let store = SequenceStore::with_hook(hook.clone());
        let topic = Topic::generate();

        store.create(pending(&topic)).await.unwrap();
        store.update(&topic, |s| s.settled = true).await.unwrap();
        store.delete(&topic).await.unwrap();

        assert_eq!(hook.saved.lock().unwrap().len(), 2);
        assert_eq!(hook.removed.lock().unwrap().as_slice(), &[topic]);
    }
}
