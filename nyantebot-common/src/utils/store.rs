use std::{
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::{mapref::multiple::RefMulti, DashMap};
use futures_util::{lock::Mutex, TryStreamExt};
use mongodb::{
    error::{ErrorKind, WriteError, WriteFailure},
    Database, IndexModel,
};
use serde::{Deserialize, Serialize};

/// A store that caches values in memory and persists them in a MongoDB
/// collection.
///
/// Reads hit the in-memory cache first. Once `values()` has been called the
/// whole collection is resident and the `cached_all` flag short-circuits
/// database lookups for missing keys.
///
/// The bot process must be the only writer to the underlying collection, and
/// only one instance per collection may exist; `edit` relies on the per-key
/// lock for its read-modify-write guarantee.
pub struct PersistentCachedStore<
    K: Serialize + Clone + Send + Sync + Unpin + 'static + Eq + Hash,
    V: Serialize + Clone + Send + Sync + Unpin + 'static,
> {
    locks: DashMap<K, Arc<Mutex<()>>>,
    cache: DashMap<K, V>,
    db: mongodb::Collection<StoreEntry<K, V>>,
    cached_all: AtomicBool,
}

impl<
        K: Serialize + Clone + Send + Sync + Unpin + 'static + Eq + Hash,
        V: Serialize + Clone + Send + Sync + Unpin + 'static,
    > Debug for PersistentCachedStore<K, V>
where
    StoreEntry<K, V>: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCachedStore")
            .field("cache", &self.cache.len())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreEntry<
    K: Serialize + Clone + Send + Sync + Unpin + 'static + Eq + Hash,
    V: Serialize + Clone + Send + Sync + Unpin + 'static,
> {
    key: K,
    value: V,
}

impl<
        K: Serialize + Clone + Send + Sync + Unpin + 'static + Eq + Hash,
        V: Serialize + Clone + Send + Sync + Unpin + 'static,
    > PersistentCachedStore<K, V>
where
    StoreEntry<K, V>: Serialize + for<'de> Deserialize<'de>,
{
    pub async fn new(db: Database, name: &str) -> Result<Self, anyhow::Error> {
        let collection = db.collection(name);
        collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "key": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .unique(true)
                            .build(),
                    )
                    .build(),
            )
            .await?;
        Ok(Self {
            locks: DashMap::new(),
            cache: DashMap::new(),
            db: collection,
            cached_all: AtomicBool::new(false),
        })
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        if let Some(value) = self.cache.get(key).as_deref() {
            return Some(value.clone());
        }
        if self.cached_all.load(Ordering::Relaxed) {
            return None;
        }
        match bson::to_bson(key) {
            Ok(key_bson) => {
                let value = self
                    .db
                    .find_one(bson::doc! { "key": key_bson })
                    .await
                    .map_err(|e| log::error!("Error getting store entry: {:?}", e))
                    .unwrap_or(None)
                    .map(|entry| entry.value);
                if let Some(value) = value.as_ref() {
                    self.cache.insert(key.clone(), value.clone());
                }
                value
            }
            Err(e) => {
                log::error!("Error serializing key: {:?}", e);
                None
            }
        }
    }

    /// Inserts the value only if the key is not present yet. Returns whether
    /// the insert happened. Duplicate-key write errors from the unique index
    /// are reported as `Ok(false)`, so concurrent inserts race safely.
    pub async fn insert_if_not_exists(&self, key: K, value: V) -> Result<bool, anyhow::Error> {
        if self.cache.contains_key(&key) {
            return Ok(false);
        }
        if let Err(err) = self
            .db
            .insert_one(StoreEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .await
        {
            if let ErrorKind::Write(WriteFailure::WriteError(WriteError { code: 11000, .. })) =
                &*err.kind
            {
                return Ok(false);
            }
            Err(err.into())
        } else {
            self.cache.insert(key, value);
            Ok(true)
        }
    }

    /// Read-modify-write under the key's lock. Returns the result of the
    /// edit closure. `default` seeds the value for missing keys.
    pub async fn edit<R>(
        &self,
        key: K,
        edit: impl FnOnce(&mut V) -> R,
        default: Option<V>,
    ) -> Result<R, anyhow::Error> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;
        let mut value = self
            .get(&key)
            .await
            .or(default)
            .ok_or_else(|| anyhow::anyhow!("No value found for key"))?;
        let r = edit(&mut value);
        self.insert_or_update(key, value).await?;
        drop(guard);
        Ok(r)
    }

    pub async fn insert_or_update(&self, key: K, value: V) -> Result<(), anyhow::Error> {
        self.cache.insert(key.clone(), value.clone());
        let key_bson = bson::to_bson(&key)?;
        let value_bson = bson::to_bson(&value)?;
        self.db
            .update_one(
                bson::doc! { "key": key_bson },
                bson::doc! { "$set": bson::doc! { "value": value_bson } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>, anyhow::Error> {
        let removed = self.cache.remove(key);
        if self.cached_all.load(Ordering::Relaxed) && removed.is_none() {
            return Ok(None);
        }
        let value = removed.map(|(_, v)| v);
        let key_bson = bson::to_bson(key)?;
        self.db.delete_one(bson::doc! { "key": key_bson }).await?;
        Ok(value)
    }

    pub async fn values(&self) -> Result<impl Iterator<Item = RefMulti<K, V>>, anyhow::Error> {
        if !self.cached_all.load(Ordering::Relaxed) {
            let mut cursor = self.db.find(bson::doc! {}).await?;
            while let Some(result) = cursor.try_next().await? {
                self.cache.insert(result.key.clone(), result.value.clone());
            }
            self.cached_all.store(true, Ordering::Relaxed);
        }
        Ok(self.cache.iter())
    }
}

/// A store that goes straight to MongoDB on every operation. Used for
/// append-heavy collections (transfer history) where caching everything in
/// memory would only waste it.
pub struct PersistentUncachedStore<
    K: Serialize + Clone + Send + Sync + Unpin + 'static + Eq + Hash,
    V: Serialize + Clone + Send + Sync + Unpin + 'static,
> {
    db: mongodb::Collection<StoreEntry<K, V>>,
}

impl<
        K: Serialize + Clone + Send + Sync + Unpin + 'static + Eq + Hash,
        V: Serialize + Clone + Send + Sync + Unpin + 'static,
    > PersistentUncachedStore<K, V>
where
    StoreEntry<K, V>: Serialize + for<'de> Deserialize<'de>,
{
    pub async fn new(db: Database, name: &str) -> Result<Self, anyhow::Error> {
        let collection = db.collection(name);
        collection
            .create_index(
                IndexModel::builder()
                    .keys(bson::doc! { "key": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .unique(true)
                            .build(),
                    )
                    .build(),
            )
            .await?;
        Ok(Self { db: collection })
    }

    pub async fn insert_or_update(&self, key: K, value: V) -> Result<(), anyhow::Error> {
        let key_bson = bson::to_bson(&key)?;
        let value_bson = bson::to_bson(&value)?;
        self.db
            .update_one(
                bson::doc! { "key": key_bson },
                bson::doc! { "$set": bson::doc! { "value": value_bson } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }
}
