use std::marker::PhantomData;

use crate::segment::{PutMode, PutOutcome};
use crate::serializer::{CacheSerializer, SerializeError};
use crate::{Cache, CacheError, HeapBackend, MemoryBackend};

/// A [`Cache`] keyed and valued by Rust types.
///
/// Keys are serialized into a temporary buffer for hashing and comparison.
/// Values are serialized directly into the new entry block.
///
/// ```
/// use offheap_lru::{Cache, StringSerializer, TypedCache, U32Serializer};
///
/// let cache = TypedCache::new(
///     Cache::builder().segment_count(2).build(),
///     U32Serializer,
///     StringSerializer,
/// );
///
/// cache.put(&7, &"seven".to_string()).unwrap();
/// assert_eq!(cache.get(&7).unwrap(), Some("seven".to_string()));
/// ```
pub struct TypedCache<K, V, KS, VS, M: MemoryBackend = HeapBackend> {
    cache: Cache<M>,
    key_serializer: KS,
    value_serializer: VS,
    _types: PhantomData<fn(K) -> V>,
}

impl<K, V, KS, VS, M> TypedCache<K, V, KS, VS, M>
where
    KS: CacheSerializer<K>,
    VS: CacheSerializer<V>,
    M: MemoryBackend,
{
    pub fn new(cache: Cache<M>, key_serializer: KS, value_serializer: VS) -> Self {
        Self {
            cache,
            key_serializer,
            value_serializer,
            _types: PhantomData,
        }
    }

    /// The underlying byte cache.
    pub fn cache(&self) -> &Cache<M> {
        &self.cache
    }

    fn key_bytes(&self, key: &K) -> Vec<u8> {
        let mut bytes = vec![0; self.key_serializer.serialized_size(key) as usize];
        self.key_serializer.serialize(key, &mut bytes);
        bytes
    }

    /// Look up and deserialize a value. The entry becomes most recently used.
    pub fn get(&self, key: &K) -> Result<Option<V>, SerializeError> {
        let key = self.key_bytes(key);
        match self.cache.get(&key) {
            Some(guard) => self.value_serializer.deserialize(guard.value()).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.cache.contains_key(&self.key_bytes(key))
    }

    /// Insert or replace. Returns `true` when a previous value was replaced.
    pub fn put(&self, key: &K, value: &V) -> Result<bool, CacheError> {
        let outcome = self.put_with_mode(key, value, PutMode::Replace)?;
        Ok(outcome == PutOutcome::Replaced)
    }

    /// Insert only if the key is absent. Returns `true` when inserted.
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<bool, CacheError> {
        let outcome = self.put_with_mode(key, value, PutMode::IfAbsent)?;
        Ok(outcome == PutOutcome::Added)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.cache.remove(&self.key_bytes(key))
    }

    fn put_with_mode(&self, key: &K, value: &V, mode: PutMode) -> Result<PutOutcome, CacheError> {
        let key = self.key_bytes(key);
        let value_len = self.value_serializer.serialized_size(value);
        self.cache.put_with(
            &key,
            value_len,
            |out| self.value_serializer.serialize(value, out),
            mode,
        )
    }
}

impl<K, V, KS, VS, M: MemoryBackend> std::fmt::Debug for TypedCache<K, V, KS, VS, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCache")
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::serializer::{BytesSerializer, I32Serializer, StringSerializer, U64Serializer};
    use crate::CacheBuilder;

    fn cache() -> TypedCache<i32, String, I32Serializer, StringSerializer> {
        TypedCache::new(
            CacheBuilder::new().segment_count(2).build(),
            I32Serializer,
            StringSerializer,
        )
    }

    #[test]
    fn test_typed_put_get_remove() {
        let cache = cache();

        assert_eq!(cache.put(&-5, &"minus five".to_string()), Ok(false));
        assert_eq!(cache.get(&-5), Ok(Some("minus five".to_string())));
        assert_eq!(cache.get(&5), Ok(None));
        assert!(cache.contains_key(&-5));

        assert_eq!(cache.put(&-5, &"replaced".to_string()), Ok(true));
        assert_eq!(cache.get(&-5), Ok(Some("replaced".to_string())));

        assert!(cache.remove(&-5));
        assert!(!cache.contains_key(&-5));
    }

    #[test]
    fn test_typed_put_if_absent() {
        let cache = cache();
        assert_eq!(cache.put_if_absent(&1, &"one".to_string()), Ok(true));
        assert_eq!(cache.put_if_absent(&1, &"uno".to_string()), Ok(false));
        assert_eq!(cache.get(&1), Ok(Some("one".to_string())));
    }

    #[test]
    fn test_keys_are_stored_serialized() {
        let cache = cache();
        cache.put(&0x0102_0304, &"v".to_string()).unwrap();

        let guard = cache.cache().get(&[1, 2, 3, 4]).unwrap();
        assert_eq!(guard.key(), &[1, 2, 3, 4]);
        assert_eq!(guard.value(), b"v");
    }

    #[test]
    fn test_deserialize_error_surfaces() {
        let bytes = CacheBuilder::new().segment_count(1).build();
        bytes.put(&7u64.to_be_bytes(), &[1, 2, 3]).unwrap();

        let typed = TypedCache::new(bytes, U64Serializer, U64Serializer);
        assert_eq!(
            typed.get(&7),
            Err(SerializeError::Length {
                expected: 8,
                actual: 3
            })
        );
    }

    #[test]
    fn test_bytes_values() {
        let cache = TypedCache::new(
            CacheBuilder::new().segment_count(1).build(),
            U64Serializer,
            BytesSerializer,
        );
        cache.put(&1, &vec![]).unwrap();
        cache.put(&2, &vec![9; 1000]).unwrap();

        assert_eq!(cache.get(&1), Ok(Some(vec![])));
        assert_eq!(cache.get(&2), Ok(Some(vec![9; 1000])));
    }

    /// Claims a size it then refuses to write.
    struct FailingSerializer;

    impl CacheSerializer<u64> for FailingSerializer {
        fn serialized_size(&self, _value: &u64) -> u64 {
            8
        }

        fn serialize(&self, _value: &u64, _out: &mut [u8]) {
            panic!("serializer failed");
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<u64, SerializeError> {
            U64Serializer.deserialize(bytes)
        }
    }

    #[test]
    fn test_panicking_serializer_leaks_nothing() {
        let mem = std::sync::Arc::new(crate::TrackingBackend::new());
        let cache = TypedCache::new(
            CacheBuilder::new()
                .segment_count(2)
                .backend(std::sync::Arc::clone(&mem))
                .build(),
            U64Serializer,
            FailingSerializer,
        );

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cache.put(&1, &1)));
        assert!(result.is_err());

        assert!(cache.cache().is_empty());
        assert!(!cache.contains_key(&1));
        mem.assert_empty();
    }
}
