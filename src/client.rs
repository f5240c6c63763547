//! Typed store access.
//!
//! A store client is the primary way of reading and writing data. It maps
//! user types to and from their serialized representation, resolves
//! conflicting concurrent versions, and delivers change notifications with
//! decoded keys.

use crate::clock::VectorClock;
use crate::ctx::{Ctx, CtxShared};
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::versioned::Versioned;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// Maps a user type to and from the internal byte representation.
///
/// Implementations must be total in both directions for values they
/// produced, with deterministic byte-for-byte output for a given value, and
/// must signal decode failures through [`Error::Serialization`].
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// Default serializer for any serde type, backed by bincode.
pub struct BincodeSerializer<T>(PhantomData<fn() -> T>);

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        BincodeSerializer(PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Serializer<T> for BincodeSerializer<T> {
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Identity serializer for values that already are bytes, plus the UTF-8
/// mapping for strings.
#[derive(Default)]
pub struct RawSerializer;

impl Serializer<Vec<u8>> for RawSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

impl Serializer<String> for RawSerializer {
    fn serialize(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// An inconsistency resolver reduces a set of concurrent values down to a
/// single value. Custom resolvers allow commutative replicated data types
/// such as sets and counters; a resolver must be deterministic for a given
/// input and should return a clock that dominates every input clock.
pub type Resolver<V> = Arc<dyn Fn(Vec<Versioned<V>>) -> Vec<Versioned<V>> + Send + Sync>;

/// The default resolver: keep the value with the newest wall-clock
/// timestamp (ties broken by input order) under the merge of all input
/// clocks.
pub fn default_resolver<V>() -> Resolver<V> {
    Arc::new(|mut items: Vec<Versioned<V>>| {
        if items.len() <= 1 {
            return items;
        }
        let now = SystemTime::now();
        let mut max_index = 0;
        let mut max_time = items[0].version().timestamp();
        let mut merged = items[0].version().clone();
        for (index, item) in items.iter().enumerate().skip(1) {
            let timestamp = item.version().timestamp();
            if timestamp > max_time {
                max_index = index;
                max_time = timestamp;
            }
            merged = merged.merge_at(item.version(), now);
        }
        let (value, _) = items.swap_remove(max_index).into_parts();
        vec![Versioned::new(value, merged)]
    })
}

/// Typed client for one registered store.
pub struct StoreClient<K, V, KS = BincodeSerializer<K>, VS = BincodeSerializer<V>> {
    shared: Arc<CtxShared>,
    store: Arc<Processor>,
    resolver: Resolver<V>,
    key_ser: KS,
    value_ser: VS,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V> StoreClient<K, V>
where
    BincodeSerializer<K>: Serializer<K>,
    BincodeSerializer<V>: Serializer<V>,
{
    /// Client for an already-registered store, using bincode serialization
    /// and the default last-writer-wins resolver.
    pub fn new(ctx: &Ctx, name: &str) -> Result<Self> {
        Self::with_resolver(ctx, name, default_resolver())
    }

    /// Client with a custom inconsistency resolver.
    pub fn with_resolver(ctx: &Ctx, name: &str, resolver: Resolver<V>) -> Result<Self> {
        Self::with_serializers(ctx, name, resolver)
    }
}

impl<K, V, KS, VS> StoreClient<K, V, KS, VS>
where
    KS: Serializer<K> + Default,
    VS: Serializer<V> + Default,
{
    /// Client with explicit serializer types.
    pub fn with_serializers(ctx: &Ctx, name: &str, resolver: Resolver<V>) -> Result<Self> {
        Self::new_shared(ctx.shared(), name, resolver)
    }

    pub(crate) fn new_shared(
        shared: Arc<CtxShared>,
        name: &str,
        resolver: Resolver<V>,
    ) -> Result<Self> {
        let store = shared.registry().get(name)?;
        Ok(StoreClient {
            shared,
            store,
            resolver,
            key_ser: KS::default(),
            value_ser: VS::default(),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// The resolved value for a key. Returns an absent versioned for an
    /// unknown key (or one whose only survivors are tombstones).
    pub fn get(&self, key: &K) -> Result<Versioned<V>> {
        let raw = self.store.get(&self.key_ser.serialize(key)?)?;
        if raw.is_empty() {
            return Ok(Versioned::absent());
        }
        self.resolve(raw)
    }

    /// Write a new value on top of the version previously read.
    ///
    /// Fails with [`Error::ObsoleteVersion`] when the store already holds a
    /// version at or after the incremented clock; re-read and retry.
    pub fn update(&self, key: &K, old_value: &Versioned<V>, new_value: &V) -> Result<()> {
        let version = old_value
            .version()
            .incremented(&self.shared.local_node_id());
        let raw = Versioned::new(Some(self.value_ser.serialize(new_value)?), version);
        if !self.store.put(&self.key_ser.serialize(key)?, &raw)? {
            return Err(Error::ObsoleteVersion);
        }
        Ok(())
    }

    /// Delete the value for a key by writing a tombstone after the given
    /// version.
    pub fn delete_key(&self, key: &K, version: &VectorClock) -> Result<()> {
        let version = version.incremented(&self.shared.local_node_id());
        let raw = Versioned::tombstone(version);
        if !self.store.put(&self.key_ser.serialize(key)?, &raw)? {
            return Err(Error::ObsoleteVersion);
        }
        Ok(())
    }

    /// Visit every record with its decoded key and resolved value.
    pub fn visit(&self, mut visitor: impl FnMut(K, Versioned<V>)) -> Result<()> {
        let mut raw_records = Vec::new();
        self.store
            .visit(|key, values| raw_records.push((key.to_vec(), values.to_vec())));

        for (key, values) in raw_records {
            let key = self.key_ser.deserialize(&key)?;
            visitor(key, self.resolve(values)?);
        }
        Ok(())
    }

    /// Subscribe to change notifications with decoded keys. Keys that fail
    /// to decode are logged and dropped.
    pub fn add_listener(&self, listener: impl Fn(K, bool) + Send + Sync + 'static)
    where
        KS: 'static,
    {
        let store_name = self.store.name().to_string();
        let key_ser = KS::default();
        self.store.add_listener(Arc::new(move |key, local| {
            match key_ser.deserialize(key) {
                Ok(key) => listener(key, local),
                Err(err) => warn!(target: "warren::store",
                                  store = %store_name,
                                  "dropping change notification: {err}"),
            }
        }));
    }

    fn resolve(&self, raw: Vec<Versioned<Vec<u8>>>) -> Result<Versioned<V>> {
        let mut decoded = Vec::with_capacity(raw.len());
        for value in raw {
            let (payload, version) = value.into_parts();
            let payload = payload
                .map(|bytes| self.value_ser.deserialize(&bytes))
                .transpose()?;
            decoded.push(Versioned::new(payload, version));
        }

        let mut resolved = (self.resolver)(decoded);
        if resolved.len() == 1 {
            Ok(resolved.remove(0))
        } else {
            Err(Error::InconsistentData {
                store: self.store.name().to_string(),
                remaining: resolved.len(),
            })
        }
    }
}
