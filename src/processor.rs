//! Per-store record processing.
//!
//! The processor indexes the data in a store and drives the periodic work
//! attached to it: change notifications, tombstone garbage collection, and
//! object expiry. Writes maintain the invariant that the set of versions
//! held for a key is an antichain under the clock partial order.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::storage::StorageEngine;
use crate::versioned::{antichain_insert, RawVersioned};
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Listener for change notifications: receives the raw key and whether the
/// change came from a local write. May be invoked from multiple threads
/// concurrently and must be internally safe.
pub type RawListener = Arc<dyn Fn(&[u8], bool) + Send + Sync>;

/// Base period for the record processing timer.
const TICK_PERIOD: Duration = Duration::from_millis(500);

struct Record {
    /// SHA-1 of the key; input to bucket assignment.
    key_hash: [u8; 20],
    values: Vec<RawVersioned>,
    last_refresh: Instant,
    last_resolve: Instant,
    next_time: Option<Instant>,
}

impl Record {
    fn new(key: &[u8]) -> Self {
        let now = Instant::now();
        Record {
            key_hash: Sha1::digest(key).into(),
            values: Vec::new(),
            last_refresh: now,
            last_resolve: now,
            next_time: None,
        }
    }
}

struct ProcState {
    /// Hashed-unique index over the records.
    records: HashMap<Vec<u8>, Record>,
    /// Records ordered by their next processing time. Records with no
    /// scheduled time are absent.
    by_time: BTreeMap<(Instant, Vec<u8>), ()>,
}

/// Indexes and processes the data in one store.
pub struct Processor {
    self_ref: Weak<Processor>,
    name: String,
    config: StoreConfig,
    /// When present, accepted values are written through; reads are served
    /// from the delegate.
    delegate: Option<Box<dyn StorageEngine>>,
    state: Mutex<ProcState>,
    listeners: RwLock<Vec<RawListener>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor").field("name", &self.name).finish()
    }
}

impl Processor {
    pub(crate) fn new(
        name: impl Into<String>,
        config: StoreConfig,
        delegate: Option<Box<dyn StorageEngine>>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|self_ref| Processor {
            self_ref: self_ref.clone(),
            name,
            config,
            delegate,
            state: Mutex::new(ProcState {
                records: HashMap::new(),
                by_time: BTreeMap::new(),
            }),
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The antichain of values for a key; empty when the key is unknown.
    pub fn get(&self, key: &[u8]) -> Result<Vec<RawVersioned>> {
        if let Some(delegate) = &self.delegate {
            return delegate.get(key);
        }
        let state = self.state.lock();
        Ok(state
            .records
            .get(key)
            .map(|r| r.values.clone())
            .unwrap_or_default())
    }

    /// Store a value from a local write. Returns `false` when the value is
    /// obsolete.
    pub fn put(&self, key: &[u8], value: &RawVersioned) -> Result<bool> {
        self.put_origin(key, value, true)
    }

    /// Apply a value learned from a remote node; listeners observe
    /// `local = false`.
    pub(crate) fn put_remote(&self, key: &[u8], value: &RawVersioned) -> Result<bool> {
        self.put_origin(key, value, false)
    }

    fn put_origin(&self, key: &[u8], value: &RawVersioned, local: bool) -> Result<bool> {
        let mut delegate_result: Result<bool> = Ok(true);
        let accepted;
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let record = state
                .records
                .entry(key.to_vec())
                .or_insert_with(|| Record::new(key));

            accepted = antichain_insert(&mut record.values, value);
            if accepted {
                if let Some(delegate) = &self.delegate {
                    delegate_result = delegate.put(key, value);
                }
                let next = next_processing_time(&record.values, &self.config);
                reindex(&mut state.by_time, key, record, next);
            }
        }

        if accepted {
            self.notify(key, local);
        }
        match delegate_result {
            Err(err) => {
                error!(target: "warren::store",
                       store = %self.name, "write-through failed: {err}");
                Err(err)
            }
            Ok(delegate_ok) => Ok(accepted && delegate_ok),
        }
    }

    /// Invoke `visitor` for every record under the record mutex. The
    /// visitor must be short and must not reenter the processor.
    pub fn visit(&self, mut visitor: impl FnMut(&[u8], &[RawVersioned])) {
        let state = self.state.lock();
        for (key, record) in state.records.iter() {
            visitor(key, &record.values);
        }
    }

    /// Subscribe to change notifications for this store.
    pub fn add_listener(&self, listener: RawListener) {
        self.listeners.write().push(listener);
    }

    /// The stored SHA-1 digest of a known key, used for bucket assignment.
    pub fn key_hash(&self, key: &[u8]) -> Option<[u8; 20]> {
        self.state.lock().records.get(key).map(|r| r.key_hash)
    }

    fn notify(&self, key: &[u8], local: bool) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(key, local);
        }
    }

    pub(crate) fn start(&self, handle: &Handle) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        if let Some(processor) = self.self_ref.upgrade() {
            handle.spawn(run_timer(processor, rx));
        }
    }

    pub(crate) fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.shutdown.lock().take() {
                let _ = tx.send(true);
            }
        }
    }

    /// Pop and process every record whose scheduled time has elapsed.
    fn on_tick(&self) {
        let now = Instant::now();
        let now_sys = SystemTime::now();

        loop {
            let mut state = self.state.lock();
            let due = match state.by_time.iter().next() {
                Some(((time, key), _)) if *time <= now => (*time, key.clone()),
                _ => break,
            };
            state.by_time.remove(&due);

            let state = &mut *state;
            if let Some(record) = state.records.get_mut(&due.1) {
                record.next_time = None;
                process_record(record, &self.config, now, now_sys);
                if record.values.is_empty() {
                    debug!(target: "warren::store",
                           store = %self.name, "dropping fully expired record");
                    state.records.remove(&due.1);
                } else if let Some(next) = record.next_time {
                    state.by_time.insert((next, due.1.clone()), ());
                }
            }
        }
    }
}

/// One pass over a due record: garbage-collect tombstones past the
/// tombstone timeout, expire objects past a non-zero object timeout, and
/// reschedule whatever remains.
fn process_record(record: &mut Record, config: &StoreConfig, now: Instant, now_sys: SystemTime) {
    record.values.retain(|v| match expiry_time(v, config) {
        Some(expiry) => expiry > now_sys,
        None => true,
    });
    record.last_refresh = now;
    record.last_resolve = now;
    record.next_time = values_next_time(&record.values, config, now, now_sys);
}

/// The wall-clock instant at which a value becomes eligible for removal,
/// or `None` when it never expires.
fn expiry_time(value: &RawVersioned, config: &StoreConfig) -> Option<SystemTime> {
    let written = value.version().timestamp();
    if value.is_tombstone() {
        Some(written + config.tombstone_timeout)
    } else if config.object_timeout > Duration::ZERO {
        Some(written + config.object_timeout)
    } else {
        None
    }
}

fn next_processing_time(values: &[RawVersioned], config: &StoreConfig) -> Option<Instant> {
    values_next_time(values, config, Instant::now(), SystemTime::now())
}

fn values_next_time(
    values: &[RawVersioned],
    config: &StoreConfig,
    now: Instant,
    now_sys: SystemTime,
) -> Option<Instant> {
    values
        .iter()
        .filter_map(|v| expiry_time(v, config))
        .min()
        .map(|expiry| match expiry.duration_since(now_sys) {
            Ok(remaining) => now + remaining,
            Err(_) => now,
        })
}

fn reindex(
    by_time: &mut BTreeMap<(Instant, Vec<u8>), ()>,
    key: &[u8],
    record: &mut Record,
    next: Option<Instant>,
) {
    if record.next_time == next {
        return;
    }
    if let Some(old) = record.next_time.take() {
        by_time.remove(&(old, key.to_vec()));
    }
    record.next_time = next;
    if let Some(next) = next {
        by_time.insert((next, key.to_vec()), ());
    }
}

async fn run_timer(processor: Arc<Processor>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if !processor.running.load(Ordering::SeqCst) {
                    break;
                }
                processor.on_tick();
            }
        }
    }
}
