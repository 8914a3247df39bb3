//! Engine lifecycle and process-wide tuning
//!
//! The [`Engine`] owns everything the codec stack shares across operations:
//! the initialized/uninitialized state, the worker pool, the decode cache,
//! and the tracked-allocation counters backing [`Engine::memory_stats`].
//! Lifecycle transitions and tuning are serialized by a single mutex;
//! ordinary transform calls never take it, they only read an atomic
//! readiness flag and rely on the stack's own thread safety.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::handle;

/// Largest edge length accepted for any target or extract dimension.
/// Oversized requests are rejected, never clamped.
pub const MAX_DIMENSION: u32 = 16383;

const DEFAULT_CACHE_MEM: usize = 100 * 1024 * 1024;
const DEFAULT_CACHE_OPS: usize = 500;

/// Tuning applied when the engine is initialized.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Decode cache budget in bytes.
    pub max_cache_mem: usize,
    /// Decode cache budget in entries.
    pub max_cache_ops: usize,
    /// Worker threads for resampling. `None` falls back to the
    /// `RASTERMILL_CONCURRENCY` environment variable, then to auto-detect.
    pub concurrency: Option<usize>,
    /// Log decode cache activity. Defaults on when `RASTERMILL_TRACE` is set.
    pub cache_trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let concurrency = std::env::var("RASTERMILL_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok());
        Self {
            max_cache_mem: DEFAULT_CACHE_MEM,
            max_cache_ops: DEFAULT_CACHE_OPS,
            concurrency,
            cache_trace: std::env::var("RASTERMILL_TRACE").is_ok(),
        }
    }
}

/// Tracked engine memory, as reported by [`Engine::memory_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub current_bytes: u64,
    pub highwater_bytes: u64,
    /// Live image handles.
    pub allocations: u64,
}

/// Atomic counters for live handle allocations. Handles register on
/// creation and deregister on drop, so the counters return to baseline
/// whenever a call chain finishes, successfully or not.
#[derive(Default)]
pub(crate) struct TrackedStats {
    current_bytes: AtomicU64,
    highwater_bytes: AtomicU64,
    allocations: AtomicU64,
}

impl TrackedStats {
    pub(crate) fn track(&self, bytes: usize) {
        let now = self.current_bytes.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.highwater_bytes.fetch_max(now, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.current_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
        self.allocations.fetch_sub(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            highwater_bytes: self.highwater_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum State {
    Uninitialized,
    Initialized,
}

struct Lifecycle {
    state: State,
    config: EngineConfig,
}

/// State shared between the engine and every live handle.
pub(crate) struct Shared {
    lifecycle: Mutex<Lifecycle>,
    ready: AtomicBool,
    stats: Arc<TrackedStats>,
    cache: Mutex<DecodeCache>,
    pool: Mutex<Option<Arc<rayon::ThreadPool>>>,
}

impl Shared {
    pub(crate) fn stats(&self) -> &Arc<TrackedStats> {
        &self.stats
    }

    pub(crate) fn worker_pool(&self) -> Result<Arc<rayon::ThreadPool>> {
        self.pool
            .lock()
            .expect("worker pool lock poisoned")
            .clone()
            .ok_or_else(|| Error::Engine("engine is not initialized".into()))
    }

    /// Decode a buffer, box-shrinking by `shrink` during load, consulting the
    /// decode cache first.
    pub(crate) fn decode(&self, buf: &[u8], shrink: u32) -> Result<DynamicImage> {
        let key = (buffer_key(buf), shrink);
        let trace = {
            let mut cache = self.cache.lock().expect("decode cache lock poisoned");
            if let Some(pixels) = cache.get(key) {
                if cache.trace {
                    debug!(shrink, "decode cache hit");
                }
                return Ok(pixels);
            }
            cache.trace
        };
        if trace {
            debug!(shrink, "decode cache miss");
        }

        let reader = image::ImageReader::new(std::io::Cursor::new(buf))
            .with_guessed_format()
            .map_err(Error::engine)?;
        let mut pixels = reader.decode().map_err(Error::engine)?;

        if shrink > 1 {
            let (w, h) = (pixels.width(), pixels.height());
            pixels = handle::box_shrink(self, &pixels, (w / shrink).max(1), (h / shrink).max(1))?;
        }

        self.cache
            .lock()
            .expect("decode cache lock poisoned")
            .put(key, &pixels);
        Ok(pixels)
    }
}

/// Handle to the process's codec engine. Cheap to clone; all clones share
/// the same lifecycle state, cache, and counters.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Construct and initialize an engine.
    ///
    /// Panics if the linked codec stack is missing a required codec or the
    /// worker pool cannot be started; both are unrecoverable startup
    /// preconditions, not per-request errors.
    pub fn new(config: EngineConfig) -> Engine {
        let engine = Engine {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    state: State::Uninitialized,
                    config,
                }),
                ready: AtomicBool::new(false),
                stats: Arc::new(TrackedStats::default()),
                cache: Mutex::new(DecodeCache::default()),
                pool: Mutex::new(None),
            }),
        };
        engine.initialize();
        engine
    }

    /// Bring the engine up. No-op if already initialized.
    pub fn initialize(&self) {
        let mut lifecycle = self
            .shared
            .lifecycle
            .lock()
            .expect("lifecycle lock poisoned");
        if lifecycle.state == State::Initialized {
            return;
        }

        verify_codecs();

        let threads = lifecycle.config.concurrency.unwrap_or(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("rastermill-worker-{i}"))
            .build()
            .expect("unable to start engine worker pool");
        *self.shared.pool.lock().expect("worker pool lock poisoned") = Some(Arc::new(pool));

        self.shared
            .cache
            .lock()
            .expect("decode cache lock poisoned")
            .configure(
                lifecycle.config.max_cache_mem,
                lifecycle.config.max_cache_ops,
                lifecycle.config.cache_trace,
            );

        lifecycle.state = State::Initialized;
        self.shared.ready.store(true, Ordering::Release);
        debug!(
            threads,
            cache_mem = lifecycle.config.max_cache_mem,
            cache_ops = lifecycle.config.max_cache_ops,
            "engine initialized"
        );
    }

    /// Tear the engine down and drop all cached decode state. No-op if
    /// already shut down.
    pub fn shutdown(&self) {
        let mut lifecycle = self
            .shared
            .lifecycle
            .lock()
            .expect("lifecycle lock poisoned");
        if lifecycle.state == State::Uninitialized {
            return;
        }
        self.shared.ready.store(false, Ordering::Release);
        *self.shared.pool.lock().expect("worker pool lock poisoned") = None;
        self.shared
            .cache
            .lock()
            .expect("decode cache lock poisoned")
            .clear();
        lifecycle.state = State::Uninitialized;
        debug!("engine shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Current tracked memory and live-allocation counters. Read-only.
    pub fn memory_stats(&self) -> MemoryStats {
        self.shared.stats.snapshot()
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::Engine("engine is not initialized".into()))
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

/// Startup probe for the minimum engine capability set.
fn verify_codecs() {
    use image::ImageFormat;
    for format in [
        ImageFormat::Jpeg,
        ImageFormat::Png,
        ImageFormat::WebP,
        ImageFormat::Tiff,
    ] {
        if !format.reading_enabled() {
            panic!("unsupported engine build: {format:?} decoder missing");
        }
    }
    if !ImageFormat::Png.writing_enabled() {
        panic!("unsupported engine build: Png encoder missing");
    }
}

fn buffer_key(buf: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    buf.hash(&mut hasher);
    hasher.finish()
}

struct CacheEntry {
    pixels: DynamicImage,
    bytes: usize,
    stamp: u64,
}

/// LRU cache of decoded source images, keyed by buffer hash and load-time
/// shrink factor, bounded by both a byte and an entry budget. Cache bytes
/// are deliberately not part of [`TrackedStats`]: those count live handles
/// only.
#[derive(Default)]
struct DecodeCache {
    entries: HashMap<(u64, u32), CacheEntry>,
    bytes: usize,
    max_mem: usize,
    max_ops: usize,
    tick: u64,
    trace: bool,
}

impl DecodeCache {
    fn configure(&mut self, max_mem: usize, max_ops: usize, trace: bool) {
        self.max_mem = max_mem;
        self.max_ops = max_ops;
        self.trace = trace;
        self.shrink_to_budget();
    }

    fn get(&mut self, key: (u64, u32)) -> Option<DynamicImage> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&key).map(|entry| {
            entry.stamp = tick;
            entry.pixels.clone()
        })
    }

    fn put(&mut self, key: (u64, u32), pixels: &DynamicImage) {
        let bytes = pixels.as_bytes().len();
        if self.max_ops == 0 || bytes > self.max_mem {
            return;
        }
        self.tick += 1;
        if let Some(old) = self.entries.insert(
            key,
            CacheEntry {
                pixels: pixels.clone(),
                bytes,
                stamp: self.tick,
            },
        ) {
            self.bytes -= old.bytes;
        }
        self.bytes += bytes;
        self.shrink_to_budget();
    }

    fn shrink_to_budget(&mut self) {
        while self.entries.len() > self.max_ops || self.bytes > self.max_mem {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| *k);
            match oldest {
                Some(key) => {
                    if let Some(entry) = self.entries.remove(&key) {
                        self.bytes -= entry.bytes;
                        if self.trace {
                            debug!(bytes = entry.bytes, "decode cache evict");
                        }
                    }
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}
