//! Image load coordination
//!
//! One background worker at a time drains a FIFO queue of decode
//! requests. Requests deduplicate against the cache up front; a display
//! target redirected while its request was queued turns the finished
//! decode into a no-op. The queue and the worker-liveness flag share a
//! mutex, so "queue non-empty implies a worker will run" holds across the
//! enqueue/exit race instead of being polled.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::Error;
use crate::cache::{CacheStats, ImageCache, ImageKey};
use crate::decoder;
use crate::decoder::DecodedImage;
use crate::targets::{TargetId, TargetRegistry};

/// Receives a decoded image once it is available and still wanted
///
/// Called synchronously on a cache hit and from the worker thread on a
/// miss; implementations that touch UI state own their own hand-off.
pub trait RenderTarget: Send + Sync {
    fn render(&self, image: &Arc<DecodedImage>);
}

/// Lifecycle notifications around a load
///
/// Not guaranteed to run on any particular thread.
pub trait LoadListener: Send + Sync {
    /// Called before the loading process starts for an image
    ///
    /// `cached` is true if the image is available in the cache.
    fn before_load(&self, cached: bool);

    /// Called when an image is finished loading
    ///
    /// `cached` is true if the image was available in the cache.
    fn after_load(&self, cached: bool);
}

/// Identity of a target, taken from its allocation address
pub fn target_id(target: &Arc<dyn RenderTarget>) -> TargetId {
    Arc::as_ptr(target) as *const () as usize
}

/// A queued decode request, consumed exactly once by the worker
struct LoadRequest {
    key: ImageKey,
    target_id: TargetId,
    target: Arc<dyn RenderTarget>,
    listener: Option<Arc<dyn LoadListener>>,
}

/// Pending requests and worker liveness, guarded together
#[derive(Default)]
struct QueueState {
    pending: VecDeque<LoadRequest>,
    worker_alive: bool,
}

struct LoaderInner {
    cache: Mutex<ImageCache>,
    queue: Mutex<QueueState>,
    /// Signalled when the worker drains the queue and exits
    idle: Condvar,
    targets: TargetRegistry,
}

/// Coordinates cache lookups and background decoding
///
/// Shared freely behind an [`Arc`]; see [`crate::LoaderRegistry`] for the
/// capacity-widening way to obtain one.
pub struct ImageLoader {
    inner: Arc<LoaderInner>,
}

impl ImageLoader {
    /// Loader with a cache budget of `capacity` raster bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                cache: Mutex::new(ImageCache::new(capacity)),
                queue: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
                targets: TargetRegistry::new(),
            }),
        }
    }

    /// Load `source` into `target`, scaled to fit `max_size`
    ///
    /// Same as [`request_display`](Self::request_display) without a
    /// listener.
    pub fn display(
        &self,
        source: impl AsRef<Path>,
        target: &Arc<dyn RenderTarget>,
        max_size: Option<u32>,
    ) -> Result<(), Error> {
        self.request_display(source, target, max_size, None)
    }

    /// Load `source` into `target`, scaled to fit `max_size`
    ///
    /// Images exceeding `max_size` in either dimension are scaled down
    /// with their aspect ratio preserved; `None` loads at full
    /// resolution. A cached image renders synchronously before this
    /// returns. Otherwise the request is queued and a worker is started
    /// if none is running.
    ///
    /// Fails only when `source` does not name an existing file; a source
    /// that exists but fails to decode is reported through the listener
    /// hooks, not as an error.
    pub fn request_display(
        &self,
        source: impl AsRef<Path>,
        target: &Arc<dyn RenderTarget>,
        max_size: Option<u32>,
        listener: Option<Arc<dyn LoadListener>>,
    ) -> Result<(), Error> {
        let source = source.as_ref();
        if !source.is_file() {
            return Err(Error::SourceNotFound(source.to_path_buf()));
        }

        let key = ImageKey::new(source, max_size);
        let id = target_id(target);

        // The target remembers the latest request before anything else
        // happens; the worker compares against this mark.
        self.inner.targets.mark(id, key.clone());

        let cached = self.inner.cache.lock().unwrap().get(&key);
        if let Some(image) = cached {
            debug!(source = %key.source.display(), "cache hit");
            if let Some(listener) = &listener {
                listener.before_load(true);
            }
            target.render(&image);
            if let Some(listener) = &listener {
                listener.after_load(true);
            }
            return Ok(());
        }

        debug!(source = %key.source.display(), "cache miss, queueing decode");
        if let Some(listener) = &listener {
            listener.before_load(false);
        }

        let request = LoadRequest {
            key,
            target_id: id,
            target: Arc::clone(target),
            listener,
        };

        let mut state = self.inner.queue.lock().unwrap();
        state.pending.push_back(request);
        if !state.worker_alive {
            state.worker_alive = true;
            drop(state);
            self.spawn_worker();
        }
        Ok(())
    }

    fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("pixcache-decode".to_string())
            .spawn(move || worker_loop(&inner))
            .expect("Failed to spawn decode worker");
    }

    /// Block until the queue is empty and no worker is running
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.queue.lock().unwrap();
        while state.worker_alive || !state.pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    /// Number of requests waiting for the worker
    pub fn pending_requests(&self) -> usize {
        self.inner.queue.lock().unwrap().pending.len()
    }

    /// Cache byte budget
    pub fn capacity(&self) -> usize {
        self.inner.cache.lock().unwrap().capacity()
    }

    /// Cache counters snapshot
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().unwrap().stats()
    }
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.queue.lock().unwrap();
        f.debug_struct("ImageLoader")
            .field("pending", &state.pending.len())
            .field("worker_alive", &state.worker_alive)
            .finish()
    }
}

/// Drain the queue, then exit
///
/// The empty-queue check, the liveness flip and the exit decision all
/// happen under the queue lock: a racing enqueue either observes the
/// worker still alive or starts the next one itself.
fn worker_loop(inner: &Arc<LoaderInner>) {
    debug!("decode worker started");
    loop {
        let request = {
            let mut state = inner.queue.lock().unwrap();
            match state.pending.pop_front() {
                Some(request) => request,
                None => {
                    state.worker_alive = false;
                    inner.idle.notify_all();
                    debug!("queue drained, decode worker exiting");
                    return;
                }
            }
        };
        inner.service(request);
    }
}

impl LoaderInner {
    /// Handle one dequeued request; never holds a lock while decoding
    fn service(&self, request: LoadRequest) {
        if !self.targets.is_desired(request.target_id, &request.key) {
            debug!(
                source = %request.key.source.display(),
                "target moved on, skipping decode"
            );
            return;
        }

        // A duplicate request for the same key may have been decoded
        // while this one sat in the queue.
        let already_cached = self.cache.lock().unwrap().contains(&request.key);
        if !already_cached {
            let decoded = std::fs::read(&request.key.source)
                .map_err(Error::from)
                .and_then(|bytes| decoder::decode_scaled(&bytes, request.key.max_size));
            match decoded {
                Ok(image) => {
                    // Inserted even when the target moved on mid-decode;
                    // the image may be wanted again later.
                    self.cache
                        .lock()
                        .unwrap()
                        .put(request.key.clone(), Arc::new(image));
                }
                Err(error) => {
                    warn!(
                        source = %request.key.source.display(),
                        %error,
                        "decode failed"
                    );
                    if let Some(listener) = &request.listener {
                        listener.after_load(false);
                    }
                    return;
                }
            }
        }

        // Fetch back from the cache rather than holding on to the decode
        // result: the entry may already have been evicted or replaced.
        if self.targets.is_desired(request.target_id, &request.key) {
            let image = self.cache.lock().unwrap().get(&request.key);
            if let Some(image) = image {
                request.target.render(&image);
            }
        }

        if let Some(listener) = &request.listener {
            listener.after_load(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTarget {
        renders: Mutex<Vec<(u32, u32)>>,
    }

    impl RecordingTarget {
        fn renders(&self) -> Vec<(u32, u32)> {
            self.renders.lock().unwrap().clone()
        }
    }

    impl RenderTarget for RecordingTarget {
        fn render(&self, image: &Arc<DecodedImage>) {
            self.renders.lock().unwrap().push((image.width, image.height));
        }
    }

    #[derive(Default)]
    struct CountingListener {
        before_cached: AtomicUsize,
        before_uncached: AtomicUsize,
        after_cached: AtomicUsize,
        after_uncached: AtomicUsize,
    }

    impl LoadListener for CountingListener {
        fn before_load(&self, cached: bool) {
            if cached {
                self.before_cached.fetch_add(1, Ordering::SeqCst);
            } else {
                self.before_uncached.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn after_load(&self, cached: bool) {
            if cached {
                self.after_cached.fetch_add(1, Ordering::SeqCst);
            } else {
                self.after_uncached.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([60, 120, 60, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        let path = dir.join(name);
        fs::write(&path, out.into_inner()).unwrap();
        path
    }

    fn recording_target() -> (Arc<RecordingTarget>, Arc<dyn RenderTarget>) {
        let target = Arc::new(RecordingTarget::default());
        let handle: Arc<dyn RenderTarget> = target.clone();
        (target, handle)
    }

    const IDLE: Duration = Duration::from_secs(10);

    #[test]
    fn test_missing_source_rejected() {
        let loader = ImageLoader::new(1024 * 1024);
        let (_, handle) = recording_target();
        let listener = Arc::new(CountingListener::default());

        let result = loader.request_display(
            "/definitely/not/here.png",
            &handle,
            None,
            Some(listener.clone()),
        );

        assert!(matches!(result, Err(Error::SourceNotFound(_))));
        assert_eq!(listener.before_uncached.load(Ordering::SeqCst), 0);
        assert_eq!(loader.pending_requests(), 0);
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 24, 12);
        let loader = ImageLoader::new(1024 * 1024);
        let (target, handle) = recording_target();
        let listener = Arc::new(CountingListener::default());

        loader
            .request_display(&path, &handle, None, Some(listener.clone()))
            .unwrap();
        assert_eq!(listener.before_uncached.load(Ordering::SeqCst), 1);
        assert!(loader.wait_until_idle(IDLE));

        assert_eq!(listener.after_uncached.load(Ordering::SeqCst), 1);
        assert_eq!(target.renders(), vec![(24, 12)]);

        // Second request is served synchronously from the cache
        loader
            .request_display(&path, &handle, None, Some(listener.clone()))
            .unwrap();
        assert_eq!(target.renders(), vec![(24, 12), (24, 12)]);
        assert_eq!(listener.before_cached.load(Ordering::SeqCst), 1);
        assert_eq!(listener.after_cached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hit_path_never_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 10, 10);
        let loader = ImageLoader::new(1024 * 1024);
        let (target, handle) = recording_target();

        loader.display(&path, &handle, None).unwrap();
        assert!(loader.wait_until_idle(IDLE));

        // Corrupt the file: a hit that reached the decoder would fail now
        fs::write(&path, b"garbage").unwrap();
        loader.display(&path, &handle, None).unwrap();

        assert_eq!(target.renders(), vec![(10, 10), (10, 10)]);
        assert_eq!(loader.pending_requests(), 0);
    }

    #[test]
    fn test_scaled_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "wide.png", 1000, 500);
        let loader = ImageLoader::new(16 * 1024 * 1024);
        let (target, handle) = recording_target();

        loader.display(&path, &handle, Some(240)).unwrap();
        assert!(loader.wait_until_idle(IDLE));

        assert_eq!(target.renders(), vec![(250, 125)]);
    }

    #[test]
    fn test_decode_failure_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.png");
        fs::write(&bad, b"not an image").unwrap();
        let good = write_png(dir.path(), "good.png", 8, 8);

        let loader = ImageLoader::new(1024 * 1024);
        let (target, handle) = recording_target();
        let listener = Arc::new(CountingListener::default());

        loader
            .request_display(&bad, &handle, None, Some(listener.clone()))
            .unwrap();
        // The failure does not kill the worker for later requests
        loader
            .request_display(&good, &handle, None, Some(listener.clone()))
            .unwrap();
        assert!(loader.wait_until_idle(IDLE));

        assert_eq!(listener.after_uncached.load(Ordering::SeqCst), 2);
        assert_eq!(target.renders(), vec![(8, 8)]);
        assert_eq!(loader.cache_stats().entries, 1);
    }

    #[test]
    fn test_oversized_image_not_rendered() {
        let dir = tempfile::tempdir().unwrap();
        // 16x16 RGBA = 1024 bytes, far over a 100 byte budget
        let path = write_png(dir.path(), "big.png", 16, 16);
        let loader = ImageLoader::new(100);
        let (target, handle) = recording_target();
        let listener = Arc::new(CountingListener::default());

        loader
            .request_display(&path, &handle, None, Some(listener.clone()))
            .unwrap();
        assert!(loader.wait_until_idle(IDLE));

        // Decoded, inserted, instantly evicted: the render re-check finds
        // nothing, but the listener still hears the end of the load.
        assert!(target.renders().is_empty());
        assert_eq!(listener.after_uncached.load(Ordering::SeqCst), 1);
        assert_eq!(loader.cache_stats().entries, 0);
    }

    #[test]
    fn test_duplicate_requests_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 12, 6);
        let loader = ImageLoader::new(1024 * 1024);
        let (target, handle) = recording_target();
        let listener = Arc::new(CountingListener::default());

        // Hold the worker off so both requests sit in the queue together
        loader.inner.queue.lock().unwrap().worker_alive = true;
        loader
            .request_display(&path, &handle, None, Some(listener.clone()))
            .unwrap();
        loader
            .request_display(&path, &handle, None, Some(listener.clone()))
            .unwrap();
        assert_eq!(loader.pending_requests(), 2);

        let first = loader.inner.queue.lock().unwrap().pending.pop_front().unwrap();
        let second = loader.inner.queue.lock().unwrap().pending.pop_front().unwrap();

        loader.inner.service(first);
        // Deleting the source proves the second request never decodes
        fs::remove_file(&path).unwrap();
        loader.inner.service(second);

        assert_eq!(target.renders(), vec![(12, 6), (12, 6)]);
        assert_eq!(listener.after_uncached.load(Ordering::SeqCst), 2);
        assert_eq!(loader.cache_stats().entries, 1);
    }

    #[test]
    fn test_stale_request_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = write_png(dir.path(), "a.png", 30, 30);
        let path_b = write_png(dir.path(), "b.png", 14, 14);
        let loader = ImageLoader::new(1024 * 1024);
        let (target, handle) = recording_target();

        // Queue both requests for one target before any decoding happens;
        // the second mark supersedes the first.
        loader.inner.queue.lock().unwrap().worker_alive = true;
        loader.display(&path_a, &handle, None).unwrap();
        loader.display(&path_b, &handle, None).unwrap();

        worker_loop(&loader.inner);

        // Request A was discarded without decoding, so only B rendered
        // and only B is cached.
        assert_eq!(target.renders(), vec![(14, 14)]);
        assert_eq!(loader.cache_stats().entries, 1);
        assert!(!loader
            .inner
            .cache
            .lock()
            .unwrap()
            .contains(&ImageKey::original(&path_a)));
    }

    #[test]
    fn test_redirected_target_shows_latest() {
        let dir = tempfile::tempdir().unwrap();
        // A is slow to decode, B is quick; whatever the interleaving, the
        // target must end up showing B.
        let path_a = write_png(dir.path(), "slow.png", 1400, 1400);
        let path_b = write_png(dir.path(), "fast.png", 16, 16);
        let loader = ImageLoader::new(64 * 1024 * 1024);
        let (target, handle) = recording_target();

        loader.display(&path_a, &handle, None).unwrap();
        loader.display(&path_b, &handle, None).unwrap();
        assert!(loader.wait_until_idle(IDLE));

        let renders = target.renders();
        assert_eq!(renders.last(), Some(&(16, 16)));
        // A never renders after B: it is either first or absent
        assert!(renders.len() <= 2);
        if renders.len() == 2 {
            assert_eq!(renders[0], (1400, 1400));
        }
    }

    #[test]
    fn test_worker_restarts_after_draining() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = write_png(dir.path(), "a.png", 6, 6);
        let path_b = write_png(dir.path(), "b.png", 7, 7);
        let loader = ImageLoader::new(1024 * 1024);
        let (target, handle) = recording_target();

        loader.display(&path_a, &handle, None).unwrap();
        assert!(loader.wait_until_idle(IDLE));
        assert!(!loader.inner.queue.lock().unwrap().worker_alive);

        loader.display(&path_b, &handle, None).unwrap();
        assert!(loader.wait_until_idle(IDLE));

        assert_eq!(target.renders(), vec![(6, 6), (7, 7)]);
        assert_eq!(loader.cache_stats().entries, 2);
    }

    #[test]
    fn test_no_request_stranded_under_churn() {
        let dir = tempfile::tempdir().unwrap();
        let sources: Vec<_> = (0..4)
            .map(|i| write_png(dir.path(), &format!("img{i}.png"), 4, 4))
            .collect();

        // Zero capacity: every request misses, so workers start and exit
        // constantly while producers race the shutdown check.
        let loader = Arc::new(ImageLoader::new(0));
        let listener = Arc::new(CountingListener::default());

        let mut producers = Vec::new();
        for t in 0..4 {
            let loader = Arc::clone(&loader);
            let listener = Arc::clone(&listener);
            let sources = sources.clone();
            producers.push(thread::spawn(move || {
                for i in 0..25 {
                    // Fresh target per request: nothing ever goes stale
                    let (_, handle) = recording_target();
                    loader
                        .request_display(
                            &sources[(t + i) % sources.len()],
                            &handle,
                            None,
                            Some(listener.clone()),
                        )
                        .unwrap();
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(loader.wait_until_idle(IDLE));
        assert_eq!(loader.pending_requests(), 0);
        assert!(!loader.inner.queue.lock().unwrap().worker_alive);
        // Every request completed: none stranded in the queue
        assert_eq!(listener.after_uncached.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_target_identity_stable_across_clones() {
        let (_, handle) = recording_target();
        let clone = Arc::clone(&handle);
        assert_eq!(target_id(&handle), target_id(&clone));

        let (_, other) = recording_target();
        assert_ne!(target_id(&handle), target_id(&other));
    }
}
