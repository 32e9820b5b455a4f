//!
//! Stream pool
//! Streams and their device arenas are allocated upfront and handed out one caller at a time
use crate::backend::{NativeBackend, RawStream};
use crate::env::{Kernel, Variant};
use crate::error::{GpuMathsError, Result};
use crate::sizing;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Define the rate of WARNING on acquire wait
pub const ACQUIRE_WAIT_WARN_RATE: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// Refusing checkouts, waiting for outstanding streams before destroying everything
    Closing,
    Closed,
    /// Pool dropped while streams were checked out. They are destroyed as they come back.
    Abandoned,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<RawStream>,
    checked_out: usize,
    phase: Phase,
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    backend: Arc<dyn NativeBackend>,
    stream_count: usize,
    mem_size: usize,
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Pool state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_back(&self, raw: RawStream) {
        let mut state = self.lock();
        state.checked_out -= 1;
        if state.phase == Phase::Abandoned {
            drop(state);
            if let Err(err) = self.backend.destroy_stream(raw) {
                tracing::error!("Couldn't destroy stream returned to abandoned pool: {err}");
            }
            return;
        }
        state.idle.push(raw);
        tracing::trace!(
            "stream {} returned, {} idle",
            raw.token(),
            state.idle.len()
        );
        drop(state);
        self.changed.notify_all();
    }
}

/// Exclusive handle on one stream of a [`StreamPool`]
///
/// Can only be obtained from the pool. Dropping it (or passing it to [`StreamPool::release`])
/// returns the stream to the idle set. The native handle stays inside the crate, so a
/// checked-out stream cannot be destroyed behind the pool's back:
///
/// ```compile_fail
/// fn native_handle(stream: &gpumaths::Stream) -> gpumaths::RawStream {
///     stream.raw()
/// }
/// ```
#[derive(Debug)]
pub struct Stream {
    raw: RawStream,
    pool: Arc<PoolShared>,
}

impl Stream {
    pub(crate) fn raw(&self) -> RawStream {
        self.raw
    }

    /// Arena size in bytes
    pub fn capacity(&self) -> usize {
        self.pool.mem_size
    }

    pub fn max_slots(&self, variant: Variant, kernel: Kernel) -> usize {
        sizing::max_slots(variant, kernel, self.capacity())
    }

    pub fn max_slots_exp(&self, variant: Variant) -> usize {
        self.max_slots(variant, Kernel::PowmOdd)
    }

    pub fn max_slots_elgamal(&self, variant: Variant) -> usize {
        self.max_slots(variant, Kernel::ElGamal)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.pool.backend
    }

    fn belongs_to(&self, pool: &StreamPool) -> bool {
        Arc::ptr_eq(&self.pool, &pool.shared)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.pool.put_back(self.raw);
    }
}

/// Fixed set of streams sharing one arena size
#[derive(Debug)]
pub struct StreamPool {
    shared: Arc<PoolShared>,
}

impl StreamPool {
    /// Allocate `stream_count` streams of `mem_size` bytes each
    ///
    /// On failure every stream already created is destroyed before returning.
    #[tracing::instrument(level = "debug", skip(backend), fields(backend = backend.name()))]
    pub fn open(
        backend: Arc<dyn NativeBackend>,
        stream_count: usize,
        mem_size: usize,
    ) -> Result<Self> {
        if stream_count == 0 {
            return Err(GpuMathsError::Config(
                "stream pool needs at least one stream".to_string(),
            ));
        }

        let mut streams = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            match backend.create_stream(mem_size) {
                Ok(raw) => streams.push(raw),
                Err(err) => {
                    // Try to destroy all created streams to avoid leaking memory
                    for raw in streams.drain(..) {
                        if let Err(destroy_err) = backend.destroy_stream(raw) {
                            tracing::error!(
                                "Couldn't release stream {} while unwinding pool creation: \
                                 {destroy_err}",
                                raw.token()
                            );
                        }
                    }
                    return Err(GpuMathsError::Resource(err.0));
                }
            }
        }
        tracing::debug!("opened {stream_count} streams of {mem_size} B");

        Ok(Self {
            shared: Arc::new(PoolShared {
                backend,
                stream_count,
                mem_size,
                state: Mutex::new(PoolState {
                    idle: streams,
                    checked_out: 0,
                    phase: Phase::Open,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    pub fn stream_count(&self) -> usize {
        self.shared.stream_count
    }

    pub fn memory_per_stream(&self) -> usize {
        self.shared.mem_size
    }

    /// Number of idle streams
    pub fn available(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn max_slots(&self, variant: Variant, kernel: Kernel) -> usize {
        sizing::max_slots(variant, kernel, self.shared.mem_size)
    }

    fn checkout(&self, state: &mut PoolState) -> Option<Stream> {
        let raw = state.idle.pop()?;
        state.checked_out += 1;
        tracing::trace!("stream {} checked out", raw.token());
        Some(Stream {
            raw,
            pool: self.shared.clone(),
        })
    }

    /// Block until a stream is idle and take it
    pub fn acquire(&self) -> Result<Stream> {
        let mut state = self.shared.lock();
        let mut waited = std::time::Duration::ZERO;
        loop {
            if state.phase != Phase::Open {
                return Err(GpuMathsError::PoolClosed);
            }
            if let Some(stream) = self.checkout(&mut state) {
                return Ok(stream);
            }
            let (guard, timeout) = self
                .shared
                .changed
                .wait_timeout(state, ACQUIRE_WAIT_WARN_RATE)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
            if timeout.timed_out() {
                waited += ACQUIRE_WAIT_WARN_RATE;
                tracing::warn!(
                    "Waiting more than {waited:?} for a stream. Check that every stream is \
                     released once its batch has been consumed"
                );
            }
        }
    }

    /// Take a stream if one is idle, without blocking
    pub fn try_acquire(&self) -> Result<Option<Stream>> {
        let mut state = self.shared.lock();
        if state.phase != Phase::Open {
            return Err(GpuMathsError::PoolClosed);
        }
        Ok(self.checkout(&mut state))
    }

    /// Return a stream to the pool
    ///
    /// The batch last submitted on the stream must have been delivered.
    pub fn release(&self, stream: Stream) {
        if !stream.belongs_to(self) {
            tracing::warn!(
                "stream {} released to a pool it doesn't belong to",
                stream.raw.token()
            );
        }
        drop(stream);
    }

    /// Destroy every stream
    ///
    /// Refuses new checkouts immediately, then waits for outstanding streams to come back.
    /// Every stream is destroyed even if some destructions fail, the first failure is returned.
    /// Calling it again once closed is a no-op.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        match state.phase {
            Phase::Closed | Phase::Abandoned => return Ok(()),
            Phase::Closing => {
                while state.phase == Phase::Closing {
                    state = self
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                return Ok(());
            }
            Phase::Open => {}
        }

        state.phase = Phase::Closing;
        self.shared.changed.notify_all();
        while state.checked_out > 0 {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let streams = std::mem::take(&mut state.idle);
        drop(state);

        let mut first_err = None;
        for raw in streams {
            if let Err(err) = self.shared.backend.destroy_stream(raw) {
                tracing::error!("Couldn't destroy stream {}: {err}", raw.token());
                first_err.get_or_insert(GpuMathsError::Destroy(err.0));
            }
        }

        self.shared.lock().phase = Phase::Closed;
        self.shared.changed.notify_all();
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.phase != Phase::Open {
            return;
        }
        state.phase = Phase::Abandoned;
        let streams = std::mem::take(&mut state.idle);
        let outstanding = state.checked_out;
        drop(state);
        self.shared.changed.notify_all();

        if outstanding > 0 {
            tracing::warn!("stream pool dropped with {outstanding} streams still checked out");
        }
        for raw in streams {
            if let Err(err) = self.shared.backend.destroy_stream(raw) {
                tracing::error!("Couldn't destroy stream {}: {err}", raw.token());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::error::NativeError;
    use crossbeam::channel;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn sim_pool(streams: usize) -> (SimBackend, StreamPool) {
        let sim = SimBackend::default();
        let pool = StreamPool::open(Arc::new(sim.clone()), streams, 4096).unwrap();
        (sim, pool)
    }

    #[test]
    fn open_and_close() {
        let (sim, pool) = sim_pool(3);
        assert_eq!(sim.live_streams(), 3);
        assert_eq!(pool.stream_count(), 3);
        assert_eq!(pool.memory_per_stream(), 4096);
        assert_eq!(pool.available(), 3);

        pool.close().unwrap();
        assert_eq!(sim.live_streams(), 0);
        // Idempotent
        pool.close().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), GpuMathsError::PoolClosed);
        assert_eq!(pool.try_acquire().unwrap_err(), GpuMathsError::PoolClosed);
    }

    #[test]
    fn zero_streams_is_rejected() {
        let sim = SimBackend::default();
        assert!(matches!(
            StreamPool::open(Arc::new(sim.clone()), 0, 4096),
            Err(GpuMathsError::Config(_))
        ));
        assert_eq!(sim.native_calls(), 0);
    }

    #[test]
    fn partial_allocation_failure_leaks_nothing() {
        let sim = SimBackend::default();
        let baseline = sim.live_streams();
        sim.fail_stream_creation_after(3);
        let err = StreamPool::open(Arc::new(sim.clone()), 5, 4096).unwrap_err();
        assert_eq!(
            err,
            GpuMathsError::Resource("simulated stream allocation failure".to_string())
        );
        assert_eq!(sim.created_streams(), 3);
        assert_eq!(sim.live_streams(), baseline);
        assert_eq!(sim.allocated_bytes(), 0);
    }

    #[test]
    fn out_of_device_memory_leaks_nothing() {
        let sim = SimBackend::new(crate::backend::sim::SimConfig {
            device_memory: 10_000,
            kernel_latency_us: 0,
        });
        let err = StreamPool::open(Arc::new(sim.clone()), 3, 4096).unwrap_err();
        assert!(matches!(err, GpuMathsError::Resource(_)));
        assert_eq!(sim.live_streams(), 0);
    }

    #[test]
    fn checkouts_are_exclusive() {
        let (_sim, pool) = sim_pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.raw(), b.raw());
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().unwrap().is_none());

        let raw_a = a.raw();
        pool.release(a);
        let c = pool.try_acquire().unwrap().unwrap();
        assert_eq!(c.raw(), raw_a);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn extra_acquirers_wait_for_release() {
        const S: usize = 2;
        const K: usize = 3;
        let (_sim, pool) = sim_pool(S);
        let pool = Arc::new(pool);
        let (tx, rx) = channel::unbounded();

        let handles = (0..S + K)
            .map(|_| {
                let pool = pool.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let stream = pool.acquire().unwrap();
                    tx.send(stream).unwrap();
                })
            })
            .collect::<Vec<_>>();

        // Exactly S immediate grants
        let mut granted = (0..S)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect::<Vec<_>>();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // Every release lets exactly one deferred acquirer through
        for _ in 0..K {
            let stream = granted.pop().unwrap();
            pool.release(stream);
            granted.push(rx.recv_timeout(Duration::from_secs(10)).unwrap());
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            assert_eq!(pool.available(), 0);
        }

        drop(granted);
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(pool.available(), S);
    }

    #[test]
    fn close_waits_for_outstanding_streams() {
        let (sim, pool) = sim_pool(2);
        let pool = Arc::new(pool);
        let stream = pool.acquire().unwrap();

        let closer = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.close())
        };
        // New checkouts are refused as soon as closing starts
        while pool.try_acquire().is_ok_and(|s| {
            drop(s);
            true
        }) {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sim.live_streams(), 2);

        drop(stream);
        closer.join().unwrap().unwrap();
        assert_eq!(sim.live_streams(), 0);
    }

    #[test]
    fn blocked_acquirer_fails_on_close() {
        let (_sim, pool) = sim_pool(1);
        let pool = Arc::new(pool);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(drop))
        };
        std::thread::sleep(Duration::from_millis(50));
        let closer = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.close())
        };
        assert_eq!(waiter.join().unwrap(), Err(GpuMathsError::PoolClosed));
        drop(held);
        closer.join().unwrap().unwrap();
    }

    #[test]
    fn dropped_pool_destroys_returned_streams() {
        let (sim, pool) = sim_pool(2);
        let stream = pool.acquire().unwrap();
        drop(pool);
        assert_eq!(sim.live_streams(), 1);
        drop(stream);
        assert_eq!(sim.live_streams(), 0);
    }

    #[derive(Debug)]
    struct FlakyDestroy {
        inner: SimBackend,
        fail_token: AtomicU64,
    }

    type NativeResult<T> = std::result::Result<T, NativeError>;

    impl NativeBackend for FlakyDestroy {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn create_stream(&self, capacity: usize) -> NativeResult<RawStream> {
            let raw = self.inner.create_stream(capacity)?;
            // Only the first stream fails to be destroyed
            let _ = self
                .fail_token
                .compare_exchange(0, raw.token(), Ordering::SeqCst, Ordering::SeqCst);
            Ok(raw)
        }
        fn destroy_stream(&self, stream: RawStream) -> NativeResult<()> {
            self.inner.destroy_stream(stream)?;
            if stream.token() == self.fail_token.load(Ordering::SeqCst) {
                return Err(NativeError::new("context destruction failed"));
            }
            Ok(())
        }
        fn put(
            &self,
            stream: RawStream,
            variant: Variant,
            kernel: Kernel,
            num_slots: usize,
            staged: &[u8],
        ) -> NativeResult<()> {
            self.inner.put(stream, variant, kernel, num_slots, staged)
        }
        fn run(&self, stream: RawStream, variant: Variant) -> NativeResult<()> {
            self.inner.run(stream, variant)
        }
        fn download(&self, stream: RawStream, variant: Variant) -> NativeResult<()> {
            self.inner.download(stream, variant)
        }
        fn synchronize(&self, stream: RawStream) -> NativeResult<()> {
            self.inner.synchronize(stream)
        }
        fn read_outputs(&self, stream: RawStream, variant: Variant, dst: &mut [u8]) -> NativeResult<()> {
            self.inner.read_outputs(stream, variant, dst)
        }
    }

    #[test]
    fn close_reports_destroy_failure_but_destroys_the_rest() {
        let sim = SimBackend::default();
        let backend = FlakyDestroy {
            inner: sim.clone(),
            fail_token: AtomicU64::new(0),
        };
        let pool = StreamPool::open(Arc::new(backend), 3, 1024).unwrap();
        assert_eq!(
            pool.close(),
            Err(GpuMathsError::Destroy("context destruction failed".to_string()))
        );
        assert_eq!(sim.live_streams(), 0);
    }
}
