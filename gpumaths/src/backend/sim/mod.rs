//! Implement a simulation model of the accelerator.
//! It enables to exercise the batch pipeline without the real HW
//!
//! Each stream owns a host-memory arena and a worker thread consuming the enqueued commands in
//! order, mimicking a Cuda stream. The first failure on a stream is sticky: subsequent commands
//! are skipped until the next `synchronize` reports and clears it.
use super::{NativeBackend, RawStream};
use crate::env::{Kernel, Variant};
use crate::error::NativeError;
use crate::sizing::ArenaLayout;
use crossbeam::channel;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

mod kernel;

// A panicking kernel task must not take the whole stream down with it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated device properties
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SimConfig {
    /// Total arena memory the device can hand out
    pub device_memory: usize,
    /// Extra time spent in each kernel launch
    pub kernel_latency_us: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_memory: 4 << 30,
            kernel_latency_us: 0,
        }
    }
}

/// Step of the native protocol a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimStage {
    /// Reported by `put`
    Upload,
    /// Reported by `run`
    Run,
    /// Reported asynchronously by the next `synchronize`
    Download,
}

#[derive(Debug, Default)]
struct SimFaults {
    create_budget: Option<usize>,
    armed: HashSet<SimStage>,
}

#[derive(Debug, Clone, Copy)]
struct SimJob {
    variant: Variant,
    kernel: Kernel,
    num_slots: usize,
}

impl SimJob {
    fn layout(&self) -> ArenaLayout {
        ArenaLayout::new(self.variant, self.kernel, self.num_slots)
    }
}

enum SimCmd {
    Upload(SimJob),
    Run(Variant),
    Download { fail: bool },
    Fence(channel::Sender<Option<String>>),
}

#[derive(Debug)]
struct SimMemory {
    host_in: Vec<u8>,
    device: Vec<u8>,
    host_out: Vec<u8>,
    job: Option<SimJob>,
    error: Option<String>,
}

impl SimMemory {
    fn execute(&mut self, cmd: SimCmd, latency: Duration) -> Result<(), String> {
        match cmd {
            SimCmd::Upload(job) => {
                let len = job.layout().staged_len();
                self.device[..len].copy_from_slice(&self.host_in[..len]);
                self.job = Some(job);
                Ok(())
            }
            SimCmd::Run(variant) => {
                let job = self.job.ok_or("run enqueued without upload")?;
                if job.variant != variant {
                    return Err(format!(
                        "run for {variant} on a stream uploaded for {}",
                        job.variant
                    ));
                }
                if !latency.is_zero() {
                    std::thread::sleep(latency);
                }
                let layout = job.layout();
                let (staged, out) = self.device.split_at_mut(layout.outputs.start);
                kernel::execute(
                    job.variant,
                    job.kernel,
                    &staged[layout.constants.clone()],
                    &staged[layout.inputs.clone()],
                    &mut out[..layout.outputs.len()],
                )
            }
            SimCmd::Download { fail } => {
                if fail {
                    return Err("simulated download failure".to_string());
                }
                let job = self.job.ok_or("download enqueued without upload")?;
                let outputs = job.layout().outputs;
                self.host_out.clear();
                self.host_out.extend_from_slice(&self.device[outputs]);
                Ok(())
            }
            SimCmd::Fence(_) => unreachable!("fences are handled by the worker loop"),
        }
    }
}

struct SimStream {
    capacity: usize,
    mem: Arc<Mutex<SimMemory>>,
    cmd: Mutex<Option<channel::Sender<SimCmd>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SimStream {
    fn spawn(token: u64, capacity: usize, latency: Duration) -> Result<Self, NativeError> {
        let mem = Arc::new(Mutex::new(SimMemory {
            host_in: Vec::new(),
            device: vec![0u8; capacity],
            host_out: Vec::new(),
            job: None,
            error: None,
        }));
        let (tx, rx) = channel::unbounded::<SimCmd>();

        let worker_mem = mem.clone();
        let worker = std::thread::Builder::new()
            .name(format!("gpumaths-sim-{token}"))
            .spawn(move || {
                // Ends once the stream is destroyed and the sender dropped
                for cmd in rx {
                    let mut mem = lock(&worker_mem);
                    match cmd {
                        SimCmd::Fence(ack) => {
                            let _ = ack.send(mem.error.take());
                        }
                        cmd if mem.error.is_some() => drop(cmd),
                        cmd => {
                            if let Err(err) = mem.execute(cmd, latency) {
                                tracing::debug!("sim stream {token} failed: {err}");
                                mem.error = Some(err);
                            }
                        }
                    }
                }
            })
            .map_err(|err| NativeError::new(format!("couldn't spawn stream worker: {err}")))?;

        Ok(Self {
            capacity,
            mem,
            cmd: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, cmd: SimCmd) -> Result<(), NativeError> {
        let tx = lock(&self.cmd);
        tx.as_ref()
            .ok_or_else(|| NativeError::new("stream already destroyed"))?
            .send(cmd)
            .map_err(|_| NativeError::new("stream worker terminated"))
    }

    fn shutdown(&self) {
        drop(lock(&self.cmd).take());
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("sim stream worker panicked");
            }
        }
    }
}

struct SimShared {
    config: SimConfig,
    streams: Mutex<HashMap<u64, Arc<SimStream>>>,
    faults: Mutex<SimFaults>,
    next_token: AtomicU64,
    live: AtomicUsize,
    created: AtomicUsize,
    calls: AtomicUsize,
    allocated: AtomicUsize,
}

impl Drop for SimShared {
    fn drop(&mut self) {
        let streams = self.streams.get_mut().unwrap_or_else(PoisonError::into_inner);
        let streams = std::mem::take(streams);
        if !streams.is_empty() {
            tracing::warn!("sim device dropped with {} live streams", streams.len());
        }
        streams.values().for_each(|s| s.shutdown());
    }
}

/// Simulated accelerator
///
/// Cloning yields another handle on the same device, which lets tests inspect counters while
/// the pool owns the backend.
#[derive(Clone)]
pub struct SimBackend {
    shared: Arc<SimShared>,
}

impl std::fmt::Debug for SimBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SimBackend{{ live: {}, allocated: {} B }}",
            self.live_streams(),
            self.allocated_bytes()
        )
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimBackend {
    pub fn new(config: SimConfig) -> Self {
        Self {
            shared: Arc::new(SimShared {
                config,
                streams: Mutex::new(HashMap::new()),
                faults: Mutex::new(SimFaults::default()),
                next_token: AtomicU64::new(1),
                live: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Streams currently allocated
    pub fn live_streams(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Streams ever allocated
    pub fn created_streams(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Number of protocol calls received, failed ones included
    pub fn native_calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.shared.allocated.load(Ordering::SeqCst)
    }

    /// Let `n` more stream creations succeed, then fail every following one
    pub fn fail_stream_creation_after(&self, n: usize) {
        lock(&self.shared.faults).create_budget = Some(n);
    }

    /// Fail the next operation of kind `stage`, whichever stream it runs on
    pub fn inject_failure(&self, stage: SimStage) {
        lock(&self.shared.faults).armed.insert(stage);
    }

    pub fn clear_faults(&self) {
        *lock(&self.shared.faults) = SimFaults::default();
    }

    fn take_fault(&self, stage: SimStage) -> bool {
        lock(&self.shared.faults).armed.remove(&stage)
    }

    fn call(&self) {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn stream(&self, stream: RawStream) -> Result<Arc<SimStream>, NativeError> {
        lock(&self.shared.streams)
            .get(&stream.token())
            .cloned()
            .ok_or_else(|| NativeError::new(format!("invalid stream handle {}", stream.token())))
    }
}

impl NativeBackend for SimBackend {
    fn name(&self) -> &'static str {
        "sim"
    }

    #[tracing::instrument(level = "trace", skip(self), ret)]
    fn create_stream(&self, capacity: usize) -> Result<RawStream, NativeError> {
        self.call();
        {
            let mut faults = lock(&self.shared.faults);
            match faults.create_budget.as_mut() {
                Some(0) => return Err(NativeError::new("simulated stream allocation failure")),
                Some(n) => *n -= 1,
                None => {}
            }
        }

        // Reserve the arena before committing to the allocation
        let limit = self.shared.config.device_memory;
        let reserved = self
            .shared
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(capacity).filter(|total| *total <= limit)
            });
        if let Err(used) = reserved {
            return Err(NativeError::new(format!(
                "out of memory: {capacity} B requested, {} B free",
                limit.saturating_sub(used)
            )));
        }

        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        let latency = Duration::from_micros(self.shared.config.kernel_latency_us);
        let stream = match SimStream::spawn(token, capacity, latency) {
            Ok(stream) => stream,
            Err(err) => {
                self.shared.allocated.fetch_sub(capacity, Ordering::SeqCst);
                return Err(err);
            }
        };
        lock(&self.shared.streams).insert(token, Arc::new(stream));
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(RawStream::from_token(token))
    }

    #[tracing::instrument(level = "trace", skip(self), ret)]
    fn destroy_stream(&self, stream: RawStream) -> Result<(), NativeError> {
        self.call();
        let sim = lock(&self.shared.streams)
            .remove(&stream.token())
            .ok_or_else(|| NativeError::new(format!("invalid stream handle {}", stream.token())))?;
        sim.shutdown();
        self.shared.allocated.fetch_sub(sim.capacity, Ordering::SeqCst);
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn put(
        &self,
        stream: RawStream,
        variant: Variant,
        kernel: Kernel,
        num_slots: usize,
        staged: &[u8],
    ) -> Result<(), NativeError> {
        self.call();
        let sim = self.stream(stream)?;
        if self.take_fault(SimStage::Upload) {
            return Err(NativeError::new("simulated upload failure"));
        }
        let job = SimJob {
            variant,
            kernel,
            num_slots,
        };
        let layout = job.layout();
        if layout.total_len() > sim.capacity {
            return Err(NativeError::new(format!(
                "{num_slots} slots of {kernel} need {} B, stream holds {} B",
                layout.total_len(),
                sim.capacity
            )));
        }
        if staged.len() != layout.staged_len() {
            return Err(NativeError::new(format!(
                "staged {} B for a {} B input region",
                staged.len(),
                layout.staged_len()
            )));
        }
        {
            let mut mem = lock(&sim.mem);
            mem.host_in.clear();
            mem.host_in.extend_from_slice(staged);
        }
        sim.send(SimCmd::Upload(job))
    }

    fn run(&self, stream: RawStream, variant: Variant) -> Result<(), NativeError> {
        self.call();
        let sim = self.stream(stream)?;
        if self.take_fault(SimStage::Run) {
            return Err(NativeError::new("simulated kernel launch failure"));
        }
        sim.send(SimCmd::Run(variant))
    }

    fn download(&self, stream: RawStream, _variant: Variant) -> Result<(), NativeError> {
        self.call();
        let sim = self.stream(stream)?;
        let fail = self.take_fault(SimStage::Download);
        sim.send(SimCmd::Download { fail })
    }

    fn synchronize(&self, stream: RawStream) -> Result<(), NativeError> {
        self.call();
        let sim = self.stream(stream)?;
        let (ack_tx, ack_rx) = channel::bounded(1);
        sim.send(SimCmd::Fence(ack_tx))?;
        match ack_rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(NativeError(err)),
            Err(_) => Err(NativeError::new("stream worker terminated")),
        }
    }

    fn read_outputs(
        &self,
        stream: RawStream,
        _variant: Variant,
        dst: &mut [u8],
    ) -> Result<(), NativeError> {
        self.call();
        let sim = self.stream(stream)?;
        let mem = lock(&sim.mem);
        if dst.len() > mem.host_out.len() {
            return Err(NativeError::new(format!(
                "{} B requested but only {} B were downloaded",
                dst.len(),
                mem.host_out.len()
            )));
        }
        dst.copy_from_slice(&mem.host_out[..dst.len()]);
        Ok(())
    }

    fn reset_device(&self) -> Result<(), NativeError> {
        self.call();
        match self.live_streams() {
            0 => Ok(()),
            n => Err(NativeError::new(format!("{n} streams still alive"))),
        }
    }
}
