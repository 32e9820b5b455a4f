//!
//! Batch pipeline
//!
//! A batch goes through Uploading -> Queued -> Executing -> Downloading -> Delivered on a single
//! stream. Validation and enqueueing happen synchronously in [`submit`], completion is awaited
//! by a dedicated waiter thread that publishes a single value on the returned [`Delivery`].
//!
//! Values cross the API big-endian. In the device arena every word is little-endian and
//! zero-filled up to the variant width.
use crate::env::{Kernel, Variant};
use crate::error::{GpuMathsError, NativeError, Result};
use crate::pool::{Stream, StreamPool};
use crate::sizing::{self, ArenaLayout};
use crossbeam::channel;
use num_bigint::BigUint;
use rayon::prelude::*;
use std::ops::Range;
use std::time::Duration;

pub mod elgamal;
pub mod exp;

pub use elgamal::{elgamal, elgamal_chunk, ElGamalInput, ElGamalInputSlot, ElGamalOutputSlot};
pub use exp::{exp, exp_chunk, ExpInput, ExpInputSlot, ExpOutputSlot};

/// Serialize big-endian values into consecutive little-endian words
pub struct SlotWriter<'a> {
    width: usize,
    buf: &'a mut [u8],
    next: usize,
}

impl<'a> SlotWriter<'a> {
    fn new(width: usize, buf: &'a mut [u8]) -> Self {
        Self {
            width,
            buf,
            next: 0,
        }
    }

    /// Store `be_bytes` in the next word
    /// Leading zeros are ignored, anything else beyond the word width is rejected
    pub fn put(&mut self, field: &'static str, be_bytes: &[u8]) -> Result<()> {
        let first = be_bytes
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(be_bytes.len());
        let value = &be_bytes[first..];
        if value.len() > self.width {
            return Err(GpuMathsError::InputTooWide {
                field,
                len: value.len(),
                width: self.width,
            });
        }

        let start = self.next * self.width;
        let word = self
            .buf
            .get_mut(start..start + self.width)
            .ok_or_else(|| {
                GpuMathsError::BatchShape(format!("no room left for `{field}` in the slot"))
            })?;
        word.iter_mut()
            .zip(value.iter().rev())
            .for_each(|(dst, src)| *dst = *src);
        word[value.len()..].fill(0);
        self.next += 1;
        Ok(())
    }

    pub fn put_biguint(&mut self, field: &'static str, value: &BigUint) -> Result<()> {
        self.put(field, &value.to_bytes_be())
    }
}

/// Read back consecutive little-endian words
pub struct SlotReader<'a> {
    width: usize,
    buf: &'a [u8],
    next: usize,
}

impl<'a> SlotReader<'a> {
    fn new(width: usize, buf: &'a [u8]) -> Self {
        Self {
            width,
            buf,
            next: 0,
        }
    }

    fn word(&mut self) -> &'a [u8] {
        let start = self.next * self.width;
        self.next += 1;
        &self.buf[start..start + self.width]
    }

    /// Next word, big-endian at full width
    pub fn take(&mut self) -> Vec<u8> {
        self.word().iter().rev().copied().collect()
    }

    pub fn take_biguint(&mut self) -> BigUint {
        BigUint::from_bytes_le(self.word())
    }
}

/// Batch of items sharing one kernel and one constants region
pub trait BatchInput: Sync {
    const KERNEL: Kernel;
    type Output: Send + 'static;

    fn num_slots(&self) -> usize;

    /// Write the constants words, in the kernel order
    fn write_constants(&self, w: &mut SlotWriter<'_>) -> Result<()>;

    /// Write the input words of item `index`, in the kernel order
    fn write_slot(&self, index: usize, w: &mut SlotWriter<'_>) -> Result<()>;

    /// Decode one output slot
    fn read_slot(r: &mut SlotReader<'_>) -> Self::Output;
}

/// Outcome of one batch
///
/// On failure `outputs` is empty and `err` holds the batch error. Either way the stream the batch
/// ran on is carried along and goes back to the pool once this is dropped or split with
/// [`BatchResult::into_parts`].
#[derive(Debug)]
pub struct BatchResult<T> {
    pub outputs: Vec<T>,
    pub err: Option<GpuMathsError>,
    stream: Stream,
}

impl<T> BatchResult<T> {
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn into_parts(self) -> (Result<Vec<T>>, Stream) {
        let outputs = match self.err {
            Some(err) => Err(err),
            None => Ok(self.outputs),
        };
        (outputs, self.stream)
    }

    /// Release the stream and keep the outputs
    pub fn into_outputs(self) -> Result<Vec<T>> {
        let (outputs, stream) = self.into_parts();
        drop(stream);
        outputs
    }
}

/// One-shot handle on the value published by a batch waiter
#[derive(Debug)]
pub struct Delivery<R> {
    rx: channel::Receiver<R>,
}

impl<R> Delivery<R> {
    fn ready(value: R) -> Self {
        let (tx, rx) = channel::bounded(1);
        // Receiver is alive and the channel has room
        let _ = tx.send(value);
        Self { rx }
    }

    /// Block until the batch is delivered
    pub fn wait(self) -> Result<R> {
        self.rx.recv().map_err(|_| GpuMathsError::DeliveryLost)
    }

    /// Ok(None) if nothing was delivered within `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<R>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(channel::RecvTimeoutError::Disconnected) => Err(GpuMathsError::DeliveryLost),
        }
    }

    pub fn try_wait(&self) -> Result<Option<R>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(channel::TryRecvError::Empty) => Ok(None),
            Err(channel::TryRecvError::Disconnected) => Err(GpuMathsError::DeliveryLost),
        }
    }

    /// Underlying channel, for use with `crossbeam::select!`
    pub fn receiver(&self) -> &channel::Receiver<R> {
        &self.rx
    }
}

fn stage<T: BatchInput>(input: &T, variant: Variant, layout: &ArenaLayout) -> Result<Vec<u8>> {
    let width = variant.byte_len();
    let mut staged = vec![0u8; layout.staged_len()];
    let (constants, slots) = staged.split_at_mut(layout.constants.end);

    input.write_constants(&mut SlotWriter::new(width, constants))?;
    slots
        .par_chunks_exact_mut(variant.input_size(T::KERNEL))
        .enumerate()
        .try_for_each(|(i, slot)| input.write_slot(i, &mut SlotWriter::new(width, slot)))?;
    Ok(staged)
}

fn decode<T: BatchInput>(variant: Variant, outputs: &[u8]) -> Vec<T::Output> {
    let width = variant.byte_len();
    outputs
        .par_chunks_exact(variant.output_size(T::KERNEL))
        .map(|slot| T::read_slot(&mut SlotReader::new(width, slot)))
        .collect()
}

fn launch<T, R, F>(input: &T, variant: Variant, stream: Stream, finish: F) -> Result<Delivery<R>>
where
    T: BatchInput,
    R: Send + 'static,
    F: FnOnce(BatchResult<T::Output>) -> R + Send + 'static,
{
    let kernel = T::KERNEL;
    let num_slots = input.num_slots();
    if num_slots == 0 {
        return Ok(Delivery::ready(finish(BatchResult {
            outputs: Vec::new(),
            err: None,
            stream,
        })));
    }

    let layout = ArenaLayout::new(variant, kernel, num_slots);
    if layout.total_len() > stream.capacity() {
        return Err(GpuMathsError::Sizing {
            items: num_slots,
            required: layout.total_len(),
            capacity: stream.capacity(),
        });
    }
    let staged = stage(input, variant, &layout)?;

    let backend = stream.backend().clone();
    let raw = stream.raw();
    tracing::trace!(
        "{kernel} {variant}: enqueue {num_slots} slots on stream {}",
        raw.token()
    );
    // Later steps aren't enqueued once one fails
    let enqueued = backend
        .put(raw, variant, kernel, num_slots, &staged)
        .and_then(|_| backend.run(raw, variant))
        .and_then(|_| backend.download(raw, variant));
    drop(staged);

    let (tx, rx) = channel::bounded(1);
    std::thread::Builder::new()
        .name(format!("gpumaths-waiter-{}", raw.token()))
        .spawn(move || {
            // Always drain the stream before handing it back
            let synced = backend.synchronize(raw);
            let fetched = enqueued.and(synced).and_then(|_| {
                let mut bytes = vec![0u8; layout.outputs.len()];
                backend.read_outputs(raw, variant, &mut bytes)?;
                Ok::<_, NativeError>(bytes)
            });
            let result = match fetched {
                Ok(bytes) => BatchResult {
                    outputs: decode::<T>(variant, &bytes),
                    err: None,
                    stream,
                },
                Err(err) => {
                    tracing::debug!("{kernel} {variant}: batch of {num_slots} failed: {err}");
                    BatchResult {
                        outputs: Vec::new(),
                        err: Some(GpuMathsError::operation(err)),
                        stream,
                    }
                }
            };
            // Submitter may have given up on the delivery
            let _ = tx.send(finish(result));
        })
        .map_err(|err| GpuMathsError::Resource(format!("couldn't spawn batch waiter: {err}")))?;

    Ok(Delivery { rx })
}

/// Run `input` on `stream`
///
/// Sizing and input errors are reported synchronously, before any native call, and the stream
/// goes back to the pool. Accelerator failures are reported through the delivered
/// [`BatchResult`], which also hands the stream back to the caller.
pub fn submit<T: BatchInput>(
    input: &T,
    variant: Variant,
    stream: Stream,
) -> Result<Delivery<BatchResult<T::Output>>> {
    launch(input, variant, stream, |result| result)
}

/// Fire-and-release flavor of [`submit`]
///
/// The waiter returns the stream to its pool before publishing the outputs.
pub fn submit_and_release<T: BatchInput>(
    input: &T,
    variant: Variant,
    stream: Stream,
) -> Result<Delivery<Result<Vec<T::Output>>>> {
    launch(input, variant, stream, BatchResult::into_outputs)
}

/// Split `len` items into batches sized for the pool streams, run them concurrently and
/// concatenate the outputs in order
pub(crate) fn run_chunked<T, F>(
    pool: &StreamPool,
    variant: Variant,
    len: usize,
    build: F,
) -> Result<Vec<T::Output>>
where
    T: BatchInput,
    F: Fn(Range<usize>) -> Result<T>,
{
    let chunk = pool.max_slots(variant, T::KERNEL);
    if chunk == 0 {
        return Err(GpuMathsError::Sizing {
            items: len,
            required: sizing::required_memory(variant, T::KERNEL, 1),
            capacity: pool.memory_per_stream(),
        });
    }

    let mut deliveries = Vec::with_capacity((len + chunk - 1) / chunk);
    for start in (0..len).step_by(chunk) {
        let input = build(start..len.min(start + chunk))?;
        // Blocks until a waiter of an earlier chunk gives its stream back
        let stream = pool.acquire()?;
        deliveries.push(submit_and_release(&input, variant, stream)?);
    }

    let mut outputs = Vec::with_capacity(len);
    let mut first_err = None;
    for delivery in deliveries {
        match delivery.wait().and_then(|r| r) {
            Ok(chunk) => outputs.extend(chunk),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    first_err.map_or(Ok(outputs), Err)
}

/// Check that the parallel buffers of a chunked call share `len`
pub(crate) fn check_lengths(len: usize, buffers: &[(&'static str, usize)]) -> Result<()> {
    match buffers.iter().find(|(_, l)| *l != len) {
        Some((name, l)) => Err(GpuMathsError::BatchShape(format!(
            "`{name}` holds {l} items, expected {len}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimStage};
    use std::sync::Arc;

    const P: u64 = 1_000_000_007;

    fn be(v: u64) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    fn exp_input(n: u64) -> ExpInput {
        ExpInput {
            slots: (0..n)
                .map(|i| ExpInputSlot {
                    base: be(i + 2),
                    exponent: be(i + 1),
                })
                .collect(),
            prime: be(P),
        }
    }

    fn sim_pool(streams: usize, slots: usize) -> (SimBackend, StreamPool) {
        let sim = SimBackend::default();
        let mem = sizing::required_memory(Variant::W2048, Kernel::PowmOdd, slots);
        let pool = StreamPool::open(Arc::new(sim.clone()), streams, mem).unwrap();
        (sim, pool)
    }

    #[test]
    fn writer_reverses_and_pads() {
        let mut buf = vec![0xaau8; 8];
        let mut w = SlotWriter::new(4, &mut buf);
        w.put("a", &[0x01, 0x02]).unwrap();
        w.put("b", &[0x00, 0x00, 0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(buf, [0x02, 0x01, 0, 0, 0x04, 0x03, 0x02, 0x01]);

        let mut r = SlotReader::new(4, &buf);
        assert_eq!(r.take(), [0, 0, 0x01, 0x02]);
        assert_eq!(r.take_biguint(), BigUint::from(0x01020304u32));
    }

    #[test]
    fn writer_rejects_wide_values() {
        let mut buf = vec![0u8; 8];
        let mut w = SlotWriter::new(4, &mut buf);
        assert_eq!(
            w.put("x", &[1, 2, 3, 4, 5]),
            Err(GpuMathsError::InputTooWide {
                field: "x",
                len: 5,
                width: 4
            })
        );
        w.put("a", &[1]).unwrap();
        w.put("b", &[1]).unwrap();
        assert!(matches!(w.put("c", &[1]), Err(GpuMathsError::BatchShape(_))));
    }

    #[test]
    fn outputs_keep_submission_order() {
        let (_sim, pool) = sim_pool(1, 32);
        let input = exp_input(32);
        let result = submit(&input, Variant::W2048, pool.acquire().unwrap())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(result.err, None);
        assert_eq!(result.outputs.len(), 32);
        for (i, out) in result.outputs.iter().enumerate() {
            let i = i as u64;
            let expected = BigUint::from(i + 2).modpow(&BigUint::from(i + 1), &BigUint::from(P));
            assert_eq!(out.result.len(), Variant::W2048.byte_len());
            assert_eq!(BigUint::from_bytes_be(&out.result), expected);
        }
        assert_eq!(pool.available(), 0);
        drop(result);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn oversized_batch_makes_no_native_call() {
        let (sim, pool) = sim_pool(1, 8);
        let calls = sim.native_calls();
        let err = submit(&exp_input(9), Variant::W2048, pool.acquire().unwrap()).unwrap_err();
        assert_eq!(
            err,
            GpuMathsError::Sizing {
                items: 9,
                required: sizing::required_memory(Variant::W2048, Kernel::PowmOdd, 9),
                capacity: pool.memory_per_stream(),
            }
        );
        assert_eq!(sim.native_calls(), calls);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn too_wide_input_makes_no_native_call() {
        let (sim, pool) = sim_pool(1, 8);
        let calls = sim.native_calls();
        let mut input = exp_input(4);
        input.slots[2].exponent = vec![0xff; Variant::W2048.byte_len() + 1];
        let err = submit(&input, Variant::W2048, pool.acquire().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            GpuMathsError::InputTooWide {
                field: "exponent",
                ..
            }
        ));
        assert_eq!(sim.native_calls(), calls);
    }

    #[test]
    fn empty_batch_is_delivered_at_once() {
        let (sim, pool) = sim_pool(1, 8);
        let calls = sim.native_calls();
        let delivery = submit(&exp_input(0), Variant::W2048, pool.acquire().unwrap()).unwrap();
        let result = delivery.try_wait().unwrap().unwrap();
        assert!(result.outputs.is_empty());
        assert_eq!(result.err, None);
        assert_eq!(sim.native_calls(), calls);
    }

    #[test]
    fn download_failure_yields_no_outputs() {
        let (sim, pool) = sim_pool(1, 8);
        sim.inject_failure(SimStage::Download);
        let result = submit(&exp_input(8), Variant::W2048, pool.acquire().unwrap())
            .unwrap()
            .wait()
            .unwrap();
        assert!(result.outputs.is_empty());
        assert_eq!(
            result.err,
            Some(GpuMathsError::Operation(
                "simulated download failure".to_string()
            ))
        );

        // Stream is clean for the next batch
        let (outputs, stream) = result.into_parts();
        assert!(outputs.is_err());
        let outputs = submit(&exp_input(8), Variant::W2048, stream)
            .unwrap()
            .wait()
            .unwrap()
            .into_outputs()
            .unwrap();
        assert_eq!(outputs.len(), 8);
    }

    #[test]
    fn enqueue_failures_are_delivered() {
        for (stage, msg) in [
            (SimStage::Upload, "simulated upload failure"),
            (SimStage::Run, "simulated kernel launch failure"),
        ] {
            let (sim, pool) = sim_pool(1, 8);
            sim.inject_failure(stage);
            let result = submit(&exp_input(8), Variant::W2048, pool.acquire().unwrap())
                .unwrap()
                .wait()
                .unwrap();
            assert!(result.outputs.is_empty());
            assert_eq!(result.err, Some(GpuMathsError::Operation(msg.to_string())));
            drop(result);
            pool.close().unwrap();
            assert_eq!(sim.live_streams(), 0);
        }
    }

    #[test]
    fn fire_and_release_returns_stream_first() {
        let (_sim, pool) = sim_pool(1, 8);
        let delivery =
            submit_and_release(&exp_input(8), Variant::W2048, pool.acquire().unwrap()).unwrap();
        let outputs = delivery.wait().unwrap().unwrap();
        assert_eq!(outputs.len(), 8);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn delivery_can_be_polled() {
        let sim = SimBackend::new(crate::backend::sim::SimConfig {
            kernel_latency_us: 200_000,
            ..Default::default()
        });
        let mem = sizing::required_memory(Variant::W2048, Kernel::PowmOdd, 4);
        let pool = StreamPool::open(Arc::new(sim), 1, mem).unwrap();
        let delivery = submit(&exp_input(4), Variant::W2048, pool.acquire().unwrap()).unwrap();
        assert!(delivery.try_wait().unwrap().is_none());

        let result = crossbeam::select! {
            recv(delivery.receiver()) -> r => r.unwrap(),
            default(Duration::from_secs(10)) => panic!("batch never delivered"),
        };
        assert_eq!(result.outputs.len(), 4);
        // Waiter is gone once it has published
        assert!(matches!(
            delivery.wait_timeout(Duration::from_secs(10)),
            Err(GpuMathsError::DeliveryLost)
        ));
    }

    #[test]
    fn shape_check() {
        assert!(check_lengths(3, &[("a", 3), ("b", 3)]).is_ok());
        assert_eq!(
            check_lengths(3, &[("a", 3), ("b", 2)]),
            Err(GpuMathsError::BatchShape(
                "`b` holds 2 items, expected 3".to_string()
            ))
        );
    }
}
