//! Sentence-level parallelism.
//!
//! A request with one sentence runs inline on the calling thread and streams
//! straight into the caller's sink. Longer requests fan out one job per
//! sentence across a fixed [`WorkerPool`]; each job records its flushes, and
//! the caller joins on a result channel, replaying recorded audio into its
//! sink strictly in sentence order.
//!
//! Callers must not be worker threads themselves: a fan-out from inside the
//! pool could wait on jobs queued behind it.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_channel::{unbounded, Sender};

use crate::{
    cancel::CancellationToken,
    error::{Result, SynthesisError},
    phonemes::Sentence,
    sentence::{SentenceSynthesizer, SynthesisParams},
    sink::{AudioSink, PcmWriter, RecordingSink},
    stats::SynthesisResult,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed set of named threads, each draining its own job queue.
pub struct WorkerPool {
    queues: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(SynthesisError::Configuration("worker pool needs at least one thread".into()));
        }
        let mut queues = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let (tx, rx) = unbounded::<Job>();
            let handle = std::thread::Builder::new()
                .name(format!("synth-worker-{i}"))
                .spawn(move || {
                    for job in rx {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            tracing::error!(worker = i, "job panicked: {}", panic_message(&*payload));
                        }
                    }
                })
                .map_err(|e| SynthesisError::ResourceInit(format!("failed to spawn worker {i}: {e}")))?;
            queues.push(tx);
            handles.push(handle);
        }
        tracing::debug!(threads, "worker pool started");
        Ok(Self {
            queues,
            handles,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Queue `job` on the next worker, round-robin.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[worker]
            .send(Box::new(job))
            .map_err(|_| SynthesisError::WorkerPool(format!("worker {worker} has exited")))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queues ends each worker loop once its backlog drains.
        self.queues.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }
}

type SentenceOutput = (RecordingSink, SynthesisResult);

pub struct ParallelSynthesisScheduler {
    synthesizer: Arc<SentenceSynthesizer>,
    workers: WorkerPool,
}

impl ParallelSynthesisScheduler {
    pub fn new(synthesizer: Arc<SentenceSynthesizer>, threads: usize) -> Result<Self> {
        Ok(Self {
            synthesizer,
            workers: WorkerPool::new(threads)?,
        })
    }

    pub fn synthesizer(&self) -> &SentenceSynthesizer {
        &self.synthesizer
    }

    pub fn width(&self) -> usize {
        self.workers.size()
    }

    /// Synthesize `sentences` in parallel, delivering audio to `sink` in
    /// input order. Returns the aggregated stats, or the first error any
    /// sentence raised.
    pub fn run(
        &self,
        sentences: Vec<Sentence>,
        params: SynthesisParams,
        sink: &mut dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<SynthesisResult> {
        match sentences.len() {
            0 => Ok(SynthesisResult::default()),
            1 => {
                let mut out = PcmWriter::streaming(sink);
                let mut result = self.synthesizer.synthesize(&sentences[0], &params, &mut out, cancel)?;
                out.flush();
                result.finalize();
                Ok(result)
            }
            _ => self.fan_out(sentences, params, sink, cancel),
        }
    }

    fn fan_out(
        &self,
        sentences: Vec<Sentence>,
        params: SynthesisParams,
        sink: &mut dyn AudioSink,
        cancel: &CancellationToken,
    ) -> Result<SynthesisResult> {
        let total = sentences.len();
        let batch = cancel.child();
        let (tx, rx) = unbounded::<(usize, Result<SentenceOutput>)>();
        let mut first_error: Option<SynthesisError> = None;
        let mut dispatched = 0usize;

        for (index, sentence) in sentences.into_iter().enumerate() {
            let (tx, synth, job_batch) = (tx.clone(), self.synthesizer.clone(), batch.clone());
            let job = move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<SentenceOutput> {
                    let mut recording = RecordingSink::new();
                    let result = {
                        let mut out = PcmWriter::streaming(&mut recording);
                        let result = synth.synthesize(&sentence, &params, &mut out, &job_batch)?;
                        out.flush();
                        result
                    };
                    Ok((recording, result))
                }))
                .unwrap_or_else(|payload| {
                    Err(SynthesisError::WorkerPool(format!(
                        "sentence {index} panicked: {}",
                        panic_message(&*payload)
                    )))
                });
                // The receiver only goes away once the join is over.
                let _ = tx.send((index, outcome));
            };
            if let Err(e) = self.workers.execute(job) {
                batch.cancel();
                first_error = Some(e);
                break;
            }
            dispatched += 1;
        }
        drop(tx);

        let mut slots: Vec<Option<SentenceOutput>> = (0..total).map(|_| None).collect();
        let mut next = 0usize;
        let mut aggregate = SynthesisResult::default();
        let mut received = 0usize;

        for (index, outcome) in rx.iter().take(dispatched) {
            received += 1;
            match outcome {
                Ok(output) if first_error.is_none() => {
                    slots[index] = Some(output);
                    while let Some((recording, result)) = slots.get_mut(next).and_then(Option::take) {
                        recording.replay(sink);
                        aggregate += &result;
                        next += 1;
                    }
                }
                Ok(_) => {}
                Err(e) if first_error.is_none() => {
                    tracing::error!(sentence = index, error = %e, "sentence failed, cancelling the rest");
                    batch.cancel();
                    first_error = Some(e);
                }
                Err(e) => {
                    tracing::debug!(sentence = index, error = %e, "discarding later sentence error");
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if received < dispatched {
            return Err(SynthesisError::WorkerPool(format!(
                "only {received} of {dispatched} sentence jobs reported back"
            )));
        }
        aggregate.finalize();
        Ok(aggregate)
    }
}
