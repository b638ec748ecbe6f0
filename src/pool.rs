//! Generic bounded-concurrency worker pool.
//!
//! `max` workers drain a shared input channel, apply the pool function and
//! fan results into an output channel, failures into an error channel.
//! Closing the input side is the graceful shutdown signal: queued items
//! are drained, then the workers exit and both downstream channels close.
//! Cancellation preempts new dequeues but lets in-flight work finish.
//! Output ordering is unspecified.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Receiving ends handed to the pool's consumer.
pub struct PoolHandles<O, E> {
    pub output: mpsc::Receiver<O>,
    pub errors: mpsc::Receiver<E>,
    /// Resolves once every worker has exited.
    pub done: JoinHandle<()>,
}

/// A named map(input) → output-or-error pool.
#[derive(Clone)]
pub struct WorkerPool<F> {
    name: &'static str,
    func: F,
}

impl<F> WorkerPool<F> {
    pub fn new(name: &'static str, func: F) -> Self {
        Self { name, func }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Launch `max` workers over `input` with capacity-1 (rendezvous-like)
    /// downstream channels: producers block until the consumer keeps up.
    pub fn run<I, O, E, Fut>(
        &self,
        cancel: CancellationToken,
        max: usize,
        input: mpsc::Receiver<I>,
    ) -> PoolHandles<O, E>
    where
        F: Fn(I) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send,
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
    {
        self.run_buffered(cancel, max, input, 1)
    }

    /// Same as [`run`](Self::run) with explicit downstream buffering.
    pub fn run_buffered<I, O, E, Fut>(
        &self,
        cancel: CancellationToken,
        max: usize,
        input: mpsc::Receiver<I>,
        buffer: usize,
    ) -> PoolHandles<O, E>
    where
        F: Fn(I) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send,
        I: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
    {
        let (output_tx, output_rx) = mpsc::channel(buffer.max(1));
        let (error_tx, error_rx) = mpsc::channel(buffer.max(1));
        let input = Arc::new(Mutex::new(input));
        let name = self.name;

        let mut workers = JoinSet::new();
        for worker in 0..max.max(1) {
            let input = Arc::clone(&input);
            let output_tx = output_tx.clone();
            let error_tx = error_tx.clone();
            let func = self.func.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    let item = {
                        let mut rx = input.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = item else { break };
                    match func(item).await {
                        Ok(out) => {
                            if output_tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            if error_tx.send(err).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!(pool = name, worker, "worker exited");
            });
        }
        drop(output_tx);
        drop(error_tx);

        let done = tokio::spawn(async move {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!(pool = name, error = %e, "worker panicked");
                }
            }
            debug!(pool = name, "pool drained");
        });

        PoolHandles {
            output: output_rx,
            errors: error_rx,
            done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_maps_all_inputs() {
        let pool = WorkerPool::new("double", |n: u32| async move { Ok::<_, String>(n * 2) });
        let (tx, rx) = mpsc::channel(4);
        let mut handles = pool.run(CancellationToken::new(), 3, rx);

        tokio::spawn(async move {
            for n in 1..=10u32 {
                tx.send(n).await.unwrap();
            }
            // sender drops here, closing the pool input
        });

        let mut out = Vec::new();
        while let Some(v) = handles.output.recv().await {
            out.push(v);
        }
        out.sort_unstable();
        assert_eq!(out, (1..=10).map(|n| n * 2).collect::<Vec<_>>());
        handles.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_fan_into_error_channel() {
        let pool = WorkerPool::new("odd-only", |n: u32| async move {
            if n % 2 == 0 {
                Err(format!("even {n}"))
            } else {
                Ok(n)
            }
        });
        let (tx, rx) = mpsc::channel(4);
        let mut handles = pool.run(CancellationToken::new(), 2, rx);

        tokio::spawn(async move {
            for n in 1..=6u32 {
                tx.send(n).await.unwrap();
            }
        });

        let mut oks = Vec::new();
        let mut errs = Vec::new();
        loop {
            tokio::select! {
                v = handles.output.recv() => match v {
                    Some(v) => oks.push(v),
                    None => break,
                },
                e = handles.errors.recv() => if let Some(e) = e {
                    errs.push(e);
                },
            }
        }
        while let Some(e) = handles.errors.recv().await {
            errs.push(e);
        }
        oks.sort_unstable();
        assert_eq!(oks, vec![1, 3, 5]);
        assert_eq!(errs.len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_ends_idle_pool() {
        let pool = WorkerPool::new("idle", |n: u32| async move { Ok::<_, String>(n) });
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let cancel = CancellationToken::new();
        let handles: PoolHandles<u32, String> = pool.run(cancel.clone(), 2, rx);

        // input stays open; cancellation alone must stop the workers
        cancel.cancel();
        handles.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_input_close_drains_queued_items() {
        let pool = WorkerPool::new("drain", |n: u32| async move { Ok::<_, String>(n) });
        let (tx, rx) = mpsc::channel(8);
        for n in 0..8u32 {
            tx.send(n).await.unwrap();
        }
        drop(tx);

        let mut handles = pool.run(CancellationToken::new(), 1, rx);
        let mut seen = 0;
        while handles.output.recv().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 8);
    }
}
