//! Timed background checkpoints.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use affect_core::ClassicalBridge;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::checkpoint::CheckpointManager;
use crate::error::{Result, StoreError};

/// Worker thread taking an automatic checkpoint every `interval`.
///
/// The engine lock is held for the whole save, so a snapshot never sees a
/// half-updated cache. Lock order is engine, then manager.
pub struct AutoCheckpointer {
    stop_tx: Option<Sender<()>>,
    done_rx: crossbeam_channel::Receiver<()>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
    taken: Arc<AtomicUsize>,
}

impl AutoCheckpointer {
    pub fn start(
        engine: Arc<Mutex<ClassicalBridge>>,
        manager: Arc<Mutex<CheckpointManager>>,
        interval: Duration,
        join_timeout: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let taken = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&taken);

        let handle = thread::Builder::new()
            .name("affect-auto-checkpoint".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let engine = engine.lock();
                            let mut manager = manager.lock();
                            match manager.create_checkpoint(&engine, None, "automatic checkpoint", true) {
                                Ok(cp) => {
                                    counter.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!("auto checkpoint {}", cp.id);
                                }
                                Err(e) => tracing::warn!("auto checkpoint failed: {e}"),
                            }
                        }
                        // stop signal or sender dropped
                        _ => break,
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| StoreError::Worker(format!("failed to spawn auto-checkpoint thread: {e}")))?;

        tracing::info!("auto-checkpoint every {}s", interval.as_secs_f64());
        Ok(Self {
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
            join_timeout,
            taken,
        })
    }

    /// Checkpoints written so far.
    pub fn taken(&self) -> usize {
        self.taken.load(Ordering::Relaxed)
    }

    /// Signal the worker and wait at most `join_timeout` for it.
    /// Returns `false` if the worker was still busy and had to be detached.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(stop_tx) = self.stop_tx.take() else {
            return true;
        };
        let _ = stop_tx.send(());
        match self.done_rx.recv_timeout(self.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "auto-checkpoint worker did not stop within {}ms; detaching",
                    self.join_timeout.as_millis()
                );
                self.handle.take();
                false
            }
            _ => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
        }
    }
}

impl Drop for AutoCheckpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
