//! Timeout-bounded inference.
//!
//! The adapter runs on a dedicated thread. The capture loop hands a frame over and waits at
//! most `timeout` for the result. A frame that times out is abandoned: its late result is
//! discarded. At most one frame waits behind a busy model; further frames are refused
//! immediately instead of queueing up.

use anyhow::{anyhow, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::detect::backend::InferenceAdapter;
use crate::detect::result::Detection;
use crate::error::SentinelError;
use crate::frame::Frame;

type InferenceResult = (u64, Result<Vec<Detection>>);

pub struct InferenceWorker {
    adapter_name: &'static str,
    requests: Option<SyncSender<(u64, Frame)>>,
    results: Receiver<InferenceResult>,
    next_seq: u64,
    timeout: Duration,
    join: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    pub fn spawn(mut adapter: Box<dyn InferenceAdapter>, timeout: Duration) -> Result<Self> {
        let adapter_name = adapter.name();
        let (request_tx, request_rx) = mpsc::sync_channel::<(u64, Frame)>(1);
        let (result_tx, result_rx) = mpsc::channel::<InferenceResult>();

        let join = std::thread::Builder::new()
            .name(format!("inference-{}", adapter_name))
            .spawn(move || {
                if let Err(err) = adapter.warm_up() {
                    log::warn!("inference adapter warm-up failed: {:#}", err);
                }
                while let Ok((seq, frame)) = request_rx.recv() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| adapter.infer(&frame)))
                        .unwrap_or_else(|_| Err(anyhow!("inference adapter panicked")));
                    drop(frame);
                    if result_tx.send((seq, outcome)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            adapter_name,
            requests: Some(request_tx),
            results: result_rx,
            next_seq: 0,
            timeout,
            join: Some(join),
        })
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter_name
    }

    /// Runs inference on `frame`, consuming it.
    ///
    /// Returns `InferenceDegraded` on timeout, adapter failure, or when the worker is still
    /// busy with an earlier frame that timed out.
    pub fn infer(&mut self, frame: Frame) -> Result<Vec<Detection>, SentinelError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| SentinelError::InferenceDegraded("inference worker stopped".into()))?;

        // Drop results of frames that already timed out so the channel stays bounded.
        while self.results.try_recv().is_ok() {}

        match requests.try_send((seq, frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(SentinelError::InferenceDegraded(
                    "inference still busy with a timed-out frame".into(),
                ))
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(SentinelError::InferenceDegraded(
                    "inference worker exited".into(),
                ))
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results.recv_timeout(remaining) {
                Ok((done, result)) if done == seq => {
                    return result
                        .map_err(|err| SentinelError::InferenceDegraded(format!("{:#}", err)))
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SentinelError::InferenceDegraded(format!(
                        "inference exceeded {}ms",
                        self.timeout.as_millis()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SentinelError::InferenceDegraded(
                        "inference worker exited".into(),
                    ))
                }
            }
        }
    }

    /// Stops the worker, waiting up to `grace` for an in-progress inference to finish.
    pub fn shutdown(mut self, grace: Duration) {
        self.requests = None;
        let Some(join) = self.join.take() else {
            return;
        };
        crate::join_with_grace(join, grace, "inference worker");
    }
}
