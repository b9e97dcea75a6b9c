//! Parallel downgrading of many independent class files.

use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DowngradeError;
use crate::pipeline::{Downgraded, Downgrader};

/// Cooperative stop signal shared between the caller and the workers.
///
/// Items that have not started when the token is cancelled come back as
/// [`BatchOutcome::Cancelled`]; items already running finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Downgraded(Downgraded),
    Failed(DowngradeError),
    Cancelled,
}

impl BatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, BatchOutcome::Failed(_))
    }
}

/// Downgrades every input on the current rayon pool. The result has one
/// outcome per input, in input order.
pub fn downgrade_all<B>(downgrader: &Downgrader, inputs: &[B], cancel: &CancelToken) -> Vec<BatchOutcome>
where
    B: AsRef<[u8]> + Sync,
{
    downgrade_all_with(downgrader, inputs, cancel, |_| {})
}

/// Like [`downgrade_all`], calling `on_done` from the worker as each
/// outcome becomes available.
pub fn downgrade_all_with<B, F>(downgrader: &Downgrader, inputs: &[B], cancel: &CancelToken, on_done: F) -> Vec<BatchOutcome>
where
    B: AsRef<[u8]> + Sync,
    F: Fn(&BatchOutcome) + Sync,
{
    inputs
        .par_iter()
        .map(|bytes| {
            let outcome = if cancel.is_cancelled() {
                BatchOutcome::Cancelled
            } else {
                match downgrader.downgrade(bytes.as_ref()) {
                    Ok(out) => BatchOutcome::Downgraded(out),
                    Err(err) => {
                        tracing::warn!(error = %err, "class failed");
                        BatchOutcome::Failed(err)
                    }
                }
            };
            on_done(&outcome);
            outcome
        })
        .collect()
}
