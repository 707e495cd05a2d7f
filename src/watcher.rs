//! The phase watcher: a single-shot primitive that drains a pod's event
//! stream until a target phase predicate fires, is cancelled, or the
//! upstream stream closes early.
//!
//! The drain runs on its own spawned task and reports exactly one outcome
//! back over a channel, so a caller's `select!` against a timeout races a
//! real concurrent task rather than blocking the calling task directly on
//! the event stream.

use crate::api::{ClusterApi, PodEvent};
use crate::errors::{CheckerError, Result};
use crate::pod::{Phase, PodExt};
use std::sync::Arc;
use tokio::sync::oneshot;

/// The one-shot outcome of a phase watch.
#[derive(Debug)]
pub enum Outcome {
    /// The target predicate fired; here is the pod that satisfied it.
    Reached(Box<k8s_openapi::api::core::v1::Pod>),
    /// The cancellation signal fired before the predicate did.
    Aborted,
    /// The upstream stream ended before the predicate fired and before
    /// cancellation.
    PrematureClose,
}

/// A handle to a running phase watch. Dropping it does not cancel the
/// watch; call [`PhaseWatch::cancel`] explicitly, or await
/// [`PhaseWatch::outcome`] to let it run to completion.
pub struct PhaseWatch {
    cancel: Option<oneshot::Sender<()>>,
    outcome: oneshot::Receiver<Outcome>,
}

impl PhaseWatch {
    /// Opens a watch on `selector` and spawns a task that drains it until
    /// `target` is satisfied by some pod's phase, cancellation fires, or
    /// the stream ends.
    ///
    /// `run_id` is re-checked against every observed pod's run-id label
    /// even though `selector` already constrains the watch to it: the
    /// label is the one piece of identity that must never be trusted on
    /// selector alone, since a future caller could pass an unscoped
    /// selector by mistake.
    pub async fn spawn<A, F>(
        api: Arc<A>,
        selector: String,
        run_id: String,
        target: F,
    ) -> Result<PhaseWatch>
    where
        A: ClusterApi + 'static,
        F: Fn(Phase) -> bool + Send + 'static,
    {
        let mut events = api.watch(&selector).await?;
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        tokio::spawn(async move {
            use futures_util::StreamExt;
            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break Outcome::Aborted,
                    next = events.next() => {
                        let event = match next {
                            Some(Ok(event)) => event,
                            Some(Err(_)) => continue,
                            None => break Outcome::PrematureClose,
                        };
                        let pod = match event {
                            PodEvent::Added(pod) | PodEvent::Modified(pod) => pod,
                            PodEvent::Deleted(_) => continue,
                        };
                        if pod.run_id_label() != Some(run_id.as_str()) {
                            log::error!(
                                "watch for selector {:?} observed pod {:?} carrying run-id {:?}, expected {:?}",
                                selector,
                                pod.metadata.name,
                                pod.run_id_label(),
                                run_id
                            );
                            continue;
                        }
                        if target(pod.phase()) {
                            break Outcome::Reached(Box::new(pod));
                        }
                    }
                }
            };
            let _ = outcome_tx.send(outcome);
        });

        Ok(PhaseWatch {
            cancel: Some(cancel_tx),
            outcome: outcome_rx,
        })
    }

    /// Signals the drain task to stop watching and report `Aborted`. A
    /// no-op if the outcome has already been received or the task has
    /// already finished on its own.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Awaits the watch's one terminal outcome.
    pub async fn outcome(self) -> Outcome {
        self.outcome.await.unwrap_or(Outcome::Aborted)
    }

    /// Splits the watch into its cancellation sender and outcome receiver
    /// so a caller can race the receiver against a timer in its own
    /// `select!` without the double-mutable-borrow that calling
    /// `cancel()`/`outcome()` on the same `&mut PhaseWatch` inside two
    /// branches of one `select!` would require.
    pub(crate) fn into_parts(self) -> (Option<oneshot::Sender<()>>, oneshot::Receiver<Outcome>) {
        (self.cancel, self.outcome)
    }
}

/// Returns true for pods that have started (or failed to start, which is
/// treated as having crossed the starting line for state-machine purposes)
/// — the predicate driving `AwaitRunning`.
pub fn running_or_terminal(phase: Phase) -> bool {
    phase.is_running_or_terminal()
}

/// Returns true for pods that have reached a terminal phase — the
/// predicate driving `AwaitTerminal`.
pub fn terminal(phase: Phase) -> bool {
    phase.is_terminal()
}

/// Converts a watch [`Outcome`] into the engine's result type, given the
/// errors to raise for the non-success cases.
pub fn into_result(
    outcome: Outcome,
    on_aborted: CheckerError,
    on_premature_close: CheckerError,
) -> Result<k8s_openapi::api::core::v1::Pod> {
    match outcome {
        Outcome::Reached(pod) => Ok(*pod),
        Outcome::Aborted => Err(on_aborted),
        Outcome::PrematureClose => Err(on_premature_close),
    }
}
