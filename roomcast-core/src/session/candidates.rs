//! Remote candidates that arrived before a remote description

use std::time::Duration;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio_util::sync::CancellationToken;

use super::SessionInput;
use crate::signaling::IceCandidate;

#[derive(Debug)]
struct Pending {
    candidate: IceCandidate,
    attempts: u32,
}

/// Retry queue with a single cancellable timer
#[derive(Debug, Default)]
pub(super) struct PendingCandidates {
    queue: Vec<Pending>,
    timer: Option<CancellationToken>,
}

impl PendingCandidates {
    pub(super) fn push(&mut self, candidate: IceCandidate) {
        self.queue.push(Pending {
            candidate,
            attempts: 0,
        });
    }

    pub(super) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }

    /// Schedule a `RetryCandidates` input unless one is already pending
    pub(super) fn arm(&mut self, interval: Duration, notify: WeakUnboundedSender<SessionInput>) {
        if self.timer.is_some() || self.queue.is_empty() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(interval) => {
                    if let Some(tx) = notify.upgrade() {
                        let _ = tx.send(SessionInput::RetryCandidates);
                    }
                }
            }
        });
        self.timer = Some(token);
    }

    /// The scheduled retry has been delivered
    pub(super) fn timer_fired(&mut self) {
        self.timer = None;
    }

    /// Count one failed attempt for every queued candidate, returning the
    /// ones that reached `max_attempts`
    pub(super) fn age(&mut self, max_attempts: u32) -> Vec<IceCandidate> {
        let mut exhausted = Vec::new();
        self.queue.retain_mut(|pending| {
            pending.attempts += 1;
            if pending.attempts >= max_attempts {
                exhausted.push(pending.candidate.clone());
                false
            } else {
                true
            }
        });
        exhausted
    }

    /// Drain the queue and stop the timer
    pub(super) fn take_all(&mut self) -> Vec<IceCandidate> {
        self.cancel();
        self.queue.drain(..).map(|pending| pending.candidate).collect()
    }

    pub(super) fn cancel(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
    }
}
