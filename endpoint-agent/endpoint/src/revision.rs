use crate::{
    lock::{Alive, Locked},
    Endpoint, Error, State,
};
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

/// Called with the completion time once a revision wait is resolved.
pub type DoneFn = Box<dyn FnOnce(DateTime<Utc>) + Send + Sync>;

pub(crate) struct PolicySignal {
    wanted: u64,
    ctx: CancellationToken,
    tx: oneshot::Sender<()>,
    done: Option<DoneFn>,
}

/// Resolves once the endpoint reaches the requested policy revision, the
/// waiter's context is cancelled, or the endpoint is removed.
///
/// A cancelled context is only observed on the next revision update or on
/// removal.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct PolicyRevisionWait {
    rx: oneshot::Receiver<()>,
}

// === impl PolicySignal ===

impl PolicySignal {
    fn complete(self, now: DateTime<Utc>) {
        if let Some(done) = self.done {
            done(now);
        }
        let _ = self.tx.send(());
    }
}

// === impl PolicyRevisionWait ===

impl PolicyRevisionWait {
    fn ready() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self { rx }
    }

    pub fn is_ready(&mut self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }
}

impl Future for PolicyRevisionWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

// === impl Locked ===

impl<M> Locked<'_, M> {
    /// Resolves every pending revision wait.
    pub fn clean_policy_signals(&mut self) {
        let now = Utc::now();
        let signals = std::mem::take(&mut self.signals);
        self.endpoint()
            .deps
            .metrics
            .revision_waits_removed(signals.len());
        for (_, signal) in signals {
            signal.complete(now);
        }
    }
}

impl Locked<'_, Alive> {
    /// Advances the realized policy revision, resolving satisfied and
    /// cancelled waits. Lower revisions are ignored.
    pub fn set_policy_revision(&mut self, rev: u64) {
        if rev <= self.policy_revision {
            return;
        }
        self.policy_revision = rev;

        let done = self
            .signals
            .iter()
            .filter(|(_, s)| s.ctx.is_cancelled() || rev >= s.wanted)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        if done.is_empty() {
            return;
        }

        let now = Utc::now();
        self.endpoint()
            .deps
            .metrics
            .revision_waits_removed(done.len());
        for id in done {
            if let Some(signal) = self.signals.remove(&id) {
                signal.complete(now);
            }
        }
    }
}

// === impl Endpoint ===

impl Endpoint {
    pub async fn set_policy_revision(&self, rev: u64) {
        let _build = self.build_lock().await;
        if let Ok(mut ep) = self.lock_alive() {
            ep.set_policy_revision(rev);
        }
    }

    /// Waits for the endpoint's policy revision to reach `rev`.
    ///
    /// Resolves immediately when the revision has already been reached or the
    /// endpoint is disconnected.
    pub fn wait_for_policy_revision(
        &self,
        ctx: CancellationToken,
        rev: u64,
        done: Option<DoneFn>,
    ) -> PolicyRevisionWait {
        let mut ep = self.unconditional_lock();
        if ep.policy_revision >= rev || ep.state == Some(State::Disconnected) {
            return PolicyRevisionWait::ready();
        }

        let (tx, rx) = oneshot::channel();
        let id = ep.next_signal;
        ep.next_signal += 1;
        ep.signals.insert(
            id,
            PolicySignal {
                wanted: rev,
                ctx,
                tx,
                done,
            },
        );
        self.deps.metrics.revision_waits_added();
        PolicyRevisionWait { rx }
    }

    /// Waits until the endpoint has completed a regeneration.
    pub async fn wait_for_first_regeneration(&self, ctx: CancellationToken) -> Result<(), Error> {
        let wait = self.wait_for_policy_revision(ctx.clone(), 1, None);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            () = wait => {
                if self.policy_revision() >= 1 {
                    Ok(())
                } else {
                    Err(Error::NotAlive)
                }
            }
        }
    }

    /// Records a policy revision acknowledged by the proxy.
    pub fn on_proxy_policy_update(&self, rev: u64) {
        if let Ok(mut ep) = self.lock_alive() {
            if rev > ep.proxy_policy_revision {
                ep.proxy_policy_revision = rev;
            }
        }
    }
}
