use crate::{controller::Controllers, Endpoint, Error};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type SyncFn = Box<dyn Fn(Vec<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Coalesces requests so that the sync function runs at most once per
/// interval, with every reason collected since the previous run.
pub(crate) struct Trigger {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    reasons: Mutex<Vec<String>>,
    notify: Notify,
    shutdown: CancellationToken,
}

// === impl Trigger ===

impl Trigger {
    pub fn spawn(
        controllers: &Controllers,
        min_interval: Duration,
        shutdown: CancellationToken,
        f: SyncFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            reasons: Mutex::new(Vec::new()),
            notify: Notify::new(),
            shutdown,
        });
        let task = controllers.spawn(run(shared.clone(), min_interval, f));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn trigger(&self, reason: impl Into<String>) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.reasons.lock().push(reason.into());
        self.shared.notify.notify_one();
    }

    /// Stops the trigger after flushing any pending request.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(shared: Arc<Shared>, min_interval: Duration, f: SyncFn) {
    let mut last_run: Option<time::Instant> = None;
    loop {
        let stopping = tokio::select! {
            biased;
            _ = shared.notify.notified() => false,
            _ = shared.shutdown.cancelled() => true,
        };

        if !stopping {
            if let Some(last) = last_run {
                tokio::select! {
                    _ = time::sleep_until(last + min_interval) => {}
                    _ = shared.shutdown.cancelled() => {}
                }
            }
        }

        let reasons = std::mem::take(&mut *shared.reasons.lock());
        if !reasons.is_empty() {
            last_run = Some(time::Instant::now());
            f(reasons).await;
        }

        if shared.shutdown.is_cancelled() {
            return;
        }
    }
}

/// Builds the sync function for an endpoint's DNS state trigger.
pub(crate) fn header_file_sync(ep: Weak<Endpoint>) -> SyncFn {
    Box::new(move |reasons| {
        let ep = ep.clone();
        Box::pin(async move {
            let Some(ep) = ep.upgrade() else {
                return;
            };
            match ep.sync_endpoint_header_file(&reasons).await {
                Ok(()) => {}
                Err(Error::NotAlive) => debug!(endpoint.id = ep.id, "Skipped state sync"),
                Err(error) => {
                    warn!(endpoint.id = ep.id, %error, ?reasons, "Failed to sync endpoint state")
                }
            }
        })
    })
}

impl Endpoint {
    /// Schedules a write of the endpoint's persisted state, including the
    /// current DNS rules.
    pub fn sync_endpoint_header_file_async(&self, reason: impl Into<String>) {
        self.dns_sync.trigger(reason);
    }

    /// Writes the endpoint's persisted state with the proxy's current DNS
    /// rules.
    pub(crate) async fn sync_endpoint_header_file(&self, reasons: &[String]) -> Result<(), Error> {
        let _build = self.build_lock().await;

        // The rule store must be read without the main lock held.
        let rules = self.deps.dns.get_dns_rules(self.id);

        let state = {
            let mut ep = self.lock_alive()?;
            ep.dns_rules = rules;
            self.serialize(&ep)
        };
        debug!(endpoint.id = self.id, ?reasons, "Syncing endpoint state");
        self.write_state(&state).await
    }
}
