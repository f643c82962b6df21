use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::Notify, task::JoinHandle, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info_span, warn, Instrument};

const ERROR_RETRY_BASE: Duration = Duration::from_secs(1);
const ERROR_RETRY_MAX: Duration = Duration::from_secs(60);

/// The background tasks owned by one endpoint.
///
/// Every task runs under a child of the endpoint's lifetime token, so
/// cancelling that token stops all of them.
#[derive(Debug)]
pub(crate) struct Controllers {
    parent: CancellationToken,
    tracker: TaskTracker,
    active: Mutex<HashMap<String, Handle>>,
}

#[derive(Debug)]
struct Handle {
    token: CancellationToken,
    trigger: Arc<Notify>,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ControllerParams {
    /// Time between successful runs. Zero runs the task until it first
    /// succeeds.
    pub run_interval: Duration,

    /// Delay before the first run.
    pub start_delay: Duration,
}

// === impl Controllers ===

impl Controllers {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            tracker: TaskTracker::new(),
            active: Mutex::new(HashMap::default()),
        }
    }

    /// Starts a named controller, replacing any controller with the same name.
    /// A replaced controller finishes its current run, then stops.
    pub fn update_controller<F, Fut>(&self, name: impl Into<String>, params: ControllerParams, f: F)
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.parent.is_cancelled() {
            debug!(controller = %name, "Endpoint is shutting down; not starting controller");
            return;
        }

        let token = self.parent.child_token();
        let trigger = Arc::new(Notify::new());
        let prior = self.active.lock().insert(
            name.clone(),
            Handle {
                token: token.clone(),
                trigger: trigger.clone(),
            },
        );
        if let Some(prior) = prior {
            prior.token.cancel();
        }

        let span = info_span!("controller", name = %name);
        self.tracker
            .spawn(run(name, params, token, trigger, f).instrument(span));
    }

    /// Runs a named controller immediately, skipping its current delay.
    pub fn trigger(&self, name: &str) {
        if let Some(h) = self.active.lock().get(name) {
            h.trigger.notify_one();
        }
    }

    pub fn remove_controller(&self, name: &str) {
        if let Some(h) = self.active.lock().remove(name) {
            h.token.cancel();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active
            .lock()
            .get(name)
            .map(|h| !h.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Spawns a one-off task that is awaited on removal.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Cancels every controller. Call [`Controllers::wait`] afterwards to
    /// wait for them to finish.
    pub fn remove_all(&self) {
        for (_, h) in self.active.lock().drain() {
            h.token.cancel();
        }
        self.tracker.close();
    }

    pub async fn wait(&self) {
        self.tracker.wait().await
    }
}

async fn run<F, Fut>(
    name: String,
    params: ControllerParams,
    token: CancellationToken,
    trigger: Arc<Notify>,
    mut f: F,
) where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let ControllerParams {
        run_interval,
        start_delay,
    } = params;
    let max_backoff = if run_interval.is_zero() {
        ERROR_RETRY_MAX
    } else {
        run_interval
    };
    let mut backoff = ERROR_RETRY_BASE.min(max_backoff);
    let mut delay = start_delay;

    loop {
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = trigger.notified() => {}
                _ = time::sleep(delay) => {}
            }
        }

        // A run in progress is never dropped, even when the controller is
        // replaced or removed; the body observes the token itself.
        let res = f(token.clone()).await;
        if token.is_cancelled() {
            break;
        }

        delay = match res {
            Ok(()) => {
                backoff = ERROR_RETRY_BASE.min(max_backoff);
                if run_interval.is_zero() {
                    debug!("Controller completed");
                    break;
                }
                run_interval
            }
            Err(error) => {
                warn!(%error, controller = %name, "Controller failed; retrying");
                let d = backoff;
                backoff = (backoff * 2).min(max_backoff);
                d
            }
        };
    }
}
