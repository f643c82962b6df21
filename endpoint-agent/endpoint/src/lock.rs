use crate::{
    state::{self, Transition},
    status::{StatusCode, StatusEntry, StatusType},
    Endpoint, Error, Inner, State,
};
use chrono::Utc;
use parking_lot::RwLockWriteGuard;
use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use tracing::{debug, info};

/// Marks a guard obtained while the endpoint was not being removed.
pub(crate) enum Alive {}

/// Marks a guard obtained regardless of the endpoint's state.
pub(crate) enum Unconditional {}

/// Exclusive access to the endpoint's mutable fields.
///
/// Operations that only make sense on a live endpoint are implemented for
/// `Locked<'_, Alive>` alone, so they can't be reached through an
/// unconditional guard.
pub(crate) struct Locked<'a, M> {
    ep: &'a Endpoint,
    inner: RwLockWriteGuard<'a, Inner>,
    _mode: PhantomData<M>,
}

/// Proof that the build lock is held.
pub(crate) struct BuildGuard<'a>(#[allow(dead_code)] tokio::sync::MutexGuard<'a, ()>);

// === impl Endpoint ===

impl Endpoint {
    /// Write-locks the endpoint unless it is being removed.
    pub(crate) fn lock_alive(&self) -> Result<Locked<'_, Alive>, Error> {
        let inner = self.inner.write();
        if matches!(
            inner.state,
            Some(State::Disconnecting | State::Disconnected)
        ) {
            return Err(Error::NotAlive);
        }
        Ok(Locked {
            ep: self,
            inner,
            _mode: PhantomData,
        })
    }

    /// Write-locks the endpoint in any state. Only for status logging and
    /// draining revision waiters.
    pub(crate) fn unconditional_lock(&self) -> Locked<'_, Unconditional> {
        Locked {
            ep: self,
            inner: self.inner.write(),
            _mode: PhantomData,
        }
    }

    pub(crate) async fn build_lock(&self) -> BuildGuard<'_> {
        BuildGuard(self.build.lock().await)
    }
}

// === impl Locked ===

impl<M> Locked<'_, M> {
    pub fn endpoint(&self) -> &Endpoint {
        self.ep
    }

    /// Applies a transition from the general table.
    pub fn set_state(&mut self, to: State, reason: &str) -> bool {
        let from = self.inner.state;
        match state::transition(from, to) {
            Transition::Allowed => {
                self.apply_state(from, to, reason);
                true
            }
            Transition::Skipped => false,
            Transition::Rejected => {
                self.reject_state(from, to, reason);
                false
            }
        }
    }

    /// Applies a transition from the builder table.
    pub fn builder_set_state(&mut self, _build: &BuildGuard<'_>, to: State, reason: &str) -> bool {
        let from = self.inner.state;
        match state::builder_transition(from, to) {
            Transition::Allowed => {
                self.apply_state(from, to, reason);
                true
            }
            Transition::Skipped => {
                debug!(endpoint.id = self.ep.id, ?from, %to, "Builder transition superseded");
                false
            }
            Transition::Rejected => {
                self.reject_state(from, to, reason);
                false
            }
        }
    }

    pub fn log_status(&mut self, kind: StatusType, code: StatusCode, message: impl Into<String>) {
        let state = self.inner.state;
        self.inner.status.push(StatusEntry {
            timestamp: Utc::now(),
            kind,
            code,
            message: message.into(),
            state,
        });
    }

    fn apply_state(&mut self, from: Option<State>, to: State, reason: &str) {
        self.inner.state = Some(to);
        self.ep.deps.metrics.state_changed(from, to);
        self.log_status(StatusType::Other, StatusCode::Ok, reason);
        debug!(endpoint.id = self.ep.id, ?from, %to, %reason, "State changed");
    }

    fn reject_state(&mut self, from: Option<State>, to: State, reason: &str) {
        if from != Some(to) {
            info!(endpoint.id = self.ep.id, ?from, %to, %reason, "Invalid state transition skipped");
        }
        self.log_status(
            StatusType::Other,
            StatusCode::Warning,
            format!("Skipped invalid state transition to {to} due to: {reason}"),
        );
    }
}

impl<M> Deref for Locked<'_, M> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

impl<M> DerefMut for Locked<'_, M> {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.inner
    }
}

#[cfg(test)]
impl Locked<'_, Unconditional> {
    /// Forces a state without validation.
    pub fn force_state(&mut self, state: Option<State>) {
        self.inner.state = state;
    }
}
