use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("endpoint is being removed")]
    NotAlive,

    #[error("endpoint has no valid security identity")]
    InvalidIdentity,

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("{0}")]
    StateChange(String),

    #[error(transparent)]
    Labels(#[from] endpoint_agent_core::labels::LabelError),

    #[error("unable to resolve identity: {0}")]
    Allocation(#[source] anyhow::Error),

    #[error("regeneration failed: {0}")]
    Regeneration(#[source] anyhow::Error),

    #[error("timed out waiting for proxy updates")]
    ProxyWait,

    #[error("regeneration timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to persist endpoint state: {0}")]
    Persist(#[source] std::io::Error),

    #[error("failed to parse restored endpoint: {0}")]
    Restore(#[source] serde_json::Error),
}

/// Failures collected while tearing an endpoint down. Deletion continues past
/// each of them.
#[derive(Debug, Default)]
pub struct DeleteErrors(pub Vec<anyhow::Error>);

impl DeleteErrors {
    pub fn push(&mut self, error: anyhow::Error) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn ok_if_empty(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for DeleteErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors while deleting endpoint", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            write!(f, "{} {e:#}", if i == 0 { ":" } else { ";" })?;
        }
        Ok(())
    }
}

impl std::error::Error for DeleteErrors {}
