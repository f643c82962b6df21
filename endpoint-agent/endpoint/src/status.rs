use crate::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const MAX_LOGS: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    Other,
    Policy,
    Bpf,
}

/// Ordered from best to worst.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Ok,
    Disabled,
    Warning,
    Failure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: StatusType,
    pub code: StatusCode,
    pub message: String,
    pub state: Option<State>,
}

/// A bounded history of status messages, newest last.
#[derive(Clone, Debug, Default)]
pub struct StatusLog {
    entries: VecDeque<StatusEntry>,
    current: [Option<StatusCode>; 3],
}

impl StatusLog {
    pub fn push(&mut self, entry: StatusEntry) {
        self.current[slot(entry.kind)] = Some(entry.code);
        if self.entries.len() == MAX_LOGS {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &StatusEntry> + '_ {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&StatusEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The worst of the latest codes recorded for each status type.
    pub fn current_status(&self) -> StatusCode {
        self.current
            .iter()
            .flatten()
            .copied()
            .max()
            .unwrap_or(StatusCode::Ok)
    }
}

fn slot(kind: StatusType) -> usize {
    match kind {
        StatusType::Other => 0,
        StatusType::Policy => 1,
        StatusType::Bpf => 2,
    }
}
