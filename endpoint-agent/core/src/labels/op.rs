use super::{Label, Labels, SOURCE_ANY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The labels of an endpoint, partitioned by how they were set and whether
/// they contribute to the security identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpLabels {
    /// Identity labels set by the user through the API.
    #[serde(default)]
    pub custom: Labels,

    /// Identity labels derived from the orchestration system.
    #[serde(default)]
    pub orchestration_identity: Labels,

    /// Orchestration identity labels explicitly turned off by the user.
    #[serde(default)]
    pub disabled: Labels,

    /// Non-identity labels derived from the orchestration system.
    #[serde(default)]
    pub orchestration_info: Labels,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label {0} not found")]
    NotFound(String),
}

// === impl OpLabels ===

impl OpLabels {
    pub fn with_identity(labels: Labels) -> Self {
        Self {
            orchestration_identity: labels,
            ..Default::default()
        }
    }

    pub fn identity_labels(&self) -> Labels {
        let mut labels = self.custom.clone();
        labels.merge(&self.orchestration_identity);
        labels
    }

    pub fn all_labels(&self) -> Labels {
        let mut labels = self.custom.clone();
        labels.merge(&self.disabled);
        labels.merge(&self.orchestration_identity);
        labels.merge(&self.orchestration_info);
        labels
    }

    pub fn identity_label(&self, key: &str) -> Option<&Label> {
        self.custom
            .get(key)
            .or_else(|| self.orchestration_identity.get(key))
    }

    /// Replaces the orchestration identity labels that come from
    /// `source_filter` with `labels`. Labels from other sources are kept
    /// unless the filter is `any`.
    ///
    /// A disabled label stays disabled and keeps its old value. An empty
    /// `labels` is a no-op.
    pub fn replace_identity_labels(&mut self, source_filter: &str, labels: &Labels) -> bool {
        if labels.is_empty() {
            return false;
        }

        let mut changed = false;
        let mut keep = BTreeSet::new();
        let mut keep_disabled = BTreeSet::new();
        for l in labels.iter() {
            if self.disabled.contains_key(&l.key) {
                keep_disabled.insert(l.key.clone());
            } else if upsert(&mut self.orchestration_identity, &mut keep, l) {
                changed = true;
            }
        }

        if delete_unmarked(&mut self.orchestration_identity, source_filter, &keep) {
            changed = true;
        }
        delete_unmarked(&mut self.disabled, source_filter, &keep_disabled);

        changed
    }

    /// Replaces the informational labels that come from `source_filter`.
    pub fn replace_information_labels(&mut self, source_filter: &str, labels: &Labels) -> bool {
        if labels.is_empty() {
            return false;
        }

        let mut changed = false;
        let mut keep = BTreeSet::new();
        for l in labels.iter() {
            if upsert(&mut self.orchestration_info, &mut keep, l) {
                changed = true;
            }
        }
        if delete_unmarked(&mut self.orchestration_info, source_filter, &keep) {
            changed = true;
        }
        changed
    }

    /// Applies a user-driven label edit.
    ///
    /// Every label in `del` must be a current orchestration label or an
    /// already disabled one; otherwise nothing is modified. Deleted labels are
    /// moved to `disabled`. Added labels are restored from `disabled`,
    /// overwrite an orchestration label, or become custom labels.
    pub fn modify_identity_labels(
        &mut self,
        add: &Labels,
        del: &Labels,
    ) -> Result<bool, LabelError> {
        for k in del.keys() {
            if !self.orchestration_identity.contains_key(k) && !self.disabled.contains_key(k) {
                return Err(LabelError::NotFound(k.to_string()));
            }
        }

        let mut changed = false;
        for k in del.keys() {
            if let Some(l) = self.orchestration_identity.remove(k) {
                self.disabled.insert(l);
                changed = true;
            }
        }

        for l in add.iter() {
            if self.disabled.remove(&l.key).is_some() {
                self.orchestration_identity.insert(l.clone());
            } else if self.orchestration_identity.contains_key(&l.key) {
                self.orchestration_identity.insert(l.clone());
            } else {
                self.custom.insert(l.clone());
            }
            changed = true;
        }

        Ok(changed)
    }

    /// Drops a reserved label from every identity set.
    pub fn remove_identity_label(&mut self, key: &str) -> bool {
        let custom = self.custom.remove(key).is_some();
        let orch = self.orchestration_identity.remove(key).is_some();
        custom || orch
    }
}

fn upsert(labels: &mut Labels, keep: &mut BTreeSet<String>, label: &Label) -> bool {
    keep.insert(label.key.clone());
    match labels.get(&label.key) {
        Some(old) if old == label => false,
        _ => {
            labels.insert(label.clone());
            true
        }
    }
}

fn delete_unmarked(labels: &mut Labels, source_filter: &str, keep: &BTreeSet<String>) -> bool {
    let before = labels.len();
    labels.retain(|l| {
        keep.contains(&l.key) || (source_filter != SOURCE_ANY && source_filter != l.source)
    });
    labels.len() != before
}
