//! Normalised provider triggers.
//!
//! Webhook signature verification and payload normalisation happen upstream;
//! the engine only ever sees validated triggers in this shape.

use serde::{Deserialize, Serialize};

use super::build::TriggerKind;

/// A validated push / pull-request / manual trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub repo_full_name: String,
    pub commit_sha: String,
    pub branch: String,
    #[serde(default)]
    pub pr_number: Option<i64>,
    pub trigger_kind: TriggerKind,
    pub author: String,
    pub message: String,
}
