//! Common types used across the proxy components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder identity for org/user when a connection carries none.
pub const STANDALONE_ID: &str = "standalone";

/// Identity of one proxy process; the ownership token for every store entry
/// that process writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random worker identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of a pairing a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// The process running next to a deployment; receives pushes.
    Sidecar,
    /// The client originating code changes and verification requests.
    Ide,
}

impl ConnectionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sidecar => "sidecar",
            Self::Ide => "ide",
        }
    }

    /// The role on the other end of the pairing.
    pub fn peer(self) -> Self {
        match self {
            Self::Sidecar => Self::Ide,
            Self::Ide => Self::Sidecar,
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sidecar => "SIDECAR",
            Self::Ide => "IDE",
        })
    }
}

/// Names one logical IDE/sidecar pairing.
///
/// All four fields participate in equality and hashing. `org_id` and
/// `user_id` fall back to [`STANDALONE_ID`] when absent, so a key never
/// carries an empty identity into storage or logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    org_id: String,
    user_id: String,
    app_id: String,
    deployment_id: String,
}

impl ConnectionKey {
    /// Key for a standalone pairing (no org or user identity).
    pub fn new(app_id: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self::with_identity(app_id, deployment_id, None, None)
    }

    /// Key carrying a pre-verified org/user identity.
    pub fn with_identity(
        app_id: impl Into<String>,
        deployment_id: impl Into<String>,
        org_id: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            org_id: non_empty_or_standalone(org_id),
            user_id: non_empty_or_standalone(user_id),
            app_id: app_id.into(),
            deployment_id: deployment_id.into(),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// The user identity, or `None` when the key is standalone.
    pub fn known_user_id(&self) -> Option<&str> {
        (self.user_id != STANDALONE_ID).then_some(self.user_id.as_str())
    }

    /// The org identity, or `None` when the key is standalone.
    pub fn known_org_id(&self) -> Option<&str> {
        (self.org_id != STANDALONE_ID).then_some(self.org_id.as_str())
    }

    /// `org_id:user_id:app_id:deployment_id`, the suffix used for
    /// distributed store keys.
    pub fn storage_suffix(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.org_id, self.user_id, self.app_id, self.deployment_id
        )
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.deployment_id)
    }
}

fn non_empty_or_standalone(value: Option<String>) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => STANDALONE_ID.to_string(),
    }
}

/// Lifecycle of a push record as kept by the push repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    /// Reserved for repositories that stage pushes before hand-off.
    Pending,
    /// Hand-off to the sidecar is in flight.
    Pushing,
    /// The sidecar socket accepted the push.
    Pushed,
    /// Hand-off failed.
    Failed,
}

impl PushStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Pushing => "pushing",
            Self::Pushed => "pushed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pushed | Self::Failed)
    }

    /// Linear progression: `PENDING -> PUSHING -> {PUSHED | FAILED}`.
    /// A pending push may also fail before it is ever handed off.
    pub fn can_transition_to(self, next: PushStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pushing)
                | (Self::Pending, Self::Failed)
                | (Self::Pushing, Self::Pushed)
                | (Self::Pushing, Self::Failed)
        )
    }
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code push as recorded by the push repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRecord {
    pub id: String,
    pub deployment_id: String,
    pub status: PushStatus,
    pub code_diff: String,
    pub change_description: String,
}
