//! Attach-phase failures and the close frames they map to.

use csp_common::ConnectionRole;
use thiserror::Error;

use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::transport::{CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};

/// Why a socket was refused before entering its receive loop.
#[derive(Debug, Error)]
pub enum AttachError {
    /// The deployment verifier rejected the pairing.
    #[error("deployment rejected: {message}")]
    DeploymentInvalid { message: String },

    /// A live owner already holds (role, key).
    #[error("{role} session already active (owner: {owner})")]
    RegistrationConflict { role: ConnectionRole, owner: String },

    /// IDE attach with no sidecar owner in the store.
    #[error("sidecar not connected")]
    PeerNotReady,

    #[error(transparent)]
    Store(StoreError),
}

impl AttachError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::DeploymentInvalid { .. } | Self::RegistrationConflict { .. } | Self::PeerNotReady => {
                CLOSE_POLICY_VIOLATION
            }
            Self::Store(_) => CLOSE_INTERNAL_ERROR,
        }
    }

    pub fn close_reason(&self) -> String {
        match self {
            Self::DeploymentInvalid { message } => message.clone(),
            Self::RegistrationConflict { role, .. } => format!("{role} session already active"),
            Self::PeerNotReady => "Sidecar not connected".to_string(),
            Self::Store(_) => "Internal server error".to_string(),
        }
    }
}

impl From<StoreError> for AttachError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { role, owner } => Self::RegistrationConflict {
                role,
                owner: owner.to_string(),
            },
            other => Self::Store(other),
        }
    }
}

impl From<RegistryError> for AttachError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ConnectionConflict { role, existing, .. } => {
                Self::RegistrationConflict {
                    role,
                    owner: format!("local connection {existing}"),
                }
            }
        }
    }
}
