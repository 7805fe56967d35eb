//! Construction of status and error envelopes sent back to clients.

use crate::protocol::{
    Envelope, PushResponse, PushResponseStatus, VerificationResponse, VerificationStatus,
};

/// Builds well-formed status envelopes.
pub struct MessageFactory;

impl MessageFactory {
    /// Push response with `FAILED` status.
    pub fn push_failed(error_message: impl Into<String>) -> Envelope {
        Envelope::PushResponse(PushResponse {
            status: PushResponseStatus::Failed as i32,
            error_message: error_message.into(),
            push_id: String::new(),
        })
    }

    /// Push response with `FAILED` status tied to a specific push.
    pub fn push_failed_for(push_id: impl Into<String>, error_message: impl Into<String>) -> Envelope {
        Envelope::PushResponse(PushResponse {
            status: PushResponseStatus::Failed as i32,
            error_message: error_message.into(),
            push_id: push_id.into(),
        })
    }

    /// Verification response with `FAILED` status.
    pub fn verification_failed(error_message: impl Into<String>) -> Envelope {
        Envelope::VerificationResponse(VerificationResponse {
            status: VerificationStatus::Failed as i32,
            error_message: error_message.into(),
        })
    }

    /// Verification accepted and running.
    pub fn verification_in_progress() -> Envelope {
        Envelope::VerificationResponse(VerificationResponse {
            status: VerificationStatus::InProgress as i32,
            error_message: String::new(),
        })
    }
}
