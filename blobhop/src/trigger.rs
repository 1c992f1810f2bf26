//! Maps the outcome of a transfer to the response of whatever triggered it (an HTTP function
//! invocation, a CLI run).
use crate::{DestinationState, TransferResult};

/// Status code and human-readable body to reply to a transfer trigger with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerResponse {
    pub status: u16,
    pub body: String,
}

impl TriggerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response for a trigger that didn't name an object to transfer
pub fn missing_object_name() -> TriggerResponse {
    TriggerResponse {
        status: 400,
        body: "Please provide an object name to transfer".to_string(),
    }
}

/// Build the response for a trigger naming `object_name`.
///
/// `outcome` is `None` when no transfer was attempted, which is only valid if no object name was
/// given.
pub fn respond(object_name: Option<&str>, outcome: Option<&TransferResult>) -> TriggerResponse {
    let (object_name, result) = match (object_name.filter(|name| !name.is_empty()), outcome) {
        (Some(name), Some(result)) => (name, result),
        _ => return missing_object_name(),
    };

    if result.success {
        return TriggerResponse {
            status: 200,
            body: format!("File {object_name} transferred successfully"),
        };
    }

    let kind = result
        .error
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = result.error_message.as_deref().unwrap_or("unknown error");
    let leftovers = match result.destination_state {
        DestinationState::NotCreated => "nothing was written to the destination",
        DestinationState::Aborted => "the partial upload was aborted",
        DestinationState::AbortFailed => {
            "the partial upload could not be aborted and may need to be cleaned up manually"
        }
        DestinationState::Committed => "the destination object was written",
        DestinationState::CommittedUntrusted => {
            "the destination object was written but failed verification and should not be trusted"
        }
    };

    TriggerResponse {
        status: 500,
        body: format!("Error during transfer of {object_name} ({kind}): {message}; {leftovers}"),
    }
}
