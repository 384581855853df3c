//! Engine error taxonomy.

use std::time::Duration;

use pvx_id::GuestId;
use thiserror::Error;

use crate::api::PlatformError;
use crate::validate::ValidationError;

/// Errors surfaced by the lifecycle entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The desired state is malformed; nothing was sent to the platform.
    #[error("invalid guest spec: {0}")]
    Validation(#[from] ValidationError),

    /// An internal invariant was violated while translating state.
    #[error("{0}; this is an engine bug, please report it")]
    Translation(String),

    /// The platform rejected a call or could not be reached.
    #[error("{operation} failed{}: {source}", vmid.map(|id| format!(" for guest {}", id)).unwrap_or_default())]
    Api {
        operation: &'static str,
        vmid: Option<GuestId>,
        #[source]
        source: PlatformError,
    },

    /// Auto-assigned ids kept colliding with concurrent creators.
    #[error("could not claim a free guest id after {attempts} attempts")]
    IdRaceExhausted { attempts: u32 },

    /// A user-supplied id is already taken.
    #[error("guest {vmid} already exists")]
    AlreadyExists { vmid: GuestId },

    /// The guest agent never reported a usable address.
    #[error("guest {vmid} reported no IPv4 address within {waited:?}")]
    AddressTimeout { vmid: GuestId, waited: Duration },

    /// The clone source could not be resolved.
    #[error("no template with ID/name '{0}' could be found")]
    TemplateNotFound(String),

    /// Importing existing guests is not implemented.
    #[error("import is not supported")]
    ImportUnsupported,

    /// The operation was interrupted by shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Builds a closure mapping a [`PlatformError`] into [`EngineError::Api`].
    pub fn api(
        operation: &'static str,
        vmid: Option<GuestId>,
    ) -> impl FnOnce(PlatformError) -> EngineError {
        move |source| EngineError::Api {
            operation,
            vmid,
            source,
        }
    }

    pub fn translation(message: impl std::fmt::Display) -> Self {
        EngineError::Translation(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_names_operation_and_guest() {
        let vmid = GuestId::new(100).unwrap();
        let err = EngineError::api("start guest", Some(vmid))(PlatformError::from_response(
            500,
            "boom",
        ));
        assert_eq!(err.to_string(), "start guest failed for guest 100: 500 boom");

        let err = EngineError::api("list guests", None)(PlatformError::Decode("x".into()));
        assert_eq!(err.to_string(), "list guests failed: unexpected response: x");
    }

    #[test]
    fn test_translation_error_asks_for_report() {
        let err = EngineError::translation("slot virtio0 holds a network device");
        assert!(err.to_string().ends_with("this is an engine bug, please report it"));
    }
}
