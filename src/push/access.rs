//! Permission gating for registration and ephemeral listener requests.

use std::fmt;

use crate::config::PushConfig;

use super::types::Session;

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenial {
    PermanentPushDisabled,
    Guest,
    MailDisabled,
    ClientNotAllowed(String),
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermanentPushDisabled => write!(f, "permanent push is not allowed"),
            Self::Guest => write!(f, "guest sessions cannot use push"),
            Self::MailDisabled => write!(f, "account has no mail permission"),
            Self::ClientNotAllowed(client) => write!(f, "client '{}' is not allowed", client),
        }
    }
}

/// Check whether a session may use push through the given client.
///
/// `permanent` adds the permanent-push-allowed switch to the checks.
pub fn check_access(
    session: &Session,
    client: &str,
    config: &PushConfig,
    permanent: bool,
) -> Result<(), AccessDenial> {
    if permanent && !config.permanent_push_allowed {
        return Err(AccessDenial::PermanentPushDisabled);
    }
    if session.guest {
        return Err(AccessDenial::Guest);
    }
    if !session.mail_enabled {
        return Err(AccessDenial::MailDisabled);
    }
    if !config.is_client_allowed(client) {
        return Err(AccessDenial::ClientNotAllowed(client.to_string()));
    }
    Ok(())
}
