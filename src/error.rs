use std::time::Duration;
use thiserror::Error;

/// Problems with a trigger definition, surfaced to whoever tried to create or edit it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("`{pattern}` is not a valid regex pattern: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("a trigger named `{0}` already exists")]
    DuplicateName(String),

    #[error("no trigger named `{0}` exists")]
    UnknownTrigger(String),

    #[error("trigger names may only contain letters, digits, `-` and `_`")]
    InvalidName,

    #[error("`{0}` is not a valid response type")]
    UnknownResponseKind(String),

    #[error("the provided response combination is not valid: {0}")]
    InvalidCombination(String),

    #[error("I require the \"{0}\" permission to use that")]
    MissingBotPermission(&'static str),

    #[error("only administrators may create {0} triggers")]
    RequiresAdministrator(&'static str),
}

/// Why a single response action could not be carried out.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("missing the \"{0}\" permission")]
    MissingPermission(&'static str),

    #[error("the request was refused by discord")]
    Forbidden,

    #[error("the target no longer exists")]
    NotFound,

    #[error("the recipient does not accept direct messages")]
    DmClosed,

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("{0}")]
    Other(String),
}

impl ActionError {
    /// Errors that are part of normal operation and only worth a debug line.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ActionError::MissingPermission(_)
                | ActionError::Forbidden
                | ActionError::NotFound
                | ActionError::NotConfigured(_)
        )
    }

    /// Delivery to this recipient will keep failing until someone changes their settings.
    pub fn is_permanent_delivery_failure(&self) -> bool {
        matches!(
            self,
            ActionError::DmClosed | ActionError::Forbidden | ActionError::NotFound
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("regex evaluation exceeded {0:?}")]
pub struct RegexTimeout(pub Duration);

/// Failures talking to the reverse image search service.
#[derive(Error, Debug)]
pub enum SauceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("no results above the similarity threshold")]
    NoResults,

    #[error("reverse search is not configured")]
    NotConfigured,
}

impl From<SauceError> for ActionError {
    fn from(e: SauceError) -> Self {
        match e {
            SauceError::NotConfigured => ActionError::NotConfigured("reverse search"),
            other => ActionError::ExternalService(other.to_string()),
        }
    }
}
