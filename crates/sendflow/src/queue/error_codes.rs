// crates/sendflow/src/queue/error_codes.rs

/// Local codes for failures that never reached the provider or never got a response.
pub const TIMEOUT: &str = "TIMEOUT";
pub const TRANSPORT: &str = "TRANSPORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    RateLimited,
    Permanent,
}

/// Maps provider error codes to a retry class. Both code lists come from
/// configuration; anything unlisted is retryable.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rate_limit_codes: Vec<String>,
    permanent_codes: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(
            ["4", "80007", "130429", "131048", "131056", "HTTP_429"]
                .into_iter()
                .map(String::from)
                .collect(),
            ["132001", "132015"].into_iter().map(String::from).collect(),
        )
    }
}

impl ErrorClassifier {
    pub fn new(rate_limit_codes: Vec<String>, permanent_codes: Vec<String>) -> Self {
        let norm = |codes: Vec<String>| {
            codes
                .into_iter()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect()
        };
        Self {
            rate_limit_codes: norm(rate_limit_codes),
            permanent_codes: norm(permanent_codes),
        }
    }

    pub fn rate_limit_codes(&self) -> &[String] {
        &self.rate_limit_codes
    }

    pub fn permanent_codes(&self) -> &[String] {
        &self.permanent_codes
    }

    pub fn classify(&self, code: Option<&str>) -> ErrorClass {
        let Some(code) = code.map(|c| c.trim().to_uppercase()) else {
            return ErrorClass::Retryable;
        };
        if self.permanent_codes.iter().any(|c| *c == code) {
            ErrorClass::Permanent
        } else if self.rate_limit_codes.iter().any(|c| *c == code) {
            ErrorClass::RateLimited
        } else {
            ErrorClass::Retryable
        }
    }
}

/// Why an item ended as `failed`. Stored as the prefix of the outcome's failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    MissingConfiguration,
    InvalidPayload,
    TemplateRejected,
    RetriesExhausted,
    ConversationResolutionFailed,
    Unknown,
}

impl FailureCode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "MISSING_CONFIGURATION" => Self::MissingConfiguration,
            "INVALID_PAYLOAD" => Self::InvalidPayload,
            "TEMPLATE_REJECTED" => Self::TemplateRejected,
            "RETRIES_EXHAUSTED" => Self::RetriesExhausted,
            "CONVERSATION_RESOLUTION_FAILED" => Self::ConversationResolutionFailed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingConfiguration => "MISSING_CONFIGURATION",
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::TemplateRejected => "TEMPLATE_REJECTED",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::ConversationResolutionFailed => "CONVERSATION_RESOLUTION_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Operator hint for a stored failure reason (`CODE: detail`).
pub fn suggested_action(reason: &str) -> &'static str {
    let code = reason.split(':').next().unwrap_or_default();
    match FailureCode::from_str(code) {
        FailureCode::MissingConfiguration => {
            "Check the send batch: template and channel must exist, channel needs phone number id, token and segment."
        }
        FailureCode::InvalidPayload => {
            "Fix the producer: variables must be a list or an object of header/body/buttons lists."
        }
        FailureCode::TemplateRejected => {
            "Template is missing, paused or not approved at the provider. Re-sync or re-submit it, then re-enqueue."
        }
        FailureCode::RetriesExhausted => {
            "Provider kept failing. Check provider status and channel capacity before re-enqueueing."
        }
        FailureCode::ConversationResolutionFailed => {
            "Message WAS delivered but not logged. Do not re-send; repair the conversation record manually."
        }
        FailureCode::Unknown => "Inspect the failure reason and worker logs.",
    }
}
