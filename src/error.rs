//! Error types for the broker.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokerError {
    /// The canonical request is malformed (missing messages, out-of-range sampling values).
    #[error("Invalid request: {message}")]
    Validation { message: String },

    /// The requested alias is not bound to any backend.
    #[error("Model '{alias}' is not configured")]
    UnknownModel { alias: String },

    /// A vendor payload could not be mapped onto the canonical shape.
    #[error("Translation error: {message}")]
    Translation { message: String },

    /// Network failure or timeout while talking to a vendor.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The vendor answered with a non-success status.
    #[error("Upstream returned status {status}")]
    Upstream { status: u16, body: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BrokerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn unknown_model(alias: impl Into<String>) -> Self {
        Self::UnknownModel {
            alias: alias.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Classify a reqwest failure without echoing its internals.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transport("upstream request timed out")
        } else if err.is_connect() {
            Self::transport("could not connect to upstream")
        } else if err.is_body() || err.is_decode() {
            Self::transport("failed to read upstream response")
        } else {
            Self::transport("upstream request failed")
        }
    }

    /// Stable machine-readable code used in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::UnknownModel { .. } => "model_not_found",
            Self::Translation { .. } => "translation_error",
            Self::Transport { .. } => "transport_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Config { .. } => "config_error",
            Self::Io(_) | Self::Json(_) | Self::Toml(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::UnknownModel { .. } => 404,
            Self::Transport { .. } | Self::Upstream { .. } => 502,
            _ => 500,
        }
    }

    /// Message suitable for callers. Upstream errors surface the vendor's own
    /// `error.message` when the body carries one.
    pub fn public_message(&self) -> String {
        match self {
            Self::Upstream { status, body } => {
                let detail = vendor_error_message(body);
                match (*status, detail) {
                    (200..=299, Some(detail)) => format!("Upstream reported an error: {detail}"),
                    (200..=299, None) => "Upstream reported an error".to_string(),
                    (status, Some(detail)) => format!("Upstream returned status {status}: {detail}"),
                    (status, None) => format!("Upstream returned status {status}"),
                }
            }
            other => other.to_string(),
        }
    }
}

fn vendor_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        assert_eq!(BrokerError::validation("x").http_status(), 400);
        assert_eq!(BrokerError::unknown_model("m").code(), "model_not_found");
        assert_eq!(BrokerError::transport("t").http_status(), 502);
        assert_eq!(BrokerError::translation("t").http_status(), 500);
    }

    #[test]
    fn test_upstream_message_uses_vendor_detail() {
        let err = BrokerError::upstream(429, r#"{"error":{"message":"slow down"}}"#);
        assert_eq!(err.public_message(), "Upstream returned status 429: slow down");

        let err = BrokerError::upstream(500, "<html>oops</html>");
        assert_eq!(err.public_message(), "Upstream returned status 500");
    }
}
