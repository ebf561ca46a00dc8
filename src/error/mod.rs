use thiserror::Error;

/// Errors raised by the auto-plugging engine and its collaborators.
///
/// Terminal kinds (`WrongType`, `MissingPlugin`, `NoBuffers`, ...) end up as
/// `Message::Error` on the bus; the others stay internal to whichever
/// operation failed.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    #[error("Wrong stream type: {0}")]
    WrongType(String),

    #[error("Missing handler for stream: {details}")]
    MissingPlugin { details: String },

    #[error("Caps negotiation failed for element {element}")]
    NegotiationFailed { element: String },

    #[error("Pad linking failed: {0}")]
    LinkFailed(String),

    #[error("Source construction failed for {uri}: {reason}")]
    SourceConstruction { uri: String, reason: String },

    #[error("All streams finished without buffers")]
    NoBuffers,

    #[error("Flushing")]
    Flushing,

    #[error("Element creation failed: {element}")]
    ElementCreation { element: String },

    #[error("Element not found: {element}")]
    ElementNotFound { element: String },

    #[error("Pad not found: {element}::{pad}")]
    PadNotFound { element: String, pad: String },

    #[error("State change failed: {0}")]
    StateChange(String),

    #[error("Property setting failed for element {element}: {property}")]
    PropertySetting { element: String, property: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("TOML parsing error: {0}")]
    TomlParse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        DecodeError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for DecodeError {
    fn from(err: toml::de::Error) -> Self {
        DecodeError::TomlParse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

pub trait ResultExt<T> {
    fn context(self, msg: &str) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, DecodeError> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| DecodeError::Unknown(format!("{}: {}", msg, e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| DecodeError::Unknown(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::SourceConstruction {
            uri: "gopher://x".into(),
            reason: "unsupported scheme".into(),
        };
        assert!(err.to_string().contains("gopher://x"));

        let err = DecodeError::MissingPlugin {
            details: "video/x-h264".into(),
        };
        assert!(err.to_string().contains("video/x-h264"));
    }

    #[test]
    fn test_context_on_option() {
        let none: Option<u32> = None;
        assert!(none.context("missing value").is_err());
        assert_eq!(Some(3u32).context("missing value").unwrap(), 3);
    }
}
