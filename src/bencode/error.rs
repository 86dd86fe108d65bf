use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at offset {0}")]
    InvalidStringLength(usize),

    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("trailing data after value at offset {0}")]
    TrailingData(usize),

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("missing key: {0}")]
    MissingKey(String),

    #[error("wrong type for key {key}: expected {expected}, found {found}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl BencodeError {
    pub(crate) fn missing(key: &[u8]) -> Self {
        BencodeError::MissingKey(String::from_utf8_lossy(key).into_owned())
    }

    pub(crate) fn wrong_type(key: &[u8], expected: &'static str, found: &'static str) -> Self {
        BencodeError::WrongType {
            key: String::from_utf8_lossy(key).into_owned(),
            expected,
            found,
        }
    }

    /// Returns true when the error is about an absent key rather than a
    /// malformed value.
    pub fn is_missing(&self) -> bool {
        matches!(self, BencodeError::MissingKey(_))
    }
}
