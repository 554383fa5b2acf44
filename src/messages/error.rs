//! Error types for the wire codec.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    BadField(&'static str),

    #[error("unknown {family} tag {value}")]
    UnknownTag { family: &'static str, value: i64 },
}
