//! The error surface for the whole crate.

use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error as ThisError;
use uuid::Uuid;

/// Every way an operation against a [`crate::Datamodel`] can fail.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A value's kind fell outside the closed set of legal attribute kinds,
    /// or a typed accessor was asked for the wrong kind.
    #[error("attribute \"{name}\" is not of the requested type")]
    AttributeType { name: String },

    /// An element or element array was assigned across a datamodel
    /// boundary.
    #[error("element {id} is owned by a different datamodel")]
    ElementOwnership { id: Uuid },

    /// `CreateElement`/`ImportElement` was given an id already present in
    /// the registry.
    #[error("element id {id} is already in use")]
    ElementIdInUse { id: Uuid },

    /// The codec raised an error while decoding an attribute.
    #[error("codec \"{codec}\" failed decoding attribute \"{attribute}\" on element {owner}: {source}")]
    Codec {
        attribute: String,
        owner: Uuid,
        codec: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No codec is registered for the requested or encountered
    /// `(encoding, version)` pair.
    #[error("no codec registered for encoding \"{encoding}\" version {version}")]
    CodecNotFound { encoding: String, version: i32 },

    /// The header line was present but unparseable, or named an encoding
    /// this build does not support at all.
    #[error("unsupported or malformed dmx header: {0}")]
    UnsupportedFormat(String),

    /// A value type constructor was given out-of-domain input (wrong arity,
    /// unparseable text).
    #[error("value out of domain: {0}")]
    ValueDomain(String),

    /// State was misused: re-parenting an already-attached element array,
    /// loading an attribute that isn't deferred, etc.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("failed to parse integer")]
    ParseInteger(#[from] ParseIntError),

    #[error("failed to parse float")]
    ParseFloat(#[from] ParseFloatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
