//! Descriptor decoding errors

use thiserror::Error;

/// Errors raised while decoding descriptor bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// A standard descriptor did not have the exact size its type requires
    #[error("Malformed descriptor: type {descriptor_type:#04x} with length {length}")]
    Malformed { descriptor_type: u8, length: usize },

    /// An endpoint record appeared before any interface record
    #[error("Endpoint descriptor before interface descriptor")]
    EndpointBeforeInterface,

    /// A record declared a length of zero, which would never advance the parser
    #[error("Zero-length descriptor record at offset {offset}")]
    ZeroLength { offset: usize },

    /// The stream held no configuration record
    #[error("No configuration descriptor found")]
    MissingConfiguration,

    /// A string descriptor zero carried no language IDs
    #[error("No language IDs found")]
    NoLanguageIds,
}

/// Type alias for descriptor decoding results
pub type Result<T> = std::result::Result<T, DescriptorError>;
