//! Error types for the Git-Stratum crate.
//!
//! This module defines a unified error enumeration used across object parsing,
//! pack decoding, segment storage, ref updates, and the push pipeline. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants group into the protocol / integrity / consistency / capacity /
//!   storage / invariant classes the push pipeline reports on.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the Git-Stratum library.
///
/// - Used across object parsing, pack decode, segment I/O, refs and the push
///   transaction.
/// - Implements `std::error::Error` via `thiserror`.
pub enum GitError {
    /// Invalid or unsupported git object type name.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Malformed or unsupported blob object encoding.
    #[error("The `{0}` is not a valid git blob object.")]
    InvalidBlobObject(String),

    /// Malformed tree object.
    #[error("Not a valid git tree object: {0}")]
    InvalidTreeObject(String),

    /// Invalid tree entry (mode/name/hash).
    #[error("The `{0}` is not a valid git tree item.")]
    InvalidTreeItem(String),

    /// Invalid commit signature line.
    #[error("The `{0}` is not a valid git signature.")]
    InvalidSignature(String),

    /// Malformed commit object.
    #[error("Not a valid git commit object: {0}")]
    InvalidCommitObject(String),

    /// Malformed tag object.
    #[error("Not a valid git tag object: {0}")]
    InvalidTagObject(String),

    /// Invalid pack header magic or version.
    #[error("The `{0}` is not a valid pack header.")]
    InvalidPackHeader(String),

    /// Malformed or unsupported pack file.
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Pack trailer checksum did not match the pack body.
    #[error("Pack checksum mismatch: expected {expected}, computed {computed}")]
    PackChecksumMismatch { expected: String, computed: String },

    /// Delta object reconstruction error.
    #[error("Delta object error: {0}")]
    DeltaObjectError(String),

    /// Delta base entry could not be located (by offset or by id).
    #[error("Unresolved delta base: {0}")]
    UnresolvedDeltaBase(String),

    /// I/O error from underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Invalid SHA-1 hash formatting or value.
    #[error("The `{0}` is not a valid hash value.")]
    InvalidHashValue(String),

    /// Stored object bytes do not hash to their recorded id.
    #[error("Object integrity failure for {id}: content hashes to {computed}")]
    ObjectIntegrity { id: String, computed: String },

    /// Object missing from buffer, cache, and segments.
    #[error("Can't find specific object: {0}")]
    ObjectNotFound(String),

    /// Ref compare-and-swap conflict.
    #[error("lock failed: {0}")]
    RefLockFailed(String),

    /// A branch protection rule denied the update.
    #[error("protected branch: {0}")]
    ProtectionDenied(String),

    /// Write buffer exceeded its configured object or byte cap.
    #[error("Write buffer overflow: {0}")]
    BufferOverflow(String),

    /// Compaction retries exhausted.
    #[error("Compaction attempts exhausted after {attempts} tries: {last_error}")]
    CompactionExhausted { attempts: u32, last_error: String },

    /// Failure while encoding entries to an output pack.
    #[error("Can't encode entries to pack: {0}")]
    PackEncodeError(String),

    /// Scratchpad database failure.
    #[error("Scratchpad error: {0}")]
    Scratchpad(#[from] sea_orm::DbErr),

    /// Parquet segment read/write failure.
    #[error("Segment error: {0}")]
    Segment(#[from] parquet::errors::ParquetError),

    /// Bucket (shared blob store) failure.
    #[error("Bucket error: {0}")]
    Bucket(String),

    /// Text encoding or UTF-8 conversion error.
    #[error("UTF-8 conversion error: {0}")]
    ConversionError(String),

    /// Wrong phase or illegal call sequence; a programming bug, fail loudly.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl GitError {
    /// Whether the caller may retry the failed operation as-is.
    ///
    /// Capacity and storage failures are transient; everything else either
    /// corrupts on retry (integrity) or cannot succeed without new input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitError::BufferOverflow(_)
                | GitError::Scratchpad(_)
                | GitError::Segment(_)
                | GitError::Bucket(_)
                | GitError::IOError(_)
        )
    }
}
