// ── Core error types ──
//
// Errors raised by the engine itself. Physical I/O failures are NOT
// errors here: drivers report them as booleans and the engine folds them
// into sync status so the next scheduled pass retries.

use thiserror::Error;

use crate::model::{DeviceId, SceneId};

/// A link record could not be decoded from its wire representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("expected {expected} record bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("fixed byte D{position} should be {expected:#04x}, got {actual:#04x}")]
    FixedByte {
        position: usize,
        expected: u8,
        actual: u8,
    },

    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },

    #[error("memory address {address:#06x} is not a link table slot")]
    Address { address: u16 },
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {id}")]
    DeviceNotFound { id: DeviceId },

    #[error("Device already exists: {id}")]
    DuplicateDevice { id: DeviceId },

    #[error("Scene not found: {id}")]
    SceneNotFound { id: SceneId },

    #[error("Scene {scene} has no such member")]
    MemberNotFound { scene: SceneId },

    // ── Input errors ─────────────────────────────────────────────────
    #[error("Invalid device address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation rejected: {message}")]
    Rejected { message: String },

    #[error("Malformed link record: {0}")]
    MalformedRecord(#[from] MalformedRecordError),

    #[error("Change log encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
