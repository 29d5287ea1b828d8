// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the message-flow engine.
//!
//! The one distinction that matters operationally is between
//! [`MatsError::BackendUnavailable`] ("nothing happened - no external
//! resources were committed") and [`MatsError::MessageSend`] ("the external
//! resource *was* committed, but the outbound messages may not have been
//! published"). The latter is the inter-commit window of the best-effort
//! 1-phase-commit discipline and requires compensating logic in the caller.

use mats_serial::SerializationError;
use thiserror::Error;

/// Result type using [`MatsError`].
pub type Result<T> = std::result::Result<T, MatsError>;

/// Errors surfaced to users of the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MatsError {
    /// An initiation builder was missing a required field. Nothing was sent
    /// and no external resource was touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// The broker could not be reached or a session could not be acquired
    /// or used. No external resources were committed.
    #[error("message backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The external resource was committed but the broker commit failed:
    /// the outbound messages may never have been published. The caller must
    /// use compensating logic.
    #[error("message send failed after external resource commit: {0}")]
    MessageSend(String),

    /// Envelope or DTO (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// An operation was performed on a stopped or closed component, or a
    /// stage emitted something its configuration does not allow.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

/// The error type user process lambdas return. Any error rolls the stage's
/// transactions back, and the broker redelivers the message.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for user process lambdas.
pub type ProcessResult = std::result::Result<(), ProcessError>;
