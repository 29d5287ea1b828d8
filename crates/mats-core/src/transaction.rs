// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Best-effort 1-phase-commit coordination.
//!
//! Every receive-process-send cycle (stage) and every initiation is
//! bracketed by two transactions: the broker session transaction (implicit
//! from the first operation) and, when a bridge is configured, an external
//! resource transaction (typically a database). The commit order is fixed:
//!
//! 1. probe broker session liveness - on `false`, roll both back;
//! 2. commit the external resource;
//! 3. commit the broker session.
//!
//! The external resource commits first because it has far more failure
//! modes (constraint violations, deadlock victims) than the broker. The
//! window between (2) and (3) is the one anomaly of the discipline: a
//! failure there means the external side effects exist but the messages may
//! never be published, surfaced distinctly as [`MatsError::MessageSend`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::error::MatsError;
use crate::pool::SessionHolder;

/// Failure of an external resource operation.
#[derive(Debug, Error)]
#[error("external resource failure: {0}")]
pub struct ExternalResourceError(pub String);

/// Bridge to an ambient transactional resource (e.g. a database). Demarcates
/// one transaction per processing cycle.
#[async_trait]
pub trait ExternalResource: Send + Sync + 'static {
    async fn begin(&self) -> Result<(), ExternalResourceError>;

    async fn commit(&self) -> Result<(), ExternalResourceError>;

    async fn rollback(&self) -> Result<(), ExternalResourceError>;
}

/// Coordinates the broker session transaction with an optional external
/// resource transaction.
#[derive(Clone, Default)]
pub struct TransactionCoordinator {
    external: Option<Arc<dyn ExternalResource>>,
}

impl TransactionCoordinator {
    pub fn new(external: Option<Arc<dyn ExternalResource>>) -> Self {
        Self { external }
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    /// Begin the external resource transaction, if a bridge is configured.
    /// The broker session transaction is implicit in its first operation.
    pub async fn begin(&self) -> Result<(), MatsError> {
        if let Some(external) = &self.external {
            external
                .begin()
                .await
                .map_err(|e| MatsError::BackendUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// The ordered commit protocol. On a liveness-probe failure both
    /// transactions are rolled back and [`MatsError::BackendUnavailable`]
    /// is returned (nothing happened). A broker commit failure *after* the
    /// external commit is [`MatsError::MessageSend`].
    pub async fn commit(&self, holder: &mut SessionHolder) -> Result<(), MatsError> {
        if !holder.is_still_active().await {
            self.rollback(holder).await;
            return Err(MatsError::BackendUnavailable(
                "broker session no longer active at pre-commit probe".to_string(),
            ));
        }

        if let Some(external) = &self.external {
            if let Err(e) = external.commit().await {
                // The broker has not committed: roll it back so the
                // triggering message is redelivered. Nothing happened.
                if let Err(rollback_err) = holder.session().rollback().await {
                    warn!(error = %rollback_err, "broker rollback failed after external commit failure");
                }
                return Err(MatsError::BackendUnavailable(e.to_string()));
            }
        }

        holder
            .session()
            .commit()
            .await
            .map_err(|e| MatsError::MessageSend(e.to_string()))
    }

    /// Roll both transactions back, logging (not propagating) rollback
    /// failures.
    pub async fn rollback(&self, holder: &mut SessionHolder) {
        if let Some(external) = &self.external {
            if let Err(e) = external.rollback().await {
                warn!(error = %e, "external resource rollback failed");
            }
        }
        if let Err(e) = holder.session().rollback().await {
            warn!(error = %e, "broker session rollback failed");
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("external", &self.external.as_ref().map(|_| "..."))
            .finish()
    }
}
