// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The stage processor: one consumer loop per concurrency slot.
//!
//! Each slot runs `acquire session -> receive -> parse -> invoke -> send
//! queued emissions -> commit` until the factory's run flag flips. Messages
//! are processed one at a time per slot; slots of the same stage interleave
//! freely. Any failure during processing rolls both transactions back and
//! leaves redelivery to the broker; session-level failures crash the
//! session, which revokes its connection group, and the slot reacquires
//! after a jittered backoff.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use mats_serial::MatsTrace;

use crate::broker::{BrokerError, MatsMessage};
use crate::endpoint::{StageDef, StageInvocation};
use crate::error::MatsError;
use crate::factory::FactoryInner;
use crate::pool::{crash_backoff, SessionHolder};

pub(crate) struct StageProcessor {
    stage: Arc<StageDef>,
    slot: usize,
    factory: Arc<FactoryInner>,
}

enum Outcome {
    Committed,
    RolledBack,
    Crashed(BrokerError),
}

enum Next {
    Stop,
    Received(Result<Option<MatsMessage>, BrokerError>),
}

impl StageProcessor {
    pub(crate) fn spawn(
        stage: Arc<StageDef>,
        slot: usize,
        factory: Arc<FactoryInner>,
        run_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let processor = Self {
            stage,
            slot,
            factory,
        };
        tokio::spawn(processor.run(run_rx))
    }

    async fn run(self, mut run_rx: watch::Receiver<bool>) {
        let mut announced = false;
        let mut attempt: u32 = 0;

        'session: loop {
            if !*run_rx.borrow() {
                break;
            }

            let mut holder = match self.factory.pool.acquire().await {
                Ok(holder) => holder,
                Err(e) => {
                    warn!(
                        stage_id = %self.stage.stage_id,
                        slot = self.slot,
                        error = %e,
                        "could not acquire broker session; backing off"
                    );
                    tokio::time::sleep(crash_backoff(attempt)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            if let Err(e) = holder.session().subscribe(&self.stage.destination).await {
                holder.crashed(&e).await;
                tokio::time::sleep(crash_backoff(attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }

            if !announced {
                self.factory.startup.mark_ready();
                announced = true;
                debug!(
                    stage_id = %self.stage.stage_id,
                    slot = self.slot,
                    destination = %self.stage.destination,
                    "stage processor entered consumer loop"
                );
            }

            loop {
                let next = tokio::select! {
                    biased;

                    changed = run_rx.changed() => {
                        if changed.is_err() || !*run_rx.borrow() {
                            Next::Stop
                        } else {
                            continue;
                        }
                    }

                    received = holder.session().receive() => Next::Received(received),
                };

                match next {
                    Next::Stop => {
                        debug!(
                            stage_id = %self.stage.stage_id,
                            slot = self.slot,
                            "stage processor stopping"
                        );
                        holder.close().await;
                        return;
                    }
                    Next::Received(Err(e)) => {
                        holder.crashed(&e).await;
                        tokio::time::sleep(crash_backoff(attempt)).await;
                        attempt = attempt.saturating_add(1);
                        continue 'session;
                    }
                    Next::Received(Ok(None)) => {
                        // The session was closed underneath us. Re-check the
                        // run flag; if still running, start afresh.
                        let stopping = !*run_rx.borrow();
                        holder.close().await;
                        if stopping {
                            return;
                        }
                        continue 'session;
                    }
                    Next::Received(Ok(Some(message))) => {
                        attempt = 0;
                        match self.process_message(&mut holder, message).await {
                            Outcome::Committed | Outcome::RolledBack => {}
                            Outcome::Crashed(e) => {
                                holder.crashed(&e).await;
                                tokio::time::sleep(crash_backoff(0)).await;
                                continue 'session;
                            }
                        }
                    }
                }
            }
        }
    }

    /// One receive-process-send cycle, already holding the message.
    async fn process_message(&self, holder: &mut SessionHolder, message: MatsMessage) -> Outcome {
        let inner = &self.factory;

        if let Err(e) = inner.coordinator.begin().await {
            warn!(
                stage_id = %self.stage.stage_id,
                error = %e,
                "external resource begin failed; rolling back for redelivery"
            );
            if let Err(rollback_err) = holder.session().rollback().await {
                warn!(error = %rollback_err, "broker rollback failed");
            }
            return Outcome::RolledBack;
        }

        let trace = match self.parse_envelope(&message) {
            Ok(trace) => trace,
            Err(reason) => {
                warn!(
                    stage_id = %self.stage.stage_id,
                    reason = %reason,
                    "failed to parse inbound envelope; rolling back for redelivery"
                );
                inner.coordinator.rollback(holder).await;
                return Outcome::RolledBack;
            }
        };

        let trace_id = trace.trace_id().to_string();
        debug!(
            trace_id = %trace_id,
            stage_id = %self.stage.stage_id,
            slot = self.slot,
            "processing message"
        );

        let invocation = StageInvocation {
            trace,
            message,
            config: Arc::clone(&inner.config),
            stage_id: self.stage.stage_id.clone(),
            next_stage_id: self.stage.next_stage_id.clone(),
            dropped_replies: Arc::clone(&inner.dropped_replies),
        };
        // A panicking lambda gets the same treatment as an erroring one:
        // both transactions roll back and the broker redelivers.
        let invoked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.stage.invoker.invoke(invocation)
        }));
        let outbound = match invoked {
            Ok(Ok(outbound)) => outbound,
            Ok(Err(e)) => {
                error!(
                    trace_id = %trace_id,
                    stage_id = %self.stage.stage_id,
                    error = %e,
                    "stage processing failed; rolling back for redelivery"
                );
                inner.coordinator.rollback(holder).await;
                return Outcome::RolledBack;
            }
            Err(_) => {
                error!(
                    trace_id = %trace_id,
                    stage_id = %self.stage.stage_id,
                    "stage lambda panicked; rolling back for redelivery"
                );
                inner.coordinator.rollback(holder).await;
                return Outcome::RolledBack;
            }
        };

        for out in &outbound {
            let (destination, broker_message) =
                match out.to_broker_message(&inner.config, inner.serializer.as_ref()) {
                    Ok(built) => built,
                    Err(e) => {
                        error!(
                            trace_id = %trace_id,
                            stage_id = %self.stage.stage_id,
                            error = %e,
                            "failed to build outbound message; rolling back for redelivery"
                        );
                        inner.coordinator.rollback(holder).await;
                        return Outcome::RolledBack;
                    }
                };
            if let Err(e) = holder.session().send(&destination, broker_message).await {
                inner.coordinator.rollback(holder).await;
                return Outcome::Crashed(e);
            }
        }

        match inner.coordinator.commit(holder).await {
            Ok(()) => Outcome::Committed,
            Err(MatsError::MessageSend(reason)) => {
                error!(
                    trace_id = %trace_id,
                    stage_id = %self.stage.stage_id,
                    reason = %reason,
                    "broker commit failed after external resource commit; message will be redelivered"
                );
                Outcome::Crashed(BrokerError::Commit(reason))
            }
            Err(e) => {
                warn!(
                    stage_id = %self.stage.stage_id,
                    error = %e,
                    "pre-commit probe failed; reacquiring session"
                );
                Outcome::Crashed(BrokerError::SessionClosed)
            }
        }
    }

    fn parse_envelope(&self, message: &MatsMessage) -> Result<MatsTrace, String> {
        let config = &self.factory.config;
        let bytes = message
            .bytes(&config.trace_key)
            .ok_or_else(|| format!("no envelope under key '{}'", config.trace_key))?;
        let meta = message
            .string(&config.meta_key())
            .ok_or_else(|| format!("no serializer meta under key '{}'", config.meta_key()))?;
        self.factory
            .serializer
            .deserialize_trace(bytes, meta)
            .map(|deserialized| deserialized.trace)
            .map_err(|e| e.to_string())
    }
}
