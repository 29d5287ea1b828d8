// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entering the system from outside a stage.
//!
//! A [`MatsInitiator`] is a long-lived, thread-safe handle obtained from the
//! factory. Each [`initiate`](MatsInitiator::initiate) call checks a session
//! out of the pool, runs the supplied builder lambda, sends the built
//! messages and commits with the same best-effort 1PC bracket a stage uses.
//! Validation failures surface before any broker I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use mats_serial::{serialize_object, Channel, KeepTrace, MatsTrace};

use crate::broker::BrokerError;
use crate::config::FactoryConfig;
use crate::endpoint::OutboundMessage;
use crate::error::MatsError;
use crate::factory::FactoryInner;

/// Thread-safe entry point for starting flows. Obtain via
/// [`MatsFactory::initiator`](crate::MatsFactory::initiator); do not create
/// one per message.
pub struct MatsInitiator {
    name: String,
    factory: Weak<FactoryInner>,
    closed: AtomicBool,
}

impl MatsInitiator {
    pub(crate) fn new(name: String, factory: Weak<FactoryInner>) -> Self {
        Self {
            name,
            factory,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close this initiator; further initiations fail with a lifecycle
    /// error. Invoked for all initiators when the factory stops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Run one initiation. The lambda configures a one-shot builder and
    /// fires `request` / `send` / `publish` terminators; everything emitted
    /// is sent in one transaction.
    ///
    /// # Errors
    ///
    /// - [`MatsError::Validation`] - the builder was missing a required
    ///   field; nothing was sent.
    /// - [`MatsError::BackendUnavailable`] - the broker could not be used;
    ///   no external resources were committed.
    /// - [`MatsError::MessageSend`] - the external resource committed but
    ///   the broker commit failed; compensating logic is required.
    pub async fn initiate<F>(&self, lambda: F) -> Result<(), MatsError>
    where
        F: FnOnce(&mut InitiateBuilder) -> Result<(), MatsError>,
    {
        if self.is_closed() {
            return Err(MatsError::Lifecycle(format!(
                "initiator '{}' is closed",
                self.name
            )));
        }
        let inner = self.factory.upgrade().ok_or_else(|| {
            MatsError::Lifecycle("the factory behind this initiator has been dropped".to_string())
        })?;

        // The builder is pure: running the lambda first means a validation
        // failure causes no broker I/O and touches no external resource.
        let mut builder = InitiateBuilder::external(Arc::clone(&inner.config));
        let outbound = match lambda(&mut builder) {
            Ok(()) => builder.into_messages(),
            Err(e) => return Err(e),
        };
        if outbound.is_empty() {
            return Ok(());
        }

        let mut holder = inner
            .pool
            .acquire()
            .await
            .map_err(|e| MatsError::BackendUnavailable(e.to_string()))?;

        if let Err(e) = inner.coordinator.begin().await {
            holder.close().await;
            return Err(e);
        }

        debug!(
            initiator = %self.name,
            messages = outbound.len(),
            "sending initiation"
        );
        for out in &outbound {
            let (destination, message) =
                match out.to_broker_message(&inner.config, inner.serializer.as_ref()) {
                    Ok(built) => built,
                    Err(e) => {
                        inner.coordinator.rollback(&mut holder).await;
                        holder.close().await;
                        return Err(e);
                    }
                };
            if let Err(e) = holder.session().send(&destination, message).await {
                inner.coordinator.rollback(&mut holder).await;
                holder.crashed(&e).await;
                return Err(MatsError::BackendUnavailable(e.to_string()));
            }
        }

        match inner.coordinator.commit(&mut holder).await {
            Ok(()) => {
                holder.release().await;
                Ok(())
            }
            Err(e) => {
                if matches!(e, MatsError::MessageSend(_)) {
                    holder
                        .crashed(&BrokerError::Commit(e.to_string()))
                        .await;
                } else {
                    holder.close().await;
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for MatsInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatsInitiator")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One-shot builder for an initiation, handed to the
/// [`initiate`](MatsInitiator::initiate) lambda (and to
/// [`ProcessContext::initiate`](crate::ProcessContext::initiate) for nested
/// flows).
///
/// `request` requires `trace_id`, `from`, `to` and `reply_to`; `send` and
/// `publish` require `trace_id`, `from` and `to`. A missing field is a
/// validation error with no side effects.
pub struct InitiateBuilder {
    config: Arc<FactoryConfig>,
    /// Present for in-stage initiations: the outer flow's trace id, which
    /// the new trace id is appended to with a `|`.
    outer_trace_id: Option<String>,
    trace_id: Option<String>,
    keep_trace: KeepTrace,
    non_persistent: bool,
    interactive: bool,
    from: Option<String>,
    to: Option<String>,
    reply_to: Option<(Channel, String)>,
    props: Vec<(String, String)>,
    binaries: Vec<(String, Bytes)>,
    strings: Vec<(String, String)>,
    out: Vec<OutboundMessage>,
}

impl InitiateBuilder {
    pub(crate) fn external(config: Arc<FactoryConfig>) -> Self {
        Self::new(config, None, None)
    }

    pub(crate) fn nested(
        config: Arc<FactoryConfig>,
        outer_trace_id: &str,
        from_stage_id: &str,
    ) -> Self {
        Self::new(
            config,
            Some(outer_trace_id.to_string()),
            Some(from_stage_id.to_string()),
        )
    }

    fn new(config: Arc<FactoryConfig>, outer_trace_id: Option<String>, from: Option<String>) -> Self {
        let keep_trace = config.default_keep_trace;
        Self {
            config,
            outer_trace_id,
            trace_id: None,
            keep_trace,
            non_persistent: false,
            interactive: false,
            from,
            to: None,
            reply_to: None,
            props: Vec::new(),
            binaries: Vec::new(),
            strings: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Set the flow's trace id (mandatory). For an initiation from within a
    /// stage, the id is appended to the outer flow's trace id with a `|`.
    pub fn trace_id(&mut self, trace_id: impl Into<String>) -> &mut Self {
        let id = trace_id.into();
        self.trace_id = Some(match &self.outer_trace_id {
            Some(outer) => format!("{}|{}", outer, id),
            None => id,
        });
        self
    }

    /// Debugging hint: how much call and state history the envelope should
    /// retain through the flow.
    pub fn keep_trace(&mut self, keep_trace: KeepTrace) -> &mut Self {
        self.keep_trace = keep_trace;
        self
    }

    /// Hint the broker to skip the durable write for this flow's messages:
    /// unreliable but fast. Only for flows whose loss is acceptable.
    pub fn non_persistent(&mut self) -> &mut Self {
        self.non_persistent = true;
        self
    }

    /// Priority hint: a human is waiting for the result. Propagates to
    /// every message of the flow.
    pub fn interactive(&mut self) -> &mut Self {
        self.interactive = true;
        self
    }

    /// The logical origin label, for tracing and debugging. Already set to
    /// the stage id for in-stage initiations, but can be overridden.
    pub fn from(&mut self, initiator_id: impl Into<String>) -> &mut Self {
        self.from = Some(initiator_id.into());
        self
    }

    /// The target endpoint.
    pub fn to(&mut self, endpoint_id: impl Into<String>) -> &mut Self {
        self.to = Some(endpoint_id.into());
        self
    }

    /// Where the reply of the requested endpoint goes, with the state that
    /// terminator will receive. Required for `request`.
    pub fn reply_to<St: Serialize>(
        &mut self,
        endpoint_id: &str,
        reply_state: &St,
    ) -> Result<&mut Self, MatsError> {
        let state = serialize_object(reply_state)?;
        self.reply_to = Some((Channel::queue(endpoint_id), state));
        Ok(self)
    }

    /// Pub-sub variant of [`reply_to`](Self::reply_to): the reply goes to a
    /// subscription terminator on a topic.
    pub fn reply_to_subscription<St: Serialize>(
        &mut self,
        endpoint_id: &str,
        reply_state: &St,
    ) -> Result<&mut Self, MatsError> {
        let state = serialize_object(reply_state)?;
        self.reply_to = Some((Channel::topic(endpoint_id), state));
        Ok(self)
    }

    /// Set a property that sticks with the whole flow.
    pub fn set_trace_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.props.push((name.into(), value.into()));
        self
    }

    /// Attach a named binary side-channel payload (e.g. a document) to the
    /// outgoing message, outside the envelope body.
    pub fn add_bytes(&mut self, key: impl Into<String>, payload: impl Into<Bytes>) -> &mut Self {
        self.binaries.push((key.into(), payload.into()));
        self
    }

    /// Attach a named string side-channel payload (e.g. an XML or CSV
    /// document) to the outgoing message, outside the envelope body.
    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) -> &mut Self {
        self.strings.push((key.into(), payload.into()));
        self
    }

    /// The standard request: a message to `to`, whose reply arrives at the
    /// `reply_to` endpoint.
    pub fn request<T: Serialize>(&mut self, request: &T) -> Result<(), MatsError> {
        self.request_inner(request, None)
    }

    /// Request variant seeding the target endpoint's initial state. Only
    /// sensible when the same code base owns both sides.
    pub fn request_with_state<T: Serialize, S0: Serialize>(
        &mut self,
        request: &T,
        initial_target_state: &S0,
    ) -> Result<(), MatsError> {
        let initial = serialize_object(initial_target_state)?;
        self.request_inner(request, Some(initial))
    }

    /// Fire-and-forget send to an endpoint.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), MatsError> {
        self.send_inner(message, None, false)
    }

    /// Send variant seeding the target endpoint's initial state.
    pub fn send_with_state<T: Serialize, S0: Serialize>(
        &mut self,
        message: &T,
        initial_target_state: &S0,
    ) -> Result<(), MatsError> {
        let initial = serialize_object(initial_target_state)?;
        self.send_inner(message, Some(initial), false)
    }

    /// Publish to a subscription terminator's topic: all live subscribers
    /// receive the message; with none, nobody does.
    pub fn publish<T: Serialize>(&mut self, message: &T) -> Result<(), MatsError> {
        self.send_inner(message, None, true)
    }

    /// Publish variant seeding the subscribers' initial state.
    pub fn publish_with_state<T: Serialize, S0: Serialize>(
        &mut self,
        message: &T,
        initial_target_state: &S0,
    ) -> Result<(), MatsError> {
        let initial = serialize_object(initial_target_state)?;
        self.send_inner(message, Some(initial), true)
    }

    fn request_inner<T: Serialize>(
        &mut self,
        request: &T,
        initial_state: Option<String>,
    ) -> Result<(), MatsError> {
        const MSG: &str = "all of 'traceId', 'from', 'to' and 'replyTo' must be set for request(..)";
        let (trace_id, from, to) = self.check_common(MSG)?;
        let (reply_to, reply_state) = self
            .reply_to
            .clone()
            .ok_or_else(|| MatsError::Validation(format!("{}: missing 'replyTo'", MSG)))?;
        let data = serialize_object(request)?;
        let to_channel = Channel::queue(&to);
        let trace = self.new_trace(trace_id, &from).add_request_call(
            &from,
            to_channel.clone(),
            reply_to,
            Some(data),
            Some(reply_state),
            initial_state,
        );
        self.push(trace, to_channel);
        Ok(())
    }

    fn send_inner<T: Serialize>(
        &mut self,
        message: &T,
        initial_state: Option<String>,
        topic: bool,
    ) -> Result<(), MatsError> {
        let msg = if topic {
            "all of 'traceId', 'from' and 'to' must be set for publish(..)"
        } else {
            "all of 'traceId', 'from' and 'to' must be set for send(..)"
        };
        let (trace_id, from, to) = self.check_common(msg)?;
        let data = serialize_object(message)?;
        let to_channel = if topic {
            Channel::topic(&to)
        } else {
            Channel::queue(&to)
        };
        let trace = self.new_trace(trace_id, &from).add_send_call(
            &from,
            to_channel.clone(),
            Some(data),
            initial_state,
        );
        self.push(trace, to_channel);
        Ok(())
    }

    fn check_common(&self, msg: &str) -> Result<(String, String, String), MatsError> {
        let trace_id = self
            .trace_id
            .clone()
            .ok_or_else(|| MatsError::Validation(format!("{}: missing 'traceId'", msg)))?;
        let from = self
            .from
            .clone()
            .ok_or_else(|| MatsError::Validation(format!("{}: missing 'from'", msg)))?;
        let to = self
            .to
            .clone()
            .ok_or_else(|| MatsError::Validation(format!("{}: missing 'to'", msg)))?;
        Ok((trace_id, from, to))
    }

    fn new_trace(&self, trace_id: String, from: &str) -> MatsTrace {
        MatsTrace::new(
            trace_id,
            self.keep_trace,
            self.non_persistent,
            self.interactive,
        )
        .with_initiator_info(
            self.config.app_name.as_str(),
            self.config.app_version.as_str(),
            self.config.nodename.as_str(),
            from,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    fn push(&mut self, mut trace: MatsTrace, to: Channel) {
        for (name, value) in &self.props {
            trace.set_trace_property(name.clone(), value.clone());
        }
        let trace = trace.with_current_call_info(
            self.config.app_name.as_str(),
            self.config.app_version.as_str(),
            self.config.nodename.as_str(),
            chrono::Utc::now().timestamp_millis(),
        );
        self.out.push(OutboundMessage {
            trace,
            to,
            binaries: self.binaries.clone(),
            strings: self.strings.clone(),
        });
    }

    pub(crate) fn into_messages(self) -> Vec<OutboundMessage> {
        self.out
    }
}
