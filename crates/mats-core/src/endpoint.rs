// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoints, stages and the per-invocation process context.
//!
//! User logic is expressed as plain closures receiving a
//! [`ProcessContext`]. The context *queues* outbound emissions - every
//! emission clones the inbound envelope and applies the flow-semantics
//! transition immediately, but no broker I/O happens until the stage
//! processor sends the queued messages inside the transaction. The inbound
//! envelope is never altered by outbound actions.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use mats_serial::{deserialize_object, serialize_object, Channel, MatsSerializer, MatsTrace};

use crate::broker::{Destination, MatsMessage};
use crate::config::{FactoryConfig, TRACE_ID_HEADER};
use crate::error::{MatsError, ProcessError, ProcessResult};
use crate::initiator::InitiateBuilder;

/// A queued outbound message: the already-transitioned envelope plus its
/// target channel and side-channel payloads.
pub(crate) struct OutboundMessage {
    pub trace: MatsTrace,
    pub to: Channel,
    pub binaries: Vec<(String, Bytes)>,
    pub strings: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Build the broker message: envelope bytes and meta under the trace
    /// key, side channels under their namespaced keys, trace id mirrored
    /// into the headers, broker hints from the envelope flags.
    pub(crate) fn to_broker_message(
        &self,
        config: &FactoryConfig,
        serializer: &dyn MatsSerializer,
    ) -> Result<(Destination, MatsMessage), MatsError> {
        let serialized = serializer.serialize_trace(&self.trace)?;
        let mut message = MatsMessage::new();
        message.put_bytes(config.trace_key.clone(), serialized.bytes);
        message.put_string(config.meta_key(), serialized.meta);
        for (key, payload) in &self.binaries {
            message.put_bytes(config.bytes_key(key), payload.clone());
        }
        for (key, payload) in &self.strings {
            message.put_string(config.string_key(key), payload.clone());
        }
        message.headers.insert(
            TRACE_ID_HEADER.to_string(),
            self.trace.trace_id().to_string(),
        );
        message.non_persistent = self.trace.is_non_persistent();
        message.interactive = self.trace.is_interactive();
        Ok((config.destination_for(&self.to), message))
    }
}

/// Everything a stage invocation needs from the processor loop.
pub(crate) struct StageInvocation {
    pub trace: MatsTrace,
    pub message: MatsMessage,
    pub config: Arc<FactoryConfig>,
    pub stage_id: String,
    pub next_stage_id: Option<String>,
    pub dropped_replies: Arc<AtomicU64>,
}

/// Type-erased stage logic: deserializes the incoming DTO, resolves the
/// state, runs the user lambda and returns the queued emissions. Any error
/// rolls the cycle back and the broker redelivers.
pub(crate) trait StageInvoker: Send + Sync {
    fn invoke(&self, invocation: StageInvocation) -> Result<Vec<OutboundMessage>, ProcessError>;
}

/// The context handed to a stage's process lambda.
///
/// `S` is the endpoint's state type, private to the endpoint's stages and
/// conveyed in the envelope between them. Emitters follow the flow
/// semantics: `request` pushes the next stage as the reply address, `reply`
/// pops the stack, `next` moves sideways, `publish` fans out on a topic,
/// and `initiate` starts a fresh nested flow.
pub struct ProcessContext<S> {
    state: S,
    trace: MatsTrace,
    message: MatsMessage,
    config: Arc<FactoryConfig>,
    stage_id: String,
    next_stage_id: Option<String>,
    out: Vec<OutboundMessage>,
    props: Vec<(String, String)>,
    binaries: Vec<(String, Bytes)>,
    strings: Vec<(String, String)>,
    dropped_replies: Arc<AtomicU64>,
}

impl<S: Serialize> ProcessContext<S> {
    fn new(invocation: StageInvocation, state: S) -> Self {
        Self {
            state,
            trace: invocation.trace,
            message: invocation.message,
            config: invocation.config,
            stage_id: invocation.stage_id,
            next_stage_id: invocation.next_stage_id,
            out: Vec::new(),
            props: Vec::new(),
            binaries: Vec::new(),
            strings: Vec::new(),
            dropped_replies: invocation.dropped_replies,
        }
    }

    pub fn trace_id(&self) -> &str {
        self.trace.trace_id()
    }

    /// The inbound envelope, read-only. Useful for debugging: its `Display`
    /// renders the retained call and state history.
    pub fn trace(&self) -> &MatsTrace {
        &self.trace
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// The endpoint's state as left by the previous stage (or the initial /
    /// default state at stage 0). Mutations are carried to the next stage
    /// or the reply continuation.
    pub fn state(&mut self) -> &mut S {
        &mut self.state
    }

    /// Read a named binary side-channel payload off the incoming message.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.message.bytes(&self.config.bytes_key(key))
    }

    /// Read a named string side-channel payload off the incoming message.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.message.string(&self.config.string_key(key))
    }

    /// Attach a binary side-channel payload to the outgoing messages of
    /// this stage. Applies to emissions made after this call.
    pub fn add_bytes(&mut self, key: impl Into<String>, payload: impl Into<Bytes>) {
        self.binaries.push((key.into(), payload.into()));
    }

    /// Attach a string side-channel payload to the outgoing messages of
    /// this stage. Applies to emissions made after this call.
    pub fn add_string(&mut self, key: impl Into<String>, payload: impl Into<String>) {
        self.strings.push((key.into(), payload.into()));
    }

    /// Set a property that sticks with the flow from this call on out.
    pub fn set_trace_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.props.push((name.into(), value.into()));
    }

    /// Read a sticky flow property (including ones set in this stage).
    pub fn get_trace_property(&self, name: &str) -> Option<&str> {
        self.props
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .or_else(|| self.trace.trace_property(name))
    }

    /// Reply to the current continuation: pops the return-address stack.
    /// With an empty stack the reply is silently dropped, like ignoring the
    /// return value of a function call; the factory's dropped-replies
    /// counter is bumped for observability.
    pub fn reply<R: Serialize>(&mut self, reply: &R) -> Result<(), MatsError> {
        let Some(to) = self
            .trace
            .current_call()
            .and_then(|call| call.stack().last())
            .cloned()
        else {
            debug!(
                stage_id = %self.stage_id,
                trace_id = self.trace.trace_id(),
                "reply invoked with an empty stack; dropping message"
            );
            self.dropped_replies.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        let data = serialize_object(reply)?;
        let trace = self
            .trace
            .add_reply_call(&self.stage_id, Some(data))
            .map_err(|e| MatsError::Lifecycle(e.to_string()))?;
        self.push(trace, to);
        Ok(())
    }

    /// Request another endpoint; the reply will arrive at this endpoint's
    /// next stage, with the current state restored.
    pub fn request<Req: Serialize>(
        &mut self,
        endpoint_id: &str,
        request: &Req,
    ) -> Result<(), MatsError> {
        let next = self.next_stage_id.clone().ok_or_else(|| {
            MatsError::Lifecycle(format!(
                "stage '{}' cannot request: there is no next stage to receive the reply",
                self.stage_id
            ))
        })?;
        let data = serialize_object(request)?;
        let reply_state = serialize_object(&self.state)?;
        let to = Channel::queue(endpoint_id);
        let trace = self.trace.add_request_call(
            &self.stage_id,
            to.clone(),
            Channel::queue(next),
            Some(data),
            Some(reply_state),
            None,
        );
        self.push(trace, to);
        Ok(())
    }

    /// Pass the flow to this endpoint's next stage, carrying the current
    /// state. The stack is unchanged.
    pub fn next<N: Serialize>(&mut self, next_message: &N) -> Result<(), MatsError> {
        let next = self.next_stage_id.clone().ok_or_else(|| {
            MatsError::Lifecycle(format!(
                "stage '{}' invoked next, but there is no next stage",
                self.stage_id
            ))
        })?;
        let data = serialize_object(next_message)?;
        let state = serialize_object(&self.state)?;
        let to = Channel::queue(next);
        let trace = self
            .trace
            .add_next_call(&self.stage_id, to.clone(), Some(data), state);
        self.push(trace, to);
        Ok(())
    }

    /// Publish to a topic; every live subscriber gets a copy, the stack is
    /// unchanged.
    pub fn publish<P: Serialize>(
        &mut self,
        endpoint_id: &str,
        message: &P,
    ) -> Result<(), MatsError> {
        let data = serialize_object(message)?;
        let to = Channel::topic(endpoint_id);
        let trace = self
            .trace
            .add_send_call(&self.stage_id, to.clone(), Some(data), None);
        self.push(trace, to);
        Ok(())
    }

    /// Start a fresh nested flow from within this stage. The nested flow's
    /// trace id is the outer trace id, a `|`, and the id given to the
    /// builder; `from` defaults to this stage's id.
    pub fn initiate(
        &mut self,
        lambda: impl FnOnce(&mut InitiateBuilder) -> Result<(), MatsError>,
    ) -> Result<(), MatsError> {
        let mut builder = InitiateBuilder::nested(
            Arc::clone(&self.config),
            self.trace.trace_id(),
            &self.stage_id,
        );
        lambda(&mut builder)?;
        self.out.append(&mut builder.into_messages());
        Ok(())
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
}

/// A generic stage: state `S`, incoming DTO `I`, user lambda `F`.
pub(crate) struct TypedStage<S, I, F> {
    lambda: F,
    _marker: PhantomData<fn(S, I)>,
}

impl<S, I, F> TypedStage<S, I, F> {
    pub(crate) fn new(lambda: F) -> Self {
        Self {
            lambda,
            _marker: PhantomData,
        }
    }
}

impl<S, I, F> StageInvoker for TypedStage<S, I, F>
where
    S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    I: DeserializeOwned + Send + 'static,
    F: Fn(&mut ProcessContext<S>, I) -> ProcessResult + Send + Sync + 'static,
{
    fn invoke(&self, invocation: StageInvocation) -> Result<Vec<OutboundMessage>, ProcessError> {
        let incoming: I =
            deserialize_object(invocation.trace.current_call().and_then(|c| c.data()))?;
        let state: S = match invocation.trace.current_state() {
            Some(state) => deserialize_object(Some(state))?,
            None => S::default(),
        };
        let mut context = ProcessContext::new(invocation, state);
        (self.lambda)(&mut context, incoming)?;
        Ok(context.out)
    }
}

/// The sole stage of a `single` endpoint: no state, and the lambda's return
/// value is the reply.
pub(crate) struct SingleStage<R, I, F> {
    lambda: F,
    _marker: PhantomData<fn(I) -> R>,
}

impl<R, I, F> SingleStage<R, I, F> {
    pub(crate) fn new(lambda: F) -> Self {
        Self {
            lambda,
            _marker: PhantomData,
        }
    }
}

impl<R, I, F> StageInvoker for SingleStage<R, I, F>
where
    R: Serialize + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    F: Fn(&mut ProcessContext<()>, I) -> Result<R, ProcessError> + Send + Sync + 'static,
{
    fn invoke(&self, invocation: StageInvocation) -> Result<Vec<OutboundMessage>, ProcessError> {
        let incoming: I =
            deserialize_object(invocation.trace.current_call().and_then(|c| c.data()))?;
        let mut context = ProcessContext::new(invocation, ());
        let reply = (self.lambda)(&mut context, incoming)?;
        context.reply(&reply)?;
        Ok(context.out)
    }
}

/// A sealed stage definition.
pub(crate) struct StageDef {
    pub stage_id: String,
    pub next_stage_id: Option<String>,
    pub invoker: Arc<dyn StageInvoker>,
    pub concurrency: usize,
    pub destination: Destination,
}

/// A sealed endpoint: its ordered stages, ready to be started.
pub(crate) struct EndpointDef {
    pub endpoint_id: String,
    pub subscription: bool,
    pub stages: Vec<Arc<StageDef>>,
}

/// The stage id for a given index: the endpoint id itself for stage 0,
/// `<endpointId>.stage<i>` for subsequent stages.
pub(crate) fn stage_id_for(endpoint_id: &str, index: usize) -> String {
    if index == 0 {
        endpoint_id.to_string()
    } else {
        format!("{}.stage{}", endpoint_id, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_naming() {
        assert_eq!(stage_id_for("svc.calc", 0), "svc.calc");
        assert_eq!(stage_id_for("svc.calc", 1), "svc.calc.stage1");
        assert_eq!(stage_id_for("svc.calc", 3), "svc.calc.stage3");
    }
}
