// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-flow wire envelope.
//!
//! A [`MatsTrace`] is the protocol that endpoints (their stages) communicate
//! with. It carries the full call history of a flow, the stack of return
//! addresses that `request` pushes and `reply` pops, and the state frames
//! that travel between the stages of a multi-stage endpoint. One envelope
//! exists per live flow; every outbound action produces a *new* envelope via
//! one of the `add_*_call` transitions, leaving the source untouched.
//!
//! How much history is retained is governed by [`KeepTrace`]: the full form
//! keeps every call and state frame for debugging, while the condensed forms
//! shave serialization cost and bandwidth once a system has stabilized.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retention policy for call and state history in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeepTrace {
    /// Keep every call with data, and every state frame.
    Full,
    /// Keep the call history but null out data on all non-current calls,
    /// and condense the state frames to a pure stack.
    #[default]
    Compact,
    /// Keep only the current call and the state frames reachable from it.
    Minimal,
}

/// Whether a channel is backed by a queue or a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessagingModel {
    Queue,
    Topic,
}

/// The kind of a call in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallType {
    Request,
    Reply,
    Next,
    Send,
}

/// A named address in the messaging fabric: a channel id plus its model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "i")]
    id: String,
    #[serde(rename = "m")]
    model: MessagingModel,
}

impl Channel {
    pub fn queue(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Queue,
        }
    }

    pub fn topic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: MessagingModel::Topic,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> MessagingModel {
        self.model
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = match self.model {
            MessagingModel::Queue => "Q",
            MessagingModel::Topic => "T",
        };
        write!(f, "[{}]{}", model, self.id)
    }
}

/// One hop in the flow: who called whom, with what, and the return-address
/// stack as it stood after the call was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    #[serde(rename = "t")]
    call_type: CallType,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(rename = "to")]
    to: Channel,
    /// Serialized user payload. Nulled on non-current calls in COMPACT mode.
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    /// Return addresses, deepest first.
    #[serde(rename = "s")]
    stack: Vec<Channel>,
    // Call-site metadata, for tracing and debugging only.
    #[serde(rename = "an", default, skip_serializing_if = "Option::is_none")]
    calling_app_name: Option<String>,
    #[serde(rename = "av", default, skip_serializing_if = "Option::is_none")]
    calling_app_version: Option<String>,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    calling_host: Option<String>,
    #[serde(rename = "ts", default)]
    called_timestamp: i64,
}

impl Call {
    fn new(
        call_type: CallType,
        from: impl Into<String>,
        to: Channel,
        data: Option<String>,
        stack: Vec<Channel>,
    ) -> Self {
        Self {
            call_type,
            from: Some(from.into()),
            to,
            data,
            stack,
            calling_app_name: None,
            calling_app_version: None,
            calling_host: None,
            called_timestamp: 0,
        }
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn to(&self) -> &Channel {
        &self.to
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn stack(&self) -> &[Channel] {
        &self.stack
    }

    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }

    pub fn calling_app_name(&self) -> Option<&str> {
        self.calling_app_name.as_deref()
    }

    pub fn calling_host(&self) -> Option<&str> {
        self.calling_host.as_deref()
    }

    pub fn called_timestamp(&self) -> i64 {
        self.called_timestamp
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indent = ": ".repeat(self.stack_height());
        write!(f, "{}{:?} #to:{}", indent, self.call_type, self.to)?;
        if let Some(from) = &self.from {
            write!(f, " #from:{}", from)?;
        }
        if let Some(data) = &self.data {
            write!(f, " #data:{}", data)?;
        }
        Ok(())
    }
}

/// One state frame: the opaque state that applies at a given stack height.
///
/// The state visible to a stage is the most recent frame whose height equals
/// the stage's current stack height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    #[serde(rename = "h")]
    height: usize,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
}

impl StackState {
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }
}

/// Error from an envelope transition that cannot be performed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    /// A reply was requested while the return-address stack was empty.
    /// Callers are expected to check the current stack height and drop the
    /// reply instead of attempting the transition.
    #[error("cannot add a reply call: the return-address stack is empty")]
    EmptyStack,
}

/// The envelope of a single flow. See the module docs for semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatsTrace {
    #[serde(rename = "tid")]
    trace_id: String,
    #[serde(rename = "kt")]
    keep_trace: KeepTrace,
    #[serde(rename = "np", default)]
    non_persistent: bool,
    #[serde(rename = "ia", default)]
    interactive: bool,
    // Initiator metadata.
    #[serde(rename = "an", default, skip_serializing_if = "Option::is_none")]
    init_app_name: Option<String>,
    #[serde(rename = "av", default, skip_serializing_if = "Option::is_none")]
    init_app_version: Option<String>,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    init_host: Option<String>,
    #[serde(rename = "iid", default, skip_serializing_if = "Option::is_none")]
    initiator_id: Option<String>,
    #[serde(rename = "its", default)]
    initialized_timestamp: i64,
    #[serde(rename = "c", default)]
    calls: Vec<Call>,
    #[serde(rename = "ss", default)]
    stack_states: Vec<StackState>,
    /// Sticky flow-wide properties, in insertion order.
    #[serde(rename = "tp", default)]
    trace_props: Vec<(String, String)>,
}

impl MatsTrace {
    /// Create a fresh envelope for a new flow.
    pub fn new(
        trace_id: impl Into<String>,
        keep_trace: KeepTrace,
        non_persistent: bool,
        interactive: bool,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            keep_trace,
            non_persistent,
            interactive,
            init_app_name: None,
            init_app_version: None,
            init_host: None,
            initiator_id: None,
            initialized_timestamp: 0,
            calls: Vec::new(),
            stack_states: Vec::new(),
            trace_props: Vec::new(),
        }
    }

    /// Attach initiator metadata (app identity, host, initiator id, epoch
    /// millis timestamp).
    pub fn with_initiator_info(
        mut self,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        host: impl Into<String>,
        initiator_id: impl Into<String>,
        timestamp_millis: i64,
    ) -> Self {
        self.init_app_name = Some(app_name.into());
        self.init_app_version = Some(app_version.into());
        self.init_host = Some(host.into());
        self.initiator_id = Some(initiator_id.into());
        self.initialized_timestamp = timestamp_millis;
        self
    }

    /// Attach call-site metadata to the current (last) call.
    pub fn with_current_call_info(
        mut self,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        host: impl Into<String>,
        timestamp_millis: i64,
    ) -> Self {
        if let Some(call) = self.calls.last_mut() {
            call.calling_app_name = Some(app_name.into());
            call.calling_app_version = Some(app_version.into());
            call.calling_host = Some(host.into());
            call.called_timestamp = timestamp_millis;
        }
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn keep_trace(&self) -> KeepTrace {
        self.keep_trace
    }

    pub fn is_non_persistent(&self) -> bool {
        self.non_persistent
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn initiator_id(&self) -> Option<&str> {
        self.initiator_id.as_deref()
    }

    pub fn init_app_name(&self) -> Option<&str> {
        self.init_app_name.as_deref()
    }

    pub fn init_host(&self) -> Option<&str> {
        self.init_host.as_deref()
    }

    pub fn initialized_timestamp(&self) -> i64 {
        self.initialized_timestamp
    }

    /// Set a sticky flow property. Setting an existing name replaces its
    /// value in place, preserving insertion order.
    pub fn set_trace_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.trace_props.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.trace_props.push((name, value)),
        }
    }

    pub fn trace_property(&self, name: &str) -> Option<&str> {
        self.trace_props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn trace_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.trace_props
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The current call is the last one added; `None` only on a freshly
    /// created envelope.
    pub fn current_call(&self) -> Option<&Call> {
        self.calls.last()
    }

    /// Stack height of the current call, zero for a fresh envelope.
    pub fn current_stack_height(&self) -> usize {
        self.current_call().map(Call::stack_height).unwrap_or(0)
    }

    /// The full retained call history, oldest first.
    pub fn call_flow(&self) -> &[Call] {
        &self.calls
    }

    /// The full retained state-frame history, oldest first.
    pub fn state_flow(&self) -> &[StackState] {
        &self.stack_states
    }

    /// The state visible at the current call's stack height.
    pub fn current_state(&self) -> Option<&str> {
        self.state_at(self.current_stack_height())
    }

    /// Resolve the state frame for a given stack height: newest-first, and
    /// the search terminates at the first frame *below* the target height,
    /// which means no frame was placed for this height on this branch.
    pub fn state_at(&self, height: usize) -> Option<&str> {
        for frame in self.stack_states.iter().rev() {
            if frame.height < height {
                break;
            }
            if frame.height == height {
                return frame.state.as_deref();
            }
        }
        None
    }

    /// The condensed state stack reachable from the current call: one frame
    /// per height at or below the current height, newest per height.
    pub fn state_stack(&self) -> Vec<&StackState> {
        let current = self.current_stack_height();
        let keep = mark_reachable(&self.stack_states, current);
        self.stack_states
            .iter()
            .enumerate()
            .filter(|(idx, _)| keep[*idx])
            .map(|(_, frame)| frame)
            .collect()
    }

    /// REQUEST transition: push the caller's next-stage channel onto the
    /// stack, record the caller's state one level below the new top (for the
    /// eventual reply), and optionally seed the callee's initial state.
    pub fn add_request_call(
        &self,
        from: impl Into<String>,
        to: Channel,
        reply_to: Channel,
        data: Option<String>,
        reply_state: Option<String>,
        initial_state: Option<String>,
    ) -> MatsTrace {
        let mut stack = self.current_stack();
        let mut next = self.clone_for_new_call();
        // The reply state targets the frame below the new top, so it is
        // recorded before the push.
        next.stack_states.push(StackState {
            height: stack.len(),
            state: reply_state,
        });
        stack.push(reply_to);
        next.drop_values_on_current();
        next.calls
            .push(Call::new(CallType::Request, from, to, data, stack.clone()));
        if let Some(initial) = initial_state {
            next.stack_states.push(StackState {
                height: stack.len(),
                state: Some(initial),
            });
        }
        next.prune_stack_states();
        next
    }

    /// SEND transition (also used for publish with a topic channel): stack
    /// unchanged, optional initial state for the target.
    pub fn add_send_call(
        &self,
        from: impl Into<String>,
        to: Channel,
        data: Option<String>,
        initial_state: Option<String>,
    ) -> MatsTrace {
        let stack = self.current_stack();
        let mut next = self.clone_for_new_call();
        next.drop_values_on_current();
        next.calls
            .push(Call::new(CallType::Send, from, to, data, stack.clone()));
        if let Some(initial) = initial_state {
            next.stack_states.push(StackState {
                height: stack.len(),
                state: Some(initial),
            });
        }
        next.prune_stack_states();
        next
    }

    /// NEXT transition: sideways call to the next stage of the same
    /// endpoint; stack unchanged, state recorded for the receiving stage.
    pub fn add_next_call(
        &self,
        from: impl Into<String>,
        to: Channel,
        data: Option<String>,
        state: String,
    ) -> MatsTrace {
        let stack = self.current_stack();
        let mut next = self.clone_for_new_call();
        next.drop_values_on_current();
        next.calls
            .push(Call::new(CallType::Next, from, to, data, stack.clone()));
        next.stack_states.push(StackState {
            height: stack.len(),
            state: Some(state),
        });
        next.prune_stack_states();
        next
    }

    /// REPLY transition: pop the top of the stack and address it.
    ///
    /// Returns [`TraceError::EmptyStack`] when there is nothing to pop;
    /// callers should check [`current_stack_height`](Self::current_stack_height)
    /// first and drop the reply instead.
    pub fn add_reply_call(
        &self,
        from: impl Into<String>,
        data: Option<String>,
    ) -> Result<MatsTrace, TraceError> {
        let mut stack = self.current_stack();
        let to = stack.pop().ok_or(TraceError::EmptyStack)?;
        let mut next = self.clone_for_new_call();
        next.drop_values_on_current();
        next.calls
            .push(Call::new(CallType::Reply, from, to, data, stack));
        next.prune_stack_states();
        Ok(next)
    }

    fn current_stack(&self) -> Vec<Channel> {
        self.current_call()
            .map(|c| c.stack.clone())
            .unwrap_or_default()
    }

    fn clone_for_new_call(&self) -> MatsTrace {
        let mut clone = self.clone();
        if self.keep_trace == KeepTrace::Minimal {
            clone.calls.clear();
        }
        clone
    }

    /// Null the data of the call that is about to become history. Only
    /// COMPACT does this; MINIMAL drops the call outright and FULL keeps it.
    fn drop_values_on_current(&mut self) {
        if self.keep_trace == KeepTrace::Compact {
            if let Some(last) = self.calls.last_mut() {
                last.data = None;
            }
        }
    }

    fn prune_stack_states(&mut self) {
        if self.keep_trace == KeepTrace::Full {
            return;
        }
        let current = self.current_stack_height();
        let keep = mark_reachable(&self.stack_states, current);
        let mut flags = keep.into_iter();
        self.stack_states.retain(|_| flags.next().unwrap_or(false));
    }
}

/// Mark, per frame, whether it is reachable from `max_height`: frames above
/// the height are unreachable, and only the newest frame per height counts
/// (older ones at the same height are history).
fn mark_reachable(frames: &[StackState], max_height: usize) -> Vec<bool> {
    let mut keep = vec![false; frames.len()];
    let mut seen = HashSet::new();
    for (idx, frame) in frames.iter().enumerate().rev() {
        if frame.height > max_height {
            continue;
        }
        if seen.insert(frame.height) {
            keep[idx] = true;
        }
    }
    keep
}

impl fmt::Display for MatsTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MatsTrace [traceId={}] keep:{:?} nonPersistent:{} interactive:{}",
            self.trace_id, self.keep_trace, self.non_persistent, self.interactive
        )?;
        for (idx, call) in self.calls.iter().enumerate() {
            write!(f, "\n  {:2} {}", idx + 1, call)?;
        }
        for (idx, frame) in self.stack_states.iter().enumerate() {
            write!(
                f,
                "\n  state {:2} height={} state={}",
                idx,
                frame.height,
                frame.state.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}
