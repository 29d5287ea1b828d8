// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire envelope and serialization layer for the mats messaging runtime.
//!
//! This crate defines the protocol that flows carry between stages:
//!
//! - [`MatsTrace`] — the per-flow envelope: call history, the return-address
//!   stack, state frames, sticky trace properties and initiator metadata.
//!   Its `add_*_call` methods are the pure flow-semantics transitions; each
//!   produces a new envelope and never mutates the source.
//! - [`MatsSerializer`] — the port that turns envelopes into bytes and back,
//!   together with the `meta` echo contract and optional compression.
//!   [`MatsSerializerJson`] is the bundled implementation.
//!
//! It deliberately knows nothing about brokers, sessions or transactions;
//! those live in `mats-core`.

mod serializer;
mod trace;

pub use serializer::{
    deserialize_object, serialize_object, DeserializedTrace, MatsSerializer, MatsSerializerJson,
    SerializationError, SerializedTrace, META_DEFLATE, META_KEY_POSTFIX, META_PLAIN,
};
pub use trace::{
    Call, CallType, Channel, KeepTrace, MatsTrace, MessagingModel, StackState, TraceError,
};
