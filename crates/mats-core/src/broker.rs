// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The broker port.
//!
//! The engine talks to the underlying message broker exclusively through
//! these traits. Required capabilities: transactional send and receive on
//! queues, publish/subscribe on topics, per-message persistent and priority
//! flags, a map-keyed message body (the envelope lives under a configurable
//! key) and string headers for the trace id.
//!
//! A [`BrokerSession`] is owned by exactly one task at a time. Sessions
//! carved from the same [`BrokerConnection`] share its fate: when one of
//! them crashes, the connection is considered broken and all siblings must
//! come home (see `pool`).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Whether a destination is a queue or a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A fully resolved broker destination (prefix already applied).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
        };
        write!(f, "{}:{}", kind, self.name)
    }
}

/// A value in the map-keyed message body.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyValue {
    Bytes(Bytes),
    String(String),
}

impl BodyValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BodyValue::Bytes(b) => Some(b),
            BodyValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BodyValue::String(s) => Some(s),
            BodyValue::Bytes(_) => None,
        }
    }
}

/// A broker message: string headers, a map-keyed body, and the two
/// per-message broker hints.
#[derive(Debug, Clone, Default)]
pub struct MatsMessage {
    pub headers: HashMap<String, String>,
    pub body: HashMap<String, BodyValue>,
    /// Hint to the broker to skip the durable write.
    pub non_persistent: bool,
    /// Priority hint: a human is waiting for the result of this flow.
    pub interactive: bool,
}

impl MatsMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.body.insert(key.into(), BodyValue::Bytes(value.into()));
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.body
            .insert(key.into(), BodyValue::String(value.into()));
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.body.get(key).and_then(BodyValue::as_bytes)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(BodyValue::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Errors raised by a broker implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),

    #[error("session closed")]
    SessionClosed,

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("rollback failed: {0}")]
    Rollback(String),
}

/// Entry point to a broker implementation.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new physical connection.
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;

    /// When this broker is a delegating wrapper, returns it as such.
    /// See [`unwrap_broker`].
    fn as_wrapper(&self) -> Option<&dyn BrokerWrapper> {
        None
    }
}

/// A physical broker connection from which sessions are carved.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, BrokerError>;

    async fn close(&self);
}

/// A single-owner transactional session.
///
/// `send` buffers into the session transaction; nothing becomes visible to
/// consumers until `commit`. `receive` hands out one message at a time;
/// `rollback` (or `close` with an uncommitted receive) makes it eligible
/// for redelivery.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Bind this session's consumer to a destination. Must be called before
    /// `receive`.
    async fn subscribe(&mut self, destination: &Destination) -> Result<(), BrokerError>;

    /// Block until a message arrives. Returns `Ok(None)` when the session
    /// (or its connection) has been closed.
    async fn receive(&mut self) -> Result<Option<MatsMessage>, BrokerError>;

    async fn send(&mut self, destination: &Destination, message: MatsMessage)
        -> Result<(), BrokerError>;

    async fn commit(&mut self) -> Result<(), BrokerError>;

    async fn rollback(&mut self) -> Result<(), BrokerError>;

    /// Pre-commit liveness probe: `false` means the underlying connection
    /// is suspect, and the caller must roll back and reacquire.
    async fn is_active(&self) -> bool;

    /// Physically close the session. Uncommitted work is rolled back.
    async fn close(&mut self);
}

/// Delegating broker wrapper, for interposing cross-cutting concerns
/// (logging, metrics, chaos) around a broker implementation.
pub trait BrokerWrapper: Broker {
    /// The wrapped broker.
    fn target(&self) -> &dyn Broker;
}

/// Unwrap a (possibly multiply) wrapped broker to the innermost instance.
pub fn unwrap_broker(broker: &dyn Broker) -> &dyn Broker {
    let mut current = broker;
    while let Some(wrapper) = current.as_wrapper() {
        current = wrapper.target();
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBroker;

    #[async_trait]
    impl Broker for NullBroker {
        async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            Err(BrokerError::Connect("null".into()))
        }
    }

    struct PassThrough {
        target: Box<dyn Broker>,
    }

    #[async_trait]
    impl Broker for PassThrough {
        async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            self.target.connect().await
        }

        fn as_wrapper(&self) -> Option<&dyn BrokerWrapper> {
            Some(self)
        }
    }

    impl BrokerWrapper for PassThrough {
        fn target(&self) -> &dyn Broker {
            self.target.as_ref()
        }
    }

    #[test]
    fn test_unwrap_broker_recurses_to_innermost() {
        let wrapped = PassThrough {
            target: Box::new(PassThrough {
                target: Box::new(NullBroker),
            }),
        };
        let innermost = unwrap_broker(&wrapped);
        assert!(innermost.as_wrapper().is_none());
    }

    #[test]
    fn test_message_body_accessors() {
        let mut msg = MatsMessage::new();
        msg.put_bytes("bin", vec![1, 2, 3]);
        msg.put_string("txt", "hello");
        assert_eq!(msg.bytes("bin"), Some(&[1u8, 2, 3][..]));
        assert_eq!(msg.string("txt"), Some("hello"));
        assert_eq!(msg.bytes("txt"), None);
        assert_eq!(msg.string("missing"), None);
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::queue("mats.a").to_string(), "queue:mats.a");
        assert_eq!(Destination::topic("mats.t").to_string(), "topic:mats.t");
    }
}
