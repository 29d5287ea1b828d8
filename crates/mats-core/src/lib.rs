// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The message-flow engine: express services as multi-stage endpoints over
//! a transactional message broker.
//!
//! An endpoint is a chain of stages; every stage is an independent message
//! consumer that may reply, request another endpoint (pushing a
//! continuation onto the envelope's stack), pass sideways to its next
//! stage, publish to a topic, or terminate the flow. State flows opaquely
//! inside the envelope, replies return to the correct continuation, and
//! every processing cycle is bracketed by a best-effort 1-phase-commit
//! across the broker and an optional external resource.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mats_core::{FactoryConfig, MatsFactory};
//!
//! #[derive(serde::Serialize, serde::Deserialize, Default)]
//! struct State { seen: i64 }
//!
//! let factory = MatsFactory::builder()
//!     .config(FactoryConfig::new("OrderService", "1.0"))
//!     .broker(broker)
//!     .build()?;
//!
//! // A single-stage service: the return value is the reply.
//! factory.single("OrderService.double", |_ctx, n: i64| Ok(n * 2));
//!
//! // A two-stage endpoint with state.
//! factory
//!     .staged::<i64, State>("OrderService.addAndDouble")
//!     .stage(|ctx, n: i64| {
//!         ctx.state().seen = n;
//!         ctx.request("OrderService.double", &(n + 1))?;
//!         Ok(())
//!     })
//!     .last_stage(|ctx, doubled: i64| {
//!         let seen = ctx.state().seen;
//!         ctx.reply(&(doubled + seen))?;
//!         Ok(())
//!     });
//!
//! factory.start();
//! factory.wait_for_started(Duration::from_secs(5)).await;
//!
//! factory
//!     .default_initiator()
//!     .initiate(|init| {
//!         init.trace_id("web.placeOrder[cart:x1]q7a")
//!             .from("Web.placeOrder")
//!             .to("OrderService.addAndDouble")
//!             .reply_to("Web.terminator", &())?;
//!         init.request(&10)
//!     })
//!     .await?;
//! ```
//!
//! # Crate layout
//!
//! - [`broker`] - the port the engine drives the underlying broker through.
//! - [`pool`] - session/connection pooling with crash revocation.
//! - [`transaction`] - the best-effort 1PC coordinator and the external
//!   resource bridge port.
//! - `stage` - the per-slot consumer loops.
//! - [`FactoryConfig`] - naming, keys and concurrency defaults.
//!
//! The wire envelope itself lives in `mats-serial` and is re-exported here.

pub mod broker;
mod config;
mod endpoint;
mod error;
mod factory;
mod initiator;
pub mod pool;
mod stage;
pub mod transaction;

pub use config::{ConfigError, FactoryConfig, TRACE_ID_HEADER};
pub use endpoint::ProcessContext;
pub use error::{MatsError, ProcessError, ProcessResult, Result};
pub use factory::{
    EndpointInfo, EndpointSetup, MatsFactory, MatsFactoryBuilder, MatsFactoryWrapper,
};
pub use initiator::{InitiateBuilder, MatsInitiator};

// The envelope is part of the public surface: stages can inspect it and
// tests assert on it.
pub use mats_serial::{
    Call, CallType, Channel, KeepTrace, MatsSerializer, MatsSerializerJson, MatsTrace,
    MessagingModel, SerializationError, StackState,
};
