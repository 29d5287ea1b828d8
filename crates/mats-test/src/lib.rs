// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test harness for the mats runtime.
//!
//! [`MatsTestHarness`] bundles an in-memory broker with a configured
//! factory, so a test sets up endpoints, starts the factory and drives
//! flows with a few lines. [`TestLatch`] is the usual flow endpoint in
//! tests: a terminator that captures the terminal (state, message,
//! envelope) triple and hands it to the awaiting test.
//!
//! ```ignore
//! let harness = MatsTestHarness::new();
//! harness.factory().single("svc.double", |_ctx, n: i64| Ok(n * 2));
//! let latch = harness.latch::<(), i64>("test.terminator");
//! harness.start().await;
//!
//! harness.factory().default_initiator().initiate(|init| {
//!     init.trace_id("t1").from("test").to("svc.double").reply_to("test.terminator", &())?;
//!     init.request(&21)
//! }).await?;
//!
//! let result = latch.wait_expect(Duration::from_secs(5)).await;
//! assert_eq!(result.message, 42);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use mats_core::transaction::{ExternalResource, ExternalResourceError};
use mats_core::{FactoryConfig, MatsFactory, MatsTrace, ProcessContext};
use mats_inmem::InMemoryBroker;

/// Default grace budget used by [`MatsTestHarness::stop`].
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Default budget for [`MatsTestHarness::start`] to see all processors up.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory broker plus a factory configured for tests.
pub struct MatsTestHarness {
    broker: Arc<InMemoryBroker>,
    factory: MatsFactory,
}

impl MatsTestHarness {
    /// Fresh harness with its own broker and a small-concurrency test
    /// configuration.
    pub fn new() -> Self {
        Self::with_config(Self::test_config())
    }

    /// Fresh harness with its own broker and the given configuration.
    pub fn with_config(config: FactoryConfig) -> Self {
        Self::assemble(InMemoryBroker::new(), config, None)
    }

    /// Harness on a shared broker, for multi-"process" tests: factories on
    /// the same broker instance can exchange messages.
    pub fn with_broker(broker: Arc<InMemoryBroker>) -> Self {
        Self::assemble(broker, Self::test_config(), None)
    }

    /// Full control: broker, configuration and an optional external
    /// resource bridge.
    pub fn assemble(
        broker: Arc<InMemoryBroker>,
        config: FactoryConfig,
        external: Option<Arc<dyn ExternalResource>>,
    ) -> Self {
        let broker_port: Arc<dyn mats_core::broker::Broker> = broker.clone();
        let mut builder = MatsFactory::builder().config(config).broker(broker_port);
        if let Some(external) = external {
            builder = builder.external_resource(external);
        }
        let factory = builder.build().expect("harness factory construction");
        Self { broker, factory }
    }

    /// The configuration tests run with: identifiable app identity and a
    /// concurrency of 2 per stage.
    pub fn test_config() -> FactoryConfig {
        FactoryConfig::new("MatsTest", "test")
            .with_nodename("test-node")
            .with_concurrency(2)
    }

    pub fn factory(&self) -> &MatsFactory {
        &self.factory
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    /// Start the factory and wait for every processor to enter its loop.
    pub async fn start(&self) -> bool {
        self.factory.start();
        self.factory.wait_for_started(START_TIMEOUT).await
    }

    /// Stop the factory with the default grace budget; returns whether the
    /// stop was clean.
    pub async fn stop(&self) -> bool {
        self.factory.stop(STOP_GRACE).await
    }

    /// Register a terminator that captures each terminal result for the
    /// test to await.
    pub fn latch<S, I>(&self, endpoint_id: &str) -> TestLatch<S, I>
    where
        S: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.factory.terminator(endpoint_id, move |ctx: &mut ProcessContext<S>, incoming: I| {
            // The test side may have gone away; that is fine.
            let _ = tx.send(LatchResult {
                state: ctx.state().clone(),
                message: incoming,
                trace: ctx.trace().clone(),
            });
            Ok(())
        });
        TestLatch {
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Like [`latch`](Self::latch), but bound to a topic: the harness's
    /// flow endpoint is a subscription terminator.
    pub fn subscription_latch<S, I>(&self, endpoint_id: &str) -> TestLatch<S, I>
    where
        S: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.factory
            .subscription_terminator(endpoint_id, move |ctx: &mut ProcessContext<S>, incoming: I| {
                let _ = tx.send(LatchResult {
                    state: ctx.state().clone(),
                    message: incoming,
                    trace: ctx.trace().clone(),
                });
                Ok(())
            });
        TestLatch {
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl Default for MatsTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// What a latch terminator captured for one flow.
pub struct LatchResult<S, I> {
    /// The state the terminator received (the reply-state supplied at
    /// initiation, or the default).
    pub state: S,
    /// The terminal incoming message, typically the flow's final reply.
    pub message: I,
    /// The envelope as seen by the terminator.
    pub trace: MatsTrace,
}

/// Awaitable capture of a flow's terminal result. One latch can capture
/// multiple flows; each [`wait`](Self::wait) takes the next one.
pub struct TestLatch<S, I> {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LatchResult<S, I>>>,
}

impl<S, I> TestLatch<S, I> {
    /// Wait up to `timeout` for the next captured result.
    pub async fn wait(&self, timeout: Duration) -> Option<LatchResult<S, I>> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Wait for the next captured result, panicking on timeout.
    pub async fn wait_expect(&self, timeout: Duration) -> LatchResult<S, I> {
        self.wait(timeout)
            .await
            .expect("latch did not trigger within the timeout")
    }

    /// Assert that nothing arrives within `window`.
    pub async fn expect_nothing(&self, window: Duration) {
        assert!(
            self.wait(window).await.is_none(),
            "latch unexpectedly received a message"
        );
    }
}

/// External resource stub that counts transaction demarcations and can be
/// told to fail, for exercising the commit protocol.
#[derive(Default)]
pub struct RecordingExternalResource {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_commit: AtomicBool,
}

impl RecordingExternalResource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Make every following commit fail until cleared.
    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalResource for RecordingExternalResource {
    async fn begin(&self) -> Result<(), ExternalResourceError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), ExternalResourceError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(ExternalResourceError("induced commit failure".to_string()));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ExternalResourceError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Initialise tracing for tests, once per process. Honors `RUST_LOG`,
/// defaulting to `info`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
