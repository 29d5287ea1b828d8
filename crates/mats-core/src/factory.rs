// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The factory: endpoint registry, initiators and lifecycle.
//!
//! All interaction starts here: build a factory over a broker and a
//! serializer, register endpoints, then `start()`. The registry is
//! per-factory; there are no process-wide singletons. `stop()` is a
//! cooperative drain with a grace budget, after which in-flight sessions
//! are forced closed.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mats_serial::{Channel, MatsSerializer, MatsSerializerJson};

use crate::broker::Broker;
use crate::config::FactoryConfig;
use crate::endpoint::{
    stage_id_for, EndpointDef, ProcessContext, SingleStage, StageDef, StageInvoker, TypedStage,
};
use crate::error::{MatsError, ProcessError, ProcessResult};
use crate::initiator::MatsInitiator;
use crate::pool::SessionPool;
use crate::stage::StageProcessor;
use crate::transaction::{ExternalResource, TransactionCoordinator};

/// Tracks how many processors this start expects and how many have entered
/// their consumer loop, for `wait_for_started`.
pub(crate) struct StartupTracker {
    expected: AtomicUsize,
    ready: AtomicUsize,
    notify: Notify,
}

impl StartupTracker {
    fn new() -> Self {
        Self {
            expected: AtomicUsize::new(0),
            ready: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn reset(&self) {
        self.expected.store(0, Ordering::SeqCst);
        self.ready.store(0, Ordering::SeqCst);
    }

    fn add_expected(&self, count: usize) {
        self.expected.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.ready.load(Ordering::SeqCst) >= self.expected.load(Ordering::SeqCst) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.ready.load(Ordering::SeqCst)
                    >= self.expected.load(Ordering::SeqCst);
            }
        }
    }
}

struct EndpointEntry {
    def: EndpointDef,
    running: AtomicBool,
}

pub(crate) struct FactoryInner {
    pub(crate) config: Arc<FactoryConfig>,
    pub(crate) serializer: Arc<dyn MatsSerializer>,
    pub(crate) pool: Arc<SessionPool>,
    pub(crate) coordinator: TransactionCoordinator,
    pub(crate) dropped_replies: Arc<AtomicU64>,
    pub(crate) startup: StartupTracker,
    endpoints: Mutex<Vec<Arc<EndpointEntry>>>,
    initiators: Mutex<Vec<Arc<MatsInitiator>>>,
    run_tx: watch::Sender<bool>,
    hold: AtomicBool,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Summary of a registered endpoint, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub endpoint_id: String,
    pub stage_ids: Vec<String>,
    pub subscription: bool,
}

/// Builder for a [`MatsFactory`].
pub struct MatsFactoryBuilder {
    config: Option<FactoryConfig>,
    broker: Option<Arc<dyn Broker>>,
    serializer: Option<Arc<dyn MatsSerializer>>,
    external: Option<Arc<dyn ExternalResource>>,
}

impl MatsFactoryBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            broker: None,
            serializer: None,
            external: None,
        }
    }

    pub fn config(mut self, config: FactoryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The broker to run over (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Override the envelope serializer. Default: [`MatsSerializerJson`].
    pub fn serializer(mut self, serializer: Arc<dyn MatsSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Bridge to an ambient transactional resource, committed before the
    /// broker on every processing cycle.
    pub fn external_resource(mut self, external: Arc<dyn ExternalResource>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn build(self) -> Result<MatsFactory, MatsError> {
        let broker = self
            .broker
            .ok_or_else(|| MatsError::Validation("broker is required".to_string()))?;
        let config = self
            .config
            .unwrap_or_else(|| FactoryConfig::new(String::new(), String::new()));
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(MatsSerializerJson::new()));
        let (run_tx, _) = watch::channel(false);
        Ok(MatsFactory {
            inner: Arc::new(FactoryInner {
                config: Arc::new(config),
                serializer,
                pool: SessionPool::new(broker),
                coordinator: TransactionCoordinator::new(self.external),
                dropped_replies: Arc::new(AtomicU64::new(0)),
                startup: StartupTracker::new(),
                endpoints: Mutex::new(Vec::new()),
                initiators: Mutex::new(Vec::new()),
                run_tx,
                hold: AtomicBool::new(false),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Default for MatsFactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The start point for all interaction with the runtime. Cheap to clone;
/// clones share the same registry and lifecycle.
#[derive(Clone)]
pub struct MatsFactory {
    inner: Arc<FactoryInner>,
}

impl MatsFactory {
    pub fn builder() -> MatsFactoryBuilder {
        MatsFactoryBuilder::new()
    }

    pub fn config(&self) -> &FactoryConfig {
        self.inner.config.as_ref()
    }

    /// Set up a multi-stage endpoint. Add stages in order with
    /// [`EndpointSetup::stage`], then seal with
    /// [`EndpointSetup::last_stage`] or [`EndpointSetup::finish_setup`].
    ///
    /// `R` is the endpoint's reply type and `S` the state type conveyed
    /// between its stages. Stage 0 receives a freshly constructed
    /// `S::default()` unless the initiation seeded a state.
    pub fn staged<R, S>(&self, endpoint_id: impl Into<String>) -> EndpointSetup<R, S> {
        EndpointSetup {
            factory: self.clone(),
            endpoint_id: endpoint_id.into(),
            subscription: false,
            endpoint_concurrency: None,
            stages: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Single-stage endpoint: no state, and the lambda's return value is
    /// the reply.
    pub fn single<R, I, F>(&self, endpoint_id: impl Into<String>, lambda: F)
    where
        R: Serialize + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        F: Fn(&mut ProcessContext<()>, I) -> Result<R, ProcessError> + Send + Sync + 'static,
    {
        let setup: EndpointSetup<R, ()> = self.staged(endpoint_id);
        setup
            .raw_stage(Arc::new(SingleStage::new(lambda)), None)
            .finish_setup();
    }

    /// Flow-terminating endpoint: receives the terminal message (typically
    /// a reply) together with the state supplied at initiation.
    pub fn terminator<S, I, F>(&self, endpoint_id: impl Into<String>, lambda: F)
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> ProcessResult + Send + Sync + 'static,
    {
        let setup: EndpointSetup<(), S> = self.staged(endpoint_id);
        setup
            .raw_stage(Arc::new(TypedStage::new(lambda)), None)
            .finish_setup();
    }

    /// Terminator bound to a topic instead of a queue: every live node
    /// running it receives each published message. Concurrency is always 1,
    /// and message loss during downtime is accepted semantics.
    pub fn subscription_terminator<S, I, F>(&self, endpoint_id: impl Into<String>, lambda: F)
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> ProcessResult + Send + Sync + 'static,
    {
        let mut setup: EndpointSetup<(), S> = self.staged(endpoint_id);
        setup.subscription = true;
        setup
            .raw_stage(Arc::new(TypedStage::new(lambda)), None)
            .finish_setup();
    }

    /// All registered endpoints.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .iter()
            .map(|entry| EndpointInfo {
                endpoint_id: entry.def.endpoint_id.clone(),
                stage_ids: entry
                    .def
                    .stages
                    .iter()
                    .map(|s| s.stage_id.clone())
                    .collect(),
                subscription: entry.def.subscription,
            })
            .collect()
    }

    /// Look up a registered endpoint by id.
    pub fn endpoint(&self, endpoint_id: &str) -> Option<EndpointInfo> {
        self.endpoints()
            .into_iter()
            .find(|info| info.endpoint_id == endpoint_id)
    }

    /// Get or create the default initiator (named `"default"`).
    pub fn default_initiator(&self) -> Arc<MatsInitiator> {
        self.initiator("default")
    }

    /// Get or create a named initiator. Initiators are long-lived and
    /// thread-safe; do not create one per message.
    pub fn initiator(&self, name: impl Into<String>) -> Arc<MatsInitiator> {
        let name = name.into();
        let mut initiators = self
            .inner
            .initiators
            .lock()
            .expect("initiator registry lock poisoned");
        if let Some(existing) = initiators.iter().find(|i| i.name() == name) {
            return Arc::clone(existing);
        }
        let initiator = Arc::new(MatsInitiator::new(name, Arc::downgrade(&self.inner)));
        initiators.push(Arc::clone(&initiator));
        initiator
    }

    /// All initiators created on this factory.
    pub fn initiators(&self) -> Vec<Arc<MatsInitiator>> {
        self.inner
            .initiators
            .lock()
            .expect("initiator registry lock poisoned")
            .clone()
    }

    /// Keep endpoints inert even after they are sealed, until `start()` is
    /// invoked on the factory. Use this when surrounding application
    /// components are wired up in an order you do not fully control, so no
    /// endpoint starts consuming before everything is ready.
    pub fn hold_endpoints_until_started(&self) {
        self.inner.hold.store(true, Ordering::SeqCst);
    }

    /// Start all registered endpoints' processors, clearing the hold flag.
    pub fn start(&self) {
        info!(factory = %self.inner.config.name, "starting factory");
        self.inner.hold.store(false, Ordering::SeqCst);
        self.inner.started.store(true, Ordering::SeqCst);
        self.inner.run_tx.send_replace(true);
        let entries: Vec<_> = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .clone();
        for entry in entries {
            self.spawn_endpoint(&entry);
        }
    }

    /// Block until every processor has acquired a session and entered its
    /// consumer loop, or the timeout elapses. Returns whether all made it.
    pub async fn wait_for_started(&self, timeout: Duration) -> bool {
        self.inner.startup.wait_all(timeout).await
    }

    /// Request a drain, wait up to the grace budget for the processor loops
    /// to finish, then force-close whatever is left. In-flight user lambdas
    /// are not interrupted; if they exceed the budget, the stop still
    /// returns, reporting `false` (non-clean).
    pub async fn stop(&self, graceful: Duration) -> bool {
        info!(factory = %self.inner.config.name, "stopping factory");
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.run_tx.send_replace(false);

        for initiator in self.initiators() {
            initiator.close();
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().expect("task list lock poisoned");
            guard.drain(..).collect()
        };

        let deadline = Instant::now() + graceful;
        let mut clean = true;
        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!("stage processor did not stop within the grace budget; aborting");
                task.abort();
                clean = false;
            }
        }

        self.inner.pool.shutdown().await;

        let entries = self
            .inner
            .endpoints
            .lock()
            .expect("endpoint registry lock poisoned")
            .clone();
        for entry in &entries {
            entry.running.store(false, Ordering::SeqCst);
        }
        self.inner.startup.reset();
        clean
    }

    /// Observable count of replies silently dropped because the
    /// return-address stack was empty.
    pub fn dropped_replies(&self) -> u64 {
        self.inner.dropped_replies.load(Ordering::Relaxed)
    }

    pub(crate) fn register_endpoint(&self, def: EndpointDef) {
        let entry = Arc::new(EndpointEntry {
            def,
            running: AtomicBool::new(false),
        });
        {
            let mut endpoints = self
                .inner
                .endpoints
                .lock()
                .expect("endpoint registry lock poisoned");
            if endpoints
                .iter()
                .any(|e| e.def.endpoint_id == entry.def.endpoint_id)
            {
                panic!(
                    "endpoint '{}' is already registered on this factory",
                    entry.def.endpoint_id
                );
            }
            endpoints.push(Arc::clone(&entry));
        }
        debug!(endpoint_id = %entry.def.endpoint_id, "endpoint registered");
        // A sealed endpoint on a started factory goes live immediately,
        // unless the hold flag keeps it inert until the next start().
        if self.inner.started.load(Ordering::SeqCst) && !self.inner.hold.load(Ordering::SeqCst) {
            self.spawn_endpoint(&entry);
        }
    }

    fn spawn_endpoint(&self, entry: &Arc<EndpointEntry>) {
        if entry.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for stage in &entry.def.stages {
            self.inner.startup.add_expected(stage.concurrency);
            for slot in 0..stage.concurrency {
                let handle = StageProcessor::spawn(
                    Arc::clone(stage),
                    slot,
                    Arc::clone(&self.inner),
                    self.inner.run_tx.subscribe(),
                );
                self.inner
                    .tasks
                    .lock()
                    .expect("task list lock poisoned")
                    .push(handle);
            }
        }
        debug!(endpoint_id = %entry.def.endpoint_id, "endpoint processors spawned");
    }
}

impl std::fmt::Debug for MatsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatsFactory")
            .field("name", &self.inner.config.name)
            .field("app_name", &self.inner.config.app_name)
            .field("endpoints", &self.endpoints().len())
            .finish()
    }
}

/// Delegating wrapper around a [`MatsFactory`] handle, for interposing
/// cross-cutting concerns. Compose by embedding; `Deref` forwards everything
/// not shadowed, and [`target`](Self::target) recovers the wrapped handle.
pub struct MatsFactoryWrapper {
    target: MatsFactory,
}

impl MatsFactoryWrapper {
    pub fn new(target: MatsFactory) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &MatsFactory {
        &self.target
    }

    pub fn into_target(self) -> MatsFactory {
        self.target
    }
}

impl std::ops::Deref for MatsFactoryWrapper {
    type Target = MatsFactory;

    fn deref(&self) -> &Self::Target {
        &self.target
    }
}

/// Unsealed endpoint under configuration: add stages in order, then seal.
///
/// `R` is the endpoint's reply type (documentation of intent; replies are
/// typed where they are emitted) and `S` the state conveyed between stages.
pub struct EndpointSetup<R, S> {
    factory: MatsFactory,
    endpoint_id: String,
    subscription: bool,
    endpoint_concurrency: Option<usize>,
    stages: Vec<(Arc<dyn StageInvoker>, Option<usize>)>,
    _marker: PhantomData<fn() -> (R, S)>,
}

impl<R, S> EndpointSetup<R, S> {
    /// Override the per-stage concurrency for every stage of this endpoint.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.endpoint_concurrency = Some(concurrency.max(1));
        self
    }

    /// Add the next stage. The first stage receives the incoming message of
    /// the endpoint; each subsequent stage receives the reply of the
    /// request made by its predecessor.
    pub fn stage<I, F>(self, lambda: F) -> Self
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> ProcessResult + Send + Sync + 'static,
    {
        self.raw_stage(Arc::new(TypedStage::new(lambda)), None)
    }

    /// Add the next stage with a stage-specific concurrency override.
    pub fn stage_with_concurrency<I, F>(self, concurrency: usize, lambda: F) -> Self
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> ProcessResult + Send + Sync + 'static,
    {
        self.raw_stage(Arc::new(TypedStage::new(lambda)), Some(concurrency.max(1)))
    }

    /// Add the final stage and seal the endpoint.
    pub fn last_stage<I, F>(self, lambda: F)
    where
        S: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        I: DeserializeOwned + Send + 'static,
        F: Fn(&mut ProcessContext<S>, I) -> ProcessResult + Send + Sync + 'static,
    {
        self.stage(lambda).finish_setup();
    }

    fn raw_stage(mut self, invoker: Arc<dyn StageInvoker>, concurrency: Option<usize>) -> Self {
        self.stages.push((invoker, concurrency));
        self
    }

    /// Seal the endpoint: no more stages can be added, and it is registered
    /// with the factory (going live immediately if the factory is started
    /// and not holding).
    ///
    /// # Panics
    ///
    /// Panics when no stage was added, or when the endpoint id is already
    /// registered.
    pub fn finish_setup(self) {
        assert!(
            !self.stages.is_empty(),
            "endpoint '{}' sealed without stages",
            self.endpoint_id
        );
        let factory = self.factory.clone();
        let config = &factory.inner.config;
        let stage_count = self.stages.len();
        let mut stages = Vec::with_capacity(stage_count);
        for (index, (invoker, stage_concurrency)) in self.stages.into_iter().enumerate() {
            let stage_id = stage_id_for(&self.endpoint_id, index);
            let next_stage_id = if index + 1 < stage_count {
                Some(stage_id_for(&self.endpoint_id, index + 1))
            } else {
                None
            };
            let concurrency = if self.subscription {
                1
            } else {
                stage_concurrency
                    .or(self.endpoint_concurrency)
                    .unwrap_or(config.concurrency)
            };
            let channel = if self.subscription {
                Channel::topic(&stage_id)
            } else {
                Channel::queue(&stage_id)
            };
            stages.push(Arc::new(StageDef {
                stage_id,
                next_stage_id,
                invoker,
                concurrency,
                destination: config.destination_for(&channel),
            }));
        }
        factory.register_endpoint(EndpointDef {
            endpoint_id: self.endpoint_id,
            subscription: self.subscription,
            stages,
        });
    }
}
