//! runtime.rs
//! Composition root: one instance of every component, wired once.
//!
//! - `Pipeline::start` builds the resolver, tracker, metrics and scheduler
//!   around host-provided store, transport and device state, then spawns
//!   the scheduler task.
//! - Lifecycle triggers (foreground, background, device and server-control
//!   changes) are methods here; nothing is reachable through globals.
//! - `shutdown` stops the scheduler, cancels retry waits and gives in-flight
//!   batches a bounded grace period.

use std::{sync::Arc, time::Duration};

use crossbeam::channel::Receiver;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};

use crate::config::PipelineConfig;
use crate::controls::{
    bus::{PolicyBus, PolicyEvent},
    device::DeviceStateProvider,
    policy::{ControlPolicy, PolicyStore},
    resolver::ControlPolicyResolver,
    server::{HttpServerPolicySource, ServerPolicySource},
};
use crate::error::{PipelineError, StoreResult};
use crate::pipeline::{
    event::{Event, LocalId},
    in_flight::InFlightTracker,
    scheduler::{BatchScheduler, SchedulerHandle},
    store::EventStore,
    transport::Transport,
    worker::WorkerContext,
};
use crate::utils::metrics::TransmissionMetrics;

/// Host-provided collaborators.
pub struct PipelineDeps {
    pub events: Arc<dyn EventStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub transport: Arc<dyn Transport>,
    pub device: Arc<dyn DeviceStateProvider>,
    /// Defaults to `HttpServerPolicySource` over `transport`.
    pub server: Option<Arc<dyn ServerPolicySource>>,
}

impl PipelineDeps {
    /// One store serving both events and the persisted policy.
    pub fn new<S>(store: Arc<S>, transport: Arc<dyn Transport>, device: Arc<dyn DeviceStateProvider>) -> Self
    where
        S: EventStore + PolicyStore + 'static,
    {
        Self {
            events: store.clone(),
            policies: store,
            transport,
            device,
            server: None,
        }
    }

    pub fn with_server_source(mut self, server: Arc<dyn ServerPolicySource>) -> Self {
        self.server = Some(server);
        self
    }
}

pub struct Pipeline {
    user_id: String,
    background_allowance: Duration,
    shutdown_grace: Duration,
    events: Arc<dyn EventStore>,
    device: Arc<dyn DeviceStateProvider>,
    server: Arc<dyn ServerPolicySource>,
    resolver: Arc<ControlPolicyResolver>,
    in_flight: Arc<InFlightTracker>,
    metrics: Arc<TransmissionMetrics>,
    scheduler: SchedulerHandle,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Pipeline {
    /// Wires all components and starts the scheduler. Must run inside a tokio runtime.
    pub fn start(config: &PipelineConfig, deps: PipelineDeps) -> Result<Self, PipelineError> {
        config.validate()?;
        if Handle::try_current().is_err() {
            return Err(PipelineError::NoRuntime);
        }

        let metrics = Arc::new(TransmissionMetrics::default());
        let in_flight = Arc::new(InFlightTracker::new());
        let bus = Arc::new(PolicyBus::new(config.controls.bus_capacity));
        let headers = config.headers();

        let server: Arc<dyn ServerPolicySource> = match deps.server {
            Some(server) => server,
            None => Arc::new(HttpServerPolicySource::new(
                deps.transport.clone(),
                headers.clone(),
                config.transport.controls_path.clone(),
                config.controls.passive_displacement_m,
            )),
        };

        let resolver = ControlPolicyResolver::new(
            config.presets(),
            deps.device.clone(),
            deps.policies,
            bus,
            metrics.clone(),
        );
        // First resolution installs unconditionally unless a live policy was restored.
        resolver.resolve();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = WorkerContext {
            store: deps.events.clone(),
            transport: deps.transport,
            in_flight: in_flight.clone(),
            device: deps.device.clone(),
            metrics: metrics.clone(),
            headers,
            events_path: config.transport.events_path.clone(),
            retry: config.retry(),
            shutdown: shutdown_rx,
        };
        let (scheduler, handle) = BatchScheduler::new(ctx, resolver.watch());
        let scheduler_task = scheduler.spawn();

        info!(
            "[Pipeline] started for user {} (policy {:?}, interval {}s)",
            config.identity.user_id,
            resolver.current().origin,
            resolver.current().batch_interval_secs
        );

        Ok(Self {
            user_id: config.identity.user_id.clone(),
            background_allowance: config.background_allowance(),
            shutdown_grace: config.shutdown_grace(),
            events: deps.events,
            device: deps.device,
            server,
            resolver,
            in_flight,
            metrics,
            scheduler: handle,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            shutdown_tx,
        })
    }

    // ========================================================================
    // Lifecycle triggers
    // ========================================================================

    /// App came to the foreground: flush now.
    pub fn on_foreground(&self) -> bool {
        self.scheduler.flush_now()
    }

    /// App is backgrounding: flush, then wait up to the allowance for every
    /// in-flight batch to finish. Returns whether the set drained in time.
    pub async fn on_background(&self) -> bool {
        if self.scheduler.flush().await.is_none() {
            warn!("[Pipeline] background flush requested after shutdown");
        }
        match tokio::time::timeout(self.background_allowance, self.in_flight.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "[Pipeline] {} event(s) still in flight after {:?} background allowance",
                    self.in_flight.len(),
                    self.background_allowance
                );
                false
            }
        }
    }

    /// Power or connectivity changed.
    pub fn on_device_state_changed(&self) -> ControlPolicy {
        self.resolver.resolve_with(&self.device.snapshot(), None)
    }

    /// Pulls the server's policy for this user, then flushes whatever the
    /// outcome. A fetch failure keeps the local policy; "no policy" falls
    /// back to local resolution.
    pub async fn on_server_controls_refreshed(&self) -> ControlPolicy {
        let policy = match self.server.fetch_server_policy(&self.user_id).await {
            Ok(Some(policy)) => self.resolver.apply_server_policy(policy),
            Ok(None) => self.resolver.resolve(),
            Err(e) => {
                warn!("[Pipeline] fetching server controls failed: {}", e);
                self.resolver.current()
            }
        };
        if !self.scheduler.flush_now() {
            warn!("[Pipeline] server controls refreshed after shutdown");
        }
        policy
    }

    /// Host override, e.g. while a live-tracking view is open.
    pub fn force_policy(&self, policy: ControlPolicy) -> ControlPolicy {
        self.resolver.force(policy)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Persists a sensor event so the next tick picks it up.
    pub fn record_event(&self, event: &Event) -> StoreResult<LocalId> {
        self.events.persist_event(event)
    }

    pub fn current_policy(&self) -> ControlPolicy {
        self.resolver.current()
    }

    /// Policy-change notifications, e.g. for the location producer's displacement filter.
    pub fn subscribe_policy(&self) -> Receiver<PolicyEvent> {
        self.resolver.bus().subscribe()
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<TransmissionMetrics> {
        &self.metrics
    }

    pub fn in_flight(&self) -> &Arc<InFlightTracker> {
        &self.in_flight
    }

    pub fn pending_count(&self) -> StoreResult<usize> {
        Ok(self.events.read_all_pending()?.len())
    }

    /// Stops the scheduler and cancels retry waits. Returns whether every
    /// in-flight batch finished within the grace period.
    pub async fn shutdown(&self) -> bool {
        info!("[Pipeline] shutting down");
        self.shutdown_tx.send_replace(true);

        let task = self.scheduler_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[Pipeline] scheduler task ended abnormally: {}", e);
            }
        }

        let drained = tokio::time::timeout(self.shutdown_grace, self.in_flight.wait_idle())
            .await
            .is_ok();
        if !drained {
            warn!("[Pipeline] {} event(s) still in flight at shutdown", self.in_flight.len());
        }
        drained
    }
}
