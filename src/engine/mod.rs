//! Engine assembly and lifecycle.
//!
//! [`EngineBuilder`] wires the store, directory, templates, transports and
//! event sinks into a [`Dispatcher`]. Anything not supplied explicitly is
//! built from [`Settings`]. [`Engine::start`] launches the background tasks
//! and recovers jobs left by a previous run; [`Engine::shutdown`] stops them
//! in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::dispatch::{
    Dispatcher, DispatcherConfig, DispatcherStatsSnapshot, DrainReport, RecoveryReport,
};
use crate::error::{EngineError, SubmitError};
use crate::events::{DeliveryEvent, EventBus, EventSink};
use crate::notification::{
    DeliveryRecord, JobId, NotificationId, NotificationReport, NotificationRequest,
    NotificationStatus,
};
use crate::recipient::{InMemoryDirectory, RecipientDirectory, RecipientResolver};
use crate::retry::RetryScheduler;
use crate::shutdown::{GracefulShutdown, ShutdownResult};
use crate::template::{create_template_store, TemplateStore};
use crate::tracker::{connect_delivery_store, DeliveryStore, DeliveryTracker};
use crate::transport::{build_registry, TransportRegistry};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    settings: Settings,
    store: Option<Arc<dyn DeliveryStore>>,
    directory: Option<Arc<dyn RecipientDirectory>>,
    templates: Option<Arc<TemplateStore>>,
    transports: Option<TransportRegistry>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
            directory: None,
            templates: None,
            transports: None,
            sinks: Vec::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn templates(mut self, templates: Arc<TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Add an event sink next to the built-in tracing and broadcast sinks.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build the engine. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<Engine, EngineError> {
        let settings = self.settings;
        settings.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => connect_delivery_store(&settings).await,
        };

        let directory: Arc<dyn RecipientDirectory> = match self.directory {
            Some(directory) => directory,
            None => match &settings.directory.seed_file {
                Some(path) => Arc::new(InMemoryDirectory::load_seed_file(path)?),
                None => Arc::new(InMemoryDirectory::new()),
            },
        };

        let templates = match self.templates {
            Some(templates) => templates,
            None => {
                let templates = create_template_store();
                if let Some(path) = &settings.templates.seed_file {
                    templates.load_seed_file(path)?;
                }
                templates
            }
        };

        let transports = self.transports.unwrap_or_else(|| {
            build_registry(&settings.transports, settings.dispatch.send_timeout())
        });
        if transports.kinds().is_empty() {
            tracing::warn!("No channel transports configured, every job will fail permanently");
        }

        let events = EventBus::with_sinks(&settings.events, self.sinks);
        let tracker = DeliveryTracker::new(store, events.clone());
        let scheduler = Arc::new(RetryScheduler::new());

        let dispatcher = Dispatcher::new(
            DispatcherConfig::from_settings(&settings),
            tracker,
            templates,
            RecipientResolver::new(directory),
            Arc::new(transports),
            scheduler,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            store = dispatcher.tracker().backend_name(),
            max_attempts = settings.dispatch.max_attempts,
            send_timeout_ms = settings.dispatch.send_timeout_ms,
            "Delivery engine built"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                dispatcher,
                events,
                shutdown_tx,
                reconcile_interval: Duration::from_secs(
                    settings.recovery.reconcile_interval_seconds.max(1),
                ),
                started: AtomicBool::new(false),
                tasks: Mutex::new(EngineTasks::default()),
            }),
        })
    }
}

#[derive(Default)]
struct EngineTasks {
    dispatch: Option<JoinHandle<DrainReport>>,
    background: Vec<JoinHandle<()>>,
}

struct EngineInner {
    dispatcher: Dispatcher,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    reconcile_interval: Duration,
    started: AtomicBool,
    tasks: Mutex<EngineTasks>,
}

/// A running delivery engine. Cloning is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    pub async fn from_settings(settings: Settings) -> Result<Self, EngineError> {
        EngineBuilder::new(settings).build().await
    }

    /// Start the dispatch loop, retry scheduler and reconciler, then
    /// recover jobs left by a previous run.
    pub async fn start(&self) -> Result<RecoveryReport, EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Internal("engine already started".into()));
        }

        let dispatcher = &self.inner.dispatcher;
        let dispatch = dispatcher
            .start(self.inner.shutdown_tx.subscribe())
            .ok_or_else(|| EngineError::Internal("dispatch loop already running".into()))?;

        let scheduler = dispatcher
            .scheduler()
            .start(dispatcher.work_sender(), self.inner.shutdown_tx.subscribe());
        let reconciler = dispatcher
            .start_reconciler(self.inner.reconcile_interval, self.inner.shutdown_tx.subscribe());

        {
            let mut tasks = self.lock_tasks();
            tasks.dispatch = Some(dispatch);
            tasks.background.push(scheduler);
            tasks.background.push(reconciler);
        }

        let report = dispatcher.recover().await?;
        tracing::info!("Delivery engine started");
        Ok(report)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, EngineTasks> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn submit(&self, request: NotificationRequest) -> Result<NotificationId, SubmitError> {
        self.inner.dispatcher.submit(request).await
    }

    pub async fn status(&self, id: &NotificationId) -> Result<NotificationStatus, EngineError> {
        self.inner.dispatcher.status(id).await
    }

    pub async fn report(&self, id: &NotificationId) -> Result<NotificationReport, EngineError> {
        self.inner.dispatcher.report(id).await
    }

    pub async fn records(&self, job_id: JobId) -> Result<Vec<DeliveryRecord>, EngineError> {
        self.inner.dispatcher.records(job_id).await
    }

    pub async fn cancel(&self, id: &NotificationId) -> Result<NotificationStatus, EngineError> {
        self.inner.dispatcher.cancel(id).await
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.inner.dispatcher.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    /// Signal every background task to stop and wait for the scheduler and
    /// reconciler. Returns the number of retries still scheduled.
    pub(crate) async fn stop_background(&self) -> usize {
        let _ = self.inner.shutdown_tx.send(());
        let handles = std::mem::take(&mut self.lock_tasks().background);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task failed");
            }
        }
        self.inner.dispatcher.scheduler().len()
    }

    /// Wait for the dispatch loop to drain.
    pub(crate) async fn drain(&self) -> DrainReport {
        let handle = self.lock_tasks().dispatch.take();
        match handle {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Dispatch loop failed");
                DrainReport::default()
            }),
            None => DrainReport::default(),
        }
    }

    pub(crate) async fn flush_events(&self) {
        self.inner.events.shutdown().await;
    }

    /// Stop the engine. See [`GracefulShutdown`] for the phases.
    pub async fn shutdown(&self) -> ShutdownResult {
        GracefulShutdown::new(self.clone()).execute("engine shutdown").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{ChannelKind, JobState};
    use crate::recipient::RecipientProfile;
    use crate::template::{Template, TemplateVariant};
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_build_from_default_settings() {
        let engine = Engine::from_settings(Settings::default()).await.unwrap();
        assert_eq!(engine.dispatcher().tracker().backend_name(), "memory");
        assert_eq!(engine.stats(), DispatcherStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_build_rejects_http_channel_without_endpoint() {
        let mut settings = Settings::default();
        settings.transports.sms.mode = crate::config::TransportMode::Http;
        let result = Engine::from_settings(settings).await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = Engine::from_settings(Settings::default()).await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        let result = engine.shutdown().await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_submit_and_deliver() {
        let templates = create_template_store();
        templates
            .create(
                Template::new("ping", "Ping", "en")
                    .with_variant(TemplateVariant::new(ChannelKind::Sms, "en", "ping {{n}}")),
            )
            .unwrap();
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .upsert_profile(RecipientProfile::new("alice").with_address(ChannelKind::Sms, "+100"))
            .unwrap();
        let sms = Arc::new(MemoryTransport::new(ChannelKind::Sms));

        let engine = Engine::builder(Settings::default())
            .templates(templates)
            .directory(directory)
            .transports(TransportRegistry::new(Duration::from_secs(1)).with_transport(sms.clone(), 4))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let id = engine
            .submit(
                NotificationRequest::builder("ping-1", "ping")
                    .to_user("alice")
                    .channel(ChannelKind::Sms)
                    .payload(serde_json::json!({"n": 1}))
                    .build(),
            )
            .await
            .unwrap();

        let mut status = engine.status(&id).await.unwrap();
        for _ in 0..100 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.status(&id).await.unwrap();
        }
        assert_eq!(status, NotificationStatus::Delivered);
        assert_eq!(sms.sent()[0].content.body, "ping 1");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_waiting_for_a_send_slot_stay_pending() {
        let templates = create_template_store();
        templates
            .create(
                Template::new("ping", "Ping", "en")
                    .with_variant(TemplateVariant::new(ChannelKind::Sms, "en", "ping")),
            )
            .unwrap();
        let directory = Arc::new(InMemoryDirectory::new());
        for (id, number) in [("alice", "+100"), ("bob", "+200")] {
            directory
                .upsert_profile(RecipientProfile::new(id).with_address(ChannelKind::Sms, number))
                .unwrap();
        }
        let sms = Arc::new(MemoryTransport::new(ChannelKind::Sms).with_delay(Duration::from_millis(300)));

        let engine = Engine::builder(Settings::default())
            .templates(templates)
            .directory(directory)
            .transports(TransportRegistry::new(Duration::from_secs(2)).with_transport(sms.clone(), 1))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let id = engine
            .submit(
                NotificationRequest::builder("slots-1", "ping")
                    .to_users(["alice", "bob"])
                    .channel(ChannelKind::Sms)
                    .build(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let states: Vec<JobState> = engine
            .report(&id)
            .await
            .unwrap()
            .jobs
            .iter()
            .map(|j| j.state)
            .collect();
        assert_eq!(states.iter().filter(|s| **s == JobState::InFlight).count(), 1);
        assert_eq!(states.iter().filter(|s| **s == JobState::Pending).count(), 1);

        let mut status = engine.status(&id).await.unwrap();
        for _ in 0..200 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.status(&id).await.unwrap();
        }
        assert_eq!(status, NotificationStatus::Delivered);
        assert!(sms.max_concurrent() <= 1);

        engine.shutdown().await;
    }
}
