/*!
 * Motor context.
 *
 * [`MotorContext`] builds the notification bus, the scheduler, the router, the
 * registry and discovery in that order and runs the dispatcher that feeds
 * transport events and fired timers into the registry. Shutdown happens in
 * reverse order.
 */
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use motorlink_core::config::Config;
use motorlink_core::event::{Notification, NotificationBus};
use motorlink_core::logging::component_span;
use motorlink_core::types::DeviceId;
use motorlink_core::utils::spawn_and_log;

use crate::codec::{BasicCodec, Codec};
use crate::discovery::{DeviceDiscovery, DiscoveryReport};
use crate::error::{ErrorCode, Result};
use crate::link::LinkProvider;
use crate::persist::{JsonFileStore, ParamStore};
use crate::registry::MotorRegistry;
use crate::router::DeviceRouter;
use crate::scheduler::{Scheduler, TimerKey};
use crate::transport::TransportEvent;

/// Everything needed to talk to a fleet of motors
#[derive(Debug)]
pub struct MotorContext {
    config: Config,
    bus: NotificationBus,
    scheduler: Scheduler,
    router: Arc<DeviceRouter>,
    registry: Arc<MotorRegistry>,
    discovery: Arc<DeviceDiscovery>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MotorContext {
    /// Build the context and start the dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Config,
        provider: Arc<dyn LinkProvider>,
        codec: Arc<dyn Codec>,
        store: Arc<dyn ParamStore>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = NotificationBus::new();
        let (scheduler, fired) = Scheduler::start();
        let (router, events) =
            DeviceRouter::new(provider, config.link.response_timeout(), bus.clone());
        let router = Arc::new(router);
        let registry = Arc::new(MotorRegistry::new(
            router.clone(),
            codec.clone(),
            store,
            scheduler.clone(),
            bus.clone(),
            config.motor.clone(),
        ));
        let discovery = Arc::new(DeviceDiscovery::new(
            router.clone(),
            registry.clone(),
            codec.clone(),
            scheduler.clone(),
            bus.clone(),
            config.discovery.clone(),
            config.link.baud_rate,
        ));

        let (stop_tx, stop_rx) = oneshot::channel();
        let dispatcher = Dispatcher {
            registry: registry.clone(),
            codec,
            bus: bus.clone(),
        };
        let handle = spawn_and_log(
            "dispatcher",
            dispatcher
                .run(events, fired, stop_rx)
                .instrument(component_span("dispatcher", None)),
        );

        info!("Motor context for {} started", config.general.app_name);
        Ok(Self {
            config,
            bus,
            scheduler,
            router,
            registry,
            discovery,
            stop: Mutex::new(Some(stop_tx)),
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Build the context with [`BasicCodec`] and JSON files under the
    /// configured params directory
    pub fn with_defaults(config: Config, provider: Arc<dyn LinkProvider>) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(&config.motor.params_dir));
        Self::start(config, provider, Arc::new(BasicCodec::new()), store)
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Notification bus
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Subscribe to notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    /// Shared scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Device router
    pub fn router(&self) -> &Arc<DeviceRouter> {
        &self.router
    }

    /// Motor registry
    pub fn registry(&self) -> &Arc<MotorRegistry> {
        &self.registry
    }

    /// Device discovery
    pub fn discovery(&self) -> &Arc<DeviceDiscovery> {
        &self.discovery
    }

    /// Run a discovery pass
    pub async fn start_recognize(&self, retry: bool) -> Result<DiscoveryReport> {
        self.discovery.start_recognize(retry).await
    }

    /// Drop every link whose port vanished and take its motors offline
    pub async fn remove_unavailable_links(&self) -> Result<Vec<DeviceId>> {
        let ids = self.router.remove_unavailable_links().await?;
        self.registry.handle_link_lost(&ids);
        Ok(ids)
    }

    /// Stop timers, flush and close every link, then stop the workers
    pub async fn shutdown(&self) {
        self.registry.stop_timers();
        self.router.shutdown().await;
        self.scheduler.shutdown().await;

        let stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatcher ended abnormally: {}", e);
            }
        }
        info!("Motor context for {} stopped", self.config.general.app_name);
    }
}

/// Feeds transport events and fired timers into the registry
struct Dispatcher {
    registry: Arc<MotorRegistry>,
    codec: Arc<dyn Codec>,
    bus: NotificationBus,
}

impl Dispatcher {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut fired: mpsc::UnboundedReceiver<TimerKey>,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                Some(event) = events.recv() => self.on_event(event),
                Some(key) = fired.recv() => self.on_timer(key),
                else => break,
            }
        }
        debug!("Dispatcher stopped");
        Ok(())
    }

    fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Response { link, tag, frame } => {
                let replies = match self.codec.decode(&frame) {
                    Ok(replies) => replies,
                    Err(e) => {
                        debug!("Undecodable bytes on {}: {}", link, e);
                        return;
                    }
                };
                for reply in replies {
                    // Replies carry their sender; other motors may answer in the same window
                    let device = match tag {
                        Some(tag) if reply.device == DeviceId::BROADCAST => tag,
                        _ => reply.device,
                    };
                    self.registry.handle_response(device, reply.response);
                }
            }
            TransportEvent::Failed {
                link,
                device,
                message,
            } => {
                warn!("Transport {} failed for motor {}: {}", link, device, message);
                self.bus
                    .connection_error(device, ErrorCode::Transport.code(), message);
            }
            TransportEvent::Finished { link } => debug!("Transport {} finished", link),
        }
    }

    fn on_timer(&self, key: TimerKey) {
        trace!("Timer {} fired", key);
        match key {
            TimerKey::Heartbeat(mac) => self.registry.heartbeat_tick(mac),
            TimerKey::AutoPoll(mac) => self.registry.auto_poll_tick(mac),
            TimerKey::Procedure(mac) => self.registry.procedure_timeout(mac),
            TimerKey::Probe(name) => trace!("Probe deadline for {} reached", name),
        }
    }
}
