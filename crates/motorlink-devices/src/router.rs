/*!
 * Device router.
 *
 * The router owns every [`LinkTransport`] in an arena indexed by [`LinkId`]
 * and maps device ids onto transports. All routing operations are fast and
 * synchronous; retries are the caller's business.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use motorlink_core::event::NotificationBus;
use motorlink_core::types::{DeviceId, LinkId};

use crate::error::{DeviceError, ErrorCode, Result};
use crate::link::LinkProvider;
use crate::transport::{ConnectionStatus, LinkTransport, TransportEvent};

/// Process-wide router between device ids and link transports
#[derive(Debug)]
pub struct DeviceRouter {
    provider: Arc<dyn LinkProvider>,
    /// Transports in creation order
    links: RwLock<Vec<Arc<LinkTransport>>>,
    /// Device id to owning transport
    routes: RwLock<HashMap<DeviceId, LinkId>>,
    next_link: AtomicU32,
    response_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    bus: NotificationBus,
}

impl DeviceRouter {
    /// Create a router
    ///
    /// Returns the router and the receiving end of every transport's events.
    pub fn new(
        provider: Arc<dyn LinkProvider>,
        response_timeout: Duration,
        bus: NotificationBus,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let router = Self {
            provider,
            links: RwLock::new(Vec::new()),
            routes: RwLock::new(HashMap::new()),
            next_link: AtomicU32::new(1),
            response_timeout,
            events,
            bus,
        };
        (router, receiver)
    }

    /// The provider links are opened through
    pub fn provider(&self) -> &Arc<dyn LinkProvider> {
        &self.provider
    }

    /// Open a link, wrap it in a transport and start draining
    pub async fn add_link(&self, name: &str, baud_rate: u32) -> Result<LinkId> {
        if let Some(existing) = self.find_by_name(name)? {
            return Err(DeviceError::other(format!(
                "Link {} is already served by {}",
                name,
                existing.id()
            )));
        }

        let link = self.provider.open(name, baud_rate).await?;
        let id = LinkId(self.next_link.fetch_add(1, Ordering::SeqCst));
        let transport = Arc::new(LinkTransport::new(
            id,
            link,
            baud_rate,
            self.response_timeout,
            self.events.clone(),
        ));
        transport.start()?;

        self.links
            .write()
            .map_err(|_| DeviceError::other("Failed to acquire write lock on link arena"))?
            .push(transport);
        info!("Added link {} as {} at {} baud", name, id, baud_rate);
        Ok(id)
    }

    /// Route a frame to the device's transport
    ///
    /// An unknown device is an error and nothing is queued.
    pub fn send(&self, device: DeviceId, frame: Bytes) -> Result<()> {
        let routes = self
            .routes
            .read()
            .map_err(|_| DeviceError::other("Failed to acquire read lock on routes"))?;
        let link = *routes
            .get(&device)
            .ok_or(DeviceError::UnknownDevice(device))?;
        // Sending under the route lock keeps a concurrent remap from slipping in between
        self.transport(link)?.send(device, frame)
    }

    /// Route a liveness frame, which a failed transport still writes
    pub fn send_liveness(&self, device: DeviceId, frame: Bytes) -> Result<()> {
        let routes = self
            .routes
            .read()
            .map_err(|_| DeviceError::other("Failed to acquire read lock on routes"))?;
        let link = *routes
            .get(&device)
            .ok_or(DeviceError::UnknownDevice(device))?;
        self.transport(link)?.send_liveness(device, frame)
    }

    /// Record that a device is reachable through a transport
    pub fn add_relation(&self, link: LinkId, device: DeviceId) -> Result<()> {
        let transport = self.transport(link)?;
        let mut routes = self
            .routes
            .write()
            .map_err(|_| DeviceError::other("Failed to acquire write lock on routes"))?;
        if let Some(previous) = routes.insert(device, link) {
            if previous != link {
                if let Ok(old) = self.transport(previous) {
                    old.remove_device(device);
                }
                warn!("Device {} moved from {} to {}", device, previous, link);
            }
        }
        transport.add_device(device);
        debug!("Device {} routed through {}", device, link);
        Ok(())
    }

    /// Move a device's association from `old` to `new`
    pub fn remap(&self, old: DeviceId, new: DeviceId) -> Result<()> {
        let mut routes = self
            .routes
            .write()
            .map_err(|_| DeviceError::other("Failed to acquire write lock on routes"))?;
        let link = *routes.get(&old).ok_or(DeviceError::UnknownDevice(old))?;
        if old == new {
            return Ok(());
        }
        if let Some(other) = routes.get(&new) {
            if *other != link {
                return Err(DeviceError::DuplicateDeviceId(new));
            }
        }

        self.transport(link)?.rename_device(old, new);
        routes.remove(&old);
        routes.insert(new, link);
        info!("Remapped device {} to {} on {}", old, new, link);
        Ok(())
    }

    /// Drop every transport whose link disappeared
    ///
    /// Each device that was served by a dropped transport gets one
    /// `ConnectionError` notification. Returns the affected devices.
    pub async fn remove_unavailable_links(&self) -> Result<Vec<DeviceId>> {
        let gone: Vec<Arc<LinkTransport>> = {
            let mut links = self
                .links
                .write()
                .map_err(|_| DeviceError::other("Failed to acquire write lock on link arena"))?;
            let (gone, kept): (Vec<_>, Vec<_>) = links
                .drain(..)
                .partition(|t| !self.provider.exists(t.name()));
            *links = kept;
            gone
        };

        let mut affected = Vec::new();
        for transport in gone {
            let devices = transport.devices();
            {
                let mut routes = self
                    .routes
                    .write()
                    .map_err(|_| DeviceError::other("Failed to acquire write lock on routes"))?;
                for device in &devices {
                    if routes.get(device) == Some(&transport.id()) {
                        routes.remove(device);
                    }
                }
            }
            warn!(
                "Link {} disappeared, dropping {} devices",
                transport.name(),
                devices.len()
            );
            for device in &devices {
                self.bus.connection_error(
                    *device,
                    ErrorCode::LinkLost.code(),
                    format!("link {} is no longer available", transport.name()),
                );
            }
            transport.stop(false).await;
            affected.extend(devices);
        }
        Ok(affected)
    }

    /// Propagate an external liveness signal into a transport
    pub fn set_connection_status(&self, link: LinkId, status: ConnectionStatus) -> Result<()> {
        self.transport(link)?.set_status(status);
        Ok(())
    }

    /// Whether any transport still has frames queued
    pub fn has_pending_data(&self) -> bool {
        self.links
            .read()
            .map(|links| links.iter().any(|t| t.has_pending_data()))
            .unwrap_or(false)
    }

    /// Names of every served link
    pub fn link_names(&self) -> Vec<String> {
        self.links
            .read()
            .map(|links| links.iter().map(|t| t.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Every transport
    pub fn links(&self) -> Vec<Arc<LinkTransport>> {
        self.links
            .read()
            .map(|links| links.clone())
            .unwrap_or_default()
    }

    /// Transport serving a device
    pub fn link_of(&self, device: DeviceId) -> Option<LinkId> {
        self.routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&device).copied())
    }

    /// Transport by identity
    pub fn transport(&self, link: LinkId) -> Result<Arc<LinkTransport>> {
        self.links
            .read()
            .map_err(|_| DeviceError::other("Failed to acquire read lock on link arena"))?
            .iter()
            .find(|t| t.id() == link)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownLink(link.to_string()))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Arc<LinkTransport>>> {
        Ok(self
            .links
            .read()
            .map_err(|_| DeviceError::other("Failed to acquire read lock on link arena"))?
            .iter()
            .find(|t| t.name() == name)
            .cloned())
    }

    /// Stop and drop one transport, unrouting its devices
    pub async fn remove_link(&self, link: LinkId, flush: bool) -> Result<Vec<DeviceId>> {
        let transport = {
            let mut links = self
                .links
                .write()
                .map_err(|_| DeviceError::other("Failed to acquire write lock on link arena"))?;
            let index = links
                .iter()
                .position(|t| t.id() == link)
                .ok_or_else(|| DeviceError::UnknownLink(link.to_string()))?;
            links.remove(index)
        };

        let devices = transport.devices();
        {
            let mut routes = self
                .routes
                .write()
                .map_err(|_| DeviceError::other("Failed to acquire write lock on routes"))?;
            routes.retain(|_, l| *l != link);
        }
        transport.stop(flush).await;
        info!("Removed link {}", transport.name());
        Ok(devices)
    }

    /// Flush and stop every transport
    pub async fn shutdown(&self) {
        let transports: Vec<Arc<LinkTransport>> = match self.links.write() {
            Ok(mut links) => links.drain(..).collect(),
            Err(_) => {
                warn!("Link arena lock poisoned during shutdown");
                return;
            }
        };
        if let Ok(mut routes) = self.routes.write() {
            routes.clear();
        }

        let count = transports.len();
        join_all(transports.iter().map(|t| t.stop(true))).await;
        info!("Router shut down {} transports", count);
    }
}
