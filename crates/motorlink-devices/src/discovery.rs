/*!
 * Device discovery.
 *
 * A discovery pass probes every candidate link that no transport serves yet,
 * one link at a time. A link is opened at the probe baud rate, sent a
 * broadcast identification request and given until its probe deadline to
 * answer. Links that answer are handed to the router and their motors to the
 * registry; the rest stay unclassified and may be retried.
 */
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, warn, Instrument};

use motorlink_core::config::DiscoveryConfig;
use motorlink_core::event::{Notification, NotificationBus};
use motorlink_core::logging::operation_span;
use motorlink_core::types::{DeviceId, DeviceMac};
use motorlink_core::utils::with_timeout;

use crate::codec::{Codec, Request, Response};
use crate::error::{DeviceError, Result};
use crate::link::{Link, LinkProvider};
use crate::registry::MotorRegistry;
use crate::router::DeviceRouter;
use crate::scheduler::{Scheduler, TimerKey};

/// Longest single read while waiting for probe answers
const PROBE_READ_SLICE: Duration = Duration::from_millis(10);

/// Outcome of probing one link
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Motors answered
    Found(Vec<(DeviceId, DeviceMac)>),
    /// Nothing answered before the deadline
    TimedOut,
    /// The link could not be opened
    OpenFailed(String),
}

/// Result of a discovery pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// Motors found and registered
    pub found: Vec<(DeviceId, DeviceMac)>,
    /// Links still unclassified when the pass ended
    pub unclassified: Vec<String>,
    /// Links whose motors were refused by the registry, with the reason
    pub rejected: Vec<(String, String)>,
    /// Number of passes over the candidates
    pub attempts: u32,
}

/// Resets the running flag when a pass ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Discovers motors on unclaimed links
#[derive(Debug)]
pub struct DeviceDiscovery {
    router: Arc<DeviceRouter>,
    registry: Arc<MotorRegistry>,
    codec: Arc<dyn Codec>,
    scheduler: Scheduler,
    bus: NotificationBus,
    config: DiscoveryConfig,
    link_baud_rate: u32,
    running: AtomicBool,
}

impl DeviceDiscovery {
    /// Create a discovery service
    ///
    /// `link_baud_rate` is the rate adopted links are reopened at.
    pub fn new(
        router: Arc<DeviceRouter>,
        registry: Arc<MotorRegistry>,
        codec: Arc<dyn Codec>,
        scheduler: Scheduler,
        bus: NotificationBus,
        config: DiscoveryConfig,
        link_baud_rate: u32,
    ) -> Self {
        Self {
            router,
            registry,
            codec,
            scheduler,
            bus,
            config,
            link_baud_rate,
            running: AtomicBool::new(false),
        }
    }

    /// Whether a pass is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn provider(&self) -> &Arc<dyn LinkProvider> {
        self.router.provider()
    }

    /// Candidate links no transport serves yet
    pub fn candidates(&self) -> Vec<String> {
        let claimed: HashSet<String> = self.router.link_names().into_iter().collect();
        self.provider()
            .available_links()
            .into_iter()
            .filter(|name| !claimed.contains(name))
            .collect()
    }

    /// Run a discovery pass
    ///
    /// With `retry`, links left unclassified are probed again, up to the
    /// configured number of attempts. Finding nothing is not an error.
    pub async fn start_recognize(&self, retry: bool) -> Result<DiscoveryReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::DiscoveryInProgress);
        }
        let _guard = RunningGuard(&self.running);

        let report = self
            .run(retry)
            .instrument(operation_span("recognize", "discovery"))
            .await;

        info!(
            "Discovery found {} motors in {} attempts, {} links unclassified",
            report.found.len(),
            report.attempts,
            report.unclassified.len()
        );
        self.bus.publish(Notification::DiscoveryFinished {
            found: report.found.clone(),
            unclassified: report.unclassified.clone(),
        });
        Ok(report)
    }

    async fn run(&self, retry: bool) -> DiscoveryReport {
        let max_attempts = if retry { self.config.max_attempts.max(1) } else { 1 };
        let mut report = DiscoveryReport::default();
        let mut candidates = self.candidates();
        debug!("Discovery candidates: {:?}", candidates);

        while !candidates.is_empty() && report.attempts < max_attempts {
            report.attempts += 1;
            let mut unclassified = Vec::new();

            for name in candidates {
                match self.probe(&name).await {
                    ProbeOutcome::Found(pairs) => match self.adopt(&name, &pairs).await {
                        Ok(()) => report.found.extend(pairs),
                        Err(e) => {
                            warn!("Motors on {} refused: {}", name, e);
                            report.rejected.push((name, e.to_string()));
                        }
                    },
                    ProbeOutcome::TimedOut => {
                        debug!("{}", DeviceError::ProbeTimeout(name.clone()));
                        unclassified.push(name);
                    }
                    ProbeOutcome::OpenFailed(reason) => {
                        debug!("Skipping {}: {}", name, reason);
                        unclassified.push(name);
                    }
                }
            }
            candidates = unclassified;
        }

        report.unclassified = candidates;
        report
    }

    /// Probe one link for motors
    ///
    /// The link is closed again before returning.
    pub async fn probe(&self, name: &str) -> ProbeOutcome {
        // A wedged driver must not stall the whole pass
        let opened = with_timeout(
            self.config.probe_timeout(),
            self.provider().open(name, self.config.probe_baud_rate),
        )
        .await;
        let mut link = match opened {
            Ok(link) => link,
            Err(e) => return ProbeOutcome::OpenFailed(e.to_string()),
        };

        let outcome = self.identify(name, link.as_mut()).await;
        if let Err(e) = link.close().await {
            warn!("Failed to close probed link {}: {}", name, e);
        }
        outcome
    }

    async fn identify(&self, name: &str, link: &mut dyn Link) -> ProbeOutcome {
        let frame = match self.codec.encode(DeviceId::BROADCAST, &Request::Probe) {
            Ok(frame) => frame,
            Err(e) => return ProbeOutcome::OpenFailed(e.to_string()),
        };
        if let Err(e) = link.write(&frame).await {
            debug!("Probe write to {} failed: {}", name, e);
            return ProbeOutcome::TimedOut;
        }

        let key = TimerKey::Probe(name.to_string());
        let mut deadline = self.scheduler.deadline(key.clone(), self.config.probe_timeout());
        let mut pairs: Vec<(DeviceId, DeviceMac)> = Vec::new();

        loop {
            match deadline.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Closed) => break,
            }
            match link.read(PROBE_READ_SLICE).await {
                Ok(Some(bytes)) => match self.codec.decode(&bytes) {
                    Ok(replies) => {
                        for reply in replies {
                            if let Response::Identity { id, mac } = reply.response {
                                if !pairs.contains(&(id, mac)) {
                                    debug!("{} answered as motor {} ({})", name, id, mac);
                                    pairs.push((id, mac));
                                }
                            }
                        }
                    }
                    Err(e) => debug!("Undecodable probe answer on {}: {}", name, e),
                },
                // Answers are in and the line went quiet
                Ok(None) if !pairs.is_empty() => break,
                Ok(None) => {}
                Err(e) => {
                    debug!("Probe read on {} failed: {}", name, e);
                    break;
                }
            }
        }
        self.scheduler.cancel(key);

        if pairs.is_empty() {
            ProbeOutcome::TimedOut
        } else {
            ProbeOutcome::Found(pairs)
        }
    }

    /// Hand a probed link to the router and its motors to the registry
    async fn adopt(&self, name: &str, pairs: &[(DeviceId, DeviceMac)]) -> Result<()> {
        let link = self.router.add_link(name, self.link_baud_rate).await?;
        if let Err(e) = self.registry.register_batch(pairs) {
            if let Err(remove) = self.router.remove_link(link, false).await {
                warn!("Could not drop link {}: {}", name, remove);
            }
            if let Some((id, _)) = pairs.first() {
                self.bus.error_occurred(*id, e.code().code(), e.to_string());
            }
            return Err(e);
        }

        let ids: Vec<DeviceId> = pairs.iter().map(|(id, _)| *id).collect();
        for id in &ids {
            self.router.add_relation(link, *id)?;
        }
        self.registry.activate(&ids)?;
        info!("Adopted {} with motors {:?}", name, ids);
        Ok(())
    }
}
