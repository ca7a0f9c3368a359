//! Tick scheduler
//!
//! Walks the configured devices in order, hands each one with its reader to
//! the delivery coordinator, and logs the resulting report.

use std::sync::Arc;
use std::time::Duration;
use tbmon_cloud::DeliveryCoordinator;
use tbmon_core::{
    AgentConfig, DeliveryOutcome, DeviceConfig, FailureReason, SkipReason, TickReport,
};
use tbmon_sources::SourceRegistry;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};

/// How often to tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A single tick
    Once,

    /// Tick every interval until shutdown
    Every(Duration),

    /// Use `agent.interval_secs` from the configuration
    Configured,
}

/// Outcome counts over one or more ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: usize,
    pub delivered: usize,
    pub cached: usize,
    pub skipped: usize,
    pub failed: usize,
    pub replayed: usize,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, report: &TickReport) {
        for outcome in std::iter::once(&report.telemetry).chain(report.host.iter()) {
            match outcome {
                DeliveryOutcome::Delivered => self.delivered += 1,
                DeliveryOutcome::Cached | DeliveryOutcome::CachedAndForwarded { .. } => {
                    self.cached += 1
                }
                DeliveryOutcome::Skipped(_) => self.skipped += 1,
                DeliveryOutcome::Failed(_) => self.failed += 1,
            }
        }
        self.replayed += report.replayed;
    }

    fn merge(&mut self, other: &RunSummary) {
        self.ticks += other.ticks;
        self.delivered += other.delivered;
        self.cached += other.cached;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.replayed += other.replayed;
        self.interrupted |= other.interrupted;
    }
}

/// Device scheduler
pub struct Runner {
    config: Arc<AgentConfig>,
    devices: Vec<DeviceConfig>,
    registry: SourceRegistry,
    coordinator: DeliveryCoordinator,
    shutdown: watch::Receiver<bool>,
}

impl Runner {
    pub fn new(
        config: Arc<AgentConfig>,
        devices: Vec<DeviceConfig>,
        registry: SourceRegistry,
        coordinator: DeliveryCoordinator,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            devices,
            registry,
            coordinator,
            shutdown,
        }
    }

    pub fn coordinator(&self) -> &DeliveryCoordinator {
        &self.coordinator
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Process every device once.
    ///
    /// Shutdown is only honoured between devices, so a device that started its
    /// tick always finishes its send/confirm work.
    pub async fn run_tick(&self) -> RunSummary {
        let mut summary = RunSummary {
            ticks: 1,
            ..Default::default()
        };

        for device in &self.devices {
            if self.shutdown_requested() {
                info!("Shutdown requested, stopping tick early");
                summary.interrupted = true;
                break;
            }

            let report = self.tick_device(device).await;
            log_report(&report);
            summary.record(&report);
        }

        summary
    }

    async fn tick_device(&self, device: &DeviceConfig) -> TickReport {
        match self.registry.reader_for(device) {
            Ok(reader) => {
                let host = if device.settings.sys_info {
                    self.registry.host()
                } else {
                    None
                };
                self.coordinator
                    .tick(device, reader.as_ref(), host.as_deref())
                    .await
            }
            Err(e) => TickReport::new(
                device.identity(),
                DeliveryOutcome::Skipped(SkipReason::SourceUnavailable(e.to_string())),
            ),
        }
    }

    /// Tick until the mode is exhausted or shutdown is requested
    pub async fn run(&mut self, mode: RunMode) -> RunSummary {
        let interval = match mode {
            RunMode::Once => None,
            RunMode::Every(interval) if interval.is_zero() => None,
            RunMode::Every(interval) => Some(interval),
            RunMode::Configured => self.config.agent.interval(),
        };

        match interval {
            Some(interval) => info!(
                "Monitoring {} devices every {}s",
                self.devices.len(),
                interval.as_secs()
            ),
            None => info!("Running a single tick for {} devices", self.devices.len()),
        }

        let mut total = RunSummary::default();
        loop {
            let summary = self.run_tick().await;
            debug!("Tick finished: {:?}", summary);
            total.merge(&summary);

            let Some(interval) = interval else {
                break;
            };
            if total.interrupted || self.shutdown_requested() {
                total.interrupted = true;
                break;
            }

            let closed = tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                changed = self.shutdown.changed() => changed.is_err(),
            };
            if closed || self.shutdown_requested() {
                total.interrupted = true;
                break;
            }
        }

        total
    }
}

/// Severity an outcome is logged at. Every outcome reaches the default
/// `info` level.
fn outcome_level(outcome: &DeliveryOutcome) -> Level {
    if outcome.is_error() {
        return Level::ERROR;
    }
    match outcome {
        DeliveryOutcome::Skipped(SkipReason::SourceUnavailable(_))
        | DeliveryOutcome::Failed(FailureReason::ReplayRetryPending) => Level::WARN,
        _ => Level::INFO,
    }
}

fn log_outcome(device: &str, what: &str, outcome: &DeliveryOutcome) {
    match outcome_level(outcome) {
        Level::ERROR => error!("Device {} {}: {}", device, what, outcome),
        Level::WARN => warn!("Device {} {}: {}", device, what, outcome),
        _ => info!("Device {} {}: {}", device, what, outcome),
    }
}

/// Log a report at the severity its outcomes call for
pub fn log_report(report: &TickReport) {
    log_outcome(&report.device, "telemetry", &report.telemetry);
    if let Some(host) = &report.host {
        log_outcome(&report.device, "host metrics", host);
    }
    // Attribute failures are logged where they happen; they are re-sent next tick
    if let Some(attributes) = &report.attributes {
        debug!("Device {} attributes: {}", report.device, attributes);
    }
    if report.replayed > 0 {
        info!(
            "Device {} replayed {} cached readings",
            report.device, report.replayed
        );
    }
}
