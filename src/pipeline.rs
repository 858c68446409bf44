//! Detection loop and task orchestration.
//!
//! `DetectionLoop::run_cycle` is one pass of capture -> inference -> aggregation -> throttle,
//! composing and enqueueing an alert when the throttle fires. `run_daemon` wires the loop to
//! the GPS poller and dispatch sender threads and owns the shutdown sequence:
//!
//! 1. the capture loop finishes its current cycle,
//! 2. the inference worker and GPS poller are stopped,
//! 3. the dispatch sender gets `shutdown_grace` to finish an in-flight send,
//! 4. the journal is flushed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregate::{AggregatedCount, ClassTally, DetectionAggregator};
use crate::alert::{Alert, AlertComposer};
use crate::config::SentinelConfig;
use crate::detect::{self, InferenceWorker};
use crate::dispatch::{DispatchQueue, DispatchRecord, DispatchSender, RetryPolicy};
use crate::error::SentinelError;
use crate::frame::FrameSource;
use crate::geo::{FixCache, GeolocationService};
use crate::ingest;
use crate::journal::{Journal, JournalEntry};
use crate::modem::{self, NetworkMonitor, NetworkStatus};
use crate::throttle::{AlertThrottle, FireReason, SuppressReason, ThrottleDecision};

/// What one detection cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// No frame was aggregated: the camera or the model was unavailable.
    Skipped(SentinelError),
    Observed {
        sequence: u64,
        frame: ClassTally,
        counts: AggregatedCount,
        decision: ThrottleDecision,
    },
    Alerted {
        sequence: u64,
        reason: FireReason,
        alert: Alert,
        records: Vec<DispatchRecord>,
    },
}

impl CycleOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, CycleOutcome::Skipped(_))
    }

    pub fn alert(&self) -> Option<&Alert> {
        match self {
            CycleOutcome::Alerted { alert, .. } => Some(alert),
            _ => None,
        }
    }
}

fn describe(decision: &ThrottleDecision) -> String {
    match decision {
        ThrottleDecision::Fire(FireReason::Escalation { classes }) => {
            let labels: Vec<&str> = classes.iter().map(|c| c.label()).collect();
            format!("fire:escalation({})", labels.join(","))
        }
        ThrottleDecision::Fire(reason) => format!("fire:{}", reason.as_str()),
        ThrottleDecision::Suppress(SuppressReason::BelowThreshold) => {
            "suppress:below_threshold".to_string()
        }
        ThrottleDecision::Suppress(SuppressReason::CoolingDown { remaining }) => {
            format!("suppress:cooling_down({}s)", remaining.as_secs())
        }
    }
}

pub struct DetectionLoop {
    source: Box<dyn FrameSource>,
    worker: InferenceWorker,
    aggregator: DetectionAggregator,
    throttle: AlertThrottle,
    composer: AlertComposer,
    fixes: FixCache,
    queue: DispatchQueue,
    journal: Journal,
    contacts: Vec<String>,
    max_fix_age: Duration,
    interval: Duration,
    source_backoff_max: Duration,
    health_check_interval: Duration,
    network: Option<Box<dyn NetworkMonitor>>,
    last_network: Option<NetworkStatus>,
    consecutive_source_failures: u32,
    cycles: u64,
    alerts: u64,
}

impl DetectionLoop {
    pub fn new(
        config: &SentinelConfig,
        source: Box<dyn FrameSource>,
        worker: InferenceWorker,
        fixes: FixCache,
        queue: DispatchQueue,
        journal: Journal,
    ) -> Result<Self> {
        let composer = AlertComposer::new(
            config.evacuation_sites.clone(),
            config.alerts.utc_offset_minutes,
        )?;
        if config.emergency_contacts.is_empty() {
            log::warn!("no emergency contacts configured; alerts will be journaled but not sent");
        }
        Ok(Self {
            source,
            worker,
            aggregator: DetectionAggregator::new((&config.detection).into()),
            throttle: AlertThrottle::new((&config.alerts).into()),
            composer,
            fixes,
            queue,
            journal,
            contacts: config.emergency_contacts.clone(),
            max_fix_age: config.gps.max_fix_age,
            interval: config.detection.interval,
            source_backoff_max: config.source_backoff_max,
            health_check_interval: config.health_check_interval,
            network: None,
            last_network: None,
            consecutive_source_failures: 0,
            cycles: 0,
            alerts: 0,
        })
    }

    /// Reports cellular registration and signal in each health check.
    pub fn with_network_monitor(mut self, monitor: Box<dyn NetworkMonitor>) -> Self {
        self.network = Some(monitor);
        self
    }

    pub fn throttle(&self) -> &AlertThrottle {
        &self.throttle
    }

    pub fn aggregator(&self) -> &DetectionAggregator {
        &self.aggregator
    }

    pub fn consecutive_source_failures(&self) -> u32 {
        self.consecutive_source_failures
    }

    /// Runs one cycle. Never fails: unavailable sensors skip the cycle.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        self.cycles += 1;
        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.consecutive_source_failures = self.consecutive_source_failures.saturating_add(1);
                log::warn!(
                    "capture: {} ({} consecutive)",
                    err,
                    self.consecutive_source_failures
                );
                self.journal.record(JournalEntry::skipped(now, &err));
                return CycleOutcome::Skipped(err);
            }
        };

        if self.consecutive_source_failures > 0 {
            log::info!(
                "capture: {} recovered after {} skipped cycle(s); restarting the window",
                self.source.name(),
                self.consecutive_source_failures
            );
            self.consecutive_source_failures = 0;
            self.aggregator.reset();
        }

        let captured_at = frame.captured_at;
        let sequence = frame.sequence;
        let detections = match self.worker.infer(frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("inference: {}; skipping frame {}", err, sequence);
                self.journal.record(JournalEntry::skipped(now, &err));
                return CycleOutcome::Skipped(err);
            }
        };

        let tally = self.aggregator.observe(captured_at, &detections);
        let at = now.max(captured_at);
        let counts = self.aggregator.current_counts(at);
        let decision = self.throttle.evaluate(&counts, at);
        log::debug!(
            "cycle {}: frame {:?}, window human={} cat={} dog={}, {}",
            sequence,
            tally.counts,
            counts.human,
            counts.cat,
            counts.dog,
            describe(&decision)
        );
        self.journal.record(JournalEntry::Cycle {
            at,
            sequence,
            frame: tally.counts,
            raw_detections: tally.raw_detections,
            mean_confidence: tally.mean_confidence,
            counts: counts.clone(),
            decision: describe(&decision),
        });

        let reason = match decision {
            ThrottleDecision::Fire(reason) => reason,
            suppressed @ ThrottleDecision::Suppress(_) => {
                return CycleOutcome::Observed {
                    sequence,
                    frame: tally.counts,
                    counts,
                    decision: suppressed,
                }
            }
        };

        let alert = self
            .composer
            .compose(&counts, self.fixes.status(self.max_fix_age, at), at);
        self.alerts += 1;
        log::warn!(
            "alert {} ({}): {} people, {} cat(s), {} dog(s), location {}",
            alert.id,
            reason.as_str(),
            counts.peak.human,
            counts.peak.cat,
            counts.peak.dog,
            alert.location.label()
        );
        self.journal.record(JournalEntry::AlertComposed {
            at,
            alert_id: alert.id.to_string(),
            format_version: alert.format_version,
            reason: reason.as_str().to_string(),
            location: alert.location.label().to_string(),
            site: alert.evacuation_site.name.clone(),
            recipients: self.contacts.len(),
        });
        let records = self.queue.enqueue(&alert, &self.contacts, at);
        if records.is_empty() && !self.contacts.is_empty() {
            log::error!("alert {} could not be queued for dispatch", alert.id);
        }

        CycleOutcome::Alerted {
            sequence,
            reason,
            alert,
            records,
        }
    }

    /// Delay before the next capture attempt: the detection interval, doubled per consecutive
    /// camera failure up to `source_backoff_max`.
    pub fn next_delay(&self) -> Duration {
        if self.consecutive_source_failures == 0 {
            return self.interval;
        }
        let exponent = (self.consecutive_source_failures - 1).min(16);
        self.interval
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.source_backoff_max)
            .min(self.source_backoff_max.max(self.interval))
    }

    /// Logs component health. Network registration is journaled whenever it changes.
    pub fn health_check(&mut self, now: DateTime<Utc>) {
        let fix_age = match self.fixes.last_known() {
            Some(fix) => format!("{}s", fix.age(now).num_seconds()),
            None => "never".to_string(),
        };
        let pending = match self.queue.pending_count() {
            Ok(n) => n.to_string(),
            Err(err) => format!("unknown ({:#})", err),
        };
        let network = self.check_network(now);
        log::info!(
            "health: camera={} healthy={} frames={} inference={} fix_age={} pending={} network={} cycles={} alerts={} journal={}{} queue={}{}",
            self.source.name(),
            self.source.is_healthy(),
            self.source.frames_captured(),
            self.worker.adapter_name(),
            fix_age,
            pending,
            network,
            self.cycles,
            self.alerts,
            self.journal.backend(),
            if self.journal.is_degraded() { " (degraded)" } else { "" },
            self.queue.backend(),
            if self.queue.is_degraded() { " (degraded)" } else { "" },
        );
    }

    fn check_network(&mut self, now: DateTime<Utc>) -> String {
        let Some(monitor) = self.network.as_mut() else {
            return "n/a".to_string();
        };
        let status = match monitor.network_status() {
            Ok(status) => status,
            Err(err) => {
                log::warn!("health: network status unavailable: {:#}", err);
                return "unknown".to_string();
            }
        };
        if !status.registered() {
            log::warn!("health: modem not registered: {}", status);
        }
        let changed = self.last_network.as_ref().map_or(true, |last| {
            last.registration != status.registration || last.sim_ready != status.sim_ready
        });
        if changed {
            self.journal.record(JournalEntry::Network {
                at: now,
                registration: status.registration.as_str().to_string(),
                signal_dbm: status.signal_dbm,
                operator: status.operator.clone(),
                sim_ready: status.sim_ready,
            });
        }
        let summary = status.registration.as_str().to_string();
        self.last_network = Some(status);
        summary
    }

    /// Runs cycles until `shutdown` is raised. The current cycle always completes.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let mut last_health = Instant::now();
        self.health_check(Utc::now());
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.run_cycle(Utc::now());

            if last_health.elapsed() >= self.health_check_interval {
                self.health_check(Utc::now());
                last_health = Instant::now();
            }

            let pause = self.next_delay().saturating_sub(started.elapsed());
            if crate::sleep_unless_shutdown(shutdown, pause) {
                break;
            }
        }
        log::info!("capture: loop stopped after {} cycles", self.cycles);
    }

    /// Stops the inference worker.
    pub fn shutdown(self, grace: Duration) {
        self.worker.shutdown(grace);
    }
}

/// Everything a run needs, opened from configuration.
struct Assembly {
    journal: Journal,
    detection: DetectionLoop,
    geolocation: GeolocationService,
    sender: DispatchSender,
}

fn assemble(config: &SentinelConfig) -> Result<Assembly> {
    let journal = Journal::open(&config.db_path);
    let queue = DispatchQueue::open(
        &config.db_path,
        RetryPolicy::from(&config.dispatch),
        journal.clone(),
    );
    let reconciled = queue.reconcile(Utc::now());
    if reconciled > 0 {
        log::warn!("dispatch: reconciled {} record(s) left in flight", reconciled);
    }

    let handles = modem::open_modem(&config.modem, &config.gps)?;
    let geolocation = GeolocationService::new(handles.gps, config.gps.clone(), journal.clone());
    let sender = DispatchSender::new(queue.clone(), handles.sms, &config.dispatch, journal.clone());

    let source = ingest::open_source(&config.camera)?;
    let adapter = detect::open_adapter(&config.detection, config.camera.width, config.camera.height)?;
    let worker = InferenceWorker::spawn(adapter, config.detection.inference_timeout)?;
    let detection = DetectionLoop::new(
        config,
        source,
        worker,
        geolocation.cache(),
        queue,
        journal.clone(),
    )?
    .with_network_monitor(handles.network);

    log::info!(
        "sentinel: db={} camera={} modem={} contacts={} sites={}",
        config.db_path,
        config.camera.source,
        config.modem.port,
        config.emergency_contacts.len(),
        config.evacuation_sites.len()
    );
    Ok(Assembly {
        journal,
        detection,
        geolocation,
        sender,
    })
}

/// Runs a single field check: one GPS poll, one detection cycle, one dispatch pass.
pub fn run_once(config: &SentinelConfig) -> Result<CycleOutcome> {
    let Assembly {
        journal,
        mut detection,
        mut geolocation,
        mut sender,
    } = assemble(config)?;

    geolocation.poll_once(Utc::now());
    let outcome = detection.run_cycle(Utc::now());
    let settled = sender.run_once(Utc::now());
    log::info!("dispatch: {} record(s) attempted", settled.len());
    detection.health_check(Utc::now());
    detection.shutdown(config.dispatch.shutdown_grace);
    journal.flush();
    Ok(outcome)
}

/// Runs the daemon until `shutdown` is raised.
pub fn run_daemon(config: &SentinelConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let Assembly {
        journal,
        mut detection,
        geolocation,
        sender,
    } = assemble(config)?;

    let gps_handle = geolocation.spawn(shutdown.clone())?;
    let sender_handle = sender.spawn(shutdown.clone())?;

    detection.run(&shutdown);

    let grace = config.dispatch.shutdown_grace;
    detection.shutdown(grace);
    crate::join_with_grace(gps_handle, grace, "gps-poller");
    crate::join_with_grace(sender_handle, grace, "dispatch-sender");
    journal.flush();
    log::info!("sentinel: shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, InferenceAdapter, TargetClass};
    use crate::frame::Frame;
    use crate::modem::network::Registration;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// Yields scripted frames (Some) or outages (None), stamped two seconds apart.
    struct ScriptedSource {
        script: VecDeque<Option<u8>>,
        sequence: u64,
    }

    impl FrameSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn next_frame(&mut self) -> std::result::Result<Frame, SentinelError> {
            self.sequence += 1;
            match self.script.pop_front().flatten() {
                Some(people) => Ok(Frame::new(
                    vec![people],
                    1,
                    1,
                    at(self.sequence as i64 * 2),
                    self.sequence,
                )),
                None => Err(SentinelError::SourceUnavailable("usb camera unplugged".into())),
            }
        }

        fn frames_captured(&self) -> u64 {
            self.sequence
        }
    }

    /// One non-overlapping person per unit of the frame's single pixel.
    struct CountingAdapter;

    impl InferenceAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let people = frame.pixels()[0];
            Ok((0..people)
                .map(|i| Detection {
                    class: TargetClass::Human,
                    confidence: 0.9,
                    bbox: BoundingBox::new(i as f32 * 0.1, 0.0, 0.05, 0.05),
                })
                .collect())
        }
    }

    fn config() -> SentinelConfig {
        let mut cfg = SentinelConfig::default();
        cfg.emergency_contacts = vec!["+639171234567".into()];
        cfg
    }

    fn detection_loop(script: Vec<Option<u8>>) -> (DetectionLoop, DispatchQueue, Journal) {
        let cfg = config();
        let journal = Journal::in_memory();
        let queue = DispatchQueue::in_memory(RetryPolicy::from(&cfg.dispatch), journal.clone());
        let worker = InferenceWorker::spawn(Box::new(CountingAdapter), Duration::from_secs(2)).unwrap();
        let source = ScriptedSource {
            script: script.into(),
            sequence: 0,
        };
        let detection = DetectionLoop::new(
            &cfg,
            Box::new(source),
            worker,
            FixCache::default(),
            queue.clone(),
            journal.clone(),
        )
        .unwrap();
        (detection, queue, journal)
    }

    #[test]
    fn quiet_frames_are_observed_and_journaled() {
        let (mut detection, queue, journal) = detection_loop(vec![Some(0)]);
        let outcome = detection.run_cycle(at(2));
        assert!(matches!(outcome, CycleOutcome::Observed { .. }));
        assert_eq!(queue.records().unwrap().len(), 0);
        assert!(matches!(
            journal.read_all().unwrap().as_slice(),
            [JournalEntry::Cycle { decision, .. }] if decision == "suppress:below_threshold"
        ));
    }

    #[test]
    fn detection_fires_and_enqueues_once_per_contact() {
        let (mut detection, queue, journal) = detection_loop(vec![Some(2), Some(2)]);
        let outcome = detection.run_cycle(at(2));
        let alert = outcome.alert().expect("alert").clone();
        assert!(alert.body.contains("Detected: 2 people, 0 cat(s), 0 dog(s)"));
        assert!(alert.body.contains("Location unavailable"));
        assert_eq!(queue.records().unwrap().len(), 1);

        // Same scene during cooldown: suppressed.
        let outcome = detection.run_cycle(at(4));
        assert!(matches!(
            outcome,
            CycleOutcome::Observed {
                decision: ThrottleDecision::Suppress(SuppressReason::CoolingDown { .. }),
                ..
            }
        ));
        let kinds: Vec<&str> = journal.read_all().unwrap().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["cycle", "alert_composed", "dispatch", "cycle"]);
    }

    #[test]
    fn outages_back_off_and_recovery_starts_a_fresh_window() {
        let mut script = vec![Some(1)];
        script.extend(std::iter::repeat(None).take(4));
        script.push(Some(0));
        let (mut detection, _queue, _journal) = detection_loop(script);

        detection.run_cycle(at(2));
        assert_eq!(detection.aggregator().len(), 1);
        let mut delays = Vec::new();
        for i in 0..4 {
            assert!(detection.run_cycle(at(4 + i * 2)).is_skipped());
            delays.push(detection.next_delay().as_secs());
        }
        assert_eq!(delays, vec![2, 4, 8, 16]);

        detection.run_cycle(at(12));
        assert_eq!(detection.consecutive_source_failures(), 0);
        assert_eq!(detection.aggregator().len(), 1);
        assert_eq!(detection.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn source_backoff_is_capped() {
        let (mut detection, _queue, _journal) = detection_loop(vec![None; 10]);
        for i in 0..10 {
            detection.run_cycle(at(i));
        }
        assert_eq!(detection.next_delay(), Duration::from_secs(30));
    }

    /// Replays network statuses, then fails.
    struct ScriptedNetwork(VecDeque<NetworkStatus>);

    impl NetworkMonitor for ScriptedNetwork {
        fn network_status(&mut self) -> Result<NetworkStatus> {
            self.0
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("modem busy"))
        }
    }

    fn network(registration: Registration, signal_dbm: Option<i32>) -> NetworkStatus {
        NetworkStatus {
            registration,
            signal_dbm,
            operator: Some("Smart".into()),
            sim_ready: true,
        }
    }

    #[test]
    fn health_check_journals_registration_changes() {
        let (detection, _queue, journal) = detection_loop(vec![]);
        let mut detection = detection.with_network_monitor(Box::new(ScriptedNetwork(
            vec![
                network(Registration::Home, Some(-73)),
                network(Registration::Home, Some(-81)),
                network(Registration::Searching, None),
            ]
            .into(),
        )));
        for i in 0..4 {
            detection.health_check(at(i * 60));
        }

        let entries = journal.read_all().unwrap();
        let registrations: Vec<(&str, Option<i32>)> = entries
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Network {
                    registration,
                    signal_dbm,
                    ..
                } => Some((registration.as_str(), *signal_dbm)),
                _ => None,
            })
            .collect();
        assert_eq!(registrations, vec![("home", Some(-73)), ("searching", None)]);
    }

    #[test]
    fn decisions_are_described_for_the_journal() {
        assert_eq!(
            describe(&ThrottleDecision::Fire(FireReason::Escalation {
                classes: vec![TargetClass::Human, TargetClass::Dog]
            })),
            "fire:escalation(human,dog)"
        );
        assert_eq!(
            describe(&ThrottleDecision::Suppress(SuppressReason::CoolingDown {
                remaining: Duration::from_secs(90)
            })),
            "suppress:cooling_down(90s)"
        );
    }
}
