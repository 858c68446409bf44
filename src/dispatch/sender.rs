use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{DispatchQueue, DispatchRecord, DispatchStatus};
use crate::config::DispatchSettings;
use crate::journal::{Journal, JournalEntry};
use crate::modem::NotificationChannel;

/// Drains the dispatch queue into the notification channel.
pub struct DispatchSender {
    queue: DispatchQueue,
    channel: Box<dyn NotificationChannel>,
    journal: Journal,
    send_timeout: Duration,
    poll_interval: Duration,
    operator_contact: Option<String>,
}

impl DispatchSender {
    pub fn new(
        queue: DispatchQueue,
        channel: Box<dyn NotificationChannel>,
        settings: &DispatchSettings,
        journal: Journal,
    ) -> Self {
        Self {
            queue,
            channel,
            journal,
            send_timeout: settings.send_timeout,
            poll_interval: settings.poll_interval,
            operator_contact: settings.operator_contact.clone(),
        }
    }

    /// Attempts every record that is ready at `now`, oldest first.
    pub fn run_once(&mut self, now: DateTime<Utc>) -> Vec<DispatchRecord> {
        self.drain(now, None)
    }

    fn drain(&mut self, now: DateTime<Utc>, shutdown: Option<&AtomicBool>) -> Vec<DispatchRecord> {
        let mut settled = Vec::new();
        while let Some(record) = self.queue.claim_next(now) {
            let result = self
                .channel
                .send(&record.destination, &record.body, self.send_timeout);
            let record = match result {
                Ok(ack) => self.queue.record_success(record, &ack, now),
                Err(err) => {
                    let record = self.queue.record_failure(record, &err, now);
                    if record.status == DispatchStatus::Abandoned {
                        self.escalate(&record, now);
                    }
                    record
                }
            };
            settled.push(record);
            if shutdown.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                break;
            }
        }
        settled
    }

    /// Best-effort single notice to the operator about an abandoned record.
    fn escalate(&mut self, record: &DispatchRecord, now: DateTime<Utc>) {
        let Some(operator) = self.operator_contact.clone() else {
            return;
        };
        if operator == record.destination {
            return;
        }
        let notice = format!(
            "ALERT UNDELIVERED: {} to {} abandoned after {} attempts",
            record.alert_id, record.destination, record.attempts
        );
        let (event, detail) = match self.channel.send(&operator, &notice, self.send_timeout) {
            Ok(_) => {
                log::warn!("dispatch: operator {} notified of {}", operator, record.alert_id);
                ("escalated", format!("operator {} notified", operator))
            }
            Err(err) => {
                log::error!("dispatch: operator escalation failed: {}", err);
                ("escalation_failed", err.to_string())
            }
        };
        self.journal.record(JournalEntry::Dispatch {
            at: now,
            record_id: record.record_id,
            alert_id: record.alert_id.to_string(),
            destination: record.destination.clone(),
            status: record.status,
            attempts: record.attempts,
            event: event.to_string(),
            detail: Some(detail),
        });
    }

    /// Polls the queue until `shutdown` is raised. A send already in progress when shutdown
    /// arrives is allowed to finish; records it leaves in flight are reconciled at startup.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        log::info!(
            "dispatch: sender started on channel {} (poll {}ms)",
            self.channel.name(),
            self.poll_interval.as_millis()
        );
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.drain(Utc::now(), Some(&shutdown));
            if crate::sleep_unless_shutdown(&shutdown, self.poll_interval) {
                break;
            }
        }
        log::info!("dispatch: sender stopped");
    }

    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("dispatch-sender".to_string())
            .spawn(move || self.run(shutdown))?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregatedCount;
    use crate::alert::{Alert, AlertId, AlertLocation, ALERT_FORMAT_VERSION};
    use crate::config::EvacuationSite;
    use crate::dispatch::RetryPolicy;
    use crate::error::SentinelError;
    use crate::modem::SendAck;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct ScriptedChannel {
        outcomes: Arc<Mutex<VecDeque<bool>>>,
        sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ScriptedChannel {
        fn failing(n: usize) -> Self {
            let channel = Self::default();
            channel
                .outcomes
                .lock()
                .unwrap()
                .extend(std::iter::repeat(false).take(n));
            channel
        }
    }

    impl NotificationChannel for ScriptedChannel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn send(
            &mut self,
            destination: &str,
            body: &str,
            _timeout: Duration,
        ) -> std::result::Result<SendAck, SentinelError> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), body.to_string()));
            if self.outcomes.lock().unwrap().pop_front().unwrap_or(true) {
                Ok(SendAck {
                    message_refs: vec![1],
                })
            } else {
                Err(SentinelError::SendFailure {
                    destination: destination.to_string(),
                    reason: "network busy".into(),
                })
            }
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn alert(id: &str) -> Alert {
        Alert {
            id: AlertId::from(id.to_string()),
            format_version: ALERT_FORMAT_VERSION,
            counts: AggregatedCount::empty(at(-10), at(0)),
            location: AlertLocation::Unavailable,
            evacuation_site: EvacuationSite {
                name: "Gym".into(),
                address: "Main St".into(),
                coordinates: None,
                primary: true,
            },
            created_at: at(0),
            body: format!("body of {}", id),
        }
    }

    fn settings(max_attempts: u32, operator: Option<&str>) -> DispatchSettings {
        DispatchSettings {
            max_attempts,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            send_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(1),
            operator_contact: operator.map(str::to_string),
        }
    }

    fn sender(channel: ScriptedChannel, settings: &DispatchSettings) -> (DispatchSender, DispatchQueue, Journal) {
        let journal = Journal::in_memory();
        let queue = DispatchQueue::in_memory(RetryPolicy::from(settings), journal.clone());
        let sender = DispatchSender::new(queue.clone(), Box::new(channel), settings, journal.clone());
        (sender, queue, journal)
    }

    #[test]
    fn retries_until_sent() {
        let channel = ScriptedChannel::failing(3);
        let (mut sender, queue, journal) = sender(channel.clone(), &settings(5, None));
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));

        let mut now = at(0);
        let mut last = None;
        for _ in 0..10 {
            if let Some(r) = sender.run_once(now).pop() {
                let done = r.status.is_terminal();
                last = Some(r);
                if done {
                    break;
                }
            }
            now += chrono::Duration::seconds(60);
        }
        let record = last.expect("attempted");
        assert_eq!(record.status, DispatchStatus::Sent);
        assert_eq!(record.attempts, 4);

        let events: Vec<String> = journal
            .read_all()
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Dispatch { event, .. } => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(events.iter().filter(|e| *e == "attempt").count(), 4);
        assert_eq!(events.iter().filter(|e| *e == "failed").count(), 3);
        assert_eq!(events.last().map(String::as_str), Some("sent"));
    }

    #[test]
    fn abandoned_records_are_escalated_to_the_operator() {
        let channel = ScriptedChannel::failing(1);
        let (mut sender, queue, journal) = sender(channel.clone(), &settings(1, Some("+639998887777")));
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], at(0));

        let settled = sender.run_once(at(0));
        assert_eq!(settled[0].status, DispatchStatus::Abandoned);

        let sent = channel.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, "+639998887777");
        assert!(sent[1].1.contains("alert:a"));
        assert!(journal.read_all().unwrap().iter().any(|e| matches!(
            e,
            JournalEntry::Dispatch { event, .. } if event == "escalated"
        )));
    }

    #[test]
    fn sends_in_enqueue_order() {
        let channel = ScriptedChannel::default();
        let (mut sender, queue, _journal) = sender(channel.clone(), &settings(5, None));
        for id in ["alert:a", "alert:b", "alert:c"] {
            queue.enqueue(&alert(id), &["+639171234567".into()], at(0));
        }
        sender.run_once(at(0));
        let bodies: Vec<String> = channel.sent.lock().unwrap().iter().map(|s| s.1.clone()).collect();
        assert_eq!(bodies, vec!["body of alert:a", "body of alert:b", "body of alert:c"]);
    }

    #[test]
    fn spawned_sender_stops_on_shutdown() {
        let channel = ScriptedChannel::default();
        let (sender, queue, _journal) = sender(channel.clone(), &settings(5, None));
        queue.enqueue(&alert("alert:a"), &["+639171234567".into()], Utc::now());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = sender.spawn(shutdown.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.pending_count().unwrap() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::SeqCst);
        assert!(crate::join_with_grace(handle, Duration::from_secs(1), "dispatch-sender"));
        assert_eq!(queue.pending_count().unwrap(), 0);
    }
}
