use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::agents::types::now_ms;
use crate::flows::{FlowService, TriggerSpec, TriggerWork};
use crate::storage::Persistence;
use crate::utils::HubError;

/// A parsed 5-field cron expression: minute, hour, day-of-month, month,
/// day-of-week.
#[derive(Debug, Clone, PartialEq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl FromStr for CronSchedule {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(HubError::Validation(format!(
                "cron expression needs 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_field(fields[4], 0, 6)?,
        })
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>, HubError> {
    let mut values = Vec::new();
    for part in field.split(',') {
        if part == "*" {
            values.extend(min..=max);
        } else if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| HubError::Validation(format!("bad cron step: {}", part)))?;
            if step == 0 {
                return Err(HubError::Validation("cron step cannot be 0".into()));
            }
            values.extend((min..=max).filter(|v| (v - min) % step == 0));
        } else if let Some((a, b)) = part.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| HubError::Validation(format!("bad cron range: {}", part)))?;
            let b: u32 = b
                .parse()
                .map_err(|_| HubError::Validation(format!("bad cron range: {}", part)))?;
            if a < min || b > max || a > b {
                return Err(HubError::Validation(format!("cron range out of bounds: {}", part)));
            }
            values.extend(a..=b);
        } else {
            let v: u32 = part
                .parse()
                .map_err(|_| HubError::Validation(format!("bad cron value: {}", part)))?;
            if v < min || v > max {
                return Err(HubError::Validation(format!("cron value out of bounds: {}", part)));
            }
            values.push(v);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

impl CronSchedule {
    fn matches(&self, at: &DateTime<Tz>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.days_of_month.contains(&at.day())
            && self.months.contains(&at.month())
            && self
                .days_of_week
                .contains(&(at.weekday().num_days_from_sunday()))
    }

    /// Next fire time strictly after `after`, scanning minute by minute for
    /// up to a year.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut candidate = tz
            .from_utc_datetime(&after.naive_utc())
            .with_second(0)?
            .with_nanosecond(0)?
            + chrono::Duration::minutes(1);

        for _ in 0..(366 * 24 * 60) {
            if self.matches(&candidate) {
                return Some(candidate.with_timezone(&Utc));
            }
            candidate = candidate + chrono::Duration::minutes(1);
        }
        None
    }
}

#[derive(Debug, Clone)]
enum WakeKind {
    /// Resume a suspended execution.
    Resume { execution_id: String },
    /// Fire a cron trigger, then reschedule it.
    Cron {
        agent_id: String,
        flow_id: String,
        schedule: CronSchedule,
        timezone: Tz,
    },
}

#[derive(Debug, Clone)]
struct ScheduledItem {
    wake_at: i64,
    sequence: u64,
    kind: WakeKind,
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.sequence == other.sequence
    }
}
impl Eq for ScheduledItem {}
impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.wake_at, self.sequence).cmp(&(other.wake_at, other.sequence))
    }
}

/// Priority queue of wake-ups with a single worker task. Delayed node
/// resumptions and cron triggers both land here; cron entries reschedule
/// themselves after firing.
pub struct Scheduler {
    queue: Mutex<BinaryHeap<Reverse<ScheduledItem>>>,
    sequence: std::sync::atomic::AtomicU64,
    notify: Notify,
    trigger_tx: mpsc::Sender<TriggerWork>,
    persistence: Arc<Persistence>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(trigger_tx: mpsc::Sender<TriggerWork>, persistence: Arc<Persistence>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            queue: Mutex::new(BinaryHeap::new()),
            sequence: std::sync::atomic::AtomicU64::new(0),
            notify: Notify::new(),
            trigger_tx,
            persistence,
            shutdown,
        })
    }

    /// Schedule a suspended execution's wake-up. The durable token is already
    /// in persistence; this is the in-memory fast path.
    pub async fn schedule_resume(&self, wake_at: i64, execution_id: &str) {
        self.push(ScheduledItem {
            wake_at,
            sequence: self.next_sequence(),
            kind: WakeKind::Resume {
                execution_id: execution_id.to_string(),
            },
        })
        .await;
    }

    /// Register every active schedule-triggered flow. Existing cron entries
    /// are replaced.
    pub async fn sync_cron(&self, flows: &FlowService) {
        let scheduled = flows.scheduled_flows().await;
        let mut queue = self.queue.lock().await;
        queue.retain(|Reverse(item)| !matches!(item.kind, WakeKind::Cron { .. }));

        let now = Utc::now();
        for flow in scheduled {
            let TriggerSpec::Schedule { cron, timezone } = &flow.trigger else {
                continue;
            };
            let schedule = match CronSchedule::from_str(cron) {
                Ok(s) => s,
                Err(e) => {
                    warn!(flow_id = %flow.flow_id, error = %e, "Skipping flow with bad cron");
                    continue;
                }
            };
            let tz = timezone
                .as_deref()
                .and_then(|name| name.parse::<Tz>().ok())
                .unwrap_or(chrono_tz::UTC);

            match schedule.next_after(now, tz) {
                Some(next) => {
                    debug!(flow_id = %flow.flow_id, next = %next, "Cron entry scheduled");
                    queue.push(Reverse(ScheduledItem {
                        wake_at: next.timestamp_millis(),
                        sequence: self.next_sequence(),
                        kind: WakeKind::Cron {
                            agent_id: flow.agent_id.clone(),
                            flow_id: flow.flow_id.clone(),
                            schedule,
                            timezone: tz,
                        },
                    }));
                }
                None => warn!(flow_id = %flow.flow_id, "Cron never fires"),
            }
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Replay durable resumption tokens at boot: fire the due ones and queue
    /// the rest.
    pub async fn replay_persisted(&self) {
        match self.persistence.due_resumptions(i64::MAX).await {
            Ok(rows) => {
                let now = now_ms();
                let mut due = 0;
                for row in rows {
                    let wake_at = row.wake_at.unwrap_or(now);
                    if wake_at <= now {
                        due += 1;
                    }
                    self.push(ScheduledItem {
                        wake_at: wake_at.max(now),
                        sequence: self.next_sequence(),
                        kind: WakeKind::Resume {
                            execution_id: row.execution_id,
                        },
                    })
                    .await;
                }
                info!(due, "Persisted resumption tokens replayed");
            }
            Err(e) => error!(error = %e, "Failed to replay resumption tokens"),
        }
    }

    pub fn spawn_worker(self: &Arc<Self>) {
        let scheduler = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let next_wake = {
                    let queue = scheduler.queue.lock().await;
                    queue.peek().map(|Reverse(item)| item.wake_at)
                };

                let sleep = match next_wake {
                    Some(wake_at) => {
                        let delta = (wake_at - now_ms()).max(0) as u64;
                        Duration::from_millis(delta.min(60_000))
                    }
                    None => Duration::from_secs(60),
                };

                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = scheduler.notify.notified() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }

                scheduler.fire_due().await;
            }
            debug!("Scheduler worker stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn fire_due(&self) {
        loop {
            let item = {
                let mut queue = self.queue.lock().await;
                match queue.peek() {
                    Some(Reverse(item)) if item.wake_at <= now_ms() => {
                        queue.pop().map(|Reverse(item)| item)
                    }
                    _ => None,
                }
            };
            let Some(item) = item else { break };

            match item.kind {
                WakeKind::Resume { execution_id } => {
                    debug!(execution_id = %execution_id, "Resuming suspended execution");
                    if self
                        .trigger_tx
                        .send(TriggerWork::Resume { execution_id })
                        .await
                        .is_err()
                    {
                        error!("Flow engine queue closed, dropping resume");
                    }
                }
                WakeKind::Cron {
                    agent_id,
                    flow_id,
                    schedule,
                    timezone,
                } => {
                    debug!(flow_id = %flow_id, "Cron trigger fired");
                    if self
                        .trigger_tx
                        .send(TriggerWork::Scheduled {
                            agent_id: agent_id.clone(),
                            flow_id: flow_id.clone(),
                        })
                        .await
                        .is_err()
                    {
                        error!("Flow engine queue closed, dropping cron fire");
                    }

                    // Self-reschedule.
                    if let Some(next) = schedule.next_after(Utc::now(), timezone) {
                        self.push(ScheduledItem {
                            wake_at: next.timestamp_millis(),
                            sequence: self.next_sequence(),
                            kind: WakeKind::Cron {
                                agent_id,
                                flow_id,
                                schedule,
                                timezone,
                            },
                        })
                        .await;
                    }
                }
            }
        }
    }

    async fn push(&self, item: ScheduledItem) {
        let mut queue = self.queue.lock().await;
        queue.push(Reverse(item));
        drop(queue);
        self.notify.notify_one();
    }

    fn next_sequence(&self) -> u64 {
        self.sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stars_and_steps() {
        let s = CronSchedule::from_str("*/15 9-17 * * 1-5").unwrap();
        assert_eq!(s.minutes, vec![0, 15, 30, 45]);
        assert_eq!(s.hours, (9..=17).collect::<Vec<_>>());
        assert_eq!(s.days_of_week, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(CronSchedule::from_str("* * * *").is_err());
        assert!(CronSchedule::from_str("61 * * * *").is_err());
        assert!(CronSchedule::from_str("*/0 * * * *").is_err());
    }

    #[test]
    fn next_after_finds_next_minute() {
        let s = CronSchedule::from_str("30 12 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let next = s.next_after(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn next_after_rolls_to_next_day() {
        let s = CronSchedule::from_str("0 0 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 30).unwrap();
        let next = s.next_after(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn timezone_is_respected() {
        // 09:00 in Berlin (CEST, UTC+2 in June) is 07:00 UTC.
        let s = CronSchedule::from_str("0 9 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let next = s
            .next_after(after, "Europe/Berlin".parse().unwrap())
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap());
    }
}
