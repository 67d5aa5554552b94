//! Scheduled, conditional, and manual task triggers

use crate::cron::CronSchedule;
use crate::manager::TaskManager;
use chrono::{DateTime, Utc};
use finflow_common::{
    metrics::MetricsCollector, Error, Result, TaskId, TriggerId, TriggerStatus, TriggerType,
};
use finflow_core::{CancelToken, Clock, CoreEvent, EventBus, Task};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Injected predicate for CONDITION triggers
pub type ConditionFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// A rule that fires a task-template instantiation on a schedule or condition
#[derive(Clone)]
pub struct Trigger {
    pub id: TriggerId,
    pub name: String,
    pub trigger_type: TriggerType,
    /// Cloned with a fresh identity on every fire
    pub task_template: Task,
    pub interval: Option<Duration>,
    pub cron: Option<CronSchedule>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub condition: Option<ConditionFn>,
    pub status: TriggerStatus,
    pub last_triggered: Option<DateTime<Utc>>,
    pub next_trigger: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub error_count: u64,
    /// Minimum gap between fires of this trigger
    pub cooldown: Duration,
    last_condition: bool,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("trigger_type", &self.trigger_type)
            .field("status", &self.status)
            .field("next_trigger", &self.next_trigger)
            .field("trigger_count", &self.trigger_count)
            .field("error_count", &self.error_count)
            .finish()
    }
}

impl Trigger {
    fn base(name: impl Into<String>, trigger_type: TriggerType, task_template: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            trigger_type,
            task_template,
            interval: None,
            cron: None,
            scheduled_time: None,
            condition: None,
            status: TriggerStatus::Enabled,
            last_triggered: None,
            next_trigger: None,
            trigger_count: 0,
            error_count: 0,
            cooldown: Duration::ZERO,
            last_condition: false,
        }
    }

    /// Fires every `interval`, starting at the first tick
    pub fn interval(name: impl Into<String>, task_template: Task, interval: Duration) -> Self {
        let mut trigger = Self::base(name, TriggerType::Interval, task_template);
        trigger.interval = Some(interval);
        trigger
    }

    /// Fires per a five-field crontab expression, in UTC
    pub fn cron(
        name: impl Into<String>,
        task_template: Task,
        expression: &str,
    ) -> Result<Self> {
        let mut trigger = Self::base(name, TriggerType::Cron, task_template);
        trigger.cron = Some(CronSchedule::parse(expression)?);
        Ok(trigger)
    }

    /// Fires once at `scheduled_time`, then disables itself
    pub fn once(
        name: impl Into<String>,
        task_template: Task,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        let mut trigger = Self::base(name, TriggerType::Once, task_template);
        trigger.scheduled_time = Some(scheduled_time);
        trigger
    }

    /// Fires on the rising edge of the injected predicate
    pub fn condition(
        name: impl Into<String>,
        task_template: Task,
        condition: ConditionFn,
    ) -> Self {
        let mut trigger = Self::base(name, TriggerType::Condition, task_template);
        trigger.condition = Some(condition);
        trigger
    }

    /// Never auto-fires; fired via `TriggerManager::manual_trigger`
    pub fn manual(name: impl Into<String>, task_template: Task) -> Self {
        Self::base(name, TriggerType::Manual, task_template)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match (self.last_triggered, chrono::Duration::from_std(self.cooldown)) {
            (Some(last), Ok(cooldown)) => now < last + cooldown,
            _ => false,
        }
    }

    /// Initial next-fire instant when the trigger is added or re-enabled
    fn initial_next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.trigger_type {
            TriggerType::Interval => Some(now),
            TriggerType::Cron => self.cron.as_ref().and_then(|c| c.next_after(now)),
            TriggerType::Once => self.scheduled_time,
            TriggerType::Condition | TriggerType::Manual => None,
        }
    }

    /// Advance the schedule after a successful fire at `now`.
    ///
    /// Computed from `now` rather than the missed instant, so an oversleeping
    /// scheduler fires at most one catch-up per tick.
    fn advance_after_fire(&mut self, now: DateTime<Utc>) {
        match self.trigger_type {
            TriggerType::Interval => {
                let interval = self
                    .interval
                    .and_then(|i| chrono::Duration::from_std(i).ok())
                    .unwrap_or_else(chrono::Duration::zero);
                self.next_trigger = Some(now + interval);
            }
            TriggerType::Cron => {
                self.next_trigger = self.cron.as_ref().and_then(|c| c.next_after(now));
            }
            TriggerType::Once => {
                self.next_trigger = None;
                self.status = TriggerStatus::Disabled;
            }
            TriggerType::Condition | TriggerType::Manual => {}
        }
    }
}

/// Owns triggers and fires task instantiations into the task manager.
///
/// Trigger evaluation runs under its own lock and never holds the task
/// manager's lock.
pub struct TriggerManager {
    manager: TaskManager,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<dyn MetricsCollector>,
    tick_interval: Duration,
    triggers: Mutex<HashMap<TriggerId, Trigger>>,
    shutdown: Mutex<CancelToken>,
}

impl TriggerManager {
    pub fn new(
        manager: TaskManager,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Arc<dyn MetricsCollector>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            manager,
            clock,
            events,
            metrics,
            tick_interval,
            triggers: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(CancelToken::new()),
        }
    }

    pub fn add_trigger(&self, mut trigger: Trigger) -> TriggerId {
        let now = self.clock.now_utc();
        trigger.next_trigger = trigger.initial_next(now);
        let trigger_id = trigger.id;
        info!(trigger_id = %trigger_id, name = %trigger.name,
            trigger_type = trigger.trigger_type.as_str(), "trigger added");
        self.triggers.lock().insert(trigger_id, trigger);
        trigger_id
    }

    pub fn remove_trigger(&self, trigger_id: TriggerId) -> Option<Trigger> {
        self.triggers.lock().remove(&trigger_id)
    }

    pub fn get_trigger(&self, trigger_id: TriggerId) -> Option<Trigger> {
        self.triggers.lock().get(&trigger_id).cloned()
    }

    pub fn list_triggers(&self, trigger_type: Option<TriggerType>) -> Vec<Trigger> {
        self.triggers
            .lock()
            .values()
            .filter(|t| trigger_type.map_or(true, |ty| t.trigger_type == ty))
            .cloned()
            .collect()
    }

    pub fn enable_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        let now = self.clock.now_utc();
        let mut triggers = self.triggers.lock();
        let trigger = triggers
            .get_mut(&trigger_id)
            .ok_or_else(|| Error::Internal(format!("trigger not found: {trigger_id}")))?;
        trigger.status = TriggerStatus::Enabled;
        trigger.next_trigger = trigger.initial_next(now);
        Ok(())
    }

    pub fn disable_trigger(&self, trigger_id: TriggerId) -> Result<()> {
        let mut triggers = self.triggers.lock();
        let trigger = triggers
            .get_mut(&trigger_id)
            .ok_or_else(|| Error::Internal(format!("trigger not found: {trigger_id}")))?;
        trigger.status = TriggerStatus::Disabled;
        Ok(())
    }

    /// Fire a trigger immediately, regardless of its schedule
    #[instrument(skip(self))]
    pub async fn manual_trigger(&self, trigger_id: TriggerId) -> Result<TaskId> {
        let now = self.clock.now_utc();
        let task = {
            let triggers = self.triggers.lock();
            let trigger = triggers
                .get(&trigger_id)
                .ok_or_else(|| Error::Internal(format!("trigger not found: {trigger_id}")))?;
            trigger.task_template.instantiate(now)
        };
        self.commit_fire(trigger_id, task, now).await
    }

    /// Start the ticker loop
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let shutdown = CancelToken::new();
        *self.shutdown.lock() = shutdown.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("trigger ticker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = this.clock.sleep(this.tick_interval) => {}
                }
                this.tick().await;
            }
            info!("trigger ticker stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.lock().cancel();
    }

    /// Evaluate every enabled trigger once and fire those that are due
    pub async fn tick(&self) {
        let now = self.clock.now_utc();
        let due: Vec<(TriggerId, Task)> = {
            let mut triggers = self.triggers.lock();
            let mut due = Vec::new();
            for trigger in triggers.values_mut() {
                if trigger.status != TriggerStatus::Enabled {
                    continue;
                }
                let fire = match trigger.trigger_type {
                    TriggerType::Interval | TriggerType::Cron | TriggerType::Once => {
                        trigger.next_trigger.map_or(false, |next| now >= next)
                    }
                    TriggerType::Condition => {
                        let Some(condition) = trigger.condition.clone() else {
                            continue;
                        };
                        let current = condition();
                        let rising = current && !trigger.last_condition;
                        trigger.last_condition = current;
                        rising
                    }
                    TriggerType::Manual => false,
                };
                if fire && !trigger.in_cooldown(now) {
                    due.push((trigger.id, trigger.task_template.instantiate(now)));
                }
            }
            due
        };

        for (trigger_id, task) in due {
            let _ = self.commit_fire(trigger_id, task, now).await;
        }
    }

    /// Enqueue the instance and update trigger bookkeeping
    async fn commit_fire(
        &self,
        trigger_id: TriggerId,
        task: Task,
        now: DateTime<Utc>,
    ) -> Result<TaskId> {
        let enqueue = async {
            let task_id = self.manager.create_task(task).await?;
            self.manager.enqueue_task(task_id).await?;
            Ok::<TaskId, Error>(task_id)
        }
        .await;

        let mut triggers = self.triggers.lock();
        let trigger = triggers
            .get_mut(&trigger_id)
            .ok_or_else(|| Error::Internal(format!("trigger not found: {trigger_id}")))?;

        match enqueue {
            Ok(task_id) => {
                trigger.last_triggered = Some(now);
                trigger.trigger_count += 1;
                trigger.advance_after_fire(now);
                let trigger_type = trigger.trigger_type;
                drop(triggers);
                self.metrics.record_trigger_fire(trigger_type.as_str());
                self.events.publish(CoreEvent::TriggerFired { trigger_id, task_id });
                Ok(task_id)
            }
            Err(e) => {
                warn!(trigger_id = %trigger_id, error = %e, "trigger fire failed to enqueue");
                trigger.error_count += 1;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TaskManagerConfig;
    use chrono::NaiveDate;
    use finflow_common::metrics::NoopMetricsCollector;
    use finflow_common::ValueMap;
    use finflow_core::{HandlerRegistry, ManualClock};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    fn epoch() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, 3, 27)
            .unwrap()
            .and_utc()
    }

    fn harness(clock: Arc<ManualClock>) -> (TaskManager, Arc<TriggerManager>) {
        let manager = TaskManager::new(
            TaskManagerConfig::default(),
            Arc::new(HandlerRegistry::new()),
            clock.clone(),
            EventBus::default(),
            Arc::new(NoopMetricsCollector),
            None,
        );
        manager
            .registry()
            .register_fn("tick_work", |_t, _p, _c| async { Ok(ValueMap::new()) });
        let triggers = Arc::new(TriggerManager::new(
            manager.clone(),
            clock,
            EventBus::default(),
            Arc::new(NoopMetricsCollector),
            Duration::from_secs(1),
        ));
        (manager, triggers)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn interval_trigger_fires_once_per_interval() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        triggers.start();
        settle().await;

        let trigger_id = triggers.add_trigger(Trigger::interval(
            "every second",
            Task::new("tick", "tick_work"),
            Duration::from_secs(1),
        ));

        for _ in 0..10 {
            clock.advance(Duration::from_secs(1));
            settle().await;
        }

        let trigger = triggers.get_trigger(trigger_id).unwrap();
        assert!(
            (9..=11).contains(&trigger.trigger_count),
            "fired {} times",
            trigger.trigger_count
        );

        // Every fire produced a distinct task instance.
        let tasks = manager.list_tasks(None, Some("tick_work"));
        assert_eq!(tasks.len() as u64, trigger.trigger_count);
        let mut ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len() as u64, trigger.trigger_count);
    }

    #[tokio::test]
    async fn once_trigger_fires_then_disables() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        triggers.start();
        settle().await;

        let trigger_id = triggers.add_trigger(Trigger::once(
            "one shot",
            Task::new("tick", "tick_work"),
            epoch() + chrono::Duration::seconds(5),
        ));

        for _ in 0..10 {
            clock.advance(Duration::from_secs(1));
            settle().await;
        }

        let trigger = triggers.get_trigger(trigger_id).unwrap();
        assert_eq!(trigger.trigger_count, 1);
        assert_eq!(trigger.status, TriggerStatus::Disabled);
        assert!(trigger.next_trigger.is_none());
    }

    #[tokio::test]
    async fn cron_trigger_computes_next_minute_mark() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        triggers.start();
        settle().await;

        // now = 12:03:27; the next matching instant is 12:05:00.
        let trigger_id = triggers.add_trigger(
            Trigger::cron("five minutes", Task::new("tick", "tick_work"), "*/5 * * * *").unwrap(),
        );
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, 5, 0)
            .unwrap()
            .and_utc();
        assert_eq!(
            triggers.get_trigger(trigger_id).unwrap().next_trigger,
            Some(expected)
        );

        // One oversized advance produces a single catch-up fire.
        clock.advance(Duration::from_secs(120));
        settle().await;

        let trigger = triggers.get_trigger(trigger_id).unwrap();
        assert_eq!(trigger.trigger_count, 1);
        let next = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, 10, 0)
            .unwrap()
            .and_utc();
        assert_eq!(trigger.next_trigger, Some(next));
    }

    #[tokio::test]
    async fn condition_trigger_fires_on_rising_edge() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        settle().await;

        let flag = Arc::new(AtomicBool::new(false));
        let predicate_flag = Arc::clone(&flag);
        let trigger_id = triggers.add_trigger(Trigger::condition(
            "on flag",
            Task::new("tick", "tick_work"),
            Arc::new(move || predicate_flag.load(AtomicOrdering::SeqCst)),
        ));

        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 0);

        flag.store(true, AtomicOrdering::SeqCst);
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 1);

        // Still true: no new edge, no fire.
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 1);

        // Falling then rising again fires once more.
        flag.store(false, AtomicOrdering::SeqCst);
        triggers.tick().await;
        flag.store(true, AtomicOrdering::SeqCst);
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 2);
    }

    #[tokio::test]
    async fn cooldown_suppresses_rapid_fires() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        settle().await;

        let flag = Arc::new(AtomicBool::new(false));
        let predicate_flag = Arc::clone(&flag);
        let trigger_id = triggers.add_trigger(
            Trigger::condition(
                "guarded",
                Task::new("tick", "tick_work"),
                Arc::new(move || predicate_flag.load(AtomicOrdering::SeqCst)),
            )
            .with_cooldown(Duration::from_secs(60)),
        );

        flag.store(true, AtomicOrdering::SeqCst);
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 1);

        // A new edge within the cooldown window does not fire.
        flag.store(false, AtomicOrdering::SeqCst);
        triggers.tick().await;
        flag.store(true, AtomicOrdering::SeqCst);
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 1);

        // After the cooldown elapses the edge fires again.
        clock.advance(Duration::from_secs(61));
        flag.store(false, AtomicOrdering::SeqCst);
        triggers.tick().await;
        flag.store(true, AtomicOrdering::SeqCst);
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 2);
    }

    #[tokio::test]
    async fn manual_trigger_fires_and_enqueue_failure_counts_errors() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        settle().await;

        let trigger_id =
            triggers.add_trigger(Trigger::manual("by hand", Task::new("tick", "tick_work")));

        // Manual triggers never auto-fire.
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 0);

        let task_id = triggers.manual_trigger(trigger_id).await.unwrap();
        assert!(manager.get_task(task_id).is_some());
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 1);

        // A stopped manager refuses enqueues; the trigger records the error
        // but stays enabled.
        manager.stop().await;
        assert!(triggers.manual_trigger(trigger_id).await.is_err());
        let trigger = triggers.get_trigger(trigger_id).unwrap();
        assert_eq!(trigger.error_count, 1);
        assert_eq!(trigger.status, TriggerStatus::Enabled);
    }

    #[tokio::test]
    async fn disabled_trigger_does_not_fire() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (manager, triggers) = harness(Arc::clone(&clock));
        manager.start();
        settle().await;

        let trigger_id = triggers.add_trigger(Trigger::interval(
            "paused schedule",
            Task::new("tick", "tick_work"),
            Duration::from_secs(1),
        ));
        triggers.disable_trigger(trigger_id).unwrap();

        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 0);

        triggers.enable_trigger(trigger_id).unwrap();
        triggers.tick().await;
        assert_eq!(triggers.get_trigger(trigger_id).unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn list_triggers_filters_by_type() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let (_manager, triggers) = harness(Arc::clone(&clock));

        triggers.add_trigger(Trigger::interval(
            "a",
            Task::new("tick", "tick_work"),
            Duration::from_secs(1),
        ));
        triggers.add_trigger(Trigger::manual("b", Task::new("tick", "tick_work")));

        assert_eq!(triggers.list_triggers(None).len(), 2);
        assert_eq!(
            triggers.list_triggers(Some(TriggerType::Manual)).len(),
            1
        );
    }
}
