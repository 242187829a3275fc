//! Time-slot scheduler
//!
//! Fires a posting cycle at each configured time of day. The loop is a single
//! task that sleeps until the next slot; any control change (slots, enable,
//! reset, reload) wakes it so a stale wait is dropped at once. Shutdown only
//! interrupts the wait, a cycle that already started always runs to the end.
//!
//! Slots missed while the process was down are not caught up: on load the
//! next trigger is computed from the current time.

pub mod slots;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{AutopostError, Result};
use crate::orchestrator::CycleOutcome;
use crate::service::events::{Event, EventBus};
use crate::types::SchedulerState;
use slots::{next_slot_after, normalize, parse_slots, TimeSlot};

/// Runs one posting cycle when a slot fires
pub type FireHandler =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<CycleOutcome>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No trigger pending (disabled, suspended, no slots, or loop not running)
    Idle,
    Waiting,
    /// A cycle started by a slot is running
    Fired,
}

pub struct TimeSlotScheduler {
    db: Database,
    tz: Tz,
    default_slots: Vec<TimeSlot>,
    state: Mutex<SchedulerState>,
    phase: StdMutex<Phase>,
    wake: Notify,
    events: EventBus,
}

fn recompute(state: &mut SchedulerState, tz: Tz, now: DateTime<Utc>) {
    state.slots = normalize(std::mem::take(&mut state.slots));
    state.next_run = if state.enabled && state.suspended_reason.is_none() {
        next_slot_after(&state.slots, tz, now).map(|t| t.timestamp())
    } else {
        None
    };
}

impl TimeSlotScheduler {
    /// Restore persisted state, or start from `default_slots` on first run
    pub async fn load(
        db: Database,
        tz: Tz,
        default_slots: Vec<TimeSlot>,
        events: EventBus,
    ) -> Result<Self> {
        let mut state = match db.load_state().await? {
            Some(state) => {
                debug!(slots = state.slots.len(), enabled = state.enabled, "Loaded scheduler state");
                state
            }
            None => SchedulerState::new(default_slots.clone()),
        };
        recompute(&mut state, tz, Utc::now());
        db.save_state(&state).await?;

        Ok(Self {
            db,
            tz,
            default_slots: normalize(default_slots),
            state: Mutex::new(state),
            phase: StdMutex::new(Phase::Idle),
            wake: Notify::new(),
            events,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub async fn state(&self) -> SchedulerState {
        self.state.lock().await.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    /// Earliest configured slot strictly after the current time
    pub async fn get_next_slot(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        next_slot_after(&state.slots, self.tz, Utc::now())
    }

    /// Apply a change, persist it, then wake the loop
    ///
    /// Memory is only updated once the store accepted the new state.
    async fn update<F>(&self, change: F) -> Result<SchedulerState>
    where
        F: FnOnce(&mut SchedulerState) -> Result<()>,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        change(&mut next)?;
        recompute(&mut next, self.tz, Utc::now());
        self.db.save_state(&next).await?;
        *guard = next.clone();
        drop(guard);

        self.wake.notify_one();
        Ok(next)
    }

    pub async fn set_slots<S: AsRef<str>>(&self, times: &[S]) -> Result<SchedulerState> {
        let parsed = parse_slots(times)?;
        let state = self
            .update(|state| {
                state.slots = parsed;
                Ok(())
            })
            .await?;
        info!(slots = ?state.slots.iter().map(|s| s.to_string()).collect::<Vec<_>>(), "Time slots replaced");
        Ok(state)
    }

    pub async fn add_slot(&self, time: &str) -> Result<SchedulerState> {
        let slot = TimeSlot::parse(time)?;
        self.update(|state| {
            state.slots.push(slot);
            Ok(())
        })
        .await
    }

    pub async fn remove_slot(&self, time: &str) -> Result<SchedulerState> {
        let slot = TimeSlot::parse(time)?;
        self.update(|state| {
            let before = state.slots.len();
            state.slots.retain(|s| *s != slot);
            if state.slots.len() == before {
                return Err(AutopostError::InvalidInput(format!("no slot at {}", slot)));
            }
            Ok(())
        })
        .await
    }

    /// Enabling also clears an automatic suspension
    pub async fn set_enabled(&self, enabled: bool) -> Result<SchedulerState> {
        let state = self
            .update(|state| {
                state.enabled = enabled;
                if enabled {
                    state.suspended_reason = None;
                }
                Ok(())
            })
            .await?;
        info!(enabled, "Scheduler toggled");
        Ok(state)
    }

    /// Back to configured defaults: default slots, enabled, no history of runs
    pub async fn reset(&self) -> Result<SchedulerState> {
        let defaults = self.default_slots.clone();
        self.update(|state| {
            *state = SchedulerState::new(defaults);
            Ok(())
        })
        .await
    }

    /// Pick up changes another process wrote to the store
    pub async fn reload(&self) -> Result<SchedulerState> {
        let Some(stored) = self.db.load_state().await? else {
            return Ok(self.state().await);
        };
        let mut guard = self.state.lock().await;
        *guard = stored;
        recompute(&mut guard, self.tz, Utc::now());
        let state = guard.clone();
        drop(guard);

        self.wake.notify_one();
        info!("Scheduler state reloaded");
        Ok(state)
    }

    /// Adopt slots and the enabled flag as currently stored
    ///
    /// Another process may have edited them without signalling this one.
    async fn refresh_from_store(&self, state: &mut SchedulerState) {
        match self.db.load_state().await {
            Ok(Some(stored)) => {
                state.version = stored.version;
                state.enabled = stored.enabled;
                state.slots = stored.slots;
                state.suspended_reason = stored.suspended_reason;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not re-read scheduler state, keeping the loaded one"),
        }
    }

    async fn suspend(&self, reason: String) {
        let mut guard = self.state.lock().await;
        self.refresh_from_store(&mut guard).await;
        guard.suspended_reason = Some(reason.clone());
        guard.next_run = None;
        if let Err(e) = self.db.save_run_state(&guard).await {
            error!(error = %e, "Could not persist scheduler suspension");
        }
        drop(guard);

        error!(reason = %reason, "Automatic posting suspended");
        self.events.emit(Event::SchedulerSuspended { reason });
    }

    /// Drive the schedule until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, handler: FireHandler) {
        info!(timezone = %self.tz, "Scheduler starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next_run = self.state.lock().await.next_run;
            let Some(target) = next_run.and_then(|ts| Utc.timestamp_opt(ts, 0).single()) else {
                self.set_phase(Phase::Idle);
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.wake.notified() => {}
                }
                continue;
            };

            self.set_phase(Phase::Waiting);
            let wait = (target - Utc::now()).to_std().unwrap_or_default();
            debug!(next_run = %target, wait_secs = wait.as_secs(), "Waiting for next slot");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = self.wake.notified() => continue,
                _ = sleep_until(Instant::now() + wait) => {}
            }

            // A change may have landed between reading next_run and the timer firing
            if self.state.lock().await.next_run != Some(target.timestamp()) {
                continue;
            }

            self.set_phase(Phase::Fired);
            self.fire(&handler).await;
        }

        self.set_phase(Phase::Idle);
        info!("Scheduler stopped");
    }

    async fn fire(&self, handler: &FireHandler) {
        let fired_at = Utc::now();
        info!(at = %fired_at, "Time slot reached, starting cycle");
        self.events.emit(Event::SchedulerFired {
            at: fired_at.timestamp(),
        });

        let suspend_reason = match handler().await {
            Ok(outcome) => {
                if matches!(outcome, CycleOutcome::Idle) {
                    info!("Nothing pending at this slot");
                }
                outcome.suspend_reason()
            }
            Err(AutopostError::Busy) => {
                warn!("A manual cycle is running, skipping this slot");
                None
            }
            Err(e) if e.suspends_scheduler() => Some(e.to_string()),
            Err(e) => {
                error!(error = %e, "Scheduled cycle failed");
                None
            }
        };

        {
            let mut guard = self.state.lock().await;
            self.refresh_from_store(&mut guard).await;
            guard.last_run = Some(fired_at.timestamp());
            recompute(&mut guard, self.tz, Utc::now().max(fired_at));
            if let Err(e) = self.db.save_run_state(&guard).await {
                error!(error = %e, "Could not persist scheduler state after firing");
            }
        }

        if let Some(reason) = suspend_reason {
            self.suspend(reason).await;
        }
    }

    #[cfg(test)]
    async fn force_next_run(&self, at: DateTime<Utc>) {
        self.state.lock().await.next_run = Some(at.timestamp());
        self.wake.notify_one();
    }
}
