//! Wall-clock triggers: one daily start per program that has a start time,
//! plus a midnight refresh of every program's derived state.
//!
//! Each trigger is its own task that sleeps until the next occurrence of
//! its local time of day, fires, and re-arms. The delay is recomputed from
//! the wall clock every time, so DST changes and clock corrections are
//! picked up on the next arming.

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;

/// Scheduled runs never consult the predicate.
pub const SCHEDULED_SKIP_PREDICATE: bool = true;

/// First occurrence of `at` strictly after `now`.
pub fn next_run_after(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// How long to sleep from `now` until the next `at` in `now`'s time zone.
///
/// An ambiguous local time (clocks going back) fires at its first
/// occurrence. A local time skipped by a forward jump is reached by adding
/// the naive wall-clock difference, so it fires as far past the jump as it
/// sat inside the gap: 02:30 in a 02:00 to 03:00 gap fires at 03:30.
pub fn delay_until<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Duration {
    let local_now = now.naive_local();
    let next = next_run_after(local_now, at);
    let delta = match now.timezone().from_local_datetime(&next) {
        LocalResult::Single(target) => target - now.clone(),
        LocalResult::Ambiguous(earliest, _) => earliest - now.clone(),
        LocalResult::None => next - local_now,
    };
    delta.to_std().unwrap_or_default()
}

/// Fire `fire` every day at local time `at` until `cancel` is triggered.
async fn every_day_at<F, Fut>(at: NaiveTime, cancel: CancellationToken, mut fire: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let delay = delay_until(&Local::now(), at);
        debug!(at = %at.format("%H:%M"), delay_sec = delay.as_secs(), "trigger armed");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        fire().await;

        // Monotonic and wall clocks drift; don't let an early wake-up
        // re-arm for the same occurrence.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

pub fn spawn_program_trigger(
    dispatcher: Dispatcher,
    program_id: String,
    at: NaiveTime,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!(program = %program_id, at = %at.format("%H:%M"), "daily trigger registered");
    tokio::spawn(every_day_at(at, cancel, move || {
        let dispatcher = dispatcher.clone();
        let program_id = program_id.clone();
        async move {
            info!(program = %program_id, "daily trigger fired");
            // Unknown ids are logged by the dispatcher.
            let _ = dispatcher
                .run_program(&program_id, SCHEDULED_SKIP_PREDICATE)
                .await;
        }
    }))
}

pub fn spawn_midnight_refresh(dispatcher: Dispatcher, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(every_day_at(NaiveTime::MIN, cancel, move || {
        let dispatcher = dispatcher.clone();
        async move {
            debug!("midnight refresh");
            dispatcher.refresh_all();
        }
    }))
}

/// Register a daily trigger for every program with a start time, plus the
/// midnight refresh.
pub fn spawn_all(dispatcher: &Dispatcher, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    let mut tasks: Vec<JoinHandle<()>> = dispatcher
        .registry()
        .programs
        .values()
        .filter_map(|p| {
            p.start_time().map(|at| {
                spawn_program_trigger(dispatcher.clone(), p.id().to_string(), at, cancel.child_token())
            })
        })
        .collect();
    tasks.push(spawn_midnight_refresh(dispatcher.clone(), cancel.child_token()));
    tasks
}

// ===========================================================================
// Tests
// ===========================================================================
