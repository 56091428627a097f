use super::*;
use crate::resilience::ResilienceError;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn moscow() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).unwrap()
}

fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
    moscow()
        .with_ymd_and_hms(2025, 3, 14, hour, minute, 0)
        .unwrap()
}

fn time(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

fn nine_to_ten_past() -> SchedulerConfig {
    SchedulerConfig {
        windows: vec!["09:00-09:10".parse().unwrap()],
        short_cadence_minutes: 1,
        long_cadence_minutes: 30,
        max_total_attempts: 10,
        auto_retry: true,
    }
}

fn scheduler_at(config: SchedulerConfig, hour: u32, minute: u32) -> AdaptiveScheduler {
    AdaptiveScheduler::new(config, Arc::new(AnchoredClock::new(at(hour, minute))))
}

#[test]
fn test_window_parsing() {
    let window: ScheduleWindow = " 8:55 - 09:10 ".parse().unwrap();
    assert_eq!(window.start(), time(8, 55));
    assert_eq!(window.end(), time(9, 10));
    assert_eq!(window.to_string(), "08:55-09:10");

    assert!(matches!(
        "0855-0910".parse::<ScheduleWindow>(),
        Err(WindowParseError::Format(_))
    ));
    assert!(matches!(
        "25:00-26:00".parse::<ScheduleWindow>(),
        Err(WindowParseError::Time(_))
    ));

    let windows = parse_windows("08:55-09:10, 09:55-10:10,").unwrap();
    assert_eq!(windows, default_windows());
    assert!(parse_windows("08:55-09:10,bogus").is_err());
}

#[test]
fn test_window_bounds_are_inclusive() {
    let window = ScheduleWindow::from_hm(9, 0, 9, 10).unwrap();
    assert!(window.contains(time(9, 0)));
    assert!(window.contains(time(9, 10)));
    assert!(!window.contains(time(8, 59)));
    assert!(!window.contains(NaiveTime::from_hms_opt(9, 10, 1).unwrap()));
}

#[test]
fn test_window_wrapping_midnight() {
    let window: ScheduleWindow = "23:30-00:30".parse().unwrap();
    assert!(window.wraps_midnight());
    assert!(window.contains(time(23, 45)));
    assert!(window.contains(time(0, 15)));
    assert!(!window.contains(time(12, 0)));
}

#[test]
fn test_window_serde_uses_string_form() {
    let windows: Vec<ScheduleWindow> = serde_json::from_str(r#"["09:00-09:10"]"#).unwrap();
    assert_eq!(windows[0], ScheduleWindow::from_hm(9, 0, 9, 10).unwrap());
    assert_eq!(
        serde_json::to_string(&windows).unwrap(),
        r#"["09:00-09:10"]"#
    );
    assert!(serde_json::from_str::<ScheduleWindow>(r#""9-10""#).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_current_cadence_follows_windows() {
    assert_eq!(
        scheduler_at(nine_to_ten_past(), 9, 5).current_cadence(),
        Duration::from_secs(60)
    );
    assert_eq!(
        scheduler_at(nine_to_ten_past(), 10, 0).current_cadence(),
        Duration::from_secs(30 * 60)
    );
}

#[tokio::test(start_paused = true)]
async fn test_cadence_is_recomputed_as_time_passes() {
    let scheduler = scheduler_at(nine_to_ten_past(), 9, 9);
    assert_eq!(scheduler.current_cadence(), Duration::from_secs(60));

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(scheduler.current_cadence(), Duration::from_secs(30 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_minutes_until_next_window() {
    let config = SchedulerConfig::default();

    let before = scheduler_at(config.clone(), 8, 0);
    assert_eq!(before.minutes_until_next_window(), 55);

    let inside = scheduler_at(config.clone(), 9, 0);
    assert_eq!(inside.minutes_until_next_window(), 0);
    assert!(inside.window_status().in_window());

    let between = scheduler_at(config.clone(), 9, 30);
    let status = between.window_status();
    assert_eq!(status.minutes_until_next, 25);
    assert_eq!(status.next_window.unwrap().to_string(), "09:55-10:10");
    assert!(status.to_string().starts_with("next window 09:55-10:10 in 25m"));

    // after the last window the next one is tomorrow morning
    let evening = scheduler_at(config, 22, 0);
    assert_eq!(evening.minutes_until_next_window(), 2 * 60 + 8 * 60 + 55);
    assert!(evening.window_status().to_string().contains("10h 55m"));
}

#[tokio::test(start_paused = true)]
async fn test_run_switches_cadence_at_window_boundary() {
    let clock = Arc::new(AnchoredClock::new(at(9, 8)));
    let scheduler = AdaptiveScheduler::new(nine_to_ten_past(), clock.clone());
    let seen = &Mutex::new(Vec::new());

    let outcome: ScheduleOutcome<()> = scheduler
        .run_until_success(
            || {
                seen.lock().unwrap().push(clock.now().time());
                async { Err(ResilienceError::Transient("no slots".into())) }
            },
            5,
            ResilienceError::is_retryable,
            || false,
        )
        .await;

    assert!(matches!(
        outcome,
        ScheduleOutcome::Exhausted { attempts: 5, .. }
    ));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![time(9, 8), time(9, 9), time(9, 10), time(9, 11), time(9, 41)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_returns_first_success() {
    let scheduler = scheduler_at(nine_to_ten_past(), 9, 0);
    let calls = &AtomicU32::new(0);

    let outcome = scheduler
        .run_until_success(
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ResilienceError::Timeout(Duration::from_secs(5)))
                } else {
                    Ok("booked")
                }
            },
            10,
            ResilienceError::is_retryable,
            || false,
        )
        .await;

    assert_eq!(
        outcome,
        ScheduleOutcome::Succeeded {
            value: "booked",
            attempts: 3
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_aborts_on_permanent_error() {
    let scheduler = scheduler_at(nine_to_ten_past(), 9, 0);
    let calls = &AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let outcome: ScheduleOutcome<()> = scheduler
        .run_until_success(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Permanent("supply not found".into()))
            },
            10,
            ResilienceError::is_retryable,
            || false,
        )
        .await;

    assert!(matches!(outcome, ScheduleOutcome::Aborted { attempts: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_run_checks_cancellation_before_each_attempt() {
    let scheduler = scheduler_at(nine_to_ten_past(), 9, 0);
    let cancelled = &AtomicBool::new(false);
    let calls = &AtomicU32::new(0);

    let outcome: ScheduleOutcome<()> = scheduler
        .run_until_success(
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    cancelled.store(true, Ordering::SeqCst);
                }
                Err(ResilienceError::Transient("busy".into()))
            },
            10,
            ResilienceError::is_retryable,
            || cancelled.load(Ordering::SeqCst),
        )
        .await;

    assert_eq!(outcome, ScheduleOutcome::Cancelled { attempts: 2 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auto_retry_disabled_makes_one_attempt() {
    let config = SchedulerConfig {
        auto_retry: false,
        ..nine_to_ten_past()
    };
    let scheduler = scheduler_at(config, 9, 0);

    let outcome: ScheduleOutcome<()> = scheduler
        .run_until_success(
            || async { Err(ResilienceError::Transient("busy".into())) },
            10,
            ResilienceError::is_retryable,
            || false,
        )
        .await;

    assert!(matches!(outcome, ScheduleOutcome::Exhausted { attempts: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_token_cancellation_interrupts_sleep() {
    let scheduler = Arc::new(scheduler_at(nine_to_ten_past(), 12, 0));
    let token = CancellationToken::new();

    let run = {
        let scheduler = Arc::clone(&scheduler);
        let token = token.clone();
        tokio::spawn(async move {
            scheduler
                .run_with_token(
                    || async { Err::<(), _>(ResilienceError::Transient("busy".into())) },
                    &token,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(60)).await;
    token.cancel();
    let started = tokio::time::Instant::now();
    let outcome = run.await.unwrap();

    assert_eq!(outcome, ScheduleOutcome::Cancelled { attempts: 1 });
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_cancels_and_joins_jobs() {
    let supervisor = JobSupervisor::new();

    let waiting = supervisor.spawn("waits-for-cancel", |token| async move {
        token.cancelled().await;
        "stopped"
    });
    let quick = supervisor.spawn("quick", |_| async { 7 });

    assert_eq!(quick.join().await.unwrap(), 7);
    tokio::task::yield_now().await;

    let jobs = supervisor.list();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "waits-for-cancel");
    assert!(!jobs[0].cancel_requested);

    assert!(supervisor.cancel(waiting.id()));
    assert_eq!(waiting.join().await.unwrap(), "stopped");
    assert_eq!(supervisor.running(), 0);
    assert!(!supervisor.cancel(uuid::Uuid::new_v4()));
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_shutdown_stops_all_jobs() {
    let supervisor = JobSupervisor::new();
    let stopped = Arc::new(AtomicU32::new(0));

    for i in 0..3 {
        let stopped = Arc::clone(&stopped);
        supervisor.spawn(format!("job-{}", i), move |token| async move {
            token.cancelled().await;
            stopped.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(supervisor.running(), 3);

    supervisor.shutdown().await;
    assert_eq!(stopped.load(Ordering::SeqCst), 3);
    assert_eq!(supervisor.running(), 0);
}
