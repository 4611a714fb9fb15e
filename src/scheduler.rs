//! Periodic warmup trigger.
//!
//! A single ticker task fires on a fixed interval and fans out one tokio task
//! per cycling account into a `JoinSet` owned by the tick. A failing or
//! panicking cycle is logged and never affects the other accounts. Shutdown
//! flips the shared watch channel, which cuts every pending delay short, and
//! then waits up to the grace period for the tick to drain. Past the grace
//! period the ticker is aborted, and dropping the tick's `JoinSet` aborts the
//! cycles with it.

use crate::error::{Error, Result, StateError};
use crate::warmup::{CycleReport, Engine};

use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;

/// Outcome of one fan-out over all cycling accounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Accounts another process was already working on.
    pub skipped: usize,
}

pub struct WarmupScheduler {
    engine: Arc<Engine>,
    interval: Duration,
    shutdown_grace: Duration,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WarmupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupScheduler")
            .field("interval", &self.interval)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl WarmupScheduler {
    /// `shutdown` must be the sender paired with the engine's shutdown receiver.
    pub fn new(
        engine: Arc<Engine>,
        interval: Duration,
        shutdown_grace: Duration,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            engine,
            interval,
            shutdown_grace,
            shutdown,
            ticker: Mutex::new(None),
        }
    }

    /// Start the ticker. Calling it again replaces the running ticker.
    pub async fn start(&self) {
        let engine = self.engine.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval_secs = self.interval.as_secs().max(1);

        let mut ticker_slot = self.ticker.lock().await;
        if let Some(previous) = ticker_slot.take() {
            previous.abort();
            tracing::debug!("aborted existing warmup ticker before restarting");
        }

        let handle = tokio::spawn(async move {
            // Sub-daily intervals that divide a day evenly fire on clean UTC
            // marks (00:00, 06:00, ...) instead of an offset from startup.
            let first_tick = if interval_secs < 86_400 && 86_400 % interval_secs == 0 {
                let now_unix = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
                let remainder = now_unix % interval_secs;
                let secs_until = if remainder == 0 {
                    interval_secs
                } else {
                    interval_secs - remainder
                };
                tracing::info!(
                    interval_secs,
                    secs_until_first_tick = secs_until,
                    "clock-aligned warmup ticker: first tick in {secs_until}s"
                );
                tokio::time::Instant::now() + Duration::from_secs(secs_until)
            } else {
                tokio::time::Instant::now() + Duration::from_secs(interval_secs)
            };

            let mut ticker =
                tokio::time::interval_at(first_tick, Duration::from_secs(interval_secs));
            // A tick that overruns the next one skips it rather than bunching up.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }

                tracing::info!("warmup tick firing");
                match run_tick(&engine, Utc::now()).await {
                    Ok(summary) => tracing::info!(
                        accounts = summary.accounts,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "warmup tick complete"
                    ),
                    Err(error) => tracing::error!(%error, "warmup tick failed"),
                }

                if *shutdown.borrow() {
                    break;
                }
            }

            tracing::debug!("warmup ticker stopped");
        });

        *ticker_slot = Some(handle);
        tracing::info!(interval_secs, "warmup scheduler started");
    }

    pub async fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run one cycle for every cycling account right now and wait for all of them.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        run_tick(&self.engine, now).await
    }

    /// Run one account's cycle immediately, outside the ticker.
    pub async fn trigger_now(&self, account_id: &str) -> Result<CycleReport> {
        tracing::info!(%account_id, "warmup cycle triggered manually");
        self.engine.run_cycle(account_id, Utc::now()).await
    }

    /// Stop the ticker and let in-flight cycles finish within the grace period.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handle = self.ticker.lock().await.take();
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
            Ok(_) => tracing::info!("warmup scheduler stopped"),
            Err(_) => {
                tracing::warn!(
                    grace_secs = self.shutdown_grace.as_secs(),
                    "in-flight warmup cycles did not finish within the grace period; aborting them"
                );
                handle.abort();
            }
        }
    }
}

/// Fan out one task per cycling account and collect the outcomes.
async fn run_tick(engine: &Arc<Engine>, now: DateTime<Utc>) -> Result<TickSummary> {
    let accounts = engine.store().cycling_accounts().await?;
    let mut summary = TickSummary {
        accounts: accounts.len(),
        ..TickSummary::default()
    };

    let mut cycles = JoinSet::new();
    for account in accounts {
        let engine = engine.clone();
        cycles.spawn(async move {
            let outcome = AssertUnwindSafe(engine.run_cycle(&account.id, now))
                .catch_unwind()
                .await;
            (account.id, outcome)
        });
    }

    while let Some(joined) = cycles.join_next().await {
        let (account_id, outcome) = match joined {
            Ok(finished) => finished,
            Err(join_error) => {
                summary.failed += 1;
                tracing::error!(%join_error, "warmup cycle task did not complete");
                continue;
            }
        };

        match outcome {
            Ok(Ok(report)) => {
                summary.succeeded += 1;
                if !report.warnings.is_empty() {
                    tracing::debug!(
                        %account_id,
                        warnings = report.warnings.len(),
                        "warmup cycle finished with warnings"
                    );
                }
            }
            Ok(Err(Error::State(StateError::AccountBusy))) => {
                summary.skipped += 1;
                tracing::info!(%account_id, "account busy elsewhere; skipped this tick");
            }
            Ok(Err(error)) => {
                summary.failed += 1;
                tracing::error!(%account_id, %error, "warmup cycle failed");
            }
            Err(_panic) => {
                summary.failed += 1;
                tracing::error!(%account_id, "warmup cycle panicked");
            }
        }
    }

    engine.locks().prune().await;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AccountTotals, EmailAccount, ImapEndpoint, SmtpEndpoint, SmtpSecurity, WarmupConfig,
    };
    use crate::store::WarmupStore;
    use crate::transport::MemoryTransport;
    use crate::warmup::engine::EngineSettings;
    use crate::warmup::rescue::RescuePolicy;
    use crate::warmup::state::AccountState;
    use chrono::TimeZone as _;
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 13, 12, 0, 0).unwrap()
    }

    fn account(name: &str) -> EmailAccount {
        let address = format!("{name}@example.test");
        EmailAccount {
            id: name.into(),
            user_id: "u".into(),
            email_address: address.clone(),
            display_name: None,
            smtp: SmtpEndpoint {
                host: "smtp.example.test".into(),
                port: 465,
                username: address.clone(),
                password: "pw".into(),
                security: SmtpSecurity::Tls,
            },
            imap: ImapEndpoint {
                host: "imap.example.test".into(),
                port: 993,
                username: address,
                password: "pw".into(),
                use_tls: true,
            },
            state: AccountState::Active,
            paused_from: None,
            totals: AccountTotals::default(),
            created_at: now(),
        }
    }

    fn config(is_active: bool) -> WarmupConfig {
        WarmupConfig {
            is_active,
            start_date: now().date_naive(),
            current_daily_limit: 1,
            min_delay_seconds: 0,
            max_delay_seconds: 0,
            read_delay_seconds: 0,
            randomize_volume: false,
            ..WarmupConfig::default()
        }
    }

    async fn scheduler(accounts: &[(&str, bool)]) -> WarmupScheduler {
        let accounts: Vec<_> = accounts
            .iter()
            .map(|(name, is_active)| (*name, config(*is_active)))
            .collect();
        scheduler_with(&accounts, Duration::from_secs(3600)).await
    }

    async fn scheduler_with(
        accounts: &[(&str, WarmupConfig)],
        interval: Duration,
    ) -> WarmupScheduler {
        let store = WarmupStore::open_in_memory().await.unwrap();
        for (name, warmup) in accounts {
            store.insert_account(&account(name), warmup).await.unwrap();
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = EngineSettings {
            rescue: RescuePolicy {
                poll_attempts: 1,
                poll_interval: Duration::ZERO,
                move_attempts: 1,
            },
            ..EngineSettings::default()
        };
        let engine = Arc::new(Engine::new(
            store,
            Arc::new(MemoryTransport::new()),
            settings,
            StdRng::seed_from_u64(11),
            shutdown_rx,
        ));
        WarmupScheduler::new(engine, interval, Duration::from_secs(5), shutdown_tx)
    }

    #[tokio::test]
    async fn one_failing_account_does_not_stop_the_others() {
        // "broken" is active but its config was switched off behind the engine's back.
        let scheduler = scheduler(&[("alpha", true), ("beta", true), ("broken", false)]).await;

        let summary = scheduler.run_once(now()).await.unwrap();
        assert_eq!(summary.accounts, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);

        let history = scheduler.engine.store().metrics_history("alpha", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn tick_prunes_idle_locks() {
        let scheduler = scheduler(&[("alpha", true), ("beta", true)]).await;
        scheduler.run_once(now()).await.unwrap();
        assert_eq!(scheduler.engine.locks().tracked().await, 0);
    }

    #[tokio::test]
    async fn trigger_now_runs_a_single_account() {
        let scheduler = scheduler(&[("alpha", true), ("beta", true)]).await;
        let report = scheduler.trigger_now("alpha").await.unwrap();
        assert_eq!(report.metrics.cycle_seq, 1);
        assert!(scheduler.engine.store().latest_metrics("beta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_the_ticker() {
        let scheduler = scheduler(&[("alpha", true)]).await;
        scheduler.start().await;
        assert!(scheduler.is_running().await);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn accounts_claimed_elsewhere_are_skipped() {
        let scheduler = scheduler(&[("alpha", true), ("beta", true)]).await;
        let store = scheduler.engine.store().clone();
        let until = Utc::now() + chrono::Duration::minutes(30);
        assert!(store.claim_lease("alpha", "other-process", Utc::now(), until).await.unwrap());

        let summary = scheduler.run_once(now()).await.unwrap();
        assert_eq!(summary.accounts, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(store.latest_metrics("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_interrupts_in_flight_cycles_and_commits_them() {
        // An hour between sends: the cycle is parked in its send delay when
        // shutdown arrives.
        let slow = WarmupConfig {
            start_date: Utc::now().date_naive(),
            current_daily_limit: 3,
            max_emails_per_day: 10,
            min_delay_seconds: 3600,
            max_delay_seconds: 3600,
            weekdays_only: false,
            ..config(true)
        };
        let scheduler = scheduler_with(
            &[("alpha", slow.clone()), ("beta", slow)],
            Duration::from_secs(1),
        )
        .await;
        let store = scheduler.engine.store().clone();
        scheduler.start().await;

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut first_sends_done = true;
                for account_id in ["alpha", "beta"] {
                    let sent = store.messages_from(account_id).await.unwrap();
                    first_sends_done &= sent.iter().any(|message| message.message_id.is_some());
                }
                if first_sends_done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("first warmup send");

        let started = std::time::Instant::now();
        scheduler.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!scheduler.is_running().await);

        for account_id in ["alpha", "beta"] {
            let history = store.metrics_history(account_id, 10).await.unwrap();
            assert_eq!(history.len(), 1, "{account_id}");
            assert_eq!(history[0].emails_sent, 1, "{account_id}");
        }
        let leftover = store
            .messages_from("alpha")
            .await
            .unwrap()
            .into_iter()
            .filter(|message| message.status == crate::model::MessageStatus::Sending)
            .count();
        assert_eq!(leftover, 0);
    }
}
