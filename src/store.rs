//! Warmup persistence (SQLite): accounts, configs, messages and cycle metrics.

use crate::error::{Error, Result};
use crate::model::{
    AccountTotals, CycleMetrics, DeliveryLocation, EmailAccount, ImapEndpoint, MessageStatus,
    SmtpEndpoint, SmtpSecurity, WarmupConfig, WarmupMessage,
};
use crate::warmup::metrics::{self, PlacementCounts};
use crate::warmup::state::AccountState;

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr as _;
use std::sync::Arc;

/// Everything a finished cycle writes, applied in one transaction.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    pub account_id: String,
    /// Cycle counters. `cycle_seq`, score and rates are filled in by the commit.
    pub metrics: CycleMetrics,
    /// New daily limit and the day it grew, when growth happened this cycle.
    pub limit_growth: Option<(u32, NaiveDate)>,
    /// State read at the start of the cycle.
    pub expected_state: AccountState,
    /// State the cycle wants to leave behind, before the completion check.
    pub next_state: AccountState,
    /// First day of the deliverability window.
    pub window_start: NaiveDate,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedCycle {
    pub metrics: CycleMetrics,
    pub state: AccountState,
    /// False when the account changed state concurrently and the cycle's
    /// transition was discarded.
    pub state_applied: bool,
    pub totals: AccountTotals,
}

pub struct WarmupStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for WarmupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl WarmupStore {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Open (creating if needed) the database file and apply migrations.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database on a single connection.
    pub async fn open_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // Accounts

    /// Insert a new account together with its warmup config.
    pub async fn insert_account(&self, account: &EmailAccount, config: &WarmupConfig) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO email_accounts (id, user_id, email_address, display_name,
                smtp_host, smtp_port, smtp_username, smtp_password, smtp_security,
                imap_host, imap_port, imap_username, imap_password, imap_use_tls,
                state, paused_from, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(&account.email_address)
        .bind(&account.display_name)
        .bind(&account.smtp.host)
        .bind(i64::from(account.smtp.port))
        .bind(&account.smtp.username)
        .bind(&account.smtp.password)
        .bind(account.smtp.security.as_str())
        .bind(&account.imap.host)
        .bind(i64::from(account.imap.port))
        .bind(&account.imap.username)
        .bind(&account.imap.password)
        .bind(account.imap.use_tls)
        .bind(account.state.as_str())
        .bind(account.paused_from.map(|state| state.as_str()))
        .bind(account.created_at)
        .bind(account.created_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert email account {}", account.email_address))?;

        sqlx::query(
            r#"
            INSERT INTO warmup_configs (account_id, is_active, start_date, max_emails_per_day,
                daily_increase, current_daily_limit, min_delay_seconds, max_delay_seconds,
                target_open_rate, target_reply_rate, warmup_days, weekdays_only,
                randomize_volume, read_delay_seconds, last_limit_increase)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(config.is_active)
        .bind(config.start_date)
        .bind(i64::from(config.max_emails_per_day))
        .bind(i64::from(config.daily_increase))
        .bind(i64::from(config.current_daily_limit))
        .bind(i64::from(config.min_delay_seconds))
        .bind(i64::from(config.max_delay_seconds))
        .bind(config.target_open_rate)
        .bind(config.target_reply_rate)
        .bind(i64::from(config.warmup_days))
        .bind(config.weekdays_only)
        .bind(config.randomize_volume)
        .bind(i64::from(config.read_delay_seconds))
        .bind(config.last_limit_increase)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert warmup config for {}", account.id))?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn account(&self, id: &str) -> Result<Option<EmailAccount>> {
        let row = sqlx::query("SELECT * FROM email_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load email account {id}"))?;
        Ok(row.map(|row| row_to_account(&row)))
    }

    pub async fn require_account(&self, id: &str) -> Result<EmailAccount> {
        self.account(id)
            .await?
            .ok_or_else(|| Error::account_not_found(id))
    }

    /// Accounts that run warmup cycles: `active` or `completed`.
    pub async fn cycling_accounts(&self) -> Result<Vec<EmailAccount>> {
        let rows = sqlx::query(
            "SELECT * FROM email_accounts WHERE state IN ('active', 'completed') ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list cycling email accounts")?;
        Ok(rows.iter().map(row_to_account).collect())
    }

    /// Compare-and-set the account state. Returns whether the row changed.
    pub async fn set_state_if(
        &self,
        id: &str,
        expected: AccountState,
        next: AccountState,
        paused_from: Option<AccountState>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE email_accounts SET state = ?, paused_from = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(next.as_str())
        .bind(paused_from.map(|state| state.as_str()))
        .bind(now)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update state for account {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the account for `owner` until `until`. Succeeds when the account
    /// is unclaimed, its lease expired before `now`, or `owner` already holds
    /// it (which extends the lease).
    pub async fn claim_lease(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_accounts SET lease_owner = ?, lease_until = ?
            WHERE id = ? AND (lease_owner IS NULL OR lease_owner = ? OR lease_until < ?)
            "#,
        )
        .bind(owner)
        .bind(until)
        .bind(id)
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to claim lease on account {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop `owner`'s lease. A lease taken over by someone else is left alone.
    pub async fn release_lease(&self, id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE email_accounts SET lease_owner = NULL, lease_until = NULL WHERE id = ? AND lease_owner = ?",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to release lease on account {id}"))?;
        Ok(())
    }

    /// Flip the config's active flag and move the account state together.
    pub async fn apply_toggle(
        &self,
        id: &str,
        is_active: bool,
        expected: AccountState,
        next: AccountState,
        paused_from: Option<AccountState>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE email_accounts SET state = ?, paused_from = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(next.as_str())
        .bind(paused_from.map(|state| state.as_str()))
        .bind(now)
        .bind(id)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE warmup_configs SET is_active = ? WHERE account_id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    // Warmup configs

    pub async fn config(&self, account_id: &str) -> Result<Option<WarmupConfig>> {
        let row = sqlx::query("SELECT * FROM warmup_configs WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load warmup config for {account_id}"))?;
        Ok(row.map(|row| row_to_config(&row)))
    }

    pub async fn require_config(&self, account_id: &str) -> Result<WarmupConfig> {
        self.config(account_id).await?.ok_or_else(|| Error::NotFound {
            kind: "warmup config",
            id: account_id.to_string(),
        })
    }

    // Messages

    /// Insert a message row and return its sequence number.
    pub async fn insert_message(&self, message: &WarmupMessage) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO warmup_messages (id, sender_id, recipient_id, token, subject, message_id,
                status, location, rescued, reply_planned, replied, sent_at, opened_at,
                replied_at, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.sender_id)
        .bind(&message.recipient_id)
        .bind(&message.token)
        .bind(&message.subject)
        .bind(&message.message_id)
        .bind(message.status.as_str())
        .bind(message.location.as_str())
        .bind(message.rescued)
        .bind(message.reply_planned)
        .bind(message.replied)
        .bind(message.sent_at)
        .bind(message.opened_at)
        .bind(message.replied_at)
        .bind(&message.error)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert warmup message {}", message.token))?;

        Ok(result.last_insert_rowid())
    }

    /// Persist every mutable column of a message.
    pub async fn update_message(&self, message: &WarmupMessage) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE warmup_messages
            SET message_id = ?, status = ?, location = ?, rescued = ?, reply_planned = ?,
                replied = ?, opened_at = ?, replied_at = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(&message.message_id)
        .bind(message.status.as_str())
        .bind(message.location.as_str())
        .bind(message.rescued)
        .bind(message.reply_planned)
        .bind(message.replied)
        .bind(message.opened_at)
        .bind(message.replied_at)
        .bind(&message.error)
        .bind(&message.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update warmup message {}", message.token))?;

        Ok(())
    }

    pub async fn message_by_token(&self, token: &str) -> Result<Option<WarmupMessage>> {
        let row = sqlx::query("SELECT * FROM warmup_messages WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load warmup message {token}"))?;
        Ok(row.map(|row| row_to_message(&row)))
    }

    pub async fn messages_from(&self, sender_id: &str) -> Result<Vec<WarmupMessage>> {
        let rows = sqlx::query("SELECT * FROM warmup_messages WHERE sender_id = ? ORDER BY seq")
            .bind(sender_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to list warmup messages from {sender_id}"))?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Messages accepted for submission on `day`. Failed sends do not count.
    pub async fn count_sent_on(&self, sender_id: &str, day: NaiveDate) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warmup_messages WHERE sender_id = ? AND status != 'failed' AND date(sent_at) = ?",
        )
        .bind(sender_id)
        .bind(day)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to count today's sends for {sender_id}"))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Messages received by an account over its lifetime.
    pub async fn count_received(&self, recipient_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warmup_messages WHERE recipient_id = ? AND status != 'failed' AND status != 'sending'",
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to count received messages for {recipient_id}"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Highest message sequence sent to each recipient, for round-robin order.
    pub async fn last_contacted(&self, sender_id: &str) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT recipient_id, MAX(seq) AS last_seq FROM warmup_messages WHERE sender_id = ? GROUP BY recipient_id",
        )
        .bind(sender_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load recipient history for {sender_id}"))?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.try_get("recipient_id").unwrap_or_default(),
                    row.try_get("last_seq").unwrap_or_default(),
                )
            })
            .collect())
    }

    /// Messages inside the window whose placement is still open: not yet found,
    /// or found in spam and not rescued.
    pub async fn outstanding_messages(
        &self,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WarmupMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM warmup_messages
            WHERE sender_id = ?
              AND status IN ('sent', 'unconfirmed')
              AND (location = 'unknown' OR (location = 'spam' AND rescued = 0))
              AND sent_at >= ?
            ORDER BY seq
            "#,
        )
        .bind(sender_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load outstanding messages for {sender_id}"))?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Located inbox messages whose engagement has not been decided or whose
    /// planned reply has not gone out yet.
    pub async fn engageable_messages(
        &self,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WarmupMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM warmup_messages
            WHERE sender_id = ?
              AND status = 'sent'
              AND (location = 'inbox' OR (location = 'spam' AND rescued = 1))
              AND (reply_planned IS NULL OR (reply_planned = 1 AND replied = 0))
              AND sent_at >= ?
            ORDER BY seq
            "#,
        )
        .bind(sender_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load engageable messages for {sender_id}"))?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Turn rows left in `sending` into `unconfirmed` so their delivery is
    /// rechecked. Only call while holding the account's lease.
    pub async fn mark_interrupted_sends(&self, sender_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE warmup_messages
            SET status = 'unconfirmed', error = 'interrupted: submission outcome unknown'
            WHERE sender_id = ? AND status = 'sending'
            "#,
        )
        .bind(sender_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to recover interrupted sends for {sender_id}"))?;
        Ok(result.rows_affected())
    }

    /// Close every open message sent before `before`. Returns how many closed.
    pub async fn close_expired(&self, sender_id: &str, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE warmup_messages SET status = 'closed'
            WHERE sender_id = ? AND status IN ('sending', 'sent', 'unconfirmed') AND sent_at < ?
            "#,
        )
        .bind(sender_id)
        .bind(before)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to close expired messages for {sender_id}"))?;
        Ok(result.rows_affected())
    }

    // Metrics

    pub async fn latest_metrics(&self, account_id: &str) -> Result<Option<CycleMetrics>> {
        let row = sqlx::query(
            "SELECT * FROM cycle_metrics WHERE account_id = ? ORDER BY cycle_seq DESC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load latest metrics for {account_id}"))?;
        Ok(row.map(|row| row_to_metrics(&row)))
    }

    /// Most recent cycles first.
    pub async fn metrics_history(&self, account_id: &str, limit: i64) -> Result<Vec<CycleMetrics>> {
        let rows = sqlx::query(
            "SELECT * FROM cycle_metrics WHERE account_id = ? ORDER BY cycle_seq DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load metrics history for {account_id}"))?;
        Ok(rows.iter().map(row_to_metrics).collect())
    }

    /// Placements recorded on or after `since`.
    pub async fn placements_since(&self, account_id: &str, since: NaiveDate) -> Result<PlacementCounts> {
        placements_since(&self.pool, account_id, since).await
    }

    /// Write a finished cycle atomically: metrics row, totals, limit growth and
    /// the state transition (compare-and-set on `expected_state`).
    pub async fn commit_cycle(&self, commit: CycleCommit) -> Result<CommittedCycle> {
        let CycleCommit {
            account_id,
            mut metrics,
            limit_growth,
            expected_state,
            next_state,
            window_start,
            now,
        } = commit;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE email_accounts
            SET total_sent = total_sent + ?, total_opened = total_opened + ?,
                total_replied = total_replied + ?,
                total_spam_placements = total_spam_placements + ?,
                total_rescues = total_rescues + ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(metrics.emails_sent))
        .bind(i64::from(metrics.emails_opened))
        .bind(i64::from(metrics.emails_replied))
        .bind(i64::from(metrics.spam_placements))
        .bind(i64::from(metrics.rescues))
        .bind(now)
        .bind(&account_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to update totals for {account_id}"))?;

        let totals_row = sqlx::query(
            "SELECT total_sent, total_opened, total_replied, total_spam_placements, total_rescues FROM email_accounts WHERE id = ?",
        )
        .bind(&account_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::account_not_found(&account_id))?;
        let totals = row_to_totals(&totals_row);

        let mut placements = placements_since(&mut *tx, &account_id, window_start).await?;
        placements.inbox += u64::from(metrics.inbox_placements);
        placements.spam += u64::from(metrics.spam_placements);

        let cycle_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(cycle_seq), 0) + 1 FROM cycle_metrics WHERE account_id = ?",
        )
        .bind(&account_id)
        .fetch_one(&mut *tx)
        .await?;

        metrics.account_id = account_id.clone();
        metrics.cycle_seq = cycle_seq;
        metrics.deliverability_score = metrics::deliverability_score(placements);
        metrics.open_rate = metrics::open_rate(&totals);
        metrics.reply_rate = metrics::reply_rate(&totals);

        sqlx::query(
            r#"
            INSERT INTO cycle_metrics (account_id, cycle_seq, cycle_date, emails_sent,
                send_failures, emails_opened, emails_replied, inbox_placements,
                spam_placements, rescues, deliverability_score, open_rate, reply_rate,
                created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metrics.account_id)
        .bind(metrics.cycle_seq)
        .bind(metrics.cycle_date)
        .bind(i64::from(metrics.emails_sent))
        .bind(i64::from(metrics.send_failures))
        .bind(i64::from(metrics.emails_opened))
        .bind(i64::from(metrics.emails_replied))
        .bind(i64::from(metrics.inbox_placements))
        .bind(i64::from(metrics.spam_placements))
        .bind(i64::from(metrics.rescues))
        .bind(metrics.deliverability_score)
        .bind(metrics.open_rate)
        .bind(metrics.reply_rate)
        .bind(metrics.created_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert cycle metrics for {account_id}"))?;

        if let Some((limit, grown_on)) = limit_growth {
            // Guarded so a day's growth is applied once even if two writers race.
            sqlx::query(
                r#"
                UPDATE warmup_configs SET current_daily_limit = ?, last_limit_increase = ?
                WHERE account_id = ? AND (last_limit_increase IS NULL OR last_limit_increase < ?)
                "#,
            )
            .bind(i64::from(limit))
            .bind(grown_on)
            .bind(&account_id)
            .bind(grown_on)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to persist daily limit for {account_id}"))?;
        }

        let config_row = sqlx::query("SELECT * FROM warmup_configs WHERE account_id = ?")
            .bind(&account_id)
            .fetch_optional(&mut *tx)
            .await?;
        let metric_days: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT cycle_date) FROM cycle_metrics WHERE account_id = ?",
        )
        .bind(&account_id)
        .fetch_one(&mut *tx)
        .await?;

        let target_state = match config_row.map(|row| row_to_config(&row)) {
            Some(config) => next_state.complete(
                config.days_elapsed(now),
                u32::try_from(metric_days).unwrap_or(u32::MAX),
                config.warmup_days,
            ),
            None => next_state,
        };

        let (state, state_applied) = if target_state == expected_state {
            (expected_state, true)
        } else {
            let result = sqlx::query(
                "UPDATE email_accounts SET state = ?, paused_from = NULL, updated_at = ? WHERE id = ? AND state = ?",
            )
            .bind(target_state.as_str())
            .bind(now)
            .bind(&account_id)
            .bind(expected_state.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to update state for {account_id}"))?;

            if result.rows_affected() > 0 {
                (target_state, true)
            } else {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT state FROM email_accounts WHERE id = ?")
                        .bind(&account_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                let current = current
                    .as_deref()
                    .and_then(AccountState::parse)
                    .unwrap_or(expected_state);
                (current, false)
            }
        };

        tx.commit().await?;

        Ok(CommittedCycle {
            metrics,
            state,
            state_applied,
            totals,
        })
    }
}

async fn placements_since<'e, E>(executor: E, account_id: &str, since: NaiveDate) -> Result<PlacementCounts>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(inbox_placements), 0) AS inbox, COALESCE(SUM(spam_placements), 0) AS spam
        FROM cycle_metrics WHERE account_id = ? AND cycle_date >= ?
        "#,
    )
    .bind(account_id)
    .bind(since)
    .fetch_one(executor)
    .await
    .with_context(|| format!("failed to sum placements for {account_id}"))?;

    Ok(PlacementCounts {
        inbox: non_negative(row.try_get("inbox").unwrap_or_default()),
        spam: non_negative(row.try_get("spam").unwrap_or_default()),
    })
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn small(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn row_to_totals(row: &sqlx::sqlite::SqliteRow) -> AccountTotals {
    AccountTotals {
        sent: non_negative(row.try_get("total_sent").unwrap_or_default()),
        opened: non_negative(row.try_get("total_opened").unwrap_or_default()),
        replied: non_negative(row.try_get("total_replied").unwrap_or_default()),
        spam_placements: non_negative(row.try_get("total_spam_placements").unwrap_or_default()),
        rescues: non_negative(row.try_get("total_rescues").unwrap_or_default()),
    }
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> EmailAccount {
    let state: String = row.try_get("state").unwrap_or_default();
    let paused_from: Option<String> = row.try_get("paused_from").ok().flatten();
    let security: String = row.try_get("smtp_security").unwrap_or_default();

    EmailAccount {
        id: row.try_get("id").unwrap_or_default(),
        user_id: row.try_get("user_id").unwrap_or_default(),
        email_address: row.try_get("email_address").unwrap_or_default(),
        display_name: row.try_get("display_name").ok().flatten(),
        smtp: SmtpEndpoint {
            host: row.try_get("smtp_host").unwrap_or_default(),
            port: u16::try_from(row.try_get::<i64, _>("smtp_port").unwrap_or_default())
                .unwrap_or_default(),
            username: row.try_get("smtp_username").unwrap_or_default(),
            password: row.try_get("smtp_password").unwrap_or_default(),
            security: SmtpSecurity::parse(&security),
        },
        imap: ImapEndpoint {
            host: row.try_get("imap_host").unwrap_or_default(),
            port: u16::try_from(row.try_get::<i64, _>("imap_port").unwrap_or_default())
                .unwrap_or_default(),
            username: row.try_get("imap_username").unwrap_or_default(),
            password: row.try_get("imap_password").unwrap_or_default(),
            use_tls: row.try_get("imap_use_tls").unwrap_or(true),
        },
        state: AccountState::parse(&state).unwrap_or(AccountState::Unverified),
        paused_from: paused_from.as_deref().and_then(AccountState::parse),
        totals: row_to_totals(row),
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    }
}

fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> WarmupConfig {
    let defaults = WarmupConfig::default();
    WarmupConfig {
        is_active: row.try_get("is_active").unwrap_or(defaults.is_active),
        start_date: row.try_get("start_date").unwrap_or(defaults.start_date),
        max_emails_per_day: small(row.try_get("max_emails_per_day").unwrap_or_default()),
        daily_increase: small(row.try_get("daily_increase").unwrap_or_default()),
        current_daily_limit: small(row.try_get("current_daily_limit").unwrap_or_default()),
        min_delay_seconds: small(row.try_get("min_delay_seconds").unwrap_or_default()),
        max_delay_seconds: small(row.try_get("max_delay_seconds").unwrap_or_default()),
        target_open_rate: row.try_get("target_open_rate").unwrap_or(defaults.target_open_rate),
        target_reply_rate: row.try_get("target_reply_rate").unwrap_or(defaults.target_reply_rate),
        warmup_days: small(row.try_get("warmup_days").unwrap_or_default()),
        weekdays_only: row.try_get("weekdays_only").unwrap_or(defaults.weekdays_only),
        randomize_volume: row.try_get("randomize_volume").unwrap_or(defaults.randomize_volume),
        read_delay_seconds: small(row.try_get("read_delay_seconds").unwrap_or_default()),
        last_limit_increase: row.try_get("last_limit_increase").ok().flatten(),
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> WarmupMessage {
    let status: String = row.try_get("status").unwrap_or_default();
    let location: String = row.try_get("location").unwrap_or_default();

    WarmupMessage {
        id: row.try_get("id").unwrap_or_default(),
        seq: row.try_get("seq").unwrap_or_default(),
        sender_id: row.try_get("sender_id").unwrap_or_default(),
        recipient_id: row.try_get("recipient_id").unwrap_or_default(),
        token: row.try_get("token").unwrap_or_default(),
        subject: row.try_get("subject").unwrap_or_default(),
        message_id: row.try_get("message_id").ok().flatten(),
        status: MessageStatus::parse(&status),
        location: DeliveryLocation::parse(&location),
        rescued: row.try_get("rescued").unwrap_or(false),
        reply_planned: row.try_get("reply_planned").ok().flatten(),
        replied: row.try_get("replied").unwrap_or(false),
        sent_at: row.try_get("sent_at").unwrap_or_else(|_| Utc::now()),
        opened_at: row.try_get("opened_at").ok().flatten(),
        replied_at: row.try_get("replied_at").ok().flatten(),
        error: row.try_get("error").ok().flatten(),
    }
}

fn row_to_metrics(row: &sqlx::sqlite::SqliteRow) -> CycleMetrics {
    CycleMetrics {
        account_id: row.try_get("account_id").unwrap_or_default(),
        cycle_seq: row.try_get("cycle_seq").unwrap_or_default(),
        cycle_date: row
            .try_get("cycle_date")
            .unwrap_or_else(|_| Utc::now().date_naive()),
        emails_sent: small(row.try_get("emails_sent").unwrap_or_default()),
        send_failures: small(row.try_get("send_failures").unwrap_or_default()),
        emails_opened: small(row.try_get("emails_opened").unwrap_or_default()),
        emails_replied: small(row.try_get("emails_replied").unwrap_or_default()),
        inbox_placements: small(row.try_get("inbox_placements").unwrap_or_default()),
        spam_placements: small(row.try_get("spam_placements").unwrap_or_default()),
        rescues: small(row.try_get("rescues").unwrap_or_default()),
        deliverability_score: row.try_get("deliverability_score").unwrap_or(100.0),
        open_rate: row.try_get("open_rate").unwrap_or_default(),
        reply_rate: row.try_get("reply_rate").unwrap_or_default(),
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    }
}
