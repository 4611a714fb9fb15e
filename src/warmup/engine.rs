//! Warmup engine: runs one account's cycle end to end and owns its state changes.
//!
//! A cycle plans today's volume, sends to other accounts in the pool, locates
//! outstanding messages in recipient mailboxes (rescuing spam placements),
//! simulates engagement and finally commits metrics, totals, limit growth and
//! any state transition in a single transaction. Everything runs under the
//! account's lock with an explicit clock.

use crate::error::{Error, Result, StateError, TransportError};
use crate::model::{
    CycleMetrics, DeliveryLocation, EmailAccount, MessageStatus, WarmupConfig, WarmupMessage,
};
use crate::store::{CycleCommit, WarmupStore};
use crate::transport::{MailTransport, MessageHandle, OutgoingMessage};
use crate::warmup::content;
use crate::warmup::engagement::{EngagementPolicy, EngagementSimulator};
use crate::warmup::folders::{INBOX, is_inbox};
use crate::warmup::locks::AccountLocks;
use crate::warmup::metrics;
use crate::warmup::rescue::{Placement, RescuePolicy, Rescuer};
use crate::warmup::state::AccountState;
use crate::warmup::volume::{self, DailyPlan};

use chrono::{DateTime, Utc};
use rand::Rng as _;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tunables shared by every cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub rescue: RescuePolicy,
    pub engagement: EngagementPolicy,
    pub jitter_percent: u32,
    /// Messages older than this are closed and no longer rechecked or engaged.
    pub engagement_window: chrono::Duration,
    pub metrics_window_days: u32,
    /// How long a claim on an account survives without renewal, so a crashed
    /// process does not lock the account out for good.
    pub lease_ttl: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rescue: RescuePolicy::default(),
            engagement: EngagementPolicy::default(),
            jitter_percent: 20,
            engagement_window: chrono::Duration::hours(72),
            metrics_window_days: 30,
            lease_ttl: chrono::Duration::minutes(30),
        }
    }
}

/// Non-fatal conditions collected during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleWarning {
    /// No other active account to send to.
    InsufficientRecipientPool,
    SendFailed {
        token: String,
        recipient_id: String,
        error: String,
    },
    /// The submission timed out; delivery is rechecked later, never resent.
    SendUnconfirmed { token: String, recipient_id: String },
    RescueFailure {
        token: String,
        recipient_id: String,
        error: String,
    },
    /// The recipient mailbox could not be inspected this cycle.
    RecipientUnavailable { recipient_id: String, error: String },
    /// The recipient's credentials were rejected and it was demoted.
    RecipientDemoted { recipient_id: String },
    EngagementFailed {
        token: String,
        recipient_id: String,
        error: String,
    },
}

impl std::fmt::Display for CycleWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientRecipientPool => write!(f, "no other active accounts to send to"),
            Self::SendFailed {
                token,
                recipient_id,
                error,
            } => write!(f, "send of {token} to {recipient_id} failed: {error}"),
            Self::SendUnconfirmed {
                token,
                recipient_id,
            } => write!(f, "send of {token} to {recipient_id} is unconfirmed"),
            Self::RescueFailure {
                token,
                recipient_id,
                error,
            } => write!(f, "rescue of {token} in {recipient_id} failed: {error}"),
            Self::RecipientUnavailable {
                recipient_id,
                error,
            } => write!(f, "recipient {recipient_id} unavailable: {error}"),
            Self::RecipientDemoted { recipient_id } => {
                write!(f, "recipient {recipient_id} demoted after auth failure")
            }
            Self::EngagementFailed {
                token,
                recipient_id,
                error,
            } => write!(f, "engagement of {token} by {recipient_id} failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub metrics: CycleMetrics,
    pub warnings: Vec<CycleWarning>,
    /// The account's own credentials were rejected and it dropped to `verified`.
    pub demoted: bool,
    pub state: AccountState,
}

/// Dashboard view of one account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmupStatus {
    pub account_id: String,
    pub email_address: String,
    pub state: AccountState,
    pub is_active: bool,
    pub days_in_warmup: u32,
    /// Fraction of the warmup period elapsed, within `[0, 1]`.
    pub warmup_progress: f64,
    pub current_daily_limit: u32,
    pub deliverability_score: f64,
    /// Spam share of located placements over the deliverability window, in percent.
    pub spam_rate: f64,
    /// Lifetime opens over sends, in percent.
    pub open_rate: f64,
    /// Lifetime replies over sends, in percent.
    pub reply_rate: f64,
    pub total_sent: u64,
    pub total_received: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Mutable bookkeeping for one running cycle.
struct CycleRun {
    metrics: CycleMetrics,
    warnings: Vec<CycleWarning>,
    demoted: bool,
    /// Recipients demoted during this cycle; their mailboxes are skipped.
    unavailable: HashSet<String>,
    /// Inbox handles found by this cycle's rescue step, keyed by message id.
    handles: HashMap<String, MessageHandle>,
}

impl CycleRun {
    fn new(account_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            metrics: CycleMetrics::empty(account_id, now),
            warnings: Vec::new(),
            demoted: false,
            unavailable: HashSet::new(),
            handles: HashMap::new(),
        }
    }

    fn warn(&mut self, warning: CycleWarning) {
        tracing::warn!(account_id = %self.metrics.account_id, %warning, "warmup cycle warning");
        self.warnings.push(warning);
    }
}

struct PendingReply {
    message: WarmupMessage,
    recipient_id: String,
    delay: Duration,
    /// `Ok(None)` when shutdown cut the reply delay short and nothing was sent.
    task: JoinHandle<std::result::Result<Option<String>, TransportError>>,
}

pub struct Engine {
    store: Arc<WarmupStore>,
    transport: Arc<dyn MailTransport>,
    settings: EngineSettings,
    locks: AccountLocks,
    rng: Mutex<StdRng>,
    shutdown: watch::Receiver<bool>,
    /// Identifies this engine's account leases in the shared database.
    lease_owner: String,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        store: Arc<WarmupStore>,
        transport: Arc<dyn MailTransport>,
        settings: EngineSettings,
        rng: StdRng,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
            locks: AccountLocks::new(),
            rng: Mutex::new(rng),
            shutdown,
            lease_owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn store(&self) -> &Arc<WarmupStore> {
        &self.store
    }

    pub fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    fn with_rng<T>(&self, draw: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        draw(&mut rng)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn pause(&self, delay: Duration) -> bool {
        super::pause(&self.shutdown, delay).await
    }

    /// Claim or extend this engine's lease on `account_id`. The in-process
    /// lock orders callers of this engine; the lease covers other processes
    /// sharing the database.
    async fn claim(&self, account_id: &str) -> Result<bool> {
        let now = Utc::now();
        self.store
            .claim_lease(account_id, &self.lease_owner, now, now + self.settings.lease_ttl)
            .await
    }

    async fn acquire_lease(&self, account_id: &str) -> Result<()> {
        if self.claim(account_id).await? {
            Ok(())
        } else {
            tracing::info!("account is claimed by another process");
            Err(StateError::AccountBusy.into())
        }
    }

    async fn release_lease(&self, account_id: &str) {
        if let Err(error) = self.store.release_lease(account_id, &self.lease_owner).await {
            tracing::warn!(%error, "failed to release account lease");
        }
    }

    /// Run one warmup cycle for `account_id` at `now`.
    #[tracing::instrument(skip_all, fields(account_id = %account_id))]
    pub async fn run_cycle(&self, account_id: &str, now: DateTime<Utc>) -> Result<CycleReport> {
        let _guard = self.locks.acquire(account_id).await;

        let account = self.store.require_account(account_id).await?;
        self.acquire_lease(account_id).await?;
        let report = self.cycle(account, now).await;
        self.release_lease(account_id).await;
        report
    }

    async fn cycle(&self, account: EmailAccount, now: DateTime<Utc>) -> Result<CycleReport> {
        let account_id = account.id.as_str();
        if !account.state.runs_cycles() {
            return Err(StateError::InvalidTransition {
                from: account.state.to_string(),
                action: "run a warmup cycle for",
            }
            .into());
        }
        let config = self.store.require_config(account_id).await?;
        if !config.is_active {
            return Err(StateError::ConfigInactive.into());
        }

        let mut run = CycleRun::new(account_id, now);
        let window_start = now - self.settings.engagement_window;

        let closed = self.store.close_expired(account_id, window_start).await?;
        if closed > 0 {
            tracing::debug!(closed, "closed messages past the engagement window");
        }

        // Under the lease nothing else is sending for this account, so a row
        // still in `sending` was cut off mid-submission and may have gone out.
        let interrupted = self.store.mark_interrupted_sends(account_id).await?;
        if interrupted > 0 {
            tracing::warn!(interrupted, "interrupted sends found; rechecking their delivery");
        }

        let sent_today = self
            .store
            .count_sent_on(account_id, now.date_naive())
            .await?;
        let plan = self.with_rng(|rng| {
            volume::plan_day(&config, now, sent_today, self.settings.jitter_percent, rng)
        });
        tracing::info!(
            quota = plan.quota,
            daily_limit = plan.daily_limit,
            sent_today,
            sending_day = plan.sending_day,
            "starting warmup cycle"
        );

        let halted = self
            .send_batch(&account, &config, &plan, now, &mut run)
            .await?;

        if halted {
            tracing::info!(demoted = run.demoted, "skipping rescue and engagement");
        } else {
            self.recheck_placements(&account, window_start, &mut run, now)
                .await?;
            self.engage(&account, &config, window_start, &mut run, now)
                .await?;
        }

        let next_state = if run.demoted {
            account.state.demote()?
        } else {
            account.state
        };
        let window_days = i64::from(self.settings.metrics_window_days.max(1));
        let committed = self
            .store
            .commit_cycle(CycleCommit {
                account_id: account_id.to_string(),
                metrics: run.metrics,
                limit_growth: plan.grown_on.map(|day| (plan.daily_limit, day)),
                expected_state: account.state,
                next_state,
                window_start: now.date_naive() - chrono::Duration::days(window_days - 1),
                now,
            })
            .await?;

        if !committed.state_applied {
            tracing::warn!(
                state = %committed.state,
                "account state changed during the cycle; transition discarded"
            );
        } else if committed.state != account.state {
            tracing::info!(from = %account.state, to = %committed.state, "account state changed");
        }

        tracing::info!(
            sent = committed.metrics.emails_sent,
            opened = committed.metrics.emails_opened,
            replied = committed.metrics.emails_replied,
            inbox = committed.metrics.inbox_placements,
            spam = committed.metrics.spam_placements,
            rescues = committed.metrics.rescues,
            deliverability = committed.metrics.deliverability_score,
            "warmup cycle complete"
        );

        Ok(CycleReport {
            metrics: committed.metrics,
            warnings: run.warnings,
            demoted: run.demoted,
            state: committed.state,
        })
    }

    /// Other accounts that can receive warmup mail, least recently contacted first.
    async fn recipient_pool(&self, account: &EmailAccount) -> Result<Vec<EmailAccount>> {
        let last_contacted = self.store.last_contacted(&account.id).await?;
        let mut pool: Vec<EmailAccount> = self
            .store
            .cycling_accounts()
            .await?
            .into_iter()
            .filter(|candidate| {
                candidate.id != account.id
                    && !candidate
                        .email_address
                        .eq_ignore_ascii_case(&account.email_address)
            })
            .collect();
        pool.sort_by_key(|candidate| last_contacted.get(&candidate.id).copied().unwrap_or(0));
        Ok(pool)
    }

    /// Step 2. Returns `true` when the rest of the cycle must be skipped.
    async fn send_batch(
        &self,
        account: &EmailAccount,
        config: &WarmupConfig,
        plan: &DailyPlan,
        now: DateTime<Utc>,
        run: &mut CycleRun,
    ) -> Result<bool> {
        if plan.quota == 0 {
            return Ok(false);
        }

        let pool = self.recipient_pool(account).await?;
        if pool.is_empty() {
            run.warn(CycleWarning::InsufficientRecipientPool);
            return Ok(false);
        }

        let mut clock = now;
        for unit in 0..plan.quota {
            if unit > 0 {
                let delay = self.with_rng(|rng| {
                    let low = config.min_delay_seconds.min(config.max_delay_seconds);
                    let high = config.max_delay_seconds.max(low);
                    Duration::from_secs(u64::from(rng.random_range(low..=high)))
                });
                if self.pause(delay).await {
                    tracing::info!(sent = unit, "shutdown requested; stopping sends");
                    return Ok(true);
                }
                clock += chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            } else if self.is_shutting_down() {
                return Ok(true);
            }

            if unit > 0 && !self.claim(&account.id).await? {
                tracing::warn!(sent = unit, "lost the account lease; stopping sends");
                return Ok(true);
            }

            let recipient = &pool[unit as usize % pool.len()];
            let token = content::generate_token();
            let email = self.with_rng(|rng| content::compose(&token, rng));

            let mut message = WarmupMessage {
                id: uuid::Uuid::new_v4().to_string(),
                seq: 0,
                sender_id: account.id.clone(),
                recipient_id: recipient.id.clone(),
                token: token.clone(),
                subject: email.subject.clone(),
                message_id: None,
                status: MessageStatus::Sending,
                location: DeliveryLocation::Unknown,
                rescued: false,
                reply_planned: None,
                replied: false,
                sent_at: clock,
                opened_at: None,
                replied_at: None,
                error: None,
            };
            message.seq = self.store.insert_message(&message).await?;

            let outgoing = OutgoingMessage {
                to: recipient.email_address.clone(),
                subject: email.subject,
                text_body: email.text_body,
                html_body: email.html_body,
                in_reply_to: None,
            };

            let outcome = self.transport.send(account, &outgoing).await;
            let sender_rejected = match outcome {
                Ok(message_id) => {
                    message.status = MessageStatus::Sent;
                    message.message_id = Some(message_id);
                    run.metrics.emails_sent += 1;
                    tracing::debug!(%token, recipient = %recipient.email_address, "warmup email sent");
                    false
                }
                Err(error) => {
                    message.error = Some(format!("{}: {error}", error.kind()));
                    if error.is_ambiguous() {
                        message.status = MessageStatus::Unconfirmed;
                        run.warn(CycleWarning::SendUnconfirmed {
                            token: token.clone(),
                            recipient_id: recipient.id.clone(),
                        });
                    } else {
                        message.status = MessageStatus::Failed;
                        run.metrics.send_failures += 1;
                        run.warn(CycleWarning::SendFailed {
                            token: token.clone(),
                            recipient_id: recipient.id.clone(),
                            error: error.to_string(),
                        });
                    }
                    error.is_auth()
                }
            };
            self.store.update_message(&message).await?;

            if sender_rejected {
                tracing::warn!("sender credentials rejected; demoting account");
                run.demoted = true;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Step 3: locate every outstanding message and rescue spam placements.
    async fn recheck_placements(
        &self,
        account: &EmailAccount,
        window_start: DateTime<Utc>,
        run: &mut CycleRun,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outstanding = self
            .store
            .outstanding_messages(&account.id, window_start)
            .await?;
        if outstanding.is_empty() {
            return Ok(());
        }

        let mut by_recipient: Vec<(String, Vec<WarmupMessage>)> = Vec::new();
        for message in outstanding {
            match by_recipient
                .iter_mut()
                .find(|(recipient_id, _)| *recipient_id == message.recipient_id)
            {
                Some((_, messages)) => messages.push(message),
                None => by_recipient.push((message.recipient_id.clone(), vec![message])),
            }
        }

        let rescuer = Rescuer::new(self.transport.as_ref(), self.settings.rescue)
            .with_shutdown(self.shutdown.clone());

        for (recipient_id, messages) in by_recipient {
            if self.is_shutting_down() {
                tracing::info!("shutdown requested; leaving remaining placements for later");
                break;
            }
            let Some(recipient) = self.usable_recipient(&recipient_id, run).await? else {
                continue;
            };

            let spam_folders = match rescuer.spam_folders(&recipient).await {
                Ok(folders) => folders,
                Err(error) => {
                    self.recipient_failed(&recipient, error, run, now).await?;
                    continue;
                }
            };

            for mut message in messages {
                if self.is_shutting_down() {
                    break;
                }
                let placement = match rescuer
                    .locate(&recipient, &spam_folders, &message.token)
                    .await
                {
                    Ok(placement) => placement,
                    Err(error) => {
                        self.recipient_failed(&recipient, error, run, now).await?;
                        break;
                    }
                };

                if apply_placement(&mut message, &placement, run) {
                    self.store.update_message(&message).await?;
                }
            }
        }

        Ok(())
    }

    /// Step 4: open located messages and send the planned replies.
    async fn engage(
        &self,
        account: &EmailAccount,
        config: &WarmupConfig,
        window_start: DateTime<Utc>,
        run: &mut CycleRun,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let messages = self
            .store
            .engageable_messages(&account.id, window_start)
            .await?;
        if messages.is_empty() {
            return Ok(());
        }

        let simulator = EngagementSimulator::new(self.settings.engagement);
        let mut recipients: HashMap<String, Option<EmailAccount>> = HashMap::new();
        let mut pending = Vec::new();

        for mut message in messages {
            if self.is_shutting_down() {
                tracing::info!("shutdown requested; deferring remaining engagement");
                break;
            }
            if !recipients.contains_key(&message.recipient_id) {
                let recipient = self.usable_recipient(&message.recipient_id, run).await?;
                recipients.insert(message.recipient_id.clone(), recipient);
            }
            let Some(Some(recipient)) = recipients.get(&message.recipient_id).cloned() else {
                continue;
            };
            if run.unavailable.contains(&recipient.id) {
                continue;
            }

            let reply_delay = if message.reply_planned.is_none() {
                let decision =
                    self.with_rng(|rng| simulator.decide(message.rescued, config, rng));

                if decision.open {
                    match self.open_message(&recipient, &message, run).await {
                        Ok(true) => {
                            message.opened_at = Some(now);
                            run.metrics.emails_opened += 1;
                        }
                        Ok(false) => continue,
                        Err(error) => {
                            self.engagement_failed(&recipient, &message, error, run, now)
                                .await?;
                            continue;
                        }
                    }
                }

                message.reply_planned = Some(decision.reply);
                if !decision.reply {
                    message.status = MessageStatus::Closed;
                }
                self.store.update_message(&message).await?;
                decision.reply_delay
            } else if message.rescued {
                self.settings.engagement.rescued_reply_delay
            } else {
                self.with_rng(|rng| simulator.reply_delay(config, rng))
            };

            if message.reply_planned != Some(true) || message.replied {
                continue;
            }

            let reply = self.with_rng(|rng| content::compose_reply(&message.subject, rng));
            let outgoing = OutgoingMessage {
                to: account.email_address.clone(),
                subject: reply.subject,
                text_body: reply.text_body,
                html_body: reply.html_body,
                in_reply_to: message.message_id.clone(),
            };

            let transport = Arc::clone(&self.transport);
            let shutdown = self.shutdown.clone();
            let replier = recipient.clone();
            let task = tokio::spawn(async move {
                if super::pause(&shutdown, reply_delay).await {
                    return Ok(None);
                }
                transport.send(&replier, &outgoing).await.map(Some)
            });

            pending.push(PendingReply {
                message,
                recipient_id: recipient.id.clone(),
                delay: reply_delay,
                task,
            });
        }

        for PendingReply {
            mut message,
            recipient_id,
            delay,
            task,
        } in pending
        {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(TransportError::ProtocolFailure(format!(
                    "reply task failed: {join_error}"
                ))),
            };

            match outcome {
                Ok(None) => {
                    // Still planned and unanswered, so the next cycle sends it.
                    tracing::debug!(token = %message.token, "reply deferred by shutdown");
                }
                Ok(Some(_)) => {
                    message.replied = true;
                    let delay =
                        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    message.replied_at = Some(now + delay);
                    message.status = MessageStatus::Closed;
                    run.metrics.emails_replied += 1;
                    self.store.update_message(&message).await?;
                    tracing::debug!(token = %message.token, "warmup reply sent");
                }
                Err(error) => {
                    if let Some(recipient) = recipients.get(&recipient_id).cloned().flatten() {
                        self.engagement_failed(&recipient, &message, error, run, now)
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Mark the message read in the recipient's inbox. `Ok(false)` when it is
    /// no longer there.
    async fn open_message(
        &self,
        recipient: &EmailAccount,
        message: &WarmupMessage,
        run: &CycleRun,
    ) -> std::result::Result<bool, TransportError> {
        let handle = match run.handles.get(&message.id) {
            Some(handle) => Some(handle.clone()),
            None => {
                self.transport
                    .search(recipient, INBOX, &message.token)
                    .await?
            }
        };
        let Some(handle) = handle else {
            tracing::debug!(token = %message.token, "located message no longer in inbox");
            return Ok(false);
        };
        self.transport.mark_read(recipient, &handle).await?;
        Ok(true)
    }

    /// Load a recipient whose mailbox may be inspected this cycle.
    async fn usable_recipient(
        &self,
        recipient_id: &str,
        run: &CycleRun,
    ) -> Result<Option<EmailAccount>> {
        if run.unavailable.contains(recipient_id) {
            return Ok(None);
        }
        let recipient = self.store.account(recipient_id).await?;
        Ok(recipient.filter(|recipient| {
            matches!(
                recipient.state,
                AccountState::Active | AccountState::Completed | AccountState::Paused
            )
        }))
    }

    async fn recipient_failed(
        &self,
        recipient: &EmailAccount,
        error: TransportError,
        run: &mut CycleRun,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if error.is_auth() {
            self.demote_recipient(recipient, run, now).await
        } else {
            run.warn(CycleWarning::RecipientUnavailable {
                recipient_id: recipient.id.clone(),
                error: error.to_string(),
            });
            Ok(())
        }
    }

    async fn engagement_failed(
        &self,
        recipient: &EmailAccount,
        message: &WarmupMessage,
        error: TransportError,
        run: &mut CycleRun,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if error.is_auth() {
            return self.demote_recipient(recipient, run, now).await;
        }
        run.warn(CycleWarning::EngagementFailed {
            token: message.token.clone(),
            recipient_id: recipient.id.clone(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Compare-and-set the recipient down to `verified` without taking its lock.
    async fn demote_recipient(
        &self,
        recipient: &EmailAccount,
        run: &mut CycleRun,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !run.unavailable.insert(recipient.id.clone()) {
            return Ok(());
        }
        let demoted = match recipient.state.demote() {
            Ok(next) => {
                self.store
                    .set_state_if(&recipient.id, recipient.state, next, None, now)
                    .await?
            }
            Err(_) => false,
        };
        if demoted {
            tracing::warn!(recipient_id = %recipient.id, "recipient credentials rejected; demoted");
        }
        run.warn(CycleWarning::RecipientDemoted {
            recipient_id: recipient.id.clone(),
        });
        Ok(())
    }

    /// Check credentials and move the account forward: `unverified -> verified`,
    /// then `active` when its config is active.
    #[tracing::instrument(skip_all, fields(account_id = %account_id))]
    pub async fn verify(&self, account_id: &str, now: DateTime<Utc>) -> Result<AccountState> {
        let _guard = self.locks.acquire(account_id).await;
        let account = self.store.require_account(account_id).await?;
        self.acquire_lease(account_id).await?;
        let state = self.verify_claimed(account, now).await;
        self.release_lease(account_id).await;
        state
    }

    async fn verify_claimed(&self, account: EmailAccount, now: DateTime<Utc>) -> Result<AccountState> {
        let account_id = account.id.as_str();
        if let Err(error) = self.transport.check_credentials(&account).await {
            if error.is_auth() && account.state.runs_cycles() {
                let next = account.state.demote()?;
                self.store
                    .set_state_if(account_id, account.state, next, None, now)
                    .await?;
            }
            tracing::warn!(%error, "credential check failed");
            return Err(error.into());
        }

        let next = match account.state {
            AccountState::Unverified | AccountState::Verified => {
                let verified = account.state.verify()?;
                let config = self.store.require_config(account_id).await?;
                if config.is_active {
                    verified.activate(true)?
                } else {
                    verified
                }
            }
            other => other,
        };

        if next != account.state {
            let applied = self
                .store
                .set_state_if(account_id, account.state, next, None, now)
                .await?;
            if !applied {
                return Err(concurrent_change(account.state, "verify"));
            }
            tracing::info!(from = %account.state, to = %next, "account verified");
        }
        Ok(next)
    }

    /// Enable or disable warmup for an account.
    #[tracing::instrument(skip_all, fields(account_id = %account_id))]
    pub async fn toggle(
        &self,
        account_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<AccountState> {
        let _guard = self.locks.acquire(account_id).await;
        let account = self.store.require_account(account_id).await?;
        self.acquire_lease(account_id).await?;
        let state = self.toggle_claimed(account, active, now).await;
        self.release_lease(account_id).await;
        state
    }

    async fn toggle_claimed(
        &self,
        account: EmailAccount,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<AccountState> {
        let account_id = account.id.as_str();
        let (next, paused_from) = if active {
            let next = match account.state {
                AccountState::Paused => account.state.resume(account.paused_from)?,
                AccountState::Verified => account.state.activate(true)?,
                AccountState::Active | AccountState::Completed => account.state,
                AccountState::Unverified => {
                    return Err(StateError::InvalidTransition {
                        from: account.state.to_string(),
                        action: "activate",
                    }
                    .into());
                }
            };
            (next, None)
        } else {
            match account.state {
                AccountState::Active | AccountState::Completed => {
                    let (paused, from) = account.state.pause()?;
                    (paused, Some(from))
                }
                other => (other, account.paused_from),
            }
        };

        let applied = self
            .store
            .apply_toggle(account_id, active, account.state, next, paused_from, now)
            .await?;
        if !applied {
            return Err(concurrent_change(account.state, "toggle"));
        }

        tracing::info!(active, from = %account.state, to = %next, "warmup toggled");
        Ok(next)
    }

    pub async fn status(&self, account_id: &str, now: DateTime<Utc>) -> Result<WarmupStatus> {
        let account = self.store.require_account(account_id).await?;
        let config = self.store.require_config(account_id).await?;
        let latest = self.store.latest_metrics(account_id).await?;
        let total_received = self.store.count_received(account_id).await?;

        let days_in_warmup = config.days_elapsed(now);
        let warmup_progress = if config.warmup_days == 0 {
            1.0
        } else {
            (f64::from(days_in_warmup) / f64::from(config.warmup_days)).min(1.0)
        };

        let deliverability_score = latest
            .as_ref()
            .map_or(100.0, |metrics| metrics.deliverability_score);

        Ok(WarmupStatus {
            account_id: account.id.clone(),
            email_address: account.email_address.clone(),
            state: account.state,
            is_active: config.is_active,
            days_in_warmup,
            warmup_progress,
            current_daily_limit: config.current_daily_limit,
            deliverability_score,
            // The score is `100 - spam rate` and the spam rate never exceeds 100.
            spam_rate: 100.0 - deliverability_score,
            open_rate: metrics::open_rate(&account.totals),
            reply_rate: metrics::reply_rate(&account.totals),
            total_sent: account.totals.sent,
            total_received,
            last_cycle_at: latest.map(|metrics| metrics.created_at),
        })
    }
}

/// Fold a placement into the message row and the cycle counters. Returns
/// whether the row changed.
fn apply_placement(message: &mut WarmupMessage, placement: &Placement, run: &mut CycleRun) -> bool {
    if placement.location == DeliveryLocation::Unknown {
        return false;
    }

    if message.status == MessageStatus::Unconfirmed {
        message.status = MessageStatus::Sent;
        message.error = None;
        run.metrics.emails_sent += 1;
    }

    if message.location == DeliveryLocation::Unknown {
        message.location = placement.location;
        match placement.location {
            DeliveryLocation::Inbox => run.metrics.inbox_placements += 1,
            DeliveryLocation::Spam => run.metrics.spam_placements += 1,
            DeliveryLocation::Unknown => {}
        }
    } else if message.location == DeliveryLocation::Spam
        && placement.location == DeliveryLocation::Inbox
    {
        // Moved out of spam by someone else since the last cycle.
        message.rescued = true;
    }

    if placement.rescued {
        message.rescued = true;
        run.metrics.rescues += 1;
    }

    if let Some(error) = &placement.rescue_error {
        run.warn(CycleWarning::RescueFailure {
            token: message.token.clone(),
            recipient_id: message.recipient_id.clone(),
            error: error.to_string(),
        });
    }

    let inbox_handle = placement
        .handle
        .as_ref()
        .filter(|handle| message.is_in_inbox() && is_inbox(&handle.folder));
    if let Some(handle) = inbox_handle {
        run.handles.insert(message.id.clone(), handle.clone());
    }

    true
}

fn concurrent_change(from: AccountState, action: &'static str) -> Error {
    StateError::InvalidTransition {
        from: format!("{from} (changed concurrently)"),
        action,
    }
    .into()
}
