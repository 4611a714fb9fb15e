//! End-to-end warmup cycles against the in-memory mail server.

use warmupd::error::{Error, StateError, TransportError};
use warmupd::model::{
    AccountTotals, DeliveryLocation, EmailAccount, ImapEndpoint, MessageStatus, SmtpEndpoint,
    SmtpSecurity, WarmupConfig, WarmupMessage,
};
use warmupd::store::WarmupStore;
use warmupd::transport::{MailTransport, MemoryTransport, OutgoingMessage};
use warmupd::warmup::engagement::EngagementPolicy;
use warmupd::warmup::rescue::RescuePolicy;
use warmupd::warmup::{AccountState, CycleWarning, Engine, EngineSettings};

use chrono::{DateTime, TimeZone as _, Utc};
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn day0() -> DateTime<Utc> {
    // A Wednesday.
    Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap()
}

fn address(name: &str) -> String {
    format!("{name}@{name}.example")
}

fn account(name: &str, state: AccountState) -> EmailAccount {
    let address = address(name);
    EmailAccount {
        id: name.into(),
        user_id: "owner".into(),
        email_address: address.clone(),
        display_name: Some(name.to_uppercase()),
        smtp: SmtpEndpoint {
            host: format!("smtp.{name}.example"),
            port: 587,
            username: address.clone(),
            password: "secret".into(),
            security: SmtpSecurity::Starttls,
        },
        imap: ImapEndpoint {
            host: format!("imap.{name}.example"),
            port: 993,
            username: address,
            password: "secret".into(),
            use_tls: true,
        },
        state,
        paused_from: None,
        totals: AccountTotals::default(),
        created_at: day0(),
    }
}

fn config(daily_limit: u32) -> WarmupConfig {
    WarmupConfig {
        is_active: true,
        start_date: day0().date_naive(),
        max_emails_per_day: 20,
        daily_increase: 2,
        current_daily_limit: daily_limit,
        min_delay_seconds: 0,
        max_delay_seconds: 0,
        target_reply_rate: 100.0,
        read_delay_seconds: 0,
        randomize_volume: false,
        ..WarmupConfig::default()
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        rescue: RescuePolicy {
            poll_attempts: 1,
            poll_interval: Duration::ZERO,
            move_attempts: 3,
        },
        engagement: EngagementPolicy {
            open_probability: 1.0,
            rescued_reply_delay: Duration::ZERO,
        },
        ..EngineSettings::default()
    }
}

struct World {
    engine: Arc<Engine>,
    store: Arc<WarmupStore>,
    mail: Arc<MemoryTransport>,
    _shutdown: watch::Sender<bool>,
}

async fn world(accounts: Vec<(EmailAccount, WarmupConfig)>) -> World {
    let store = WarmupStore::open_in_memory().await.unwrap();
    for (account, config) in &accounts {
        store.insert_account(account, config).await.unwrap();
    }
    let mail = Arc::new(MemoryTransport::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Arc::new(Engine::new(
        store.clone(),
        mail.clone(),
        settings(),
        StdRng::seed_from_u64(42),
        shutdown_rx,
    ));
    World {
        engine,
        store,
        mail,
        _shutdown: shutdown_tx,
    }
}

async fn pair(sender_limit: u32) -> World {
    world(vec![
        (account("alice", AccountState::Active), config(sender_limit)),
        (account("bob", AccountState::Active), config(0)),
    ])
    .await
}

#[tokio::test]
async fn inbox_delivery_is_opened_and_answered() {
    let world = pair(2).await;

    let report = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(!report.demoted);
    assert_eq!(report.metrics.emails_sent, 2);
    assert_eq!(report.metrics.inbox_placements, 2);
    assert_eq!(report.metrics.spam_placements, 0);
    assert_eq!(report.metrics.emails_opened, 2);
    assert_eq!(report.metrics.emails_replied, 2);
    assert_eq!(report.metrics.deliverability_score, 100.0);
    assert_eq!(report.metrics.open_rate, 100.0);
    assert_eq!(report.metrics.reply_rate, 100.0);

    let messages = world.store.messages_from("alice").await.unwrap();
    assert_eq!(messages.len(), 2);
    for message in &messages {
        assert_eq!(message.status, MessageStatus::Closed);
        assert_eq!(message.location, DeliveryLocation::Inbox);
        assert!(message.replied);
        assert!(message.opened_at.is_some());

        let (folder, stored) = world.mail.locate(&address("bob"), &message.token).unwrap();
        assert_eq!(folder, "INBOX");
        assert!(stored.seen);
    }

    // Replies thread onto the originals and land in the sender's inbox.
    let replies: Vec<_> = world
        .mail
        .sent()
        .into_iter()
        .filter(|(from, _)| *from == address("bob"))
        .map(|(_, message)| message)
        .collect();
    assert_eq!(replies.len(), 2);
    for reply in &replies {
        assert_eq!(reply.to, address("alice"));
        assert!(reply.subject.starts_with("Re: "));
        let parent = messages
            .iter()
            .find(|message| message.message_id == reply.in_reply_to)
            .expect("reply threads onto a sent message");
        assert!(reply.subject.contains(&parent.token));
    }
    assert_eq!(world.mail.folder_contents(&address("alice"), "INBOX").len(), 2);

    let account = world.store.require_account("alice").await.unwrap();
    assert_eq!(account.totals.sent, 2);
    assert_eq!(account.totals.opened, 2);
    assert_eq!(account.totals.replied, 2);

    let status = world.engine.status("bob", day0()).await.unwrap();
    assert_eq!(status.total_received, 2);
}

#[tokio::test]
async fn spam_placement_is_rescued_and_answered_regardless_of_reply_rate() {
    let mut sender_config = config(2);
    sender_config.target_reply_rate = 0.0;
    let world = world(vec![
        (account("alice", AccountState::Active), sender_config),
        (account("bob", AccountState::Active), config(0)),
    ])
    .await;
    world.mail.add_mailbox(&address("bob"), &["Junk"]);
    world.mail.place_next(&address("bob"), "Junk");

    let report = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert_eq!(report.metrics.emails_sent, 2);
    assert_eq!(report.metrics.spam_placements, 1);
    assert_eq!(report.metrics.inbox_placements, 1);
    assert_eq!(report.metrics.rescues, 1);
    assert_eq!(report.metrics.emails_opened, 2);
    assert_eq!(report.metrics.emails_replied, 1);
    assert_eq!(report.metrics.deliverability_score, 50.0);

    let bob = world.store.require_account("bob").await.unwrap();
    let messages = world.store.messages_from("alice").await.unwrap();
    let (rescued, delivered) = (&messages[0], &messages[1]);

    assert_eq!(rescued.location, DeliveryLocation::Spam);
    assert!(rescued.rescued);
    assert!(rescued.replied);
    let in_inbox = world.mail.search(&bob, "INBOX", &rescued.token).await.unwrap();
    assert!(in_inbox.is_some());
    assert!(world.mail.folder_contents(&address("bob"), "Junk").is_empty());

    assert_eq!(delivered.location, DeliveryLocation::Inbox);
    assert!(!delivered.rescued);
    assert!(!delivered.replied);
    assert_eq!(delivered.status, MessageStatus::Closed);

    let account = world.store.require_account("alice").await.unwrap();
    assert_eq!(account.totals.spam_placements, 1);
    assert_eq!(account.totals.rescues, 1);
}

#[tokio::test]
async fn zero_quota_cycle_still_rechecks_unknown_messages() {
    let world = pair(1).await;
    world.mail.add_mailbox(&address("bob"), &["Archive"]);
    world.mail.place_next(&address("bob"), "Archive");

    let first = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert_eq!(first.metrics.emails_sent, 1);
    assert_eq!(first.metrics.inbox_placements, 0);

    let message = world.store.messages_from("alice").await.unwrap().remove(0);
    assert_eq!(message.location, DeliveryLocation::Unknown);

    // The recipient's filters release the message later the same day.
    let bob = world.store.require_account("bob").await.unwrap();
    let handle = world
        .mail
        .search(&bob, "Archive", &message.token)
        .await
        .unwrap()
        .unwrap();
    world.mail.move_message(&bob, &handle, "INBOX").await.unwrap();

    let later = day0() + chrono::Duration::hours(6);
    let second = world.engine.run_cycle("alice", later).await.unwrap();
    assert_eq!(second.metrics.emails_sent, 0);
    assert_eq!(second.metrics.inbox_placements, 1);
    assert_eq!(second.metrics.emails_opened, 1);
    assert_eq!(second.metrics.cycle_seq, 2);

    let message = world.store.message_by_token(&message.token).await.unwrap().unwrap();
    assert_eq!(message.location, DeliveryLocation::Inbox);
}

#[tokio::test]
async fn concurrent_cycles_grow_the_limit_once() {
    let mut sender_config = config(2);
    sender_config.start_date = day0().date_naive() - chrono::Duration::days(3);
    let world = world(vec![
        (account("alice", AccountState::Active), sender_config),
        (account("bob", AccountState::Active), config(0)),
    ])
    .await;

    let (first, second) = tokio::join!(
        world.engine.run_cycle("alice", day0()),
        world.engine.run_cycle("alice", day0())
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let config = world.store.require_config("alice").await.unwrap();
    assert_eq!(config.current_daily_limit, 4);
    assert_eq!(config.last_limit_increase, Some(day0().date_naive()));

    assert_eq!(first.metrics.emails_sent + second.metrics.emails_sent, 4);
    let seqs = [first.metrics.cycle_seq, second.metrics.cycle_seq];
    assert!(seqs.contains(&1) && seqs.contains(&2));
}

#[tokio::test]
async fn lone_account_warns_and_keeps_zero_rates() {
    let world = world(vec![(account("alice", AccountState::Active), config(3))]).await;

    let report = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert_eq!(report.warnings, vec![CycleWarning::InsufficientRecipientPool]);
    assert_eq!(report.metrics.emails_sent, 0);
    assert_eq!(report.metrics.open_rate, 0.0);
    assert_eq!(report.metrics.reply_rate, 0.0);
    assert_eq!(report.metrics.deliverability_score, 100.0);
    assert_eq!(report.state, AccountState::Active);
}

#[tokio::test]
async fn paused_accounts_leave_the_recipient_pool() {
    let world = pair(2).await;
    assert_eq!(
        world.engine.toggle("bob", false, day0()).await.unwrap(),
        AccountState::Paused
    );

    let report = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert_eq!(report.warnings, vec![CycleWarning::InsufficientRecipientPool]);
    assert!(world.mail.sent().is_empty());
}

#[tokio::test]
async fn sender_auth_failure_demotes_and_halts() {
    let world = pair(3).await;
    world.mail.reject_auth(&address("alice"));

    let report = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert!(report.demoted);
    assert_eq!(report.state, AccountState::Verified);
    assert_eq!(report.metrics.send_failures, 1);
    assert_eq!(report.metrics.emails_sent, 0);

    let messages = world.store.messages_from("alice").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Failed);

    let error = world.engine.run_cycle("alice", day0()).await.unwrap_err();
    assert!(matches!(
        error,
        Error::State(StateError::InvalidTransition { .. })
    ));

    world.mail.restore_auth(&address("alice"));
    let state = world.engine.verify("alice", day0()).await.unwrap();
    assert_eq!(state, AccountState::Active);
}

#[tokio::test]
async fn recipient_auth_failure_demotes_the_recipient_only() {
    let world = pair(1).await;
    world.mail.reject_auth(&address("bob"));

    let report = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert!(!report.demoted);
    assert_eq!(report.state, AccountState::Active);
    assert_eq!(report.metrics.emails_sent, 1);
    assert!(report.warnings.contains(&CycleWarning::RecipientDemoted {
        recipient_id: "bob".into()
    }));

    let bob = world.store.require_account("bob").await.unwrap();
    assert_eq!(bob.state, AccountState::Verified);
}

#[tokio::test]
async fn failed_rescue_is_retried_next_cycle() {
    let world = pair(1).await;
    world.mail.add_mailbox(&address("bob"), &["Junk"]);
    world.mail.place_next(&address("bob"), "Junk");
    world.mail.fail_moves(
        &address("bob"),
        3,
        TransportError::ProtocolFailure("NO [CANNOT] move refused".into()),
    );

    let first = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert_eq!(first.metrics.spam_placements, 1);
    assert_eq!(first.metrics.rescues, 0);
    assert_eq!(first.metrics.emails_replied, 0);
    assert!(first
        .warnings
        .iter()
        .any(|warning| matches!(warning, CycleWarning::RescueFailure { .. })));

    let message = world.store.messages_from("alice").await.unwrap().remove(0);
    assert_eq!(message.location, DeliveryLocation::Spam);
    assert!(!message.rescued);
    let (folder, _) = world.mail.locate(&address("bob"), &message.token).unwrap();
    assert_eq!(folder, "Junk");

    let later = day0() + chrono::Duration::hours(6);
    let second = world.engine.run_cycle("alice", later).await.unwrap();
    assert_eq!(second.metrics.emails_sent, 0);
    assert_eq!(second.metrics.spam_placements, 0);
    assert_eq!(second.metrics.rescues, 1);
    assert_eq!(second.metrics.emails_replied, 1);
}

#[tokio::test]
async fn warmup_completes_after_enough_days_of_history() {
    let mut sender_config = config(1);
    sender_config.warmup_days = 3;
    let world = world(vec![
        (account("alice", AccountState::Active), sender_config),
        (account("bob", AccountState::Active), config(0)),
    ])
    .await;

    for day in 0..3 {
        let now = day0() + chrono::Duration::days(day);
        let report = world.engine.run_cycle("alice", now).await.unwrap();
        assert_eq!(report.state, AccountState::Active, "day {day}");
    }

    let now = day0() + chrono::Duration::days(3);
    let report = world.engine.run_cycle("alice", now).await.unwrap();
    assert_eq!(report.state, AccountState::Completed);

    // Completed accounts keep cycling at the frozen limit.
    let frozen = world.store.require_config("alice").await.unwrap().current_daily_limit;
    let now = day0() + chrono::Duration::days(4);
    let report = world.engine.run_cycle("alice", now).await.unwrap();
    assert_eq!(report.state, AccountState::Completed);
    assert_eq!(report.metrics.emails_sent, frozen);
    assert_eq!(
        world.store.require_config("alice").await.unwrap().current_daily_limit,
        frozen
    );
}

#[tokio::test]
async fn weekend_cycles_send_nothing_when_weekdays_only() {
    let mut sender_config = config(2);
    sender_config.weekdays_only = true;
    let world = world(vec![
        (account("alice", AccountState::Active), sender_config),
        (account("bob", AccountState::Active), config(0)),
    ])
    .await;

    let saturday = day0() + chrono::Duration::days(3);
    let report = world.engine.run_cycle("alice", saturday).await.unwrap();
    assert_eq!(report.metrics.emails_sent, 0);
    assert!(world.mail.sent().is_empty());
    assert_eq!(
        world.store.require_config("alice").await.unwrap().current_daily_limit,
        2
    );
}

#[tokio::test]
async fn restarted_engine_with_the_same_seed_keeps_tokens_unique() {
    let world = pair(2).await;
    world.engine.run_cycle("alice", day0()).await.unwrap();

    // A fresh process on the same database, seeded like the first one.
    let (_restart_shutdown, restart_rx) = watch::channel(false);
    let restarted = Engine::new(
        world.store.clone(),
        world.mail.clone(),
        settings(),
        StdRng::seed_from_u64(42),
        restart_rx,
    );
    let next_day = day0() + chrono::Duration::days(1);
    let report = restarted.run_cycle("alice", next_day).await.unwrap();
    assert!(report.metrics.emails_sent > 0);

    let messages = world.store.messages_from("alice").await.unwrap();
    let tokens: HashSet<&str> = messages.iter().map(|message| message.token.as_str()).collect();
    assert_eq!(tokens.len(), messages.len());
}

#[tokio::test]
async fn send_cut_off_before_it_was_recorded_is_rechecked() {
    let world = pair(1).await;
    let alice = world.store.require_account("alice").await.unwrap();

    // The server took the message but the row never left `sending`.
    let token = "WARMUP-0123456789abcdef0123456789abcdef";
    let subject = format!("{token}: Checking in");
    world
        .mail
        .send(
            &alice,
            &OutgoingMessage {
                to: address("bob"),
                subject: subject.clone(),
                text_body: "Hi".into(),
                html_body: "<p>Hi</p>".into(),
                in_reply_to: None,
            },
        )
        .await
        .unwrap();
    world
        .store
        .insert_message(&WarmupMessage {
            id: "cut-off".into(),
            seq: 0,
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
            token: token.into(),
            subject,
            message_id: None,
            status: MessageStatus::Sending,
            location: DeliveryLocation::Unknown,
            rescued: false,
            reply_planned: None,
            replied: false,
            sent_at: day0(),
            opened_at: None,
            replied_at: None,
            error: None,
        })
        .await
        .unwrap();

    let later = day0() + chrono::Duration::hours(6);
    let report = world.engine.run_cycle("alice", later).await.unwrap();
    // It used up today's single send and is counted once found.
    assert_eq!(report.metrics.emails_sent, 1);
    assert_eq!(report.metrics.inbox_placements, 1);
    assert_eq!(report.metrics.emails_replied, 1);

    let recovered = world.store.message_by_token(token).await.unwrap().unwrap();
    assert_eq!(recovered.location, DeliveryLocation::Inbox);
    assert_eq!(recovered.status, MessageStatus::Closed);
    assert!(recovered.replied);

    let from_alice = world
        .mail
        .sent()
        .into_iter()
        .filter(|(from, _)| *from == address("alice"))
        .count();
    assert_eq!(from_alice, 1);
}

#[tokio::test]
async fn rescue_counts_once_when_the_moved_message_shows_up_late() {
    let world = pair(1).await;
    world.mail.add_mailbox(&address("bob"), &["Junk"]);
    world.mail.place_next(&address("bob"), "Junk");
    world.mail.lag_moves(&address("bob"), 1);

    let first = world.engine.run_cycle("alice", day0()).await.unwrap();
    assert_eq!(first.metrics.spam_placements, 1);
    assert_eq!(first.metrics.rescues, 1);
    assert_eq!(first.metrics.emails_replied, 1);
    assert!(!first
        .warnings
        .iter()
        .any(|warning| matches!(warning, CycleWarning::RescueFailure { .. })));

    let later = day0() + chrono::Duration::hours(6);
    let second = world.engine.run_cycle("alice", later).await.unwrap();
    assert_eq!(second.metrics.rescues, 0);

    let account = world.store.require_account("alice").await.unwrap();
    assert_eq!(account.totals.rescues, 1);
    assert_eq!(account.totals.spam_placements, 1);

    let status = world.engine.status("alice", later).await.unwrap();
    assert_eq!(status.spam_rate, 100.0);
    assert_eq!(status.deliverability_score, 0.0);
}
