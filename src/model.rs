//! Persistent warmup entities: accounts, configs, sent messages and cycle metrics.

use crate::error::ConfigError;
use crate::warmup::state::AccountState;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How the SMTP session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Implicit TLS, usually port 465.
    Tls,
    /// Plain connection upgraded with STARTTLS, usually port 587.
    Starttls,
}

impl SmtpSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Starttls => "starttls",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "tls" => Self::Tls,
            _ => Self::Starttls,
        }
    }

    /// Port 465 speaks TLS from the first byte; everything else negotiates.
    pub fn for_port(port: u16) -> Self {
        if port == 465 { Self::Tls } else { Self::Starttls }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub security: SmtpSecurity,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
}

impl std::fmt::Debug for SmtpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("security", &self.security)
            .finish()
    }
}

impl std::fmt::Debug for ImapEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Running totals kept on the account row and updated once per cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTotals {
    pub sent: u64,
    pub opened: u64,
    pub replied: u64,
    pub spam_placements: u64,
    pub rescues: u64,
}

/// A managed mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAccount {
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    pub display_name: Option<String>,
    pub smtp: SmtpEndpoint,
    pub imap: ImapEndpoint,
    pub state: AccountState,
    /// State to return to when a paused account is re-enabled.
    pub paused_from: Option<AccountState>,
    pub totals: AccountTotals,
    pub created_at: DateTime<Utc>,
}

impl EmailAccount {
    /// Domain part of the address, used for generated Message-IDs.
    pub fn domain(&self) -> &str {
        self.email_address
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost")
    }
}

/// Per-account warmup tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub is_active: bool,
    pub start_date: NaiveDate,
    pub max_emails_per_day: u32,
    pub daily_increase: u32,
    pub current_daily_limit: u32,
    pub min_delay_seconds: u32,
    pub max_delay_seconds: u32,
    pub target_open_rate: f64,
    pub target_reply_rate: f64,
    pub warmup_days: u32,
    pub weekdays_only: bool,
    pub randomize_volume: bool,
    pub read_delay_seconds: u32,
    /// Calendar day the daily limit last grew; growth happens at most once a day.
    pub last_limit_increase: Option<NaiveDate>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            is_active: true,
            start_date: Utc::now().date_naive(),
            max_emails_per_day: 40,
            daily_increase: 2,
            current_daily_limit: 2,
            min_delay_seconds: 60,
            max_delay_seconds: 300,
            target_open_rate: 80.0,
            target_reply_rate: 40.0,
            warmup_days: 28,
            weekdays_only: false,
            randomize_volume: true,
            read_delay_seconds: 120,
            last_limit_increase: None,
        }
    }
}

impl WarmupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.current_daily_limit > self.max_emails_per_day {
            return Err(ConfigError::InvalidWarmupConfig(format!(
                "current_daily_limit ({}) exceeds max_emails_per_day ({})",
                self.current_daily_limit, self.max_emails_per_day
            )));
        }
        if self.min_delay_seconds > self.max_delay_seconds {
            return Err(ConfigError::InvalidWarmupConfig(format!(
                "min_delay_seconds ({}) exceeds max_delay_seconds ({})",
                self.min_delay_seconds, self.max_delay_seconds
            )));
        }
        for (name, rate) in [
            ("target_open_rate", self.target_open_rate),
            ("target_reply_rate", self.target_reply_rate),
        ] {
            if !(0.0..=100.0).contains(&rate) {
                return Err(ConfigError::InvalidWarmupConfig(format!(
                    "{name} must be within 0-100, got {rate}"
                )));
            }
        }
        if self.warmup_days == 0 {
            return Err(ConfigError::InvalidWarmupConfig(
                "warmup_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whole days since warmup started, never negative.
    pub fn days_elapsed(&self, now: DateTime<Utc>) -> u32 {
        let days = (now.date_naive() - self.start_date).num_days();
        u32::try_from(days.max(0)).unwrap_or(u32::MAX)
    }
}

/// Where the provider put a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryLocation {
    Inbox,
    Spam,
    Unknown,
}

impl DeliveryLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Spam => "spam",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "inbox" => Self::Inbox,
            "spam" => Self::Spam,
            _ => Self::Unknown,
        }
    }
}

/// Lifecycle of a warmup message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Row written, SMTP submission in progress.
    Sending,
    /// Accepted by the sender's SMTP server.
    Sent,
    /// Submission timed out; the server may or may not have accepted it.
    Unconfirmed,
    /// Submission definitely failed.
    Failed,
    /// Engagement window closed.
    Closed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Unconfirmed => "unconfirmed",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "unconfirmed" => Self::Unconfirmed,
            "closed" => Self::Closed,
            _ => Self::Failed,
        }
    }
}

/// One warmup email sent from a managed account to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupMessage {
    pub id: String,
    /// Monotonic insertion order.
    pub seq: i64,
    pub sender_id: String,
    pub recipient_id: String,
    pub token: String,
    pub subject: String,
    pub message_id: Option<String>,
    pub status: MessageStatus,
    pub location: DeliveryLocation,
    pub rescued: bool,
    /// Reply decision, drawn once when the message is first engaged.
    pub reply_planned: Option<bool>,
    pub replied: bool,
    pub sent_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WarmupMessage {
    /// Located messages that can be engaged with: in the inbox, or rescued into it.
    pub fn is_in_inbox(&self) -> bool {
        self.location == DeliveryLocation::Inbox
            || (self.location == DeliveryLocation::Spam && self.rescued)
    }
}

/// Outcome of one warmup cycle for one account. Append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub account_id: String,
    pub cycle_seq: i64,
    pub cycle_date: NaiveDate,
    pub emails_sent: u32,
    pub send_failures: u32,
    pub emails_opened: u32,
    pub emails_replied: u32,
    pub inbox_placements: u32,
    pub spam_placements: u32,
    pub rescues: u32,
    pub deliverability_score: f64,
    pub open_rate: f64,
    pub reply_rate: f64,
    pub created_at: DateTime<Utc>,
}

impl CycleMetrics {
    pub fn empty(account_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            cycle_seq: 0,
            cycle_date: now.date_naive(),
            emails_sent: 0,
            send_failures: 0,
            emails_opened: 0,
            emails_replied: 0,
            inbox_placements: 0,
            spam_placements: 0,
            rescues: 0,
            deliverability_score: 100.0,
            open_rate: 0.0,
            reply_rate: 0.0,
            created_at: now,
        }
    }
}

/// Account definition as written in an import file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSpec {
    pub user_id: String,
    pub email_address: String,
    pub display_name: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: String,
    pub smtp_security: Option<SmtpSecurity>,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub imap_username: Option<String>,
    pub imap_password: Option<String>,
    #[serde(default = "default_true")]
    pub imap_use_tls: bool,
    #[serde(default)]
    pub warmup: WarmupConfig,
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

impl AccountSpec {
    /// Build a fresh, unverified account. Usernames default to the address and
    /// the IMAP password defaults to the SMTP one.
    pub fn into_account(self, now: DateTime<Utc>) -> Result<(EmailAccount, WarmupConfig), ConfigError> {
        let address = self.email_address.trim().to_string();
        if !address.contains('@') || address.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidAccount(format!(
                "invalid email address '{address}'"
            )));
        }
        self.warmup.validate()?;

        let account = EmailAccount {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id,
            display_name: self.display_name,
            smtp: SmtpEndpoint {
                host: self.smtp_host,
                port: self.smtp_port,
                username: self.smtp_username.unwrap_or_else(|| address.clone()),
                password: self.smtp_password.clone(),
                security: self
                    .smtp_security
                    .unwrap_or_else(|| SmtpSecurity::for_port(self.smtp_port)),
            },
            imap: ImapEndpoint {
                host: self.imap_host,
                port: self.imap_port,
                username: self.imap_username.unwrap_or_else(|| address.clone()),
                password: self.imap_password.unwrap_or(self.smtp_password),
                use_tls: self.imap_use_tls,
            },
            email_address: address,
            state: AccountState::Unverified,
            paused_from: None,
            totals: AccountTotals::default(),
            created_at: now,
        };

        Ok((account, self.warmup))
    }
}

/// Top-level shape of an account import file.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountImport {
    #[serde(default, rename = "account")]
    pub accounts: Vec<AccountSpec>,
}
