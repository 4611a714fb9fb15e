//! Mail transport: send over SMTP, inspect and move over IMAP.
//!
//! Every call opens and closes its own session. Nothing keeps a connection
//! alive across a warmup cycle, since servers drop idle sessions and cap
//! concurrent connections.

pub mod mailserver;
pub mod memory;

pub use mailserver::MailServerTransport;
pub use memory::MemoryTransport;

use crate::error::TransportError;
use crate::model::EmailAccount;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Locates one message inside one folder of one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub folder: String,
    pub uid: u32,
}

/// A message to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    /// Message-ID of the message being answered.
    pub in_reply_to: Option<String>,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    /// Submit a message from `account`. Returns the Message-ID it was sent with.
    async fn send(&self, account: &EmailAccount, message: &OutgoingMessage) -> TransportResult<String>;

    async fn list_folders(&self, account: &EmailAccount) -> TransportResult<Vec<String>>;

    /// Find the original warmup message carrying `token` in `folder`.
    /// Replies to it never match.
    async fn search(
        &self,
        account: &EmailAccount,
        folder: &str,
        token: &str,
    ) -> TransportResult<Option<MessageHandle>>;

    /// Move the message out of `handle.folder` into `to_folder`.
    async fn move_message(
        &self,
        account: &EmailAccount,
        handle: &MessageHandle,
        to_folder: &str,
    ) -> TransportResult<()>;

    async fn mark_read(&self, account: &EmailAccount, handle: &MessageHandle) -> TransportResult<()>;

    /// Check that both the send and the fetch credentials are accepted.
    async fn check_credentials(&self, account: &EmailAccount) -> TransportResult<()>;
}

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries, for tests and one-shot credential checks.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `operation` until it succeeds or the failure may not be retried.
    ///
    /// Auth failures return immediately. Protocol failures get one retry.
    /// Ambiguous failures (timeouts) are retried only when `idempotent`.
    pub async fn run<T, F, Fut>(&self, label: &str, idempotent: bool, mut operation: F) -> TransportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut attempt = 1;
        let mut protocol_failures = 0;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if matches!(error, TransportError::ProtocolFailure(_)) {
                protocol_failures += 1;
            }

            let retryable = error.is_retryable()
                && (idempotent || !error.is_ambiguous())
                && protocol_failures <= 1;

            if !retryable || attempt >= self.max_attempts {
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                operation = label,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying mail transport operation"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Wraps a transport with [`RetryPolicy`].
///
/// Sends are not idempotent: a timed-out submission is surfaced rather than
/// repeated, and the engine rechecks delivery on the next cycle.
#[derive(Debug)]
pub struct ResilientTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: MailTransport> ResilientTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: MailTransport> MailTransport for ResilientTransport<T> {
    async fn send(&self, account: &EmailAccount, message: &OutgoingMessage) -> TransportResult<String> {
        self.policy
            .run("send", false, || self.inner.send(account, message))
            .await
    }

    async fn list_folders(&self, account: &EmailAccount) -> TransportResult<Vec<String>> {
        self.policy
            .run("list_folders", true, || self.inner.list_folders(account))
            .await
    }

    async fn search(
        &self,
        account: &EmailAccount,
        folder: &str,
        token: &str,
    ) -> TransportResult<Option<MessageHandle>> {
        self.policy
            .run("search", true, || self.inner.search(account, folder, token))
            .await
    }

    async fn move_message(
        &self,
        account: &EmailAccount,
        handle: &MessageHandle,
        to_folder: &str,
    ) -> TransportResult<()> {
        // A move that timed out may have completed; the rescue step re-searches
        // before trying again, so only unambiguous failures are retried here.
        self.policy
            .run("move_message", false, || {
                self.inner.move_message(account, handle, to_folder)
            })
            .await
    }

    async fn mark_read(&self, account: &EmailAccount, handle: &MessageHandle) -> TransportResult<()> {
        self.policy
            .run("mark_read", true, || self.inner.mark_read(account, handle))
            .await
    }

    async fn check_credentials(&self, account: &EmailAccount) -> TransportResult<()> {
        self.policy
            .run("check_credentials", true, || self.inner.check_credentials(account))
            .await
    }
}
