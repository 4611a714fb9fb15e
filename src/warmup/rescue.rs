//! Find where a warmup message landed and pull it out of spam.

use crate::error::TransportError;
use crate::model::{DeliveryLocation, EmailAccount};
use crate::transport::{MailTransport, MessageHandle, TransportResult};
use crate::warmup::folders::{INBOX, spam_folders_present};

use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescuePolicy {
    /// Search passes before a message is left as `unknown`.
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub move_attempts: u32,
}

impl Default for RescuePolicy {
    fn default() -> Self {
        Self {
            poll_attempts: 3,
            poll_interval: Duration::from_secs(20),
            move_attempts: 3,
        }
    }
}

/// Result of locating one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Where the provider delivered the message; `Spam` even after a rescue.
    pub location: DeliveryLocation,
    /// Current handle. After a rescue it is the inbox handle, or `None` when
    /// the moved message could not be looked up again yet.
    pub handle: Option<MessageHandle>,
    /// Moved out of spam by this call.
    pub rescued: bool,
    /// Found in spam but every move attempt failed.
    pub rescue_error: Option<TransportError>,
}

impl Placement {
    fn unknown() -> Self {
        Self {
            location: DeliveryLocation::Unknown,
            handle: None,
            rescued: false,
            rescue_error: None,
        }
    }
}

pub struct Rescuer<'a> {
    transport: &'a dyn MailTransport,
    policy: RescuePolicy,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<'a> Rescuer<'a> {
    pub fn new(transport: &'a dyn MailTransport, policy: RescuePolicy) -> Self {
        Self {
            transport,
            policy,
            shutdown: None,
        }
    }

    /// Cut polling short once `shutdown` flips; the message stays unlocated.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    async fn wait_between_polls(&self) -> bool {
        match &self.shutdown {
            Some(shutdown) => crate::warmup::pause(shutdown, self.policy.poll_interval).await,
            None => {
                tokio::time::sleep(self.policy.poll_interval).await;
                false
            }
        }
    }

    /// Spam folders that exist in the recipient's mailbox, in search order.
    pub async fn spam_folders(&self, recipient: &EmailAccount) -> TransportResult<Vec<String>> {
        let folders = self.transport.list_folders(recipient).await?;
        Ok(spam_folders_present(&folders))
    }

    /// One pass: inbox first, then each spam folder. First match wins.
    pub async fn find(
        &self,
        recipient: &EmailAccount,
        spam_folders: &[String],
        token: &str,
    ) -> TransportResult<Option<(DeliveryLocation, MessageHandle)>> {
        if let Some(handle) = self.transport.search(recipient, INBOX, token).await? {
            return Ok(Some((DeliveryLocation::Inbox, handle)));
        }
        for folder in spam_folders {
            if let Some(handle) = self.transport.search(recipient, folder, token).await? {
                return Ok(Some((DeliveryLocation::Spam, handle)));
            }
        }
        Ok(None)
    }

    /// Locate `token` in the recipient's mailbox and rescue it if it sits in spam.
    ///
    /// Not finding the message is not an error. Transport errors from search are
    /// returned; move failures are reported in [`Placement::rescue_error`]
    /// unless they are auth failures.
    pub async fn locate(
        &self,
        recipient: &EmailAccount,
        spam_folders: &[String],
        token: &str,
    ) -> TransportResult<Placement> {
        let attempts = self.policy.poll_attempts.max(1);
        let mut found = None;

        for attempt in 1..=attempts {
            found = self.find(recipient, spam_folders, token).await?;
            if found.is_some() {
                break;
            }
            if attempt < attempts && self.wait_between_polls().await {
                break;
            }
        }

        let Some((location, handle)) = found else {
            tracing::debug!(
                recipient = %recipient.email_address,
                token,
                attempts,
                "warmup message not found yet"
            );
            return Ok(Placement::unknown());
        };

        if location == DeliveryLocation::Inbox {
            return Ok(Placement {
                location,
                handle: Some(handle),
                rescued: false,
                rescue_error: None,
            });
        }

        tracing::info!(
            recipient = %recipient.email_address,
            token,
            folder = %handle.folder,
            "warmup message landed in spam"
        );

        match self.rescue(recipient, &handle, token).await {
            Ok(inbox_handle) => Ok(Placement {
                location,
                handle: inbox_handle,
                rescued: true,
                rescue_error: None,
            }),
            Err(error) if error.is_auth() => Err(error),
            Err(error) => {
                tracing::warn!(
                    recipient = %recipient.email_address,
                    token,
                    folder = %handle.folder,
                    %error,
                    "failed to rescue warmup message from spam"
                );
                Ok(Placement {
                    location,
                    handle: Some(handle),
                    rescued: false,
                    rescue_error: Some(error),
                })
            }
        }
    }

    /// Move a spam-placed message to the inbox and return its new handle.
    /// Once the move has gone through, a failed lookup only loses the handle.
    async fn rescue(
        &self,
        recipient: &EmailAccount,
        handle: &MessageHandle,
        token: &str,
    ) -> TransportResult<Option<MessageHandle>> {
        let attempts = self.policy.move_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.move_message(recipient, handle, INBOX).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(error) if error.is_auth() => return Err(error),
                Err(error) => {
                    tracing::debug!(
                        recipient = %recipient.email_address,
                        token,
                        attempt,
                        %error,
                        "spam rescue move failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        if let Some(error) = last_error {
            return Err(error);
        }

        // The move changes the UID, so look the message up again.
        match self.transport.search(recipient, INBOX, token).await {
            Ok(Some(inbox_handle)) => Ok(Some(inbox_handle)),
            Ok(None) => {
                tracing::debug!(
                    recipient = %recipient.email_address,
                    token,
                    "rescued message not visible in inbox yet"
                );
                Ok(None)
            }
            Err(error) if error.is_auth() => Err(error),
            Err(error) => {
                tracing::debug!(
                    recipient = %recipient.email_address,
                    token,
                    %error,
                    "inbox lookup after rescue failed"
                );
                Ok(None)
            }
        }
    }
}
