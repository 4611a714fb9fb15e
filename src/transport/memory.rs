//! In-memory mail server for dry runs and tests.
//!
//! Mailboxes are keyed by address. Delivery lands in `INBOX` unless a folder
//! was queued with [`MemoryTransport::place_next`]. Failures can be injected
//! per address.

use super::{MailTransport, MessageHandle, OutgoingMessage, TransportResult};
use crate::error::TransportError;
use crate::model::EmailAccount;
use crate::warmup::content::subject_matches_token;
use crate::warmup::folders::INBOX;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// A message as stored in a mailbox folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub uid: u32,
    pub from: String,
    pub subject: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub seen: bool,
}

#[derive(Debug, Default)]
struct MemoryMailbox {
    folders: BTreeMap<String, Vec<StoredMessage>>,
}

impl MemoryMailbox {
    fn with_inbox() -> Self {
        let mut folders = BTreeMap::new();
        folders.insert(INBOX.to_string(), Vec::new());
        Self { folders }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    mailboxes: HashMap<String, MemoryMailbox>,
    placements: HashMap<String, VecDeque<String>>,
    rejected_auth: HashSet<String>,
    send_failures: HashMap<String, VecDeque<TransportError>>,
    move_failures: HashMap<String, VecDeque<TransportError>>,
    /// Searches a moved message stays invisible for, per mailbox.
    move_lag: HashMap<String, usize>,
    /// `(uid, searches left)` of moved messages still invisible, per mailbox.
    hidden: HashMap<String, Vec<(u32, usize)>>,
    sent: Vec<(String, OutgoingMessage)>,
    next_uid: u32,
    next_message_id: u64,
}

impl MemoryState {
    fn mailbox(&mut self, address: &str) -> &mut MemoryMailbox {
        self.mailboxes
            .entry(normalize(address))
            .or_insert_with(MemoryMailbox::with_inbox)
    }

    fn check_auth(&self, address: &str) -> TransportResult<()> {
        if self.rejected_auth.contains(&normalize(address)) {
            return Err(TransportError::AuthFailure(format!(
                "credentials rejected for {address}"
            )));
        }
        Ok(())
    }

    fn allocate_uid(&mut self) -> u32 {
        self.next_uid += 1;
        self.next_uid
    }
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create `address` with `INBOX` plus the given extra folders.
    pub fn add_mailbox(&self, address: &str, folders: &[&str]) {
        let mut state = self.state();
        let mailbox = state.mailbox(address);
        for folder in folders {
            mailbox.folders.entry((*folder).to_string()).or_default();
        }
    }

    /// Deliver the next message addressed to `address` into `folder`.
    pub fn place_next(&self, address: &str, folder: &str) {
        self.state()
            .placements
            .entry(normalize(address))
            .or_default()
            .push_back(folder.to_string());
    }

    /// Refuse every session opened with this account's credentials.
    pub fn reject_auth(&self, address: &str) {
        self.state().rejected_auth.insert(normalize(address));
    }

    pub fn restore_auth(&self, address: &str) {
        self.state().rejected_auth.remove(&normalize(address));
    }

    /// Fail the next send from `sender` with `error`.
    pub fn fail_next_send(&self, sender: &str, error: TransportError) {
        self.state()
            .send_failures
            .entry(normalize(sender))
            .or_default()
            .push_back(error);
    }

    /// Fail the next `count` moves in `address`'s mailbox.
    pub fn fail_moves(&self, address: &str, count: usize, error: TransportError) {
        let mut state = self.state();
        let queue = state.move_failures.entry(normalize(address)).or_default();
        queue.extend(std::iter::repeat_n(error, count));
    }

    /// Hide messages moved in `address`'s mailbox from the next `searches`
    /// searches of that mailbox, like a server whose index trails its moves.
    pub fn lag_moves(&self, address: &str, searches: usize) {
        self.state().move_lag.insert(normalize(address), searches);
    }

    pub fn folder_contents(&self, address: &str, folder: &str) -> Vec<StoredMessage> {
        self.state()
            .mailboxes
            .get(&normalize(address))
            .and_then(|mailbox| mailbox.folders.get(folder))
            .cloned()
            .unwrap_or_default()
    }

    /// Folder currently holding the original message for `token`, if any.
    pub fn locate(&self, address: &str, token: &str) -> Option<(String, StoredMessage)> {
        let state = self.state();
        let mailbox = state.mailboxes.get(&normalize(address))?;
        mailbox.folders.iter().find_map(|(folder, messages)| {
            messages
                .iter()
                .find(|message| subject_matches_token(&message.subject, token))
                .map(|message| (folder.clone(), message.clone()))
        })
    }

    /// Every accepted submission as `(sender, message)`, in order.
    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.state().sent.clone()
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn send(&self, account: &EmailAccount, message: &OutgoingMessage) -> TransportResult<String> {
        let mut state = self.state();
        state.check_auth(&account.email_address)?;

        let sender = normalize(&account.email_address);
        if let Some(error) = state
            .send_failures
            .get_mut(&sender)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        state.next_message_id += 1;
        let message_id = format!("<{}.{}@{}>", state.next_message_id, sender, account.domain());
        let folder = state
            .placements
            .get_mut(&normalize(&message.to))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| INBOX.to_string());
        let uid = state.allocate_uid();

        state
            .mailbox(&message.to)
            .folders
            .entry(folder)
            .or_default()
            .push(StoredMessage {
                uid,
                from: sender.clone(),
                subject: message.subject.clone(),
                message_id: message_id.clone(),
                in_reply_to: message.in_reply_to.clone(),
                seen: false,
            });
        state.sent.push((sender, message.clone()));

        Ok(message_id)
    }

    async fn list_folders(&self, account: &EmailAccount) -> TransportResult<Vec<String>> {
        let mut state = self.state();
        state.check_auth(&account.email_address)?;
        Ok(state
            .mailbox(&account.email_address)
            .folders
            .keys()
            .cloned()
            .collect())
    }

    async fn search(
        &self,
        account: &EmailAccount,
        folder: &str,
        token: &str,
    ) -> TransportResult<Option<MessageHandle>> {
        let mut state = self.state();
        state.check_auth(&account.email_address)?;

        let address = normalize(&account.email_address);
        let hidden: HashSet<u32> = match state.hidden.get_mut(&address) {
            Some(entries) => {
                let uids = entries.iter().map(|(uid, _)| *uid).collect();
                for (_, left) in entries.iter_mut() {
                    *left -= 1;
                }
                entries.retain(|(_, left)| *left > 0);
                uids
            }
            None => HashSet::new(),
        };

        let Some(messages) = state.mailbox(&account.email_address).folders.get(folder) else {
            return Err(TransportError::ProtocolFailure(format!(
                "NO mailbox '{folder}' does not exist"
            )));
        };
        Ok(messages
            .iter()
            .filter(|message| subject_matches_token(&message.subject, token))
            .map(|message| message.uid)
            .filter(|uid| !hidden.contains(uid))
            .max()
            .map(|uid| MessageHandle {
                folder: folder.to_string(),
                uid,
            }))
    }

    async fn move_message(
        &self,
        account: &EmailAccount,
        handle: &MessageHandle,
        to_folder: &str,
    ) -> TransportResult<()> {
        let mut state = self.state();
        state.check_auth(&account.email_address)?;

        if let Some(error) = state
            .move_failures
            .get_mut(&normalize(&account.email_address))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let uid = state.allocate_uid();
        let address = normalize(&account.email_address);
        let lag = state.move_lag.get(&address).copied().unwrap_or(0);
        let mailbox = state.mailbox(&account.email_address);
        if !mailbox.folders.contains_key(to_folder) {
            return Err(TransportError::ProtocolFailure(format!(
                "NO mailbox '{to_folder}' does not exist"
            )));
        }
        let source = mailbox.folders.get_mut(&handle.folder).ok_or_else(|| {
            TransportError::ProtocolFailure(format!("NO mailbox '{}' does not exist", handle.folder))
        })?;
        let position = source
            .iter()
            .position(|message| message.uid == handle.uid)
            .ok_or_else(|| {
                TransportError::ProtocolFailure(format!(
                    "NO uid {} not found in '{}'",
                    handle.uid, handle.folder
                ))
            })?;

        let mut message = source.remove(position);
        message.uid = uid;
        mailbox
            .folders
            .entry(to_folder.to_string())
            .or_default()
            .push(message);
        if lag > 0 {
            state.hidden.entry(address).or_default().push((uid, lag));
        }
        Ok(())
    }

    async fn mark_read(&self, account: &EmailAccount, handle: &MessageHandle) -> TransportResult<()> {
        let mut state = self.state();
        state.check_auth(&account.email_address)?;
        let message = state
            .mailbox(&account.email_address)
            .folders
            .get_mut(&handle.folder)
            .and_then(|messages| messages.iter_mut().find(|message| message.uid == handle.uid))
            .ok_or_else(|| {
                TransportError::ProtocolFailure(format!(
                    "NO uid {} not found in '{}'",
                    handle.uid, handle.folder
                ))
            })?;
        message.seen = true;
        Ok(())
    }

    async fn check_credentials(&self, account: &EmailAccount) -> TransportResult<()> {
        let mut state = self.state();
        state.check_auth(&account.email_address)?;
        state.mailbox(&account.email_address);
        Ok(())
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountTotals, ImapEndpoint, SmtpEndpoint, SmtpSecurity};
    use crate::warmup::state::AccountState;

    fn account(address: &str) -> EmailAccount {
        EmailAccount {
            id: address.into(),
            user_id: "u".into(),
            email_address: address.into(),
            display_name: None,
            smtp: SmtpEndpoint {
                host: "smtp.test".into(),
                port: 587,
                username: address.into(),
                password: "pw".into(),
                security: SmtpSecurity::Starttls,
            },
            imap: ImapEndpoint {
                host: "imap.test".into(),
                port: 993,
                username: address.into(),
                password: "pw".into(),
                use_tls: true,
            },
            state: AccountState::Active,
            paused_from: None,
            totals: AccountTotals::default(),
            created_at: chrono::Utc::now(),
        }
    }

    fn outgoing(to: &str, subject: &str) -> OutgoingMessage {
        OutgoingMessage {
            to: to.into(),
            subject: subject.into(),
            text_body: "hi".into(),
            html_body: "<p>hi</p>".into(),
            in_reply_to: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_inbox_by_default() {
        let transport = MemoryTransport::new();
        let alice = account("alice@a.test");
        let bob = account("bob@b.test");

        transport
            .send(&alice, &outgoing("bob@b.test", "WARMUP-1: hi"))
            .await
            .unwrap();

        let handle = transport.search(&bob, INBOX, "WARMUP-1").await.unwrap();
        assert_eq!(handle.map(|handle| handle.folder), Some(INBOX.to_string()));
    }

    #[tokio::test]
    async fn placed_messages_can_be_moved_back() {
        let transport = MemoryTransport::new();
        let alice = account("alice@a.test");
        let bob = account("bob@b.test");
        transport.add_mailbox("bob@b.test", &["Junk"]);
        transport.place_next("bob@b.test", "Junk");

        transport
            .send(&alice, &outgoing("bob@b.test", "WARMUP-2: hi"))
            .await
            .unwrap();
        assert!(transport.search(&bob, INBOX, "WARMUP-2").await.unwrap().is_none());

        let handle = transport.search(&bob, "Junk", "WARMUP-2").await.unwrap().unwrap();
        transport.move_message(&bob, &handle, INBOX).await.unwrap();

        let (folder, message) = transport.locate("bob@b.test", "WARMUP-2").unwrap();
        assert_eq!(folder, INBOX);
        assert_ne!(message.uid, handle.uid);
    }

    #[tokio::test]
    async fn replies_do_not_match_search() {
        let transport = MemoryTransport::new();
        let alice = account("alice@a.test");
        transport
            .send(&account("bob@b.test"), &outgoing("alice@a.test", "Re: WARMUP-3: hi"))
            .await
            .unwrap();
        assert!(transport.search(&alice, INBOX, "WARMUP-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_credentials_fail_every_operation() {
        let transport = MemoryTransport::new();
        let alice = account("alice@a.test");
        transport.reject_auth("Alice@A.test");

        assert!(transport.check_credentials(&alice).await.unwrap_err().is_auth());
        assert!(transport.list_folders(&alice).await.unwrap_err().is_auth());
        assert!(
            transport
                .send(&alice, &outgoing("bob@b.test", "x"))
                .await
                .unwrap_err()
                .is_auth()
        );
    }

    #[tokio::test]
    async fn injected_move_failures_are_consumed_in_order() {
        let transport = MemoryTransport::new();
        let bob = account("bob@b.test");
        transport.add_mailbox("bob@b.test", &["Spam"]);
        transport.place_next("bob@b.test", "Spam");
        transport
            .send(&account("alice@a.test"), &outgoing("bob@b.test", "WARMUP-4: hi"))
            .await
            .unwrap();
        transport.fail_moves("bob@b.test", 1, TransportError::ProtocolFailure("NO".into()));

        let handle = transport.search(&bob, "Spam", "WARMUP-4").await.unwrap().unwrap();
        assert!(transport.move_message(&bob, &handle, INBOX).await.is_err());
        assert!(transport.move_message(&bob, &handle, INBOX).await.is_ok());
    }
}
