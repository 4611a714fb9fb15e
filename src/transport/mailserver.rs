//! SMTP submission with lettre and IMAP inspection with the blocking `imap`
//! client, one short-lived session per call.

use super::{MailTransport, MessageHandle, OutgoingMessage, TransportResult};
use crate::error::TransportError;
use crate::model::{EmailAccount, ImapEndpoint, SmtpEndpoint, SmtpSecurity};
use crate::warmup::content::subject_matches_token;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mailparse::MailHeaderMap as _;
use std::time::Duration;

type ImapSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

/// Talks to real mail servers using each account's own credentials.
#[derive(Debug, Clone)]
pub struct MailServerTransport {
    timeout: Duration,
}

impl MailServerTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a blocking IMAP operation on the blocking pool, bounded by the
    /// transport timeout.
    async fn with_imap<T, F>(&self, endpoint: &ImapEndpoint, operation: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> TransportResult<T> + Send + 'static,
    {
        let endpoint = endpoint.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut session = open_imap_session(&endpoint)?;
            let result = operation(&mut session);
            if let Err(error) = session.logout() {
                tracing::debug!(%error, host = %endpoint.host, "IMAP logout failed");
            }
            result
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(TransportError::ProtocolFailure(format!(
                "IMAP task failed: {join_error}"
            ))),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl MailTransport for MailServerTransport {
    async fn send(&self, account: &EmailAccount, message: &OutgoingMessage) -> TransportResult<String> {
        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), account.domain());
        let email = build_message(account, message, &message_id)?;
        let transport = build_smtp_transport(&account.smtp, self.timeout)?;

        match tokio::time::timeout(self.timeout, transport.send(email)).await {
            Ok(Ok(_response)) => Ok(message_id),
            Ok(Err(error)) => Err(classify_smtp_error(&error, self.timeout)),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn list_folders(&self, account: &EmailAccount) -> TransportResult<Vec<String>> {
        self.with_imap(&account.imap, |session| {
            let names = session.list(None, Some("*")).map_err(classify_imap_error)?;
            Ok(names.iter().map(|name| name.name().to_string()).collect())
        })
        .await
    }

    async fn search(
        &self,
        account: &EmailAccount,
        folder: &str,
        token: &str,
    ) -> TransportResult<Option<MessageHandle>> {
        let folder = folder.to_string();
        let token = token.to_string();
        self.with_imap(&account.imap, move |session| {
            session.select(&folder).map_err(classify_imap_error)?;

            let criterion = format!("SUBJECT {}", quote_imap_value(&token));
            let mut uids: Vec<u32> = session
                .uid_search(&criterion)
                .map_err(classify_imap_error)?
                .into_iter()
                .collect();
            uids.sort_unstable_by(|left, right| right.cmp(left));

            for uid in uids {
                let fetches = session
                    .uid_fetch(uid.to_string(), "(UID BODY.PEEK[HEADER])")
                    .map_err(classify_imap_error)?;
                let matched = fetches.iter().any(|fetch| {
                    fetch
                        .header()
                        .and_then(|raw| mailparse::parse_headers(raw).ok())
                        .and_then(|(headers, _)| headers.get_first_value("Subject"))
                        .is_some_and(|subject| subject_matches_token(&subject, &token))
                });
                if matched {
                    return Ok(Some(MessageHandle {
                        folder: folder.clone(),
                        uid,
                    }));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn move_message(
        &self,
        account: &EmailAccount,
        handle: &MessageHandle,
        to_folder: &str,
    ) -> TransportResult<()> {
        let handle = handle.clone();
        let to_folder = to_folder.to_string();
        self.with_imap(&account.imap, move |session| {
            let supports_move = session
                .capabilities()
                .map(|capabilities| capabilities.has_str("MOVE"))
                .unwrap_or(false);

            session.select(&handle.folder).map_err(classify_imap_error)?;
            let uid = handle.uid.to_string();

            if supports_move {
                session.uid_mv(&uid, &to_folder).map_err(classify_imap_error)?;
            } else {
                session.uid_copy(&uid, &to_folder).map_err(classify_imap_error)?;
                session
                    .uid_store(&uid, "+FLAGS (\\Deleted)")
                    .map_err(classify_imap_error)?;
                session.expunge().map_err(classify_imap_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn mark_read(&self, account: &EmailAccount, handle: &MessageHandle) -> TransportResult<()> {
        let handle = handle.clone();
        self.with_imap(&account.imap, move |session| {
            session.select(&handle.folder).map_err(classify_imap_error)?;
            session
                .uid_store(handle.uid.to_string(), "+FLAGS (\\Seen)")
                .map_err(classify_imap_error)?;
            Ok(())
        })
        .await
    }

    async fn check_credentials(&self, account: &EmailAccount) -> TransportResult<()> {
        self.with_imap(&account.imap, |session| {
            session.select("INBOX").map_err(classify_imap_error)?;
            Ok(())
        })
        .await?;

        let transport = build_smtp_transport(&account.smtp, self.timeout)?;
        match tokio::time::timeout(self.timeout, transport.test_connection()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TransportError::ConnectFailure(
                "SMTP server rejected test connection".to_string(),
            )),
            Ok(Err(error)) => Err(classify_smtp_error(&error, self.timeout)),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

fn build_smtp_transport(
    endpoint: &SmtpEndpoint,
    timeout: Duration,
) -> TransportResult<AsyncSmtpTransport<Tokio1Executor>> {
    let builder = match endpoint.security {
        SmtpSecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&endpoint.host),
        SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&endpoint.host),
    }
    .map_err(|error| {
        TransportError::ConnectFailure(format!("invalid SMTP host '{}': {error}", endpoint.host))
    })?;

    Ok(builder
        .port(endpoint.port)
        .timeout(Some(timeout))
        .credentials(Credentials::new(
            endpoint.username.clone(),
            endpoint.password.clone(),
        ))
        .build())
}

fn build_message(
    account: &EmailAccount,
    message: &OutgoingMessage,
    message_id: &str,
) -> TransportResult<Message> {
    let from = mailbox(account.display_name.clone(), &account.email_address)?;
    let to = mailbox(None, &message.to)?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone())
        .message_id(Some(message_id.to_string()));

    if let Some(in_reply_to) = &message.in_reply_to {
        builder = builder
            .in_reply_to(in_reply_to.clone())
            .references(in_reply_to.clone());
    }

    builder
        .multipart(MultiPart::alternative_plain_html(
            message.text_body.clone(),
            message.html_body.clone(),
        ))
        .map_err(|error| TransportError::ProtocolFailure(format!("failed to build email: {error}")))
}

fn mailbox(name: Option<String>, address: &str) -> TransportResult<Mailbox> {
    let address: Address = address.parse().map_err(|error| {
        TransportError::ProtocolFailure(format!("invalid email address '{address}': {error}"))
    })?;
    Ok(Mailbox::new(name, address))
}

fn open_imap_session(endpoint: &ImapEndpoint) -> TransportResult<ImapSession> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|error| TransportError::ConnectFailure(format!("TLS connector: {error}")))?;

    let address = (endpoint.host.as_str(), endpoint.port);
    let client = if endpoint.use_tls {
        imap::connect(address, endpoint.host.as_str(), &tls)
    } else {
        imap::connect_starttls(address, endpoint.host.as_str(), &tls)
    }
    .map_err(|error| {
        TransportError::ConnectFailure(format!(
            "failed to connect to IMAP server '{}:{}': {error}",
            endpoint.host, endpoint.port
        ))
    })?;

    client
        .login(endpoint.username.as_str(), endpoint.password.as_str())
        .map_err(|(error, _client)| match error {
            imap::error::Error::Io(io) => TransportError::ConnectFailure(io.to_string()),
            other => TransportError::AuthFailure(other.to_string()),
        })
}

fn classify_imap_error(error: imap::error::Error) -> TransportError {
    use imap::error::Error as ImapError;
    match error {
        ImapError::Io(_) | ImapError::Tls(_) | ImapError::TlsHandshake(_) | ImapError::ConnectionLost => {
            TransportError::ConnectFailure(error.to_string())
        }
        other => TransportError::ProtocolFailure(other.to_string()),
    }
}

/// SMTP reply codes that mean the credentials were refused.
const SMTP_AUTH_CODES: &[&str] = &["530", "534", "535"];

fn classify_smtp_error(error: &lettre::transport::smtp::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout(timeout);
    }
    if let Some(code) = error.status() {
        let code = code.to_string();
        if SMTP_AUTH_CODES.contains(&code.as_str()) {
            return TransportError::AuthFailure(error.to_string());
        }
        return TransportError::ProtocolFailure(error.to_string());
    }
    let rendered = error.to_string();
    if rendered.to_ascii_lowercase().contains("authentication") {
        TransportError::AuthFailure(rendered)
    } else {
        TransportError::ConnectFailure(rendered)
    }
}

fn quote_imap_value(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .filter(|character| !character.is_control())
        .collect();
    format!("\"{}\"", sanitized.replace('\\', "\\\\").replace('"', "\\\""))
}
