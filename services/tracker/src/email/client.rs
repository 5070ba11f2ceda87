//! Mail client abstraction and the IMAP implementation.
//!
//! The pipeline only needs "messages since a date, newest data first
//! parsed into plain text"; everything IMAP-specific stays behind the
//! trait so tests run against an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use parceltrack_core::carrier::Carrier;
use parceltrack_core::config::EmailConfig;

use crate::error::{Error, Result};

type ImapSession = async_imap::Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// One mail message reduced to what the pipeline consumes
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailClient: Send + Sync {
    /// Connectivity probe used by the pre-start health check
    async fn health_check(&self) -> Result<()>;

    /// Messages received since `since`, in no particular order. `query`
    /// overrides the default carrier-sender filter and is passed opaquely
    /// to the mail backend.
    async fn search_since(
        &self,
        since: DateTime<Utc>,
        query: Option<&str>,
    ) -> Result<Vec<EmailMessage>>;
}

/// IMAP-over-TLS mail client
pub struct ImapMailClient {
    config: EmailConfig,
    tls: TlsConnector,
}

impl ImapMailClient {
    pub fn new(config: EmailConfig) -> Result<Self> {
        if config.imap_host.is_empty() || config.username.is_empty() {
            return Err(Error::Mail(
                "EMAIL_IMAP_HOST and EMAIL_USERNAME are required".to_string(),
            ));
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    async fn connect(&self) -> Result<ImapSession> {
        let address = (self.config.imap_host.as_str(), self.config.imap_port);
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| Error::Mail(format!("IMAP connect: {e}")))?;

        let server_name = rustls::pki_types::ServerName::try_from(self.config.imap_host.clone())
            .map_err(|e| Error::Mail(format!("IMAP server name: {e}")))?;
        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Mail(format!("IMAP TLS handshake: {e}")))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let session = client
            .login(&self.config.username, &self.config.password)
            .await
            .map_err(|(e, _)| Error::Mail(format!("IMAP login: {e}")))?;

        Ok(session)
    }

    /// Default search: carrier sender domains OR-ed together, bounded by
    /// SINCE. IMAP's OR is binary, so the domains fold right-to-left.
    fn default_query(since: DateTime<Utc>) -> String {
        let since_date = since.format("%d-%b-%Y");
        let domains: Vec<&str> = Carrier::ALL
            .iter()
            .flat_map(|carrier| carrier.sender_domains().iter().copied())
            .collect();

        let mut folded = format!("FROM \"{}\"", domains[domains.len() - 1]);
        for domain in domains[..domains.len() - 1].iter().rev() {
            folded = format!("OR FROM \"{domain}\" ({folded})");
        }
        format!("SINCE {since_date} {folded}")
    }

    fn parse_message(raw: &[u8], received_at: DateTime<Utc>) -> Option<EmailMessage> {
        let parsed = mail_parser::MessageParser::default().parse(raw)?;

        let message_id = parsed.message_id().map(str::to_string)?;
        let sender = parsed
            .from()
            .and_then(|from| from.first())
            .and_then(|address| address.address())
            .unwrap_or_default()
            .to_string();
        let subject = parsed.subject().unwrap_or_default().to_string();
        let thread_id = parsed.thread_name().map(str::to_string);

        let mut body = parsed.body_text(0).unwrap_or_default().to_string();
        if body.is_empty() {
            // HTML-only notification mails still carry numbers in markup
            body = parsed.body_html(0).unwrap_or_default().to_string();
        }

        Some(EmailMessage {
            message_id,
            thread_id,
            sender,
            subject,
            body,
            received_at,
        })
    }
}

#[async_trait]
impl MailClient for ImapMailClient {
    async fn health_check(&self) -> Result<()> {
        let mut session = self.connect().await?;
        session
            .select(&self.config.mailbox)
            .await
            .map_err(|e| Error::Mail(format!("IMAP select {}: {e}", self.config.mailbox)))?;
        let _ = session.logout().await;
        Ok(())
    }

    async fn search_since(
        &self,
        since: DateTime<Utc>,
        query: Option<&str>,
    ) -> Result<Vec<EmailMessage>> {
        let mut session = self.connect().await?;
        session
            .select(&self.config.mailbox)
            .await
            .map_err(|e| Error::Mail(format!("IMAP select {}: {e}", self.config.mailbox)))?;

        let search = match query {
            Some(custom) => format!("SINCE {} {custom}", since.format("%d-%b-%Y")),
            None => Self::default_query(since),
        };
        debug!(%search, "IMAP search");

        let uids = session
            .uid_search(&search)
            .await
            .map_err(|e| Error::Mail(format!("IMAP search: {e}")))?;
        if uids.is_empty() {
            let _ = session.logout().await;
            return Ok(Vec::new());
        }

        let uid_set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches: Vec<_> = {
            let stream = session
                .uid_fetch(&uid_set, "(UID INTERNALDATE RFC822)")
                .await
                .map_err(|e| Error::Mail(format!("IMAP fetch: {e}")))?;
            stream
                .try_collect()
                .await
                .map_err(|e| Error::Mail(format!("IMAP fetch stream: {e}")))?
        };

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(raw) = fetch.body() else {
                continue;
            };
            let received_at = fetch
                .internal_date()
                .map(|instant| instant.with_timezone(&Utc))
                .unwrap_or(since);
            match Self::parse_message(raw, received_at) {
                Some(message) => messages.push(message),
                None => warn!(uid = fetch.uid, "Skipping unparseable message"),
            }
        }

        let _ = session.logout().await;
        Ok(messages)
    }
}
