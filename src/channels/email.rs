//! Email channel: IMAP source for inbound items, SMTP sink via lettre.
//!
//! IMAP is spoken directly over rustls on a blocking socket, so every session
//! runs inside `spawn_blocking`. Each fetch or mark opens its own short
//! session; connection setup is retried with backoff.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::ChannelError;
use crate::pipeline::capability::{DeliverCapability, FetchCapability};
use crate::pipeline::retry::{RetryPolicy, retry_with_backoff};
use crate::pipeline::types::Item;

const IMAP_READ_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// Email configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Where summaries are sent when email is the sink.
    pub summary_to: String,
    pub mailbox: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            imap_host: String::new(),
            imap_port: 993,
            smtp_host: String::new(),
            smtp_port: 587,
            username: String::new(),
            password: SecretString::from(String::new()),
            from_address: String::new(),
            summary_to: String::new(),
            mailbox: "INBOX".to_string(),
        }
    }
}

impl EmailConfig {
    /// Build config from `EMAIL_*` variables. Missing values leave the
    /// source/sink unconfigured rather than failing here.
    pub fn from_env() -> Self {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").unwrap_or_default();

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let summary_to = std::env::var("EMAIL_SUMMARY_TO").unwrap_or_else(|_| from_address.clone());
        let mailbox = std::env::var("EMAIL_MAILBOX").unwrap_or_else(|_| "INBOX".to_string());

        Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            summary_to,
            mailbox,
        }
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.expose_secret().is_empty()
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// IMAP inbox as a `FetchCapability`. Item ids are IMAP UIDs.
pub struct EmailSource {
    config: EmailConfig,
    query: Mutex<Option<String>>,
    /// UIDs already flagged `\Seen` by this process.
    marked: Mutex<HashSet<String>>,
    cancel: Mutex<CancellationToken>,
    connect_policy: RetryPolicy,
}

impl EmailSource {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            query: Mutex::new(None),
            marked: Mutex::new(HashSet::new()),
            cancel: Mutex::new(CancellationToken::new()),
            connect_policy: RetryPolicy::new(RetryConfig {
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
                ..RetryConfig::default()
            }),
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open an authenticated session on the configured mailbox.
    async fn open_session(&self, token: &CancellationToken) -> Result<ImapSession, ChannelError> {
        let session = retry_with_backoff("imap.connect", &self.connect_policy, token, || {
            let cfg = self.config.clone();
            async move {
                match tokio::task::spawn_blocking(move || ImapSession::connect(&cfg)).await {
                    Ok(connected) => connected,
                    Err(e) => Err(fetch_failed(format!("IMAP connect task failed: {e}"))),
                }
            }
        })
        .await?;

        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || -> Result<ImapSession, ChannelError> {
            let mut session = session;
            session.login(&cfg)?;
            session.select(&cfg.mailbox)?;
            Ok(session)
        })
        .await
        .map_err(|e| fetch_failed(format!("IMAP login task failed: {e}")))?
    }

    async fn fetch(&self, criteria: String, count: usize) -> Result<Vec<Item>, ChannelError> {
        if !self.is_configured() {
            return Err(ChannelError::NotConfigured {
                name: "email".into(),
            });
        }

        let token = self.current_token();
        tokio::select! {
            _ = token.cancelled() => Err(ChannelError::Cancelled { name: "email".into() }),
            r = self.search_and_fetch(&token, criteria, count) => r,
        }
    }

    async fn search_and_fetch(
        &self,
        token: &CancellationToken,
        criteria: String,
        count: usize,
    ) -> Result<Vec<Item>, ChannelError> {
        let session = self.open_session(token).await?;
        let abort = token.clone();
        tokio::task::spawn_blocking(move || fetch_items(session, &criteria, count, &abort))
            .await
            .map_err(|e| fetch_failed(format!("IMAP fetch task failed: {e}")))?
    }
}

#[async_trait]
impl FetchCapability for EmailSource {
    fn name(&self) -> &str {
        "email"
    }

    async fn fetch_unread(&self, count: usize) -> Result<Vec<Item>, ChannelError> {
        let query = self
            .query
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let criteria = match query {
            Some(q) => format!("UNSEEN {q}"),
            None => "UNSEEN".to_string(),
        };
        self.fetch(criteria, count).await
    }

    async fn fetch_by_query(&self, query: &str, count: usize) -> Result<Vec<Item>, ChannelError> {
        self.fetch(query.trim().to_string(), count).await
    }

    fn set_query(&self, query: Option<String>) {
        *self.query.lock().unwrap_or_else(PoisonError::into_inner) =
            query.filter(|q| !q.trim().is_empty());
    }

    async fn mark_processed(&self, id: &str) -> Result<(), ChannelError> {
        if self
            .marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
        {
            return Ok(());
        }

        let token = self.current_token();
        let session = self.open_session(&token).await?;
        let uid = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), ChannelError> {
            let mut session = session;
            let reply = session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
            session.logout();
            if reply.ok {
                Ok(())
            } else {
                Err(mark_failed(&uid, reply.status))
            }
        })
        .await
        .map_err(|e| mark_failed(id, e.to_string()))??;

        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        tracing::debug!(uid = id, "Marked email as seen");
        Ok(())
    }

    fn is_configured(&self) -> bool {
        !self.config.imap_host.is_empty() && self.config.has_credentials()
    }

    fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

// ── Sink ────────────────────────────────────────────────────────────

/// SMTP mailbox as a `DeliverCapability`.
pub struct EmailSink {
    config: EmailConfig,
    cancel: Mutex<CancellationToken>,
}

impl EmailSink {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

#[async_trait]
impl DeliverCapability for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(
        &self,
        content: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ChannelError> {
        if !self.is_configured() {
            return Err(ChannelError::NotConfigured {
                name: "email".into(),
            });
        }

        let subject = summary_subject(metadata);
        let body = content.to_string();
        let cfg = self.config.clone();
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let send = tokio::task::spawn_blocking(move || send_email(&cfg, &subject, body));
        tokio::select! {
            _ = token.cancelled() => Err(ChannelError::Cancelled { name: "email".into() }),
            r = send => r.map_err(|e| ChannelError::SendFailed {
                name: "email".into(),
                reason: format!("SMTP task failed: {e}"),
            })?,
        }
    }

    fn is_configured(&self) -> bool {
        !self.config.smtp_host.is_empty()
            && !self.config.summary_to.is_empty()
            && !self.config.from_address.is_empty()
            && self.config.has_credentials()
    }

    fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// Send an email via SMTP (blocking).
fn send_email(config: &EmailConfig, subject: &str, body: String) -> Result<(), ChannelError> {
    let send_failed = |reason: String| ChannelError::SendFailed {
        name: "email".into(),
        reason,
    };

    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    // 465 is implicit TLS; anything else upgrades with STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    };
    let transport = builder
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(config
            .summary_to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .body(body)
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    tracing::info!(to = %config.summary_to, "Summary email sent");
    Ok(())
}

/// `"Summary: <subject>"`, or a bare `"Summary"` when the item had none.
pub fn summary_subject(metadata: &BTreeMap<String, String>) -> String {
    match metadata.get("subject").map(|s| s.trim()) {
        Some(s) if !s.is_empty() => format!("Summary: {s}"),
        _ => "Summary".to_string(),
    }
}

// ── IMAP session ────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Tagged response to one IMAP command.
#[derive(Debug, Default)]
struct ImapReply {
    /// Untagged and continuation lines, CRLF stripped.
    lines: Vec<String>,
    /// Literal payloads in the order they appeared.
    literals: Vec<Vec<u8>>,
    ok: bool,
    /// The tagged status line.
    status: String,
}

/// Blocking IMAP connection over TLS.
struct ImapSession {
    stream: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    /// TCP + TLS handshake and greeting. No login.
    fn connect(config: &EmailConfig) -> Result<Self, ChannelError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| fetch_failed(format!("IMAP connect to {} failed: {e}", config.imap_host)))?;
        tcp.set_read_timeout(Some(IMAP_READ_TIMEOUT))
            .map_err(|e| fetch_failed(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| fetch_failed(format!("Invalid IMAP host: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| fetch_failed(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") {
            return Err(fetch_failed(format!("Unexpected IMAP greeting: {greeting}")));
        }
        Ok(session)
    }

    fn login(&mut self, config: &EmailConfig) -> Result<(), ChannelError> {
        let reply = self.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !reply.ok {
            return Err(ChannelError::AuthFailed {
                name: "email".into(),
                reason: reply.status,
            });
        }
        Ok(())
    }

    fn select(&mut self, mailbox: &str) -> Result<(), ChannelError> {
        let reply = self.command(&format!("SELECT {}", quote(mailbox)))?;
        if !reply.ok {
            return Err(fetch_failed(format!("SELECT {mailbox} failed: {}", reply.status)));
        }
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<ImapReply, ChannelError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| fetch_failed(format!("IMAP write failed: {e}")))?;

        let mut reply = ImapReply::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream
                    .read_exact(&mut literal)
                    .map_err(|e| fetch_failed(format!("IMAP literal read failed: {e}")))?;
                reply.literals.push(literal);
                reply.lines.push(line);
                continue;
            }
            if let Some(rest) = line.strip_prefix(&tag) {
                let rest = rest.trim_start();
                reply.ok = rest.starts_with("OK");
                reply.status = rest.to_string();
                return Ok(reply);
            }
            reply.lines.push(line);
        }
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(fetch_failed("IMAP connection closed".to_string())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        buf.truncate(buf.len() - 2);
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(fetch_failed(format!("IMAP read failed: {e}"))),
            }
        }
    }

    fn logout(mut self) {
        // best effort
        let _ = self.command("LOGOUT");
    }
}

/// Search, then fetch the newest `count` matches oldest-first. Checks `abort`
/// between messages.
fn fetch_items(
    mut session: ImapSession,
    criteria: &str,
    count: usize,
    abort: &CancellationToken,
) -> Result<Vec<Item>, ChannelError> {
    let search = session.command(&format!("UID SEARCH {criteria}"))?;
    if !search.ok {
        session.logout();
        return Err(fetch_failed(format!("SEARCH failed: {}", search.status)));
    }

    let mut uids = parse_search(&search.lines);
    uids.sort_unstable();
    let skip = uids.len().saturating_sub(count);
    let wanted = &uids[skip..];
    tracing::debug!(matched = uids.len(), fetching = wanted.len(), "IMAP search complete");

    let mut items = Vec::with_capacity(wanted.len());
    for uid in wanted {
        if abort.is_cancelled() {
            break;
        }
        let reply = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        let Some(raw) = reply.literals.first() else {
            tracing::warn!(uid, "FETCH returned no body");
            continue;
        };
        match parse_message(&uid.to_string(), raw) {
            Some(item) => items.push(item),
            None => tracing::warn!(uid, "Unparseable message skipped"),
        }
    }

    session.logout();
    Ok(items)
}

// ── Helpers (public for testing) ────────────────────────────────────

/// UIDs from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|n| n.parse().ok())
        .collect()
}

/// Byte length of a literal announced at the end of `line` (`... {123}`).
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let open = line.rfind('{')?;
    line[open + 1..].strip_suffix('}')?.parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Turn a raw RFC 822 message into an `Item` keyed by `uid`.
pub fn parse_message(uid: &str, raw: &[u8]) -> Option<Item> {
    let parsed = MessageParser::default().parse(raw)?;

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let mut item = Item::new(uid, subject, extract_text(&parsed))
        .with_meta("from", extract_sender(&parsed));

    if let Some(date) = parsed.date().and_then(message_date) {
        item = item.with_meta("date", date.to_rfc2822());
    }
    if let Some(message_id) = parsed.message_id() {
        item = item.with_meta("message_id", message_id);
    }
    Some(item)
}

/// Header date normalised to UTC, honouring its zone offset.
fn message_date(d: &mail_parser::DateTime) -> Option<chrono::DateTime<Utc>> {
    Utc.timestamp_opt(d.to_timestamp(), 0).single()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    String::new()
}

fn fetch_failed(reason: String) -> ChannelError {
    ChannelError::FetchFailed {
        name: "email".into(),
        reason,
    }
}

fn mark_failed(id: &str, reason: String) -> ChannelError {
    ChannelError::MarkFailed {
        name: "email".into(),
        id: id.to_string(),
        reason,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            imap_host: "imap.test.com".into(),
            smtp_host: "smtp.test.com".into(),
            username: "user@test.com".into(),
            password: SecretString::from("pass"),
            from_address: "user@test.com".into(),
            summary_to: "me@test.com".into(),
            ..EmailConfig::default()
        }
    }

    const RAW: &str = "From: Alice <alice@example.com>\r\n\
        To: user@test.com\r\n\
        Subject: Quarterly numbers\r\n\
        Date: Tue, 1 Oct 2024 09:30:00 +0000\r\n\
        Message-ID: <abc123@example.com>\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Revenue is up.\r\n";

    // ── Message parsing ─────────────────────────────────────────────

    #[test]
    fn parse_message_builds_item() {
        let item = parse_message("42", RAW.as_bytes()).unwrap();
        assert_eq!(item.id, "42");
        assert_eq!(item.subject, "Quarterly numbers");
        assert!(item.body.contains("Revenue is up."));
        assert_eq!(item.metadata["from"], "alice@example.com");
        assert_eq!(item.metadata["message_id"], "abc123@example.com");
        assert_eq!(item.metadata["date"], "Tue, 1 Oct 2024 09:30:00 +0000");
    }

    #[test]
    fn parse_message_date_applies_zone_offset() {
        let raw = RAW.replace("09:30:00 +0000", "09:30:00 -0700");
        let item = parse_message("42", raw.as_bytes()).unwrap();
        assert_eq!(item.metadata["date"], "Tue, 1 Oct 2024 16:30:00 +0000");

        let raw = RAW.replace("09:30:00 +0000", "09:30:00 +0530");
        let item = parse_message("42", raw.as_bytes()).unwrap();
        assert_eq!(item.metadata["date"], "Tue, 1 Oct 2024 04:00:00 +0000");
    }

    #[test]
    fn parse_message_html_only() {
        let raw = "From: b@example.com\r\nSubject: Hi\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>there</b></p>\r\n";
        let item = parse_message("1", raw.as_bytes()).unwrap();
        assert!(item.body.contains("Hello"));
        assert!(!item.body.contains("<p>"));
    }

    #[test]
    fn parse_message_without_subject() {
        let raw = "From: b@example.com\r\n\r\nbody\r\n";
        let item = parse_message("1", raw.as_bytes()).unwrap();
        assert_eq!(item.subject, "(no subject)");
    }

    // ── IMAP protocol helpers ───────────────────────────────────────

    #[test]
    fn search_lines_parse_to_uids() {
        let lines = vec![
            "* SEARCH 4 9 12".to_string(),
            "* OK still here".to_string(),
        ];
        assert_eq!(parse_search(&lines), vec![4, 9, 12]);
        assert!(parse_search(&["* SEARCH".to_string()]).is_empty());
    }

    #[test]
    fn literal_length_detected() {
        assert_eq!(literal_len("* 3 FETCH (UID 9 BODY[] {2048}"), Some(2048));
        assert_eq!(literal_len("* 3 FETCH (FLAGS (\\Seen))"), None);
        assert_eq!(literal_len("{abc}"), None);
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote("INBOX"), "\"INBOX\"");
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    // ── HTML stripping ──────────────────────────────────────────────

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_html_whitespace_normalized() {
        assert_eq!(strip_html("<p>  Hello   World  </p>"), "Hello World");
    }

    #[test]
    fn strip_html_plain_text_passthrough() {
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }

    // ── Capability wiring ───────────────────────────────────────────

    #[test]
    fn source_configuration() {
        assert!(EmailSource::new(config()).is_configured());
        assert!(!EmailSource::new(EmailConfig::default()).is_configured());
        let no_password = EmailConfig {
            password: SecretString::from(""),
            ..config()
        };
        assert!(!EmailSource::new(no_password).is_configured());
    }

    #[test]
    fn sink_configuration() {
        assert!(EmailSink::new(config()).is_configured());
        let no_recipient = EmailConfig {
            summary_to: String::new(),
            ..config()
        };
        assert!(!EmailSink::new(no_recipient).is_configured());
    }

    #[test]
    fn set_query_ignores_blank() {
        let source = EmailSource::new(config());
        source.set_query(Some("FROM \"news@x.com\"".into()));
        assert!(source.query.lock().unwrap().is_some());
        source.set_query(Some("   ".into()));
        assert!(source.query.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_unconfigured_fails_fast() {
        let err = EmailSource::new(EmailConfig::default())
            .fetch_unread(5)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn mark_processed_repeat_is_noop() {
        let source = EmailSource::new(config());
        source.marked.lock().unwrap().insert("7".into());
        // would need a network round-trip if it were not remembered
        source.mark_processed("7").await.unwrap();
    }

    #[test]
    fn summary_subject_prefix() {
        let mut meta = BTreeMap::new();
        assert_eq!(summary_subject(&meta), "Summary");
        meta.insert("subject".into(), "Launch plan".into());
        assert_eq!(summary_subject(&meta), "Summary: Launch plan");
    }
}
