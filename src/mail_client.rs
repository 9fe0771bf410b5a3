//! Mail provider API client with rate-limit retry, connection pooling and a
//! process-wide TTL cache.
//!
//! The upstream speaks paged JSON-LD (`member`, `view.next`, `totalItems`)
//! and is loose about field shapes: `from` may be a string or a structured
//! object, `html`/`text` may be a string or a list of strings. Everything is
//! normalised at this edge so internal types stay concrete.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::models::MessageHeader;

const MAX_RETRIES: u32 = 3;
/// Sleep schedule for HTTP 429, indexed by attempt.
const RETRY_BACKOFF_SECS: [u64; 3] = [2, 5, 15];
const PAGE_SIZE: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_KEEPALIVE_CONNECTIONS: usize = 10;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONCURRENT: usize = 20;

/// A provider account with its well-known mailboxes resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAccount {
    pub id: String,
    pub email: String,
    pub inbox_id: Option<String>,
    pub trash_id: Option<String>,
    pub junk_id: Option<String>,
    pub sent_id: Option<String>,
}

impl ProviderAccount {
    /// Mailboxes the scanner reads, in scan order.
    pub fn scan_mailbox_ids(&self) -> Vec<String> {
        [&self.inbox_id, &self.trash_id, &self.junk_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMailbox {
    pub id: String,
    pub name: String,
}

/// A fully fetched message, body included.
#[derive(Debug, Clone)]
pub struct ProviderMessage {
    pub header: MessageHeader,
    pub html: Option<String>,
    pub text: Option<String>,
}

impl ProviderMessage {
    /// Prefer HTML, fall back to plain text.
    pub fn body(&self) -> String {
        self.html
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.text.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<MessageHeader>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
}

/// Operations the rest of the engine needs from the mail provider.
#[async_trait]
pub trait MailApi: Send + Sync {
    /// All provider accounts, mailbox ids resolved (paged upstream).
    async fn list_accounts(&self) -> Result<Vec<ProviderAccount>>;

    /// Create a new account, invalidating the account-list cache.
    async fn create_account(&self, email: &str, password: Option<&str>)
        -> Result<ProviderAccount>;

    /// Update an account password, invalidating the account-list cache.
    async fn update_password(&self, account_id: &str, password: &str) -> Result<()>;

    async fn find_account_by_email(&self, email: &str) -> Result<Option<ProviderAccount>>;

    async fn list_mailboxes(&self, account_id: &str) -> Result<Vec<ProviderMailbox>>;

    async fn list_messages(
        &self,
        account_id: &str,
        mailbox_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<MessagePage>;

    /// Fetch a single message with its full body by provider path.
    async fn get_message(&self, path: &str) -> Result<Option<ProviderMessage>>;

    async fn get_attachment(
        &self,
        account_id: &str,
        mailbox_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Attachment>;

    /// Fetch every message header across the given mailboxes.
    async fn list_all_headers(
        &self,
        account_id: &str,
        mailbox_ids: &[String],
    ) -> Result<Vec<MessageHeader>>;
}

// --- Wire types ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    member: Vec<T>,
    #[serde(default)]
    view: Option<View>,
    #[serde(rename = "totalItems", default)]
    total_items: u64,
}

#[derive(Debug, Deserialize, Default)]
struct View {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMailbox {
    #[serde(default)]
    id: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(default)]
    id: String,
    #[serde(default)]
    address: String,
    #[serde(default = "Vec::new")]
    mailboxes: Vec<RawMailbox>,
}

impl RawAccount {
    fn normalize(self) -> ProviderAccount {
        let mut account = ProviderAccount {
            id: strip_id_path(&self.id),
            email: self.address,
            inbox_id: None,
            trash_id: None,
            junk_id: None,
            sent_id: None,
        };
        for mailbox in self.mailboxes {
            match mailbox.path.to_lowercase().as_str() {
                "inbox" => account.inbox_id = Some(mailbox.id),
                "trash" => account.trash_id = Some(mailbox.id),
                "junk" => account.junk_id = Some(mailbox.id),
                "sent" => account.sent_id = Some(mailbox.id),
                _ => {}
            }
        }
        account
    }
}

/// `from` arrives either as a plain string or `{address, name}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFrom {
    Text(String),
    Structured {
        #[serde(default)]
        address: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl RawFrom {
    /// Normalise to (`Name <addr>` display form, bare address).
    fn normalize(self) -> (String, String) {
        match self {
            RawFrom::Text(text) => {
                let sender = extract_bare_address(&text);
                (text, sender)
            }
            RawFrom::Structured { address, name } => match name.filter(|n| !n.is_empty()) {
                Some(name) => (format!("{name} <{address}>"), address),
                None => (address.clone(), address),
            },
        }
    }
}

/// `html`/`text` arrive either as a string or a list of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBody {
    Text(String),
    Lines(Vec<String>),
}

impl RawBody {
    fn normalize(self) -> String {
        match self {
            RawBody::Text(text) => text,
            RawBody::Lines(lines) => lines.join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "@id", default)]
    at_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<RawFrom>,
    #[serde(default)]
    date: Option<String>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
    #[serde(default)]
    html: Option<RawBody>,
    #[serde(default)]
    text: Option<RawBody>,
}

impl RawMessage {
    fn normalize(self) -> ProviderMessage {
        let (from, sender) = self
            .from
            .map(RawFrom::normalize)
            .unwrap_or_else(|| (String::new(), String::new()));

        let date = self
            .date
            .as_deref()
            .or(self.created_at.as_deref())
            .and_then(parse_provider_date);

        ProviderMessage {
            header: MessageHeader {
                id: self.at_id.or(self.id).unwrap_or_default(),
                subject: self.subject.unwrap_or_default(),
                from,
                sender,
                date,
            },
            html: self.html.map(RawBody::normalize),
            text: self.text.map(RawBody::normalize),
        }
    }
}

fn extract_bare_address(from: &str) -> String {
    let mut s = from;
    if let Some(idx) = s.rfind('<') {
        s = s[idx + 1..].trim_end_matches('>');
    }
    s.trim().to_string()
}

/// Clean JSON-LD `@id` paths: `/accounts/abc123` -> `abc123`.
fn strip_id_path(id: &str) -> String {
    match id.rsplit('/').next() {
        Some(tail) if !tail.is_empty() => tail.to_string(),
        _ => id.to_string(),
    }
}

/// Parse the handful of date shapes the provider emits.
pub fn parse_provider_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

// --- TTL cache -----------------------------------------------------------

#[derive(Debug, Clone)]
enum CacheEntry {
    Accounts(Vec<ProviderAccount>),
    Mailboxes(Vec<ProviderMailbox>),
    Account(ProviderAccount),
}

/// Process-wide TTL cache over the provider's read endpoints. Writes are
/// serialised by the mutex; the lock is never held across an await.
#[derive(Debug)]
struct TtlCache {
    ttl: Duration,
    store: Mutex<HashMap<String, (Instant, CacheEntry)>>,
}

impl TtlCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            store: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((inserted, entry)) = store.get(key) {
            if inserted.elapsed() < self.ttl {
                return Some(entry.clone());
            }
            store.remove(key);
        }
        None
    }

    fn set(&self, key: String, entry: CacheEntry) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.insert(key, (Instant::now(), entry));
    }

    fn invalidate(&self, key: &str) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.remove(key);
    }
}

// --- HTTP client ---------------------------------------------------------

/// Production client against the external mail API.
pub struct HttpMailClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    permits: Arc<Semaphore>,
    cache: TtlCache,
    retry_backoff: [u64; 3],
}

impl HttpMailClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::with_settings(base_url, api_key, DEFAULT_CACHE_TTL, DEFAULT_MAX_CONCURRENT)
    }

    pub fn with_settings(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        cache_ttl: Duration,
        max_concurrent: usize,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_KEEPALIVE_CONNECTIONS)
            .build()
            .map_err(|e| MonitorError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cache: TtlCache::new(cache_ttl),
            retry_backoff: RETRY_BACKOFF_SECS,
        })
    }

    /// Override the 429 sleep schedule. Intended for tests.
    pub fn with_retry_schedule(mut self, backoff: [u64; 3]) -> Self {
        self.retry_backoff = backoff;
        self
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..MAX_RETRIES {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| MonitorError::MailApi(format!("semaphore closed: {e}")))?;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("X-API-Key", &self.api_key)
                .header("Accept", "application/ld+json");
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            if let Some(content_type) = content_type {
                request = request.header("Content-Type", content_type);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = self.retry_backoff[attempt.min(2) as usize];
                warn!(
                    "mail API rate limited on {} (attempt {}/{}), sleeping {}s",
                    path,
                    attempt + 1,
                    MAX_RETRIES,
                    wait
                );
                drop(_permit);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(MonitorError::MailStatus {
                    status: status.as_u16(),
                    message,
                });
            }

            return Ok(response);
        }

        Err(MonitorError::RateLimited {
            attempts: MAX_RETRIES,
            path: path.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.send(reqwest::Method::GET, path, query, None, None).await?;
        Ok(response.json::<T>().await?)
    }

    async fn fetch_accounts_uncached(&self) -> Result<Vec<ProviderAccount>> {
        let mut accounts = Vec::new();
        let mut page: u32 = 1;
        loop {
            let collection: Collection<RawAccount> = self
                .get_json(
                    "/accounts",
                    &[("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())],
                )
                .await?;

            let page_len = collection.member.len();
            accounts.extend(collection.member.into_iter().map(RawAccount::normalize));

            let has_next = collection
                .view
                .as_ref()
                .and_then(|view| view.next.as_ref())
                .is_some();
            if !has_next || page_len == 0 {
                break;
            }
            page += 1;
        }
        debug!("fetched {} provider accounts", accounts.len());
        Ok(accounts)
    }
}

#[async_trait]
impl MailApi for HttpMailClient {
    async fn list_accounts(&self) -> Result<Vec<ProviderAccount>> {
        if let Some(CacheEntry::Accounts(accounts)) = self.cache.get("all_accounts") {
            return Ok(accounts);
        }
        let accounts = self.fetch_accounts_uncached().await?;
        self.cache
            .set("all_accounts".to_string(), CacheEntry::Accounts(accounts.clone()));
        Ok(accounts)
    }

    async fn create_account(
        &self,
        email: &str,
        password: Option<&str>,
    ) -> Result<ProviderAccount> {
        let mut payload = serde_json::json!({ "address": email });
        if let Some(password) = password {
            payload["password"] = serde_json::Value::String(password.to_string());
        }

        let response = self
            .send(reqwest::Method::POST, "/accounts", &[], Some(payload), None)
            .await?;
        let raw: RawAccount = response.json().await?;

        self.cache.invalidate("all_accounts");
        Ok(raw.normalize())
    }

    async fn update_password(&self, account_id: &str, password: &str) -> Result<()> {
        let path = format!("/accounts/{account_id}");
        self.send(
            reqwest::Method::PATCH,
            &path,
            &[],
            Some(serde_json::json!({ "password": password })),
            Some("application/merge-patch+json"),
        )
        .await?;
        self.cache.invalidate("all_accounts");
        Ok(())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<ProviderAccount>> {
        let cache_key = format!("account:{email}");
        if let Some(CacheEntry::Account(account)) = self.cache.get(&cache_key) {
            return Ok(Some(account));
        }

        let accounts = self.list_accounts().await?;
        let found = accounts.into_iter().find(|account| account.email == email);
        if let Some(account) = &found {
            self.cache.set(cache_key, CacheEntry::Account(account.clone()));
        }
        Ok(found)
    }

    async fn list_mailboxes(&self, account_id: &str) -> Result<Vec<ProviderMailbox>> {
        let cache_key = format!("mailboxes:{account_id}");
        if let Some(CacheEntry::Mailboxes(mailboxes)) = self.cache.get(&cache_key) {
            return Ok(mailboxes);
        }

        let path = format!("/accounts/{account_id}/mailboxes");
        let collection: Collection<RawMailbox> = self.get_json(&path, &[]).await?;
        let mailboxes: Vec<ProviderMailbox> = collection
            .member
            .into_iter()
            .map(|raw| ProviderMailbox {
                id: raw.id,
                name: raw.path,
            })
            .collect();

        self.cache
            .set(cache_key, CacheEntry::Mailboxes(mailboxes.clone()));
        Ok(mailboxes)
    }

    async fn list_messages(
        &self,
        account_id: &str,
        mailbox_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<MessagePage> {
        let path = format!("/accounts/{account_id}/mailboxes/{mailbox_id}/messages");
        let collection: Collection<RawMessage> = self
            .get_json(
                &path,
                &[("page", page.to_string()), ("per_page", per_page.to_string())],
            )
            .await?;

        Ok(MessagePage {
            total: collection.total_items,
            messages: collection
                .member
                .into_iter()
                .map(|raw| raw.normalize().header)
                .collect(),
        })
    }

    async fn get_message(&self, path: &str) -> Result<Option<ProviderMessage>> {
        if !path.starts_with('/') {
            return Ok(None);
        }
        let response = self.send(reqwest::Method::GET, path, &[], None, None).await;
        match response {
            Ok(response) => {
                if response.status() == StatusCode::NO_CONTENT {
                    return Ok(None);
                }
                let raw: RawMessage = response.json().await?;
                Ok(Some(raw.normalize()))
            }
            Err(MonitorError::MailStatus { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_attachment(
        &self,
        account_id: &str,
        mailbox_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Attachment> {
        let path = format!(
            "/accounts/{account_id}/mailboxes/{mailbox_id}/messages/{message_id}/attachment/{attachment_id}"
        );
        let response = self.send(reqwest::Method::GET, &path, &[], None, None).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_disposition_filename)
            .unwrap_or_else(|| "attachment".to_string());

        let bytes = response.bytes().await?.to_vec();
        Ok(Attachment {
            bytes,
            content_type,
            filename,
        })
    }

    async fn list_all_headers(
        &self,
        account_id: &str,
        mailbox_ids: &[String],
    ) -> Result<Vec<MessageHeader>> {
        let mut headers = Vec::new();
        for mailbox_id in mailbox_ids {
            let mut page: u32 = 1;
            loop {
                let batch = self
                    .list_messages(account_id, mailbox_id, page, PAGE_SIZE)
                    .await?;
                let count = batch.messages.len();
                headers.extend(batch.messages);
                if count < PAGE_SIZE as usize {
                    break;
                }
                page += 1;
            }
        }
        Ok(headers)
    }
}

fn parse_disposition_filename(disposition: &str) -> Option<String> {
    let idx = disposition.find("filename=")?;
    let raw = disposition[idx + "filename=".len()..].trim();
    let trimmed = raw.trim_matches(|c| c == '"' || c == ' ' || c == ';');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpMailClient {
        HttpMailClient::new(server.uri(), "test-key")
            .unwrap()
            .with_retry_schedule([0, 0, 0])
    }

    #[test]
    fn test_parse_provider_date_formats() {
        assert!(parse_provider_date("2024-01-15T10:30:00Z").is_some());
        assert!(parse_provider_date("2024-01-15T10:30:00+02:00").is_some());
        assert!(parse_provider_date("2024-01-15T10:30:00").is_some());
        assert!(parse_provider_date("2024-01-15 10:30:00").is_some());
        assert!(parse_provider_date("2024-01-15").is_some());
        assert!(parse_provider_date("not a date").is_none());
        assert!(parse_provider_date("").is_none());
    }

    #[test]
    fn test_strip_id_path() {
        assert_eq!(strip_id_path("/accounts/abc123"), "abc123");
        assert_eq!(strip_id_path("abc123"), "abc123");
        assert_eq!(strip_id_path(""), "");
    }

    #[test]
    fn test_raw_from_normalization() {
        let (display, sender) = RawFrom::Text("DoorDash <no-reply@doordash.com>".to_string())
            .normalize();
        assert_eq!(display, "DoorDash <no-reply@doordash.com>");
        assert_eq!(sender, "no-reply@doordash.com");

        let (display, sender) = RawFrom::Structured {
            address: "checkr@checkr.com".to_string(),
            name: Some("Checkr".to_string()),
        }
        .normalize();
        assert_eq!(display, "Checkr <checkr@checkr.com>");
        assert_eq!(sender, "checkr@checkr.com");

        let (display, sender) = RawFrom::Structured {
            address: "bare@example.com".to_string(),
            name: None,
        }
        .normalize();
        assert_eq!(display, "bare@example.com");
        assert_eq!(sender, "bare@example.com");
    }

    #[test]
    fn test_raw_body_joins_lines() {
        let joined = RawBody::Lines(vec!["line one".to_string(), "line two".to_string()])
            .normalize();
        assert_eq!(joined, "line one\nline two");

        assert_eq!(RawBody::Text("single".to_string()).normalize(), "single");
    }

    #[test]
    fn test_raw_message_variant_payloads() {
        // Structured `from`, list bodies
        let raw: RawMessage = serde_json::from_value(json!({
            "@id": "/accounts/a/mailboxes/b/messages/c",
            "subject": "Hello",
            "from": {"address": "x@y.com", "name": "X"},
            "date": "2024-01-15T10:30:00Z",
            "html": ["<p>a</p>", "<p>b</p>"]
        }))
        .unwrap();
        let msg = raw.normalize();
        assert_eq!(msg.header.id, "/accounts/a/mailboxes/b/messages/c");
        assert_eq!(msg.header.from, "X <x@y.com>");
        assert_eq!(msg.header.sender, "x@y.com");
        assert!(msg.header.date.is_some());
        assert_eq!(msg.body(), "<p>a</p>\n<p>b</p>");

        // String `from`, string body, unparseable date
        let raw: RawMessage = serde_json::from_value(json!({
            "id": "plain-id",
            "subject": "Hi",
            "from": "plain@example.com",
            "date": "whenever",
            "text": "hello"
        }))
        .unwrap();
        let msg = raw.normalize();
        assert_eq!(msg.header.id, "plain-id");
        assert_eq!(msg.header.sender, "plain@example.com");
        assert!(msg.header.date.is_none());
        assert_eq!(msg.body(), "hello");
    }

    #[test]
    fn test_scan_mailbox_ids_subset() {
        let account = ProviderAccount {
            id: "a".to_string(),
            email: "a@b.c".to_string(),
            inbox_id: Some("in".to_string()),
            trash_id: None,
            junk_id: Some("junk".to_string()),
            sent_id: Some("sent".to_string()),
        };
        // Sent is never scanned
        assert_eq!(account.scan_mailbox_ids(), vec!["in", "junk"]);
    }

    #[test]
    fn test_parse_disposition_filename() {
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename=raw.txt"),
            Some("raw.txt".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[tokio::test]
    async fn test_list_accounts_pages_and_normalizes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [{
                    "id": "/accounts/acc-1",
                    "address": "driver1@fleet.test",
                    "mailboxes": [
                        {"id": "mb-in", "path": "INBOX"},
                        {"id": "mb-trash", "path": "Trash"}
                    ]
                }],
                "view": {"next": "/accounts?page=2"},
                "totalItems": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [{
                    "id": "acc-2",
                    "address": "driver2@fleet.test",
                    "mailboxes": []
                }],
                "totalItems": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let accounts = client.list_accounts().await.unwrap();

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, "acc-1");
        assert_eq!(accounts[0].inbox_id.as_deref(), Some("mb-in"));
        assert_eq!(accounts[0].trash_id.as_deref(), Some("mb-trash"));
        assert!(accounts[0].junk_id.is_none());
        assert_eq!(accounts[1].email, "driver2@fleet.test");
    }

    #[tokio::test]
    async fn test_list_accounts_uses_ttl_cache() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [],
                "totalItems": 0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.list_accounts().await.unwrap();
        // Second call must come from cache; mock expects exactly one hit
        client.list_accounts().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_account_invalidates_cache() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [],
                "totalItems": 0
            })))
            .expect(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "/accounts/new-1",
                "address": "new@fleet.test",
                "mailboxes": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.list_accounts().await.unwrap();
        let created = client.create_account("new@fleet.test", None).await.unwrap();
        assert_eq!(created.id, "new-1");
        // Cache was invalidated, so this hits the server again
        client.list_accounts().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_mailboxes_cached_per_account() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts/acc-1/mailboxes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [
                    {"id": "mb-1", "path": "INBOX"},
                    {"id": "mb-2", "path": "Junk"}
                ],
                "totalItems": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mailboxes = client.list_mailboxes("acc-1").await.unwrap();
        assert_eq!(mailboxes.len(), 2);
        assert_eq!(mailboxes[0].name, "INBOX");

        // Served from cache on the second call
        let again = client.list_mailboxes("acc-1").await.unwrap();
        assert_eq!(again, mailboxes);
    }

    #[tokio::test]
    async fn test_find_account_by_email() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [
                    {"id": "acc-1", "address": "driver1@fleet.test", "mailboxes": []},
                    {"id": "acc-2", "address": "driver2@fleet.test", "mailboxes": []}
                ],
                "totalItems": 2
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let found = client
            .find_account_by_email("driver2@fleet.test")
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, "acc-2");

        let missing = client.find_account_by_email("nobody@fleet.test").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_retry_on_429_then_success() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [],
                "totalItems": 0
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let accounts = client.list_accounts().await.unwrap();
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let error = client.list_accounts().await.unwrap_err();
        assert!(matches!(error, MonitorError::RateLimited { attempts: 3, .. }));
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_surfaces_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let error = client.list_accounts().await.unwrap_err();
        match error {
            MonitorError::MailStatus { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_message_not_found_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts/a/mailboxes/b/messages/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let message = client
            .get_message("/accounts/a/mailboxes/b/messages/missing")
            .await
            .unwrap();
        assert!(message.is_none());

        // Non-path ids cannot be fetched
        assert!(client.get_message("bare-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_all_headers_walks_mailboxes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts/acc/mailboxes/in/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [
                    {"@id": "/m/1", "subject": "One", "from": "a@b.c", "date": "2024-01-01"},
                    {"@id": "/m/2", "subject": "Two", "from": {"address": "d@e.f"}, "date": "2024-01-02"}
                ],
                "totalItems": 2
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/accounts/acc/mailboxes/junk/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "member": [
                    {"@id": "/m/3", "subject": "Three", "from": "g@h.i", "date": "2024-01-03"}
                ],
                "totalItems": 1
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let headers = client
            .list_all_headers("acc", &["in".to_string(), "junk".to_string()])
            .await
            .unwrap();

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].subject, "One");
        assert_eq!(headers[1].sender, "d@e.f");
        assert_eq!(headers[2].id, "/m/3");
    }

    #[tokio::test]
    async fn test_get_attachment_parses_headers() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts/a/mailboxes/b/messages/c/attachment/d"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .insert_header("content-disposition", "attachment; filename=\"w2.pdf\"")
                    .set_body_bytes(b"pdf-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let attachment = client.get_attachment("a", "b", "c", "d").await.unwrap();
        assert_eq!(attachment.bytes, b"pdf-bytes");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.filename, "w2.pdf");
    }
}
