// =============================================================================
// driver.rs - THE AUTOMATION SEAM
// =============================================================================
//
// The pool and the session manager never talk to a concrete automation
// backend. They see three traits:
//
//   AutomationDriver  launches handles (one per worker "process")
//   BrowserHandle     a long-lived session that can open isolated pages
//   Page              one isolated context: its own cookie jar, GET/POST
//
// The shipped backend drives the portal over plain HTTP. A handle owns its
// own reqwest client and connection pool, and a page owns its own cookie
// jar, so two pages on the same handle never see each other's session.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, SET_COOKIE};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::SyncError;

/// Status and body of one page request.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
}

impl PageResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, SyncError>;
}

#[async_trait]
pub trait BrowserHandle: Send + Sync {
    fn id(&self) -> u64;
    async fn new_page(&self) -> Result<Arc<dyn Page>, SyncError>;
    async fn close(&self) -> Result<(), SyncError>;
}

#[async_trait]
pub trait Page: Send + Sync {
    async fn get(&self, path: &str) -> Result<PageResponse, SyncError>;

    async fn post_json(
        &self,
        path: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<PageResponse, SyncError>;

    /// Current cookie jar of this page.
    fn cookies(&self) -> BTreeMap<String, String>;

    /// Merge cookies into this page's jar.
    fn add_cookies(&self, cookies: &BTreeMap<String, String>);

    async fn close(&self) -> Result<(), SyncError>;
}

// =============================================================================
// HTTP BACKEND
// =============================================================================

pub struct HttpDriver {
    base_url: Url,
    user_agent: String,
    page_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpDriver {
    pub fn new(base_url: &str, user_agent: &str, page_timeout: Duration) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Driver(format!("invalid portal URL `{base_url}`: {e}")))?;
        Ok(Self {
            base_url,
            user_agent: user_agent.to_string(),
            page_timeout,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl AutomationDriver for HttpDriver {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(self.page_timeout)
            .user_agent(self.user_agent.as_str())
            .gzip(true)
            .build()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(handle_id = id, "Launched HTTP automation handle");
        Ok(Arc::new(HttpHandle {
            id,
            client,
            base_url: self.base_url.clone(),
            page_timeout: self.page_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

struct HttpHandle {
    id: u64,
    client: reqwest::Client,
    base_url: Url,
    page_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl BrowserHandle for HttpHandle {
    fn id(&self) -> u64 {
        self.id
    }

    async fn new_page(&self) -> Result<Arc<dyn Page>, SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Driver(format!("handle {} is closed", self.id)));
        }
        Ok(Arc::new(HttpPage {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            page_timeout: self.page_timeout,
            jar: Mutex::new(BTreeMap::new()),
        }))
    }

    async fn close(&self) -> Result<(), SyncError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct HttpPage {
    client: reqwest::Client,
    base_url: Url,
    page_timeout: Duration,
    jar: Mutex<BTreeMap<String, String>>,
}

impl HttpPage {
    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Driver(format!("invalid path `{path}`: {e}")))
    }

    fn cookie_header(&self) -> Option<HeaderValue> {
        let jar = self.jar.lock();
        if jar.is_empty() {
            return None;
        }
        let joined = jar
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    fn absorb_cookies(&self, headers: &HeaderMap) {
        let mut jar = self.jar.lock();
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let pair = raw.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    jar.insert(name.to_string(), value.trim().to_string());
                }
            }
        }
    }

    async fn send(&self, mut request: reqwest::RequestBuilder) -> Result<PageResponse, SyncError> {
        if let Some(cookies) = self.cookie_header() {
            request = request.header(COOKIE, cookies);
        }
        let response = request.send().await.map_err(|e| self.request_error(e))?;
        self.absorb_cookies(response.headers());
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.request_error(e))?;
        Ok(PageResponse { status, body })
    }

    /// A timed-out page is a stuck page: report it as a timeout so the pool
    /// retires the handle.
    fn request_error(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.page_timeout)
        } else {
            SyncError::Network(e)
        }
    }
}

#[async_trait]
impl Page for HttpPage {
    async fn get(&self, path: &str) -> Result<PageResponse, SyncError> {
        let url = self.url(path)?;
        self.send(self.client.get(url)).await
    }

    async fn post_json(
        &self,
        path: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<PageResponse, SyncError> {
        let url = self.url(path)?;
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SyncError::Driver(format!("bad header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SyncError::Driver(format!("bad header value: {e}")))?;
            request = request.header(name, value);
        }
        self.send(request).await
    }

    fn cookies(&self) -> BTreeMap<String, String> {
        self.jar.lock().clone()
    }

    fn add_cookies(&self, cookies: &BTreeMap<String, String>) {
        let mut jar = self.jar.lock();
        for (k, v) in cookies {
            jar.insert(k.clone(), v.clone());
        }
    }

    async fn close(&self) -> Result<(), SyncError> {
        self.jar.lock().clear();
        Ok(())
    }
}

// =============================================================================
// TEST BACKEND
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Counts launches and closes, and can be told to fail launches.
    #[derive(Default)]
    pub struct MockDriver {
        pub launched: AtomicU64,
        pub closed: Arc<AtomicU64>,
        pub pages_closed: Arc<AtomicU64>,
        pub fail_launch: AtomicBool,
    }

    #[async_trait]
    impl AutomationDriver for MockDriver {
        async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, SyncError> {
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(SyncError::Driver("launch refused".into()));
            }
            let id = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(MockHandle {
                id,
                closed: self.closed.clone(),
                pages_closed: self.pages_closed.clone(),
            }))
        }
    }

    struct MockHandle {
        id: u64,
        closed: Arc<AtomicU64>,
        pages_closed: Arc<AtomicU64>,
    }

    #[async_trait]
    impl BrowserHandle for MockHandle {
        fn id(&self) -> u64 {
            self.id
        }

        async fn new_page(&self) -> Result<Arc<dyn Page>, SyncError> {
            Ok(Arc::new(MockPage {
                jar: Mutex::new(BTreeMap::new()),
                pages_closed: self.pages_closed.clone(),
            }))
        }

        async fn close(&self) -> Result<(), SyncError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockPage {
        jar: Mutex<BTreeMap<String, String>>,
        pages_closed: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Page for MockPage {
        async fn get(&self, _path: &str) -> Result<PageResponse, SyncError> {
            Ok(PageResponse { status: 200, body: String::new() })
        }

        async fn post_json(
            &self,
            _path: &str,
            _headers: &[(&str, String)],
            _body: &serde_json::Value,
        ) -> Result<PageResponse, SyncError> {
            Ok(PageResponse { status: 200, body: "{}".into() })
        }

        fn cookies(&self) -> BTreeMap<String, String> {
            self.jar.lock().clone()
        }

        fn add_cookies(&self, cookies: &BTreeMap<String, String>) {
            self.jar.lock().extend(cookies.clone());
        }

        async fn close(&self) -> Result<(), SyncError> {
            self.pages_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
