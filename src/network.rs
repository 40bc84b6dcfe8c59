//! HTTP transport used to download rules.
use std::{collections::BTreeMap, time::Duration};

use rand::{thread_rng, Rng};
use reqwest::Url;

use crate::{Error, Result};

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Request method.
    pub method: HttpMethod,
    /// Headers sent in order.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Vec<u8>>,
    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,
    /// Time allowed for the response once connected.
    pub read_timeout: Duration,
}

impl HttpRequest {
    /// Default connect and read timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// `GET` request with default timeouts.
    pub fn get(url: impl Into<String>) -> HttpRequest {
        HttpRequest {
            url: url.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            body: None,
            connect_timeout: Self::DEFAULT_TIMEOUT,
            read_timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> HttpRequest {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Update connect and read timeouts.
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> HttpRequest {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }
}

/// Response to an [`HttpRequest`]. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns `true` for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs HTTP requests. Implement this to plug in a platform network stack.
pub trait HttpClient: Send + Sync {
    /// Perform `request`. Any status code is a successful fetch; transport failures are errors.
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by blocking `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
}

impl ReqwestHttpClient {
    /// Create a client with a default `reqwest` configuration.
    pub fn new() -> Result<ReqwestHttpClient> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(HttpRequest::DEFAULT_TIMEOUT)
            .user_agent(concat!("eventhub/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestHttpClient { client })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = Url::parse(&request.url).map_err(Error::InvalidUrl)?;
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        // Connect timeout is per client in reqwest, so the request deadline covers both phases.
        builder = builder.timeout(request.connect_timeout + request.read_timeout);

        let response = builder.send()?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
            })
            .collect();
        let body = response.bytes()?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Retry behavior for downloads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter: Duration,
    recoverable_status_codes: Vec<u16>,
}

impl RetryPolicy {
    /// Default number of attempts, including the first one.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default delay before the first retry. Doubles on each following retry.
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
    /// Default upper bound of the random delay added to each retry.
    pub const DEFAULT_JITTER: Duration = Duration::from_millis(500);
    /// Status codes retried by default.
    pub const DEFAULT_RECOVERABLE_STATUS_CODES: [u16; 5] = [408, 429, 502, 503, 504];

    /// Create a new `RetryPolicy` using default configuration.
    pub fn new() -> RetryPolicy {
        RetryPolicy::default()
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> RetryPolicy {
        RetryPolicy::new().with_max_attempts(1)
    }

    /// Set the number of attempts. Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> RetryPolicy {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Update the delay before the first retry.
    pub fn with_base_delay(mut self, base_delay: Duration) -> RetryPolicy {
        self.base_delay = base_delay;
        self
    }

    /// Update the random jitter added to every delay.
    pub fn with_jitter(mut self, jitter: Duration) -> RetryPolicy {
        self.jitter = jitter;
        self
    }

    /// Replace the set of status codes worth retrying.
    pub fn with_recoverable_status_codes(
        mut self,
        codes: impl IntoIterator<Item = u16>,
    ) -> RetryPolicy {
        self.recoverable_status_codes = codes.into_iter().collect();
        self
    }

    /// Returns `true` if a response with `status` is worth retrying.
    pub fn is_recoverable(&self, status: u16) -> bool {
        self.recoverable_status_codes.contains(&status)
    }

    /// Delay before retry number `retry` (starting at 1).
    fn delay(&self, retry: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
        jitter(backoff, self.jitter)
    }

    /// Fetch `request`, retrying transport errors and recoverable status codes.
    ///
    /// Returns the last response when attempts run out on a recoverable status, so callers still
    /// see the status code.
    pub fn fetch(&self, client: &dyn HttpClient, request: &HttpRequest) -> Result<HttpResponse> {
        let mut attempt = 1;
        loop {
            let result = client.fetch(request);
            let retry = match &result {
                Ok(response) => self.is_recoverable(response.status),
                Err(Error::InvalidUrl(_)) => false,
                Err(_) => true,
            };
            if !retry || attempt >= self.max_attempts {
                return result;
            }

            let delay = self.delay(attempt);
            match &result {
                Ok(response) => {
                    log::warn!(target: "eventhub",
                               url:display = request.url,
                               status = response.status,
                               attempt;
                               "recoverable status while fetching, retrying in {delay:?}");
                }
                Err(err) => {
                    log::warn!(target: "eventhub",
                               url:display = request.url,
                               attempt;
                               "error while fetching, retrying in {delay:?}: {err}");
                }
            }
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
            jitter: Self::DEFAULT_JITTER,
            recoverable_status_codes: Self::DEFAULT_RECOVERABLE_STATUS_CODES.to_vec(),
        }
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
    use crate::{Error, Result};

    /// Replays canned responses and records requests.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        pub responses: Mutex<VecDeque<Result<HttpResponse>>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        pub fn new(responses: impl IntoIterator<Item = Result<HttpResponse>>) -> Arc<Self> {
            Arc::new(ScriptedClient {
                responses: Mutex::new(responses.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl HttpClient for ScriptedClient {
        fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::HttpStatus(599)))
        }
    }

    pub(crate) fn response(status: u16, body: &[u8]) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
            ..Default::default()
        })
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn retries_recoverable_status() {
        let client = ScriptedClient::new([response(503, b""), response(200, b"ok")]);
        let result = fast_policy(3)
            .fetch(client.as_ref(), &HttpRequest::get("https://example.com"))
            .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(client.request_count(), 2);
    }

    #[test]
    fn does_not_retry_other_status() {
        let client = ScriptedClient::new([response(404, b""), response(200, b"ok")]);
        let result = fast_policy(3)
            .fetch(client.as_ref(), &HttpRequest::get("https://example.com"))
            .unwrap();
        assert_eq!(result.status, 404);
        assert_eq!(client.request_count(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let client = ScriptedClient::new([
            response(429, b""),
            Err(Error::HttpStatus(0)),
            response(502, b""),
            response(200, b""),
        ]);
        let result = fast_policy(3)
            .fetch(client.as_ref(), &HttpRequest::get("https://example.com"))
            .unwrap();
        assert_eq!(result.status, 502);
        assert_eq!(client.request_count(), 3);
    }

    #[test]
    fn response_headers_are_case_insensitive() {
        let mut response = HttpResponse::default();
        response.headers.insert("etag".to_owned(), "\"v1\"".to_owned());
        assert_eq!(response.header("ETag"), Some("\"v1\""));
    }
}
