//! Host side of the guest `fetch` binding.
//!
//! Every request from a snippet passes through here: concurrency
//! accounting, SSRF guarding on the literal host and on every resolved DNS
//! answer, redirect re-guarding per hop, a hard 5 s timeout, and a bounded
//! body read. Failures never surface to the guest as exceptions; they
//! become synthetic `{body, status}` replies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{redirect, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::addr::{self, BlockedAddress};

/// User-Agent stamped on every guest-initiated request.
pub const FETCH_USER_AGENT: &str =
    "Sandbox Unsafe JavaScript Execution Environment - https://github.com/RyanPotat/eval-server/";

/// Hard cap on outbound request duration.
pub const FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Cap on the decoded response body.
const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

const MAX_REDIRECTS: usize = 10;

/// Per-request identity payload forwarded in the `x-potat-data` header.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PotatContext {
    /// Calling user, when the message carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Originating channel, when the message carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Value>,
    /// Message id.
    pub id: String,
    /// Message timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// Originating platform.
    pub platform: String,
    /// Whether the invocation was silent.
    pub is_silent: bool,
}

impl PotatContext {
    /// Derive the context from a sanitized message; missing fields get
    /// defaults.
    pub fn from_msg(msg: &Value) -> Self {
        Self {
            user: msg.get("user").cloned(),
            channel: msg.get("channel").cloned(),
            id: match msg.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            },
            timestamp: msg
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ms),
            platform: msg
                .get("platform")
                .and_then(Value::as_str)
                .unwrap_or("PotatEval")
                .to_string(),
            is_silent: msg
                .get("isSilent")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Request options accepted from the guest (a `fetch` init subset).
#[derive(Debug, Default, Deserialize)]
pub struct FetchOptions {
    /// HTTP method, `GET` when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Caller headers, merged under the host overlay.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Request body.
    #[serde(default)]
    pub body: Option<String>,
}

/// Value-copied reply surfaced to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchReply {
    /// Decoded body: parsed JSON when the response was JSON, raw text
    /// otherwise.
    pub body: Value,
    /// HTTP status, or a synthetic 400/408/429 on failure.
    pub status: u16,
}

/// Process-wide in-flight accounting for guest-initiated requests.
///
/// Snippets run serially, so the counter also bounds concurrency per
/// process. `reset` is called after every evaluation; the counter should
/// already be zero at that point.
#[derive(Debug)]
pub struct FetchLimiter {
    inflight: AtomicI64,
    max: i64,
}

impl FetchLimiter {
    /// Limiter admitting at most `max` concurrent requests.
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            inflight: AtomicI64::new(0),
            max: max as i64,
        })
    }

    fn acquire(self: &Arc<Self>) -> InflightGuard {
        let count = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        InflightGuard {
            limiter: Arc::clone(self),
            count,
        }
    }

    /// Current in-flight count.
    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Zero the counter.
    pub fn reset(&self) {
        self.inflight.store(0, Ordering::SeqCst);
    }
}

/// Holds one in-flight slot; releases it on drop on every exit path.
struct InflightGuard {
    limiter: Arc<FetchLimiter>,
    count: i64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // Clamped at zero: an end-of-evaluation reset can race a late drop.
        let _ = self
            .limiter
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)));
    }
}

/// DNS resolver that rejects lookups whose answers include any blocked
/// address. One private record poisons the whole lookup, which also covers
/// rebinding responses that mix public and private answers.
#[derive(Debug, Clone, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> =
                tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
            for addr in &addrs {
                if addr::ip_is_blocked(addr.ip()) {
                    tracing::warn!(host = %host, answer = %addr.ip(), "blocked DNS answer");
                    return Err(Box::new(BlockedAddress(host.clone()))
                        as Box<dyn std::error::Error + Send + Sync>);
                }
            }
            let iter: Addrs = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}

/// Redirect policy: follow, but every hop's host passes the same guard.
/// Literal-IP hops are checked here; named hops resolve through
/// [`GuardedResolver`] when the connection is made.
fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let host = attempt.url().host_str().unwrap_or_default().to_string();
        if addr::is_blocked(&host) {
            return attempt.error(BlockedAddress(host));
        }
        attempt.follow()
    })
}

/// Build the shared outbound client: guarded DNS, guarded redirects, fixed
/// timeout.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .dns_resolver(Arc::new(GuardedResolver))
        .redirect(redirect_policy())
        .timeout(FETCH_TIMEOUT)
        .build()
}

enum FetchFailure {
    Blocked(BlockedAddress),
    Timeout,
    Transport {
        kind: &'static str,
        message: String,
    },
}

/// Host implementation of the guest `fetch` callable, bound to one
/// evaluation's [`PotatContext`].
pub struct FetchBridge {
    client: reqwest::Client,
    limiter: Arc<FetchLimiter>,
    context: PotatContext,
}

impl FetchBridge {
    /// Bridge over a shared client and process-wide limiter.
    pub fn new(
        client: reqwest::Client,
        limiter: Arc<FetchLimiter>,
        context: PotatContext,
    ) -> Self {
        Self {
            client,
            limiter,
            context,
        }
    }

    /// Execute a guest fetch. Never errors toward the guest: every failure
    /// becomes a synthetic reply.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> FetchReply {
        let guard = self.limiter.acquire();
        if guard.count > self.limiter.max {
            return FetchReply {
                body: Value::String("Too many requests.".into()),
                status: 429,
            };
        }
        match self.dispatch(url, options).await {
            Ok(reply) => reply,
            Err(failure) => synthetic_reply(failure),
        }
    }

    async fn dispatch(&self, url: &str, options: FetchOptions) -> Result<FetchReply, FetchFailure> {
        let parsed = Url::parse(url).map_err(|e| FetchFailure::Transport {
            kind: "InvalidUrl",
            message: e.to_string(),
        })?;

        // Literal private IPs are rejected before any connection attempt.
        let host = parsed.host_str().unwrap_or_default();
        addr::guard_or_fail(host).map_err(FetchFailure::Blocked)?;

        let method = options.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method.as_bytes()).map_err(|e| FetchFailure::Transport {
            kind: "InvalidMethod",
            message: e.to_string(),
        })?;

        let headers = self.build_headers(options.headers.as_ref())?;

        let mut request = self.client.request(method, parsed).headers(headers);
        if let Some(body) = options.body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        let text = if bytes.len() > MAX_RESPONSE_BYTES {
            String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BYTES]).into_owned()
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(FetchReply { body, status })
    }

    /// Caller headers merged first, then the host overlay on top.
    fn build_headers(
        &self,
        caller: Option<&HashMap<String, String>>,
    ) -> Result<HeaderMap, FetchFailure> {
        let mut headers = HeaderMap::new();
        if let Some(caller) = caller {
            for (key, value) in caller {
                let name =
                    HeaderName::try_from(key.as_str()).map_err(|e| FetchFailure::Transport {
                        kind: "InvalidHeader",
                        message: e.to_string(),
                    })?;
                let value =
                    HeaderValue::from_str(value.as_str()).map_err(|e| FetchFailure::Transport {
                        kind: "InvalidHeader",
                        message: e.to_string(),
                    })?;
                headers.insert(name, value);
            }
        }

        headers.insert(USER_AGENT, HeaderValue::from_static(FETCH_USER_AGENT));
        let context = serde_json::to_string(&self.context).map_err(|e| FetchFailure::Transport {
            kind: "InvalidContext",
            message: e.to_string(),
        })?;
        let context =
            HeaderValue::from_str(&context).map_err(|e| FetchFailure::Transport {
                kind: "InvalidContext",
                message: e.to_string(),
            })?;
        headers.insert(HeaderName::from_static("x-potat-data"), context);
        Ok(headers)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        return FetchFailure::Timeout;
    }
    if let Some(blocked) = find_blocked(&err) {
        return FetchFailure::Blocked(blocked.clone());
    }
    let kind = if err.is_connect() {
        "Connect"
    } else if err.is_redirect() {
        "Redirect"
    } else if err.is_request() {
        "Request"
    } else if err.is_body() || err.is_decode() {
        "Decode"
    } else {
        "Error"
    };
    FetchFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

/// Walk an error chain looking for a [`BlockedAddress`] raised by the
/// resolver or the redirect policy.
fn find_blocked<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a BlockedAddress> {
    let mut source: Option<&'a (dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(blocked) = e.downcast_ref::<BlockedAddress>() {
            return Some(blocked);
        }
        source = e.source();
    }
    None
}

fn synthetic_reply(failure: FetchFailure) -> FetchReply {
    match failure {
        FetchFailure::Timeout => FetchReply {
            body: Value::String("Request timed out.".into()),
            status: 408,
        },
        FetchFailure::Blocked(blocked) => FetchReply {
            body: Value::String(format!("Request failed - {blocked}")),
            status: 400,
        },
        FetchFailure::Transport { kind, message } => FetchReply {
            body: Value::String(format!("Request failed - {kind}: {message}")),
            status: 400,
        },
    }
}
