//! Isolate runner: one fresh V8 guest per evaluation.
//!
//! Each evaluation gets a brand new runtime with a hard heap cap and wall
//! clock budget; the isolate is disposed on every exit path. V8 isolates
//! are `!Send`, so all runtime work happens on a dedicated thread with its
//! own single-threaded tokio runtime. The public API is fully async and
//! `Send`-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;

use crate::error::EvalError;
use crate::fetch::{self, FetchBridge, FetchLimiter, PotatContext};
use crate::ops::{potat_ext, EvalOutcome};
use crate::shape;
use crate::{NoopUtils, UtilsInjector};

/// Limits applied to every evaluation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Wall-clock budget for one evaluation.
    pub timeout: Duration,
    /// V8 heap cap in bytes.
    pub max_heap_size: usize,
    /// Result cap in characters.
    pub max_output_chars: usize,
    /// Concurrent outbound requests allowed per snippet.
    pub max_fetch_concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_heap_size: 8 * 1024 * 1024,
            max_output_chars: 3000,
            max_fetch_concurrency: 5,
        }
    }
}

/// Runs snippets in fresh isolates.
pub struct IsolateRunner {
    config: RunnerConfig,
    client: reqwest::Client,
    limiter: Arc<FetchLimiter>,
    utils: Arc<dyn UtilsInjector>,
}

impl IsolateRunner {
    /// Runner with no guest helper bindings.
    pub fn new(config: RunnerConfig) -> anyhow::Result<Self> {
        Self::with_utils(config, Arc::new(NoopUtils))
    }

    /// Runner with a [`UtilsInjector`] collaborator.
    pub fn with_utils(
        config: RunnerConfig,
        utils: Arc<dyn UtilsInjector>,
    ) -> anyhow::Result<Self> {
        let client = fetch::build_client()?;
        let limiter = FetchLimiter::new(config.max_fetch_concurrency);
        Ok(Self {
            config,
            client,
            limiter,
            utils,
        })
    }

    /// The process-wide fetch limiter.
    pub fn limiter(&self) -> &Arc<FetchLimiter> {
        &self.limiter
    }

    /// Evaluate one snippet against its message context.
    ///
    /// Never fails toward the caller: every guest or host failure becomes
    /// the sentinel string `🚫 <ErrorKindName>: <message>`.
    pub async fn run(&self, code: &str, msg: &Value) -> String {
        tracing::info!(code_len = code.len(), "eval: starting");
        let result = self.execute(code, msg).await;
        // Snippets are serial, so the counter should already be zero here.
        self.limiter.reset();
        match result {
            Ok(output) => {
                tracing::info!(result_len = output.len(), "eval: complete");
                output
            }
            Err(err) => {
                tracing::warn!(error = %err, "eval: failed");
                // The sentinel is bounded like any other result string.
                truncate_chars(format!("🚫 {err}"), self.config.max_output_chars)
            }
        }
    }

    async fn execute(&self, code: &str, msg: &Value) -> Result<String, EvalError> {
        let sanitized = shape::sanitize_msg(msg.clone());
        let context = PotatContext::from_msg(&sanitized);
        let script =
            shape::build_script(code, &sanitized).map_err(|e| EvalError::Internal(e.into()))?;
        let bridge = Arc::new(FetchBridge::new(
            self.client.clone(),
            Arc::clone(&self.limiter),
            context,
        ));

        let config = self.config.clone();
        let utils_source = self.utils.source();

        // V8 isolates are !Send; run everything on a dedicated thread.
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(EvalError::Internal(e.into()))).is_err() {
                        tracing::warn!("evaluation receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_guest(&config, script, bridge, utils_source));
            if tx.send(result).is_err() {
                tracing::warn!("evaluation receiver dropped before result was sent");
            }
        });

        let raw = rx
            .await
            .map_err(|_| EvalError::Internal(anyhow::anyhow!("evaluation thread panicked")))??;
        Ok(truncate_chars(raw, self.config.max_output_chars))
    }
}

/// Bound a result string to `max` characters.
fn truncate_chars(value: String, max: usize) -> String {
    if value.chars().count() <= max {
        return value;
    }
    value.chars().take(max).collect()
}

/// Bootstrap evaluated before anything else in a fresh guest: captures the
/// ops in closures, installs `global`, `fetch`, and the result setter, then
/// removes the `Deno` namespace from the global scope.
const BOOTSTRAP: &str = r#"
    ((ops) => {
        globalThis.global = globalThis;
        globalThis.__potat = Object.freeze({
            setResult: (json) => ops.op_potat_set_result(json),
            log: (msg) => ops.op_potat_log(String(msg)),
        });
        globalThis.fetch = async (url, options) => {
            const reply = await ops.op_potat_fetch(
                String(url), JSON.stringify(options ?? {})
            );
            return JSON.parse(reply);
        };
        delete globalThis.Deno;
    })(Deno.core.ops);
"#;

/// Envelope reported by the prelude through the result op.
#[derive(Deserialize)]
struct GuestEnvelope {
    #[serde(default)]
    ok: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit fired. AtomicBool so the callback works
    /// through a shared `&` reference even if V8 re-enters it.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` box owned by
    // `run_user_code`, which outlives every point at which V8 can invoke
    // this callback: the box is alive until after the watchdog is joined
    // and no guest code runs past that join.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run one evaluation on the current thread (must be a dedicated thread,
/// not the main tokio runtime).
async fn run_guest(
    config: &RunnerConfig,
    script: String,
    bridge: Arc<FetchBridge>,
    utils_source: String,
) -> Result<String, EvalError> {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![potat_ext::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(bridge);

    runtime
        .execute_script("[potat:bootstrap]", BOOTSTRAP)
        .map_err(|e| EvalError::Internal(anyhow::anyhow!("bootstrap failed: {e}")))?;

    if !utils_source.is_empty() {
        runtime
            .execute_script("[potat:utils]", utils_source)
            .map_err(|e| EvalError::Internal(anyhow::anyhow!("utils injection failed: {e}")))?;
    }

    run_user_code(&mut runtime, script, config).await
}

/// Execute the shaped script with the heap callback and CPU watchdog armed,
/// then extract the outcome envelope from OpState.
async fn run_user_code(
    runtime: &mut JsRuntime,
    script: String,
    config: &RunnerConfig,
) -> Result<String, EvalError> {
    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Set up CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = Arc::clone(&timed_out);
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Execute the shaped script ---
    let mut event_loop_expired = false;
    let exec_error = match runtime.execute_script("[potat:eval]", script) {
        Ok(_) => {
            // Drive the event loop so pending fetches and the top-level
            // promise resolve.
            match tokio::time::timeout(
                config.timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    event_loop_expired = true;
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // --- Cleanup: cancel the watchdog and wait for it to exit ---
    // The watchdog must be done before the runtime drops so the
    // IsolateHandle is never used after free.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    // --- Check failure causes in priority order ---
    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(EvalError::HeapLimit);
    }

    if timed_out.load(Ordering::SeqCst) || event_loop_expired {
        return Err(EvalError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }

    if let Some(message) = exec_error {
        // Compile-time failures in the shaped script (bad user syntax)
        // land here; runtime throws are captured by the prelude and
        // arrive through the result op instead.
        return Err(EvalError::GuestThrew(normalize_js_error(&message)));
    }

    // --- Extract the outcome envelope from OpState ---
    let envelope_json = {
        let state = runtime.op_state();
        let state = state.borrow();
        state.try_borrow::<EvalOutcome>().map(|r| r.0.clone())
    };
    let envelope_json = envelope_json
        .ok_or_else(|| EvalError::Internal(anyhow::anyhow!("guest produced no result")))?;

    let envelope: GuestEnvelope =
        serde_json::from_str(&envelope_json).map_err(|e| EvalError::Internal(e.into()))?;
    if let Some(error) = envelope.error {
        return Err(EvalError::GuestThrew(error));
    }
    Ok(envelope.ok.unwrap_or_default())
}

/// Reduce a deno_core error display to `<name>: <message>`.
fn normalize_js_error(message: &str) -> String {
    let first = message.lines().next().unwrap_or("").trim();
    let first = first.strip_prefix("Uncaught ").unwrap_or(first);
    if first.is_empty() {
        "Error: unknown guest failure".to_string()
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_service_limits() {
        let config = RunnerConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.max_heap_size, 8 * 1024 * 1024);
        assert_eq!(config.max_output_chars, 3000);
        assert_eq!(config.max_fetch_concurrency, 5);
    }

    #[test]
    fn truncate_bounds_long_results() {
        let long = "x".repeat(4000);
        assert_eq!(truncate_chars(long, 3000).chars().count(), 3000);
        assert_eq!(truncate_chars("short".into(), 3000), "short");
        // Multi-byte characters count as single units.
        let emoji = "🥔".repeat(3001);
        assert_eq!(truncate_chars(emoji, 3000).chars().count(), 3000);
    }

    #[test]
    fn normalize_strips_uncaught_prefix_and_stack() {
        assert_eq!(
            normalize_js_error("Uncaught TypeError: x\n    at [potat:eval]:3:1"),
            "TypeError: x"
        );
        assert_eq!(normalize_js_error("SyntaxError: bad"), "SyntaxError: bad");
        assert_eq!(normalize_js_error(""), "Error: unknown guest failure");
    }
}
