//! End-to-end tests for the evaluation pipeline: shaping, isolate
//! lifecycle, sentinel mapping, and queue serialization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use potat_sandbox::{AdmissionQueue, IsolateRunner, QueueError, RunnerConfig, UtilsInjector};
use serde_json::json;

fn runner() -> IsolateRunner {
    IsolateRunner::new(RunnerConfig::default()).unwrap()
}

#[tokio::test]
async fn arithmetic_expression() {
    let result = runner().run("1 + 1", &json!({})).await;
    assert_eq!(result, "2");
}

#[tokio::test]
async fn return_statement_takes_the_async_path() {
    let result = runner()
        .run("return [1,2,3].map(x => x * x)", &json!({}))
        .await;
    assert_eq!(result, "1, 4, 9");
}

#[tokio::test]
async fn string_results_pass_through_unquoted() {
    let result = runner().run("'hello' + ' ' + 'world'", &json!({})).await;
    assert_eq!(result, "hello world");
}

#[tokio::test]
async fn objects_are_json_stringified() {
    let result = runner().run("({a: 1, b: [true, null]})", &json!({})).await;
    assert_eq!(result, r#"{"a":1,"b":[true,null]}"#);
}

#[tokio::test]
async fn json_parse_round_trips() {
    let result = runner().run(r#"JSON.parse('{"a":1}')"#, &json!({})).await;
    assert_eq!(result, r#"{"a":1}"#);
}

#[tokio::test]
async fn error_values_render_as_name_and_message() {
    let result = runner().run("new TypeError('nope')", &json!({})).await;
    assert_eq!(result, "TypeError: nope");
}

#[tokio::test]
async fn undefined_renders_as_undefined() {
    let result = runner().run("undefined", &json!({})).await;
    assert_eq!(result, "undefined");
}

#[tokio::test]
async fn guest_throw_becomes_the_sentinel() {
    let result = runner().run("throw new TypeError('x')", &json!({})).await;
    assert_eq!(result, "🚫 TypeError: x");
}

#[tokio::test]
async fn syntax_errors_become_the_sentinel() {
    let result = runner().run("this is not javascript", &json!({})).await;
    assert!(result.starts_with("🚫 SyntaxError:"), "{result}");
}

#[tokio::test]
async fn cpu_bound_loop_times_out() {
    let runner = IsolateRunner::new(RunnerConfig {
        timeout: Duration::from_millis(300),
        ..RunnerConfig::default()
    })
    .unwrap();

    let start = Instant::now();
    let result = runner.run("while(true){}", &json!({})).await;
    let elapsed = start.elapsed();

    assert!(result.starts_with("🚫 TimeoutError:"), "{result}");
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
}

#[tokio::test]
async fn heap_pressure_is_terminated() {
    let runner = IsolateRunner::new(RunnerConfig {
        timeout: Duration::from_secs(30),
        ..RunnerConfig::default()
    })
    .unwrap();

    let code = r#"
        const arr = [];
        while (true) { arr.push(new Array(100000).fill("x")); }
    "#;
    let result = runner.run(code, &json!({})).await;
    assert!(result.starts_with("🚫 "), "{result}");
}

#[tokio::test]
async fn results_are_truncated_to_3000_chars() {
    let result = runner().run("'x'.repeat(4000)", &json!({})).await;
    assert_eq!(result.chars().count(), 3000);
}

#[tokio::test]
async fn sentinel_results_are_truncated_too() {
    let result = runner()
        .run("throw new Error('x'.repeat(5000))", &json!({}))
        .await;
    assert!(result.starts_with("🚫 Error: xxx"), "{result}");
    assert_eq!(result.chars().count(), 3000);
}

#[tokio::test]
async fn msg_is_bound_in_the_guest() {
    let msg = json!({"user": {"name": "ryan"}, "platform": "twitch"});
    let result = runner().run("msg.user.name", &msg).await;
    assert_eq!(result, "ryan");
}

#[tokio::test]
async fn msg_is_a_deep_copy_with_pruned_fields() {
    let msg = json!({
        "channel": {
            "id": "42",
            "commands": ["huge"],
            "blocks": ["huge"],
        },
    });
    let result = runner().run("JSON.stringify(msg.channel)", &msg).await;
    assert_eq!(result, r#"{"id":"42"}"#);
}

#[tokio::test]
async fn global_aliases_the_guest_global_object() {
    let result = runner().run("global === globalThis", &json!({})).await;
    assert_eq!(result, "true");
}

#[tokio::test]
async fn deno_namespace_is_not_reachable() {
    let result = runner().run("typeof Deno", &json!({})).await;
    assert_eq!(result, "undefined");
}

struct DoubleUtils;

impl UtilsInjector for DoubleUtils {
    fn source(&self) -> String {
        "globalThis.double = (n) => n * 2;".to_string()
    }
}

#[tokio::test]
async fn utils_bindings_are_injected_before_user_code() {
    let runner =
        IsolateRunner::with_utils(RunnerConfig::default(), Arc::new(DoubleUtils)).unwrap();
    let result = runner.run("double(21)", &json!({})).await;
    assert_eq!(result, "42");
}

#[tokio::test]
async fn repeated_evaluations_share_no_state() {
    let runner = Arc::new(runner());
    let first = runner.run("globalThis.leak = 7; 'set'", &json!({})).await;
    assert_eq!(first, "set");
    let second = runner.run("typeof globalThis.leak", &json!({})).await;
    assert_eq!(second, "undefined");
}

#[tokio::test]
async fn limiter_is_zero_after_each_evaluation() {
    let runner = Arc::new(runner());
    runner.run("1 + 1", &json!({})).await;
    assert_eq!(runner.limiter().inflight(), 0);
}

// --- Queue behavior ---

#[tokio::test]
async fn queue_preserves_submission_results() {
    let runner = Arc::new(runner());
    let queue = AdmissionQueue::new(runner);

    let mut handles = Vec::new();
    for i in 0..5 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue.submit(format!("{i} * 10"), json!({})).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, (i * 10).to_string());
    }
}

#[tokio::test]
async fn overflow_is_rejected_while_the_consumer_is_busy() {
    let runner = Arc::new(
        IsolateRunner::new(RunnerConfig {
            timeout: Duration::from_millis(500),
            ..RunnerConfig::default()
        })
        .unwrap(),
    );
    let queue = AdmissionQueue::new(runner);

    // Occupy the consumer so nothing drains while we flood the queue.
    let busy = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.submit("while(true){}".into(), json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(
            async move { queue.submit("1".into(), json!({})).await },
        ));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result, "1");
                admitted += 1;
            }
            Err(QueueError::QueueFull { capacity }) => {
                assert_eq!(capacity, 20);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(admitted, 20);
    assert_eq!(rejected, 5);

    let busy_result = busy.await.unwrap().unwrap();
    assert!(busy_result.starts_with("🚫 TimeoutError:"), "{busy_result}");
}
