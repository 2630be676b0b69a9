//! Transforms user snippets into the script evaluated in the guest.
//!
//! Shaping covers three concerns: pruning oversized message fields,
//! synthesizing the prelude (`toString`, the `msg` binding, strict mode),
//! and deciding whether the snippet is a statement block or an expression.

use serde_json::Value;

/// Message paths pruned before the message is embedded in the guest.
/// These are known large fields that bloat the guest environment.
const PRUNED_PATHS: &[&[&str]] = &[
    &["channel", "data", "command_stats"],
    &["channel", "commands"],
    &["command", "description"],
    &["channel", "blocks"],
];

/// Remove known oversized fields from the message object.
pub fn sanitize_msg(mut msg: Value) -> Value {
    for path in PRUNED_PATHS {
        remove_path(&mut msg, path);
    }
    msg
}

fn remove_path(value: &mut Value, path: &[&str]) {
    let (leaf, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut cursor = value;
    for key in parents {
        match cursor.get_mut(*key) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(map) = cursor.as_object_mut() {
        map.remove(*leaf);
    }
}

/// How a snippet is wrapped for evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shaping {
    /// Statement block inside the async wrapper; the snippet carries its
    /// own `return`.
    Statements,
    /// `await` expression with no `return`; the wrapper returns its value
    /// so `await fetch(...)` yields the reply instead of `undefined`.
    AwaitExpression,
    /// Plain expression via reflective eval.
    Expression,
}

/// Decide how to wrap a snippet.
///
/// A naive substring test on the raw source: `return` and `await` are
/// illegal at the top level but legal inside the wrapper. The test misfires
/// on those tokens inside string literals or comments; that behavior is
/// kept as-is.
pub fn classify(code: &str) -> Shaping {
    if code.contains("return") {
        Shaping::Statements
    } else if code.contains("await") {
        Shaping::AwaitExpression
    } else {
        Shaping::Expression
    }
}

/// Escape a snippet for embedding in a single-quoted JS literal.
fn escape_single_quoted(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    for ch in code.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out
}

/// Build the script evaluated in the guest: strict-mode prelude, the `msg`
/// binding, the shaped user code, and result capture through the host op.
///
/// The message is embedded as a double-JSON-stringified literal so the
/// guest parses a fresh deep copy and can never observe a live host
/// reference.
pub fn build_script(code: &str, sanitized_msg: &Value) -> Result<String, serde_json::Error> {
    let embedded = serde_json::to_string(&serde_json::to_string(sanitized_msg)?)?;
    let shaped = match classify(code) {
        Shaping::Statements => {
            format!("toString((async function evaluate() {{ {code} }})())")
        }
        Shaping::AwaitExpression => {
            format!("toString((async function evaluate() {{ return {code} }})())")
        }
        Shaping::Expression => {
            format!("toString(eval('{}'))", escape_single_quoted(code))
        }
    };
    Ok(format!(
        r#""use strict";
const msg = JSON.parse({embedded});
async function toString(value) {{
    if (typeof value === "string") return value;
    if (value instanceof Error) return `${{value.name}}: ${{value.message}}`;
    if (value instanceof Promise) return toString(await value);
    if (Array.isArray(value)) {{
        const parts = [];
        for (const item of value) parts.push(await toString(item));
        return parts.join(", ");
    }}
    return JSON.stringify(value);
}}
(async () => {{
    try {{
        const result = await {shaped};
        __potat.setResult(JSON.stringify({{ ok: String(result) }}));
    }} catch (e) {{
        const name = (e && e.name) ? e.name : "Error";
        const message = (e && e.message !== undefined) ? e.message : String(e);
        __potat.setResult(JSON.stringify({{ error: `${{name}}: ${{message}}` }}));
    }}
}})();
"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_prunes_known_paths() {
        let msg = json!({
            "channel": {
                "data": { "command_stats": [1, 2, 3], "name": "general" },
                "commands": ["a", "b"],
                "blocks": ["x"],
                "id": "42",
            },
            "command": { "description": "long text", "name": "eval" },
            "user": { "name": "ryan" },
        });
        let sanitized = sanitize_msg(msg);
        assert!(sanitized["channel"]["data"].get("command_stats").is_none());
        assert!(sanitized["channel"].get("commands").is_none());
        assert!(sanitized["channel"].get("blocks").is_none());
        assert!(sanitized["command"].get("description").is_none());
        // Siblings survive.
        assert_eq!(sanitized["channel"]["data"]["name"], "general");
        assert_eq!(sanitized["command"]["name"], "eval");
        assert_eq!(sanitized["user"]["name"], "ryan");
    }

    #[test]
    fn sanitize_tolerates_missing_paths() {
        assert_eq!(sanitize_msg(json!({})), json!({}));
        assert_eq!(sanitize_msg(json!(null)), json!(null));
        assert_eq!(
            sanitize_msg(json!({"channel": "just-a-string"})),
            json!({"channel": "just-a-string"})
        );
    }

    #[test]
    fn return_and_await_pick_the_async_wrapper() {
        assert_eq!(classify("return 1"), Shaping::Statements);
        assert_eq!(
            classify("await fetch('https://example.com')"),
            Shaping::AwaitExpression
        );
        assert_eq!(
            classify("const r = await f(); return r"),
            Shaping::Statements
        );
        // Substring semantics, even inside other tokens or literals.
        assert_eq!(classify("'return'"), Shaping::Statements);
        assert_eq!(classify("1 + 1"), Shaping::Expression);
        assert_eq!(classify("[1,2,3].map(x => x * x)"), Shaping::Expression);
    }

    #[test]
    fn expression_path_escapes_the_snippet() {
        let script = build_script(r#"'a' + "b" + '\n'"#, &json!({})).unwrap();
        assert!(script.contains(r#"toString(eval('\'a\' + "b" + \'\\n\''))"#));
    }

    #[test]
    fn statement_path_wraps_in_evaluate() {
        let script = build_script("return [1,2,3]", &json!({})).unwrap();
        assert!(script.contains("(async function evaluate() { return [1,2,3] })()"));
        assert!(!script.contains("eval('"));
    }

    #[test]
    fn await_without_return_yields_its_value() {
        let script = build_script("await f().then(r => r.status)", &json!({})).unwrap();
        assert!(script
            .contains("(async function evaluate() { return await f().then(r => r.status) })()"));
    }

    #[test]
    fn message_is_double_stringified() {
        let script = build_script("1", &json!({"user": {"name": "a\"b"}})).unwrap();
        // The embedded literal is a JSON string containing JSON.
        assert!(script.contains(r#"const msg = JSON.parse("{\"user\""#));
    }

    #[test]
    fn prelude_is_strict_and_captures_errors() {
        let script = build_script("1", &json!({})).unwrap();
        assert!(script.starts_with("\"use strict\";"));
        assert!(script.contains("__potat.setResult"));
        assert!(script.contains("`${name}: ${message}`"));
    }
}
