//! deno_core op definitions for the evaluation sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function
//! pointers, metadata structs) that cannot carry doc comments, so
//! `missing_docs` is suppressed at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::{op2, OpState};
use deno_error::JsErrorBox;

use crate::fetch::FetchBridge;

/// Wrapper for the guest's reported outcome envelope stored in OpState.
pub struct EvalOutcome(pub String);

/// Log a message from guest code.
#[op2(fast)]
pub fn op_potat_log(#[string] msg: &str) {
    tracing::info!(target: "potat::sandbox::js", "{}", msg);
}

/// Store the evaluation outcome envelope in OpState.
#[op2(fast)]
pub fn op_potat_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(EvalOutcome(json.to_string()));
}

/// Guest-initiated HTTP request, routed through the host fetch bridge.
///
/// Arguments and the reply cross the boundary as JSON strings; the bridge
/// itself never raises toward the guest, so the only op-level error is
/// reply serialization.
#[op2(async)]
#[string]
pub async fn op_potat_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[string] options_json: String,
) -> Result<String, JsErrorBox> {
    let bridge = {
        let state = op_state.borrow();
        state.borrow::<Arc<FetchBridge>>().clone()
    };

    tracing::debug!(url = %url, options_len = options_json.len(), "guest fetch dispatched");

    let options = serde_json::from_str(&options_json).unwrap_or_default();
    let reply = bridge.fetch(&url, options).await;

    serde_json::to_string(&reply)
        .map_err(|e| JsErrorBox::generic(format!("reply serialization failed: {e}")))
}

deno_core::extension!(
    potat_ext,
    ops = [op_potat_log, op_potat_set_result, op_potat_fetch],
);
