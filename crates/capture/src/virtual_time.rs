//! Deterministic clock for the page.
//!
//! The script in `virtual_time.js` replaces `Date`, `performance.now`, the timer functions and
//! `requestAnimationFrame` with versions driven by a logical offset. It installs itself once per
//! document behind the `__framecastVirtualTime` global and starts out inactive, ticking itself in
//! real time. While a capture runs, every frame step calls `tick(timestamp)` before the screenshot
//! is taken.

use cdp_adapter::{AdapterError, AdapterErrorKind, PageTarget};
use serde_json::{json, Value};
use tracing::debug;

pub const SENTINEL: &str = "__framecastVirtualTime";

pub const INSTALL_SCRIPT: &str = include_str!("virtual_time.js");

/// Register the script for every new document and run it in the documents already loaded.
///
/// Returns the identifier needed by [`uninstall`].
pub async fn install(page: &dyn PageTarget) -> Result<String, AdapterError> {
    let response = page
        .send(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": INSTALL_SCRIPT }),
        )
        .await?;
    let identifier = response
        .get("identifier")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint("addScriptToEvaluateOnNewDocument returned no identifier")
        })?
        .to_string();

    evaluate_everywhere(page, INSTALL_SCRIPT).await?;
    Ok(identifier)
}

pub async fn uninstall(page: &dyn PageTarget, identifier: &str) -> Result<(), AdapterError> {
    page.send(
        "Page.removeScriptToEvaluateOnNewDocument",
        json!({ "identifier": identifier }),
    )
    .await
    .map(|_| ())
}

pub async fn activate(page: &dyn PageTarget, capture_timestamp: f64) -> Result<(), AdapterError> {
    evaluate_everywhere(page, &call("activate", capture_timestamp)).await
}

pub async fn deactivate(page: &dyn PageTarget, frame_interval: f64) -> Result<(), AdapterError> {
    evaluate_everywhere(page, &call("deactivate", frame_interval)).await
}

/// Fire everything due at `capture_timestamp` in every frame.
pub async fn tick(page: &dyn PageTarget, capture_timestamp: f64) -> Result<(), AdapterError> {
    evaluate_everywhere(page, &call("tick", capture_timestamp)).await
}

/// Restore the page's own time functions.
pub async fn eject(page: &dyn PageTarget) -> Result<(), AdapterError> {
    evaluate_everywhere(page, &format!("window.{SENTINEL} && window.{SENTINEL}.eject()")).await
}

fn call(method: &str, argument: f64) -> String {
    format!(
        "window.{SENTINEL} && window.{SENTINEL}.{method}({})",
        js_number(argument)
    )
}

/// Render a float as a JavaScript literal.
pub fn js_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        value.to_string()
    }
}

async fn evaluate_everywhere(page: &dyn PageTarget, expression: &str) -> Result<(), AdapterError> {
    for context_id in page.execution_contexts() {
        let result = page
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "contextId": context_id,
                    "returnByValue": true,
                    "awaitPromise": false,
                }),
            )
            .await;
        match result {
            Ok(response) => {
                if let Some(details) = response.get("exceptionDetails") {
                    debug!(
                        target: "framecast-capture",
                        context_id,
                        details = %details,
                        "virtual time script raised"
                    );
                }
            }
            // Frames navigate away between listing and evaluating.
            Err(err) if err.is_missing_context() => {
                debug!(target: "framecast-capture", context_id, ?err, "context gone, skipping");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPage;

    #[test]
    fn js_numbers_are_valid_literals() {
        assert_eq!(js_number(50.0), "50");
        assert_eq!(js_number(16.5), "16.5");
        assert_eq!(js_number(f64::INFINITY), "Infinity");
        assert_eq!(call("tick", 0.0), "window.__framecastVirtualTime && window.__framecastVirtualTime.tick(0)");
    }

    #[test]
    fn script_is_guarded_by_sentinel() {
        assert!(INSTALL_SCRIPT.contains(&format!("'{SENTINEL}'")));
        assert!(INSTALL_SCRIPT.contains("if (scope[SENTINEL])"));
    }

    #[tokio::test]
    async fn install_registers_and_evaluates_in_each_context() {
        let page = MockPage::new();
        page.set_contexts(vec![3, 7]);
        let identifier = install(page.as_ref()).await.expect("install");
        assert_eq!(identifier, "script-1");

        let commands = page.commands();
        assert_eq!(commands[0].0, "Page.addScriptToEvaluateOnNewDocument");
        let contexts: Vec<i64> = commands[1..]
            .iter()
            .map(|(method, params)| {
                assert_eq!(method, "Runtime.evaluate");
                params["contextId"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(contexts, vec![3, 7]);

        uninstall(page.as_ref(), &identifier).await.expect("uninstall");
        let (method, params) = page.commands().pop().unwrap();
        assert_eq!(method, "Page.removeScriptToEvaluateOnNewDocument");
        assert_eq!(params["identifier"], "script-1");
    }

    #[tokio::test]
    async fn vanished_contexts_are_skipped_but_other_errors_surface() {
        let page = MockPage::new();
        page.set_contexts(vec![4, 9]);
        page.fail(
            "Runtime.evaluate",
            AdapterError::protocol(-32000, "Cannot find context with specified id"),
        );
        tick(page.as_ref(), 50.0).await.expect("stale contexts are ignored");
        assert_eq!(page.count("Runtime.evaluate"), 2);

        page.fail(
            "Runtime.evaluate",
            AdapterError::protocol(-32000, "Internal error"),
        );
        let err = tick(page.as_ref(), 100.0).await.unwrap_err();
        assert_eq!(err.code, Some(-32000));
        assert_eq!(page.count("Runtime.evaluate"), 3);
    }

    #[tokio::test]
    async fn closed_page_fails_tick() {
        let page = MockPage::new();
        page.set_contexts(vec![1]);
        page.close();
        let err = tick(page.as_ref(), 0.0).await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::TargetClosed);
    }
}
