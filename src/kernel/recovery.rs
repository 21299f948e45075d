//! Panic containment for capability calls.
//!
//! Tool implementations are foreign code. A panic inside `start` or `probe`
//! becomes an `Internal` error for that tool, so the dispatcher still delivers
//! a completion and the control loop keeps running.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result, ToolId};

/// Await one capability call, converting a panic into `Error::Internal`.
pub async fn with_recovery<F, T>(call: F, tool: &ToolId, operation: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                "capability_panicked: tool={}, operation={}, panic={}",
                tool,
                operation,
                message
            );
            Err(Error::internal(format!(
                "{} panicked during {}: {}",
                tool, operation, message
            )))
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
