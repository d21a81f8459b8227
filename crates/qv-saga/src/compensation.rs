//! Compensation stack: named undo actions, executed LIFO.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use qv_common::QuiverError;

pub type CompensationFn = Arc<dyn Fn() -> BoxFuture<'static, qv_common::Result<()>> + Send + Sync>;

/// LIFO stack of compensating actions for one saga instance.
///
/// `compensate` pops and runs every action in reverse registration order
/// and is a no-op on an empty stack. With `stop_on_first_error` the first
/// failure aborts the run; otherwise every action is attempted and the
/// failures are aggregated.
#[derive(Default)]
pub struct CompensationStack {
    actions: Vec<(String, CompensationFn)>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, action: CompensationFn) {
        let name = name.into();
        debug!(compensation = %name, "compensation registered");
        self.actions.push((name, action));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drop actions registered after `len`; used to unwind registrations
    /// from an attempt that did not persist.
    pub fn truncate(&mut self, len: usize) {
        self.actions.truncate(len);
    }

    pub async fn compensate(&mut self, stop_on_first_error: bool) -> qv_common::Result<()> {
        let mut failures: Vec<String> = Vec::new();

        while let Some((name, action)) = self.actions.pop() {
            debug!(compensation = %name, "running compensation");
            if let Err(error) = action().await {
                warn!(compensation = %name, %error, "compensation failed");
                failures.push(format!("{name}: {error}"));
                if stop_on_first_error {
                    break;
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(QuiverError::HandlerFailed(format!(
                "compensation failed: {}",
                failures.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail: bool,
    ) -> CompensationFn {
        let log = log.clone();
        Arc::new(move || {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(name);
                if fail {
                    Err(QuiverError::handler(format!("{name} refused")))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn empty_stack_is_a_no_op() {
        let mut stack = CompensationStack::new();
        assert!(stack.compensate(false).await.is_ok());
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn actions_run_in_lifo_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.add("first", recording(&log, "first", false));
        stack.add("second", recording(&log, "second", false));
        stack.add("third", recording(&log, "third", false));

        stack.compensate(false).await.unwrap();
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn stop_on_first_error_aborts_the_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.add("first", recording(&log, "first", false));
        stack.add("second", recording(&log, "second", true));
        stack.add("third", recording(&log, "third", false));

        let error = stack.compensate(true).await.unwrap_err();
        assert!(error.to_string().contains("second"));
        // "first" was never reached
        assert_eq!(*log.lock(), vec!["third", "second"]);
    }

    #[tokio::test]
    async fn all_actions_attempted_and_errors_aggregated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.add("first", recording(&log, "first", true));
        stack.add("second", recording(&log, "second", false));
        stack.add("third", recording(&log, "third", true));

        let error = stack.compensate(false).await.unwrap_err();
        let text = error.to_string();
        assert!(text.contains("third") && text.contains("first"));
        assert!(!text.contains("second:"));
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn compensate_twice_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();
        stack.add("only", recording(&log, "only", false));

        stack.compensate(false).await.unwrap();
        stack.compensate(false).await.unwrap();
        assert_eq!(*log.lock(), vec!["only"]);
    }
}
