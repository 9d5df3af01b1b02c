// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Last resort boundary around spawned pipeline tasks.
//!
//! A panic inside a plugin leaves its internal state unknown, so it is not recovered: the
//! panic surfaces through the task's [`JoinError`] and goes to the [`FatalHandler`], which by
//! default logs and terminates the process. The panic hook has already printed the location
//! and, with `RUST_BACKTRACE` set, the backtrace of the panicking thread.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Receives a description of an unrecoverable failure.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[must_use]
pub fn exit_process() -> FatalHandler {
    Arc::new(|msg: &str| {
        error!("[agent] FATAL: {msg}");
        std::process::exit(1);
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Joins tasks of one pipeline run. The first panic is recorded, cancels `abort` so the
/// remaining stages drain, and goes to the fatal handler.
#[derive(Clone)]
pub(crate) struct Supervisor {
    fatal: FatalHandler,
    abort: CancellationToken,
    failure: Arc<OnceLock<String>>,
}

impl Supervisor {
    pub(crate) fn new(fatal: FatalHandler, abort: CancellationToken) -> Self {
        Self {
            fatal,
            abort,
            failure: Arc::new(OnceLock::new()),
        }
    }

    /// Cancelled when the run is stopped from outside or a task panicked.
    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Description of the first panic seen, if any.
    pub(crate) fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Unwraps a joined task result. Panics go to the fatal handler and yield `None`.
    pub(crate) fn check<T>(&self, result: Result<T, JoinError>, task: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let msg = format!("{task} panicked: {}", panic_message(payload.as_ref()));
                let _ = self.failure.set(msg.clone());
                (self.fatal)(&msg);
                self.abort.cancel();
                None
            }
            Err(e) => {
                error!("[agent] {task} did not complete: {e}");
                None
            }
        }
    }

    /// Spawns `future` and checks its result as soon as it ends, not when the returned
    /// handle is joined.
    pub(crate) fn spawn<F>(&self, task: String, future: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = tokio::spawn(future);
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.check(inner.await, &task) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (Supervisor, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let fatal: FatalHandler = Arc::new(move |msg: &str| sink.lock().unwrap().push(msg.to_string()));
        (Supervisor::new(fatal, CancellationToken::new()), seen)
    }

    #[tokio::test]
    async fn test_panic_reaches_fatal_handler() {
        let (supervisor, seen) = recording();

        let result = tokio::spawn(async { 7 }).await;
        assert_eq!(supervisor.check(result, "ok"), Some(7));
        assert!(!supervisor.abort_token().is_cancelled());

        let result = tokio::spawn(async { panic!("disk exploded") }).await;
        assert!(supervisor.check::<()>(result, "gather in inputs.disk").is_none());

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["gather in inputs.disk panicked: disk exploded".to_string()]
        );
        assert!(supervisor.abort_token().is_cancelled());
        assert_eq!(
            supervisor.failure(),
            Some("gather in inputs.disk panicked: disk exploded")
        );
    }

    #[tokio::test]
    async fn test_spawned_panic_is_reported_before_join() {
        let (supervisor, seen) = recording();
        let handle = supervisor.spawn("processor processors.bad".to_string(), async {
            panic!("bad state");
        });
        supervisor.abort_token().cancelled().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_failure_is_kept() {
        let (supervisor, seen) = recording();
        for name in ["first", "second"] {
            let result = tokio::spawn(async move { panic!("{name}") }).await;
            supervisor.check::<()>(result, name);
        }
        assert_eq!(supervisor.failure(), Some("first panicked: first"));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
