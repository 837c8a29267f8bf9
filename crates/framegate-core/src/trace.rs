//! Distributed-trace context: deadline, labels, cancellation.
//!
//! A [`Trace`] travels with every call. The bridge serializes its deadline
//! and labels into handshake meta; the gateway reconstructs them on the far
//! side. Cancellation and deadline expiry share one signal: the trace going
//! inactive. Delivery races (response vs. deadline vs. teardown) are
//! resolved by the one-shot [`Finalizer`] handed out by
//! [`Trace::once_inactive`] — the first path to finish it wins.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use framegate_proto::{
    SystemError, WireError, codes,
    wire::{self, WireCursor},
};

/// Errors serializing or deserializing trace context.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A label value could not be rendered as JSON.
    #[error("trace labels are not serializable: {0}")]
    Labels(#[from] serde_json::Error),

    /// The meta bytes did not decode.
    #[error("trace meta decode failed: {0}")]
    Meta(#[from] WireError),

    /// The deadline value cannot be represented.
    #[error("trace deadline out of range: {millis}")]
    DeadlineRange {
        /// The offending wire value.
        millis: i64,
    },
}

/// One-shot delivery guard.
///
/// [`Finalizer::finish`] returns `true` exactly once across all clones;
/// whichever of the racing completion paths calls it first owns delivery.
/// The winning claim also aborts the watcher task behind the
/// [`Trace::once_inactive`] registration, so a call that completes
/// normally does not leave a task parked on a trace that never expires.
#[derive(Debug, Clone)]
pub struct Finalizer {
    delivered: Arc<AtomicBool>,
    watcher: AbortHandle,
}

impl Finalizer {
    fn new(watcher: AbortHandle) -> Self {
        Self { delivered: Arc::new(AtomicBool::new(false)), watcher }
    }

    /// Claim delivery. `true` on the first call, `false` afterwards.
    ///
    /// The first claim reaps the inactivity watcher; its handler will not
    /// fire after this returns `true`.
    pub fn finish(&self) -> bool {
        let first = !self.delivered.swap(true, Ordering::SeqCst);
        if first {
            self.watcher.abort();
        }
        first
    }
}

/// Shared trace handle. Clones refer to the same trace.
#[derive(Debug, Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

#[derive(Debug)]
struct TraceInner {
    deadline: Option<SystemTime>,
    labels: Mutex<HashMap<String, Value>>,
    token: CancellationToken,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    /// A trace with no deadline.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A trace expiring at an absolute instant.
    pub fn with_deadline(deadline: SystemTime) -> Self {
        Self::build(Some(deadline))
    }

    /// A trace expiring after `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(SystemTime::now() + timeout))
    }

    fn build(deadline: Option<SystemTime>) -> Self {
        Self {
            inner: Arc::new(TraceInner {
                deadline,
                labels: Mutex::new(HashMap::new()),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Absolute deadline, if any.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.inner.deadline
    }

    /// Whether the trace is still live: not cancelled and not past its
    /// deadline.
    pub fn active(&self) -> bool {
        if self.inner.token.is_cancelled() {
            return false;
        }
        match self.inner.deadline {
            Some(deadline) => SystemTime::now() < deadline,
            None => true,
        }
    }

    /// Cancel the trace, waking every registered handler.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Snapshot of the trace labels.
    pub fn labels(&self) -> HashMap<String, Value> {
        match self.inner.labels.lock() {
            Ok(labels) => labels.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Set one label.
    pub fn set_label(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut labels) = self.inner.labels.lock() {
            labels.insert(key.into(), value);
        }
    }

    /// Merge a batch of labels into the trace.
    pub fn merge_labels(&self, incoming: HashMap<String, Value>) {
        if let Ok(mut labels) = self.inner.labels.lock() {
            labels.extend(incoming);
        }
    }

    /// Register a handler invoked once when the trace goes inactive
    /// (deadline reached or cancelled), and return the delivery guard.
    ///
    /// The handler always runs on the executor, never inline, so
    /// registering from inside a lock is safe even when the trace is
    /// already inactive. The watcher task lives only as long as the
    /// registration is undecided: the first [`Finalizer::finish`] claim
    /// aborts it, so a deadline-less trace that is never cancelled does
    /// not pin the handler's captures forever.
    pub fn once_inactive(&self, handler: impl FnOnce() + Send + 'static) -> Finalizer {
        let token = self.inner.token.clone();
        let sleep_for = self.inner.deadline.map(|deadline| {
            deadline.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)
        });
        let watcher = tokio::spawn(async move {
            match sleep_for {
                Some(duration) => {
                    tokio::select! {
                        () = token.cancelled() => {},
                        () = tokio::time::sleep(duration) => {},
                    }
                },
                None => token.cancelled().await,
            }
            handler();
        });
        Finalizer::new(watcher.abort_handle())
    }

    /// The timeout error a call completes with when this trace expires.
    pub fn deadline_error(&self) -> SystemError {
        SystemError::new(codes::DEADLINE_EXCEEDED, "trace went inactive before a response arrived")
    }

    /// Serialize the labels for the `avro.trace.labels` meta slot.
    pub fn encode_labels(&self) -> Result<Bytes, TraceError> {
        let labels = self.labels();
        let mut rendered = HashMap::with_capacity(labels.len());
        for (key, value) in labels {
            rendered.insert(key, serde_json::to_string(&value)?);
        }
        let mut buf = BytesMut::new();
        wire::write_string_map(&mut buf, &rendered);
        Ok(buf.freeze())
    }

    /// Parse an `avro.trace.labels` meta value.
    pub fn decode_labels(buf: &[u8]) -> Result<HashMap<String, Value>, TraceError> {
        let mut cur = WireCursor::new(buf);
        let raw = cur.read_string_map()?;
        let mut labels = HashMap::with_capacity(raw.len());
        for (key, text) in raw {
            labels.insert(key, serde_json::from_str(&text)?);
        }
        Ok(labels)
    }

    /// Serialize an absolute deadline for the `avro.trace.deadline` slot
    /// (long, milliseconds since the Unix epoch).
    pub fn encode_deadline(deadline: SystemTime) -> Bytes {
        let millis = deadline
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        let mut buf = BytesMut::new();
        wire::write_long(&mut buf, millis);
        buf.freeze()
    }

    /// Parse an `avro.trace.deadline` meta value.
    pub fn decode_deadline(buf: &[u8]) -> Result<SystemTime, TraceError> {
        let mut cur = WireCursor::new(buf);
        let millis = cur.read_long()?;
        let offset =
            u64::try_from(millis).map_err(|_| TraceError::DeadlineRange { millis })?;
        Ok(SystemTime::UNIX_EPOCH + Duration::from_millis(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_fires_handler_once() {
        let trace = Trace::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        trace.once_inactive(move || {
            let _ = tx.send(());
        });

        assert!(trace.active());
        trace.cancel();
        rx.recv().await.unwrap();
        assert!(!trace.active());
        // No second firing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deadline_expiry_fires_handler() {
        let trace = Trace::with_timeout(Duration::from_millis(10));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        trace.once_inactive(move || {
            let _ = tx.send(());
        });
        rx.recv().await.unwrap();
        assert!(!trace.active());
    }

    #[tokio::test]
    async fn already_inactive_trace_still_fires() {
        let trace = Trace::new();
        trace.cancel();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        trace.once_inactive(move || {
            let _ = tx.send(());
        });
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn finalizer_claims_exactly_once() {
        let trace = Trace::new();
        let finalizer = trace.once_inactive(|| {});
        let clone = finalizer.clone();
        assert!(finalizer.finish());
        assert!(!finalizer.finish());
        assert!(!clone.finish());
    }

    #[tokio::test]
    async fn finish_reaps_the_watcher() {
        let trace = Trace::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let finalizer = trace.once_inactive(move || {
            let _ = tx.send(());
        });

        assert!(finalizer.finish());
        tokio::task::yield_now().await;

        // The watcher is gone: cancelling the trace no longer fires the
        // handler.
        trace.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn labels_round_trip() {
        let trace = Trace::new();
        trace.set_label("peer", Value::String("gateway-1".to_string()));
        trace.set_label("attempt", Value::from(2));

        let encoded = trace.encode_labels().unwrap();
        let decoded = Trace::decode_labels(&encoded).unwrap();
        assert_eq!(decoded, trace.labels());
    }

    #[test]
    fn deadline_round_trip() {
        let deadline = SystemTime::UNIX_EPOCH + Duration::from_millis(1_712_345_678_901);
        let encoded = Trace::encode_deadline(deadline);
        assert_eq!(Trace::decode_deadline(&encoded).unwrap(), deadline);
    }

    #[test]
    fn negative_deadline_rejected() {
        let mut buf = BytesMut::new();
        wire::write_long(&mut buf, -5);
        assert!(matches!(
            Trace::decode_deadline(&buf),
            Err(TraceError::DeadlineRange { millis: -5 })
        ));
    }
}
