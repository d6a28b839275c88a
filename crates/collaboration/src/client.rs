/// Client-side document model
/// Pending local operations, in-order delivery of broadcasts and recovery retries
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use docops::{apply, compose, transform, DocOp};

use crate::{ClientId, CollaborationError, RecoveredOp, RecoveryConfig, Result};

/// One client's view of a document.
///
/// At most one operation is in flight. Edits made meanwhile are composed
/// into a single queued operation and sent once the in-flight one is acked.
/// The in-flight operation is kept both as sent, for resending, and rebased
/// over later broadcasts, for applying them locally.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    revision: u64,
    contents: String,
    sent: Option<(u64, DocOp)>,
    unacked: Option<DocOp>,
    queued: Option<DocOp>,
}

impl PendingQueue {
    pub fn new(revision: u64, contents: impl Into<String>) -> Self {
        Self {
            revision,
            contents: contents.into(),
            sent: None,
            unacked: None,
            queued: None,
        }
    }

    /// Last server revision this client has incorporated
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Local text, including edits the server has not acked yet
    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn has_pending(&self) -> bool {
        self.unacked.is_some() || self.queued.is_some()
    }

    pub fn local_edit(&mut self, op: DocOp) -> Result<()> {
        self.contents = apply(&op, &self.contents)?;
        self.queued = Some(match self.queued.take() {
            Some(queued) => compose(&queued, &op)?,
            None => op,
        });
        Ok(())
    }

    /// The next operation to submit with its base revision, if one may be sent now
    pub fn take_outgoing(&mut self) -> Option<(u64, DocOp)> {
        if self.unacked.is_some() {
            return None;
        }
        let op = self.queued.take()?;
        self.unacked = Some(op.clone());
        self.sent = Some((self.revision, op.clone()));
        Some((self.revision, op))
    }

    /// The in-flight operation exactly as first sent, for a retry.
    ///
    /// The server recognizes a resend by its base revision and acks the
    /// revision it already recorded instead of applying it twice.
    pub fn resend(&self) -> Option<(u64, DocOp)> {
        self.sent.clone()
    }

    /// Revision to recover from and the operation to resend with the request
    pub fn recovery_request(&self) -> (u64, Option<DocOp>) {
        match &self.sent {
            Some((base, op)) => (*base, Some(op.clone())),
            None => (self.revision, None),
        }
    }

    pub fn on_ack(&mut self, applied_revision: u64) -> Result<()> {
        if self.unacked.take().is_none() {
            return Err(CollaborationError::IncompatibleOperation(format!(
                "ack for revision {} with nothing in flight",
                applied_revision
            )));
        }
        self.sent = None;
        self.revision = applied_revision;
        Ok(())
    }

    /// Incorporate another client's operation, which must be the next revision
    pub fn on_broadcast(&mut self, applied_revision: u64, op: &DocOp) -> Result<()> {
        if applied_revision != self.revision + 1 {
            return Err(CollaborationError::IncompatibleOperation(format!(
                "expected revision {} but got {}",
                self.revision + 1,
                applied_revision
            )));
        }
        self.rebase_and_apply(op.clone())?;
        self.revision = applied_revision;
        Ok(())
    }

    /// Incorporate the individual operations of a recovery response.
    ///
    /// Revisions already seen are skipped. The client's own in-flight
    /// operation, if the server recorded it, counts as its ack.
    pub fn on_recovered_operations(&mut self, operations: &[RecoveredOp], me: ClientId) -> Result<()> {
        for recovered in operations {
            if recovered.applied_revision <= self.revision {
                continue;
            }
            if recovered.author_client_id == me && self.unacked.is_some() {
                self.on_ack(recovered.applied_revision)?;
            } else {
                self.on_broadcast(recovered.applied_revision, &recovered.op)?;
            }
        }
        Ok(())
    }

    /// Start over from a fresh snapshot after the server refused the
    /// in-flight operation for good.
    ///
    /// Returns the local edits that were dropped, composed into one
    /// operation against the text the client last had from the server.
    pub fn reset(&mut self, revision: u64, contents: impl Into<String>) -> Result<Option<DocOp>> {
        let dropped = match (self.unacked.take(), self.queued.take()) {
            (Some(unacked), Some(queued)) => Some(compose(&unacked, &queued)?),
            (unacked, queued) => unacked.or(queued),
        };
        self.sent = None;
        self.revision = revision;
        self.contents = contents.into();
        Ok(dropped)
    }

    /// Incorporate a composed recovery response; only valid with nothing in flight
    pub fn on_recovered(&mut self, composed: &DocOp, new_revision: u64) -> Result<()> {
        if self.unacked.is_some() {
            return Err(CollaborationError::IncompatibleOperation(
                "cannot recover while an operation is in flight".to_string(),
            ));
        }
        self.rebase_and_apply(composed.clone())?;
        self.revision = new_revision;
        Ok(())
    }

    fn rebase_and_apply(&mut self, mut server: DocOp) -> Result<()> {
        // The server op is already ordered, so it goes first on ties
        for pending in [&mut self.unacked, &mut self.queued] {
            if let Some(local) = pending.as_ref() {
                let (server_prime, local_prime) = transform(&server, local)?;
                *pending = Some(local_prime);
                server = server_prime;
            }
        }
        self.contents = apply(&server, &self.contents)?;
        Ok(())
    }
}

/// Releases revision-numbered items strictly in order
#[derive(Debug)]
pub struct Reorderer<T> {
    next: u64,
    buffered: BTreeMap<u64, T>,
    gap_since: Option<Instant>,
    gap_timeout: Duration,
}

impl<T> Reorderer<T> {
    pub fn new(next: u64, gap_timeout: Duration) -> Self {
        Self {
            next,
            buffered: BTreeMap::new(),
            gap_since: None,
            gap_timeout,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Accept one item; returns everything that is now in order
    pub fn push(&mut self, revision: u64, item: T) -> Vec<T> {
        if revision < self.next {
            tracing::debug!("dropping duplicate revision {}", revision);
            return Vec::new();
        }
        self.buffered.insert(revision, item);
        self.release()
    }

    /// Forget everything before `next`, e.g. after a recovery response
    pub fn skip_to(&mut self, next: u64) -> Vec<T> {
        self.buffered = self.buffered.split_off(&next);
        self.next = self.next.max(next);
        self.release()
    }

    /// True once a gap has stayed open longer than the timeout
    pub fn needs_recovery(&self, now: Instant) -> bool {
        self.gap_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.gap_timeout)
    }

    fn release(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.buffered.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        self.gap_since = if self.buffered.is_empty() {
            None
        } else {
            self.gap_since.or_else(|| Some(Instant::now()))
        };
        ready
    }
}

/// Retry schedule for recovery requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl From<&RecoveryConfig> for RecoveryPolicy {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl RecoveryPolicy {
    /// Run `attempt` until it succeeds, fails for good, or retries run out
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    tracing::warn!(
                        "recovery attempt failed ({}), retry {}/{}",
                        e,
                        retries,
                        self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docops::DocOpBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_local_edits_compose_while_in_flight() {
        let mut queue = PendingQueue::new(0, "abc");
        queue
            .local_edit(DocOpBuilder::new().insert("1").retain(3, false).build())
            .unwrap();
        let (base, first) = queue.take_outgoing().unwrap();
        assert_eq!(base, 0);
        assert_eq!(apply(&first, "abc").unwrap(), "1abc");

        queue
            .local_edit(DocOpBuilder::new().retain(4, false).insert("2").build())
            .unwrap();
        queue
            .local_edit(DocOpBuilder::new().retain(5, false).insert("3").build())
            .unwrap();
        assert!(queue.take_outgoing().is_none());

        queue.on_ack(1).unwrap();
        let (base, second) = queue.take_outgoing().unwrap();
        assert_eq!(base, 1);
        assert_eq!(apply(&second, "1abc").unwrap(), "1abc23");
        assert_eq!(queue.contents(), "1abc23");
    }

    #[test]
    fn test_broadcast_rebases_pending() {
        let mut queue = PendingQueue::new(0, "abc");
        queue
            .local_edit(DocOpBuilder::new().retain(3, false).insert("Y").build())
            .unwrap();
        queue.take_outgoing().unwrap();

        // Another client's prepend was ordered first on the server
        let server = DocOpBuilder::new().insert("X").retain(3, false).build();
        queue.on_broadcast(1, &server).unwrap();
        assert_eq!(queue.contents(), "XabcY");
        assert_eq!(queue.revision(), 1);

        queue.on_ack(2).unwrap();
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_broadcast_out_of_order_rejected() {
        let mut queue = PendingQueue::new(4, "");
        let op = DocOpBuilder::new().insert("x").build();
        assert!(queue.on_broadcast(6, &op).is_err());
        assert!(queue.on_ack(5).is_err());
    }

    #[test]
    fn test_resend_keeps_original_base() {
        let mut queue = PendingQueue::new(0, "abc");
        assert!(queue.resend().is_none());
        assert_eq!(queue.recovery_request(), (0, None));

        let op = DocOpBuilder::new().retain(3, false).insert("Y").build();
        queue.local_edit(op.clone()).unwrap();
        queue.take_outgoing().unwrap();

        let server = DocOpBuilder::new().insert("X").retain(3, false).build();
        queue.on_broadcast(1, &server).unwrap();
        assert_eq!(queue.resend(), Some((0, op.clone())));
        assert_eq!(queue.recovery_request(), (0, Some(op)));

        queue.on_ack(2).unwrap();
        assert!(queue.resend().is_none());
        assert_eq!(queue.recovery_request(), (2, None));
    }

    #[test]
    fn test_recovered_operations_ack_own_op() {
        let me = ClientId::new();
        let other = ClientId::new();
        let mut queue = PendingQueue::new(0, "abc");
        queue
            .local_edit(DocOpBuilder::new().retain(3, false).insert("Y").build())
            .unwrap();
        queue.take_outgoing().unwrap();

        let first = DocOpBuilder::new().insert("X").retain(3, false).build();
        queue.on_broadcast(1, &first).unwrap();
        queue
            .local_edit(DocOpBuilder::new().retain(5, false).insert("Z").build())
            .unwrap();

        let operations = vec![
            RecoveredOp {
                applied_revision: 1,
                op: first,
                author_client_id: other,
            },
            RecoveredOp {
                applied_revision: 2,
                op: DocOpBuilder::new().retain(4, false).insert("Y").build(),
                author_client_id: me,
            },
            RecoveredOp {
                applied_revision: 3,
                op: DocOpBuilder::new().retain(5, false).insert("W").build(),
                author_client_id: other,
            },
        ];
        queue.on_recovered_operations(&operations, me).unwrap();

        assert_eq!(queue.revision(), 3);
        assert_eq!(queue.contents(), "XabcYWZ");
        assert!(queue.resend().is_none());
        let (base, next) = queue.take_outgoing().unwrap();
        assert_eq!(base, 3);
        assert_eq!(apply(&next, "XabcYW").unwrap(), "XabcYWZ");
    }

    #[test]
    fn test_recovered_with_op_in_flight_rejected() {
        let mut queue = PendingQueue::new(0, "");
        queue.local_edit(DocOpBuilder::new().insert("a").build()).unwrap();
        queue.take_outgoing().unwrap();
        let op = DocOpBuilder::new().insert("b").build();
        assert!(queue.on_recovered(&op, 1).is_err());
    }

    #[test]
    fn test_reset_drops_local_edits() {
        let mut queue = PendingQueue::new(0, "abc");
        queue
            .local_edit(DocOpBuilder::new().insert("1").retain(3, false).build())
            .unwrap();
        queue.take_outgoing().unwrap();
        queue
            .local_edit(DocOpBuilder::new().retain(4, false).insert("2").build())
            .unwrap();

        let dropped = queue.reset(7, "fresh").unwrap().unwrap();
        assert_eq!(apply(&dropped, "abc").unwrap(), "1abc2");
        assert_eq!(queue.revision(), 7);
        assert_eq!(queue.contents(), "fresh");
        assert!(!queue.has_pending());
        assert!(queue.resend().is_none());
        assert!(queue.reset(8, "again").unwrap().is_none());
    }

    #[test]
    fn test_reorderer_releases_in_order() {
        let mut reorderer = Reorderer::new(1, Duration::from_millis(50));
        assert_eq!(reorderer.push(2, "b"), Vec::<&str>::new());
        assert_eq!(reorderer.push(3, "c"), Vec::<&str>::new());
        assert!(!reorderer.needs_recovery(Instant::now()));
        assert!(reorderer.needs_recovery(Instant::now() + Duration::from_millis(100)));

        assert_eq!(reorderer.push(1, "a"), vec!["a", "b", "c"]);
        assert_eq!(reorderer.next_expected(), 4);
        assert!(!reorderer.needs_recovery(Instant::now() + Duration::from_secs(10)));

        assert!(reorderer.push(2, "dup").is_empty());
    }

    #[test]
    fn test_reorderer_skip_to() {
        let mut reorderer = Reorderer::new(1, Duration::from_millis(50));
        reorderer.push(3, "c");
        reorderer.push(6, "f");
        assert_eq!(reorderer.skip_to(5), Vec::<&str>::new());
        assert_eq!(reorderer.push(5, "e"), vec!["e", "f"]);
    }

    #[tokio::test]
    async fn test_recovery_retries_transient_failures() {
        let policy = RecoveryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CollaborationError::TransientFailure("busy".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovery_gives_up() {
        let policy = RecoveryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CollaborationError::TransientFailure("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CollaborationError::StaleBaseRevision {
                    base: 1,
                    horizon: 5,
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
