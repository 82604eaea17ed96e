//! Approval Hub (§4.3): a per-session queue of pending approvals plus
//! `tokio::sync::oneshot` waiters, grounded on the teacher's broadcast-fanout
//! `ws.rs::output_tx` for the "pending" notification and a oneshot per
//! ticket for `wait`/`decide` pairing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use eclia_core::{ApprovalDecision, ApprovalTicket, Error, Result};
use tokio::sync::{broadcast, oneshot, Mutex};
use uuid::Uuid;

/// Emitted whenever a ticket is enqueued; the orchestrator's SSE layer
/// subscribes to forward this as a `tool_approval_pending` side-effect.
#[derive(Clone, Debug)]
pub struct ApprovalPending {
    pub session_id: String,
    pub ticket: ApprovalTicket,
}

struct TicketState {
    ticket: ApprovalTicket,
    resolved: Option<ApprovalDecision>,
    waiter: Option<oneshot::Sender<ApprovalDecision>>,
}

/// Process-scoped singleton owning all pending approval tickets.
pub struct ApprovalHub {
    // approvalId -> state, guarded per-ticket so concurrent decide/wait don't race.
    tickets: DashMap<String, Arc<Mutex<TicketState>>>,
    // sessionId -> ordered list of approvalIds, oldest first.
    by_session: DashMap<String, Vec<String>>,
    pending_tx: broadcast::Sender<ApprovalPending>,
}

impl ApprovalHub {
    pub fn new() -> Self {
        let (pending_tx, _) = broadcast::channel(1024);
        Self {
            tickets: DashMap::new(),
            by_session: DashMap::new(),
            pending_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalPending> {
        self.pending_tx.subscribe()
    }

    /// Adds a ticket and notifies any attached watcher.
    pub fn enqueue(
        &self,
        session_id: impl Into<String>,
        reason: impl Into<String>,
        tool: impl Into<String>,
        args: serde_json::Value,
    ) -> String {
        let session_id = session_id.into();
        let approval_id = Uuid::new_v4().to_string();
        let ticket = ApprovalTicket {
            approval_id: approval_id.clone(),
            session_id: session_id.clone(),
            reason: reason.into(),
            tool: tool.into(),
            args,
            created_at: Utc::now(),
        };

        self.tickets.insert(
            approval_id.clone(),
            Arc::new(Mutex::new(TicketState {
                ticket: ticket.clone(),
                resolved: None,
                waiter: None,
            })),
        );
        self.by_session
            .entry(session_id.clone())
            .or_default()
            .push(approval_id.clone());

        let _ = self.pending_tx.send(ApprovalPending { session_id, ticket });

        approval_id
    }

    /// Sets a terminal outcome and wakes the waiter. A no-op if the ticket
    /// already resolved or doesn't exist.
    pub async fn decide(&self, approval_id: &str, decision: ApprovalDecision) -> Result<()> {
        let Some(entry) = self.tickets.get(approval_id) else {
            return Err(Error::invalid_request(format!(
                "unknown approval id: {approval_id}"
            )));
        };
        let state = entry.clone();
        drop(entry);

        let mut guard = state.lock().await;
        if guard.resolved.is_some() {
            return Ok(());
        }
        guard.resolved = Some(decision);
        if let Some(tx) = guard.waiter.take() {
            let _ = tx.send(decision);
        }
        Ok(())
    }

    /// Blocks until `decide` resolves this ticket, or `timeout` elapses —
    /// the hard 5-minute upper bound from spec §4.3, independent of any
    /// other timeout in the system.
    pub async fn wait(&self, approval_id: &str, timeout: Duration) -> Result<ApprovalDecision> {
        let Some(entry) = self.tickets.get(approval_id) else {
            return Err(Error::invalid_request(format!(
                "unknown approval id: {approval_id}"
            )));
        };
        let state = entry.clone();
        drop(entry);

        let rx = {
            let mut guard = state.lock().await;
            if let Some(decision) = guard.resolved {
                return Ok(decision);
            }
            let (tx, rx) = oneshot::channel();
            guard.waiter = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => Ok(ApprovalDecision::Cancelled),
            Err(_) => {
                // Hard timeout: resolve as Timeout ourselves, idempotently.
                let mut guard = state.lock().await;
                if guard.resolved.is_none() {
                    guard.resolved = Some(ApprovalDecision::Timeout);
                }
                Ok(guard.resolved.unwrap())
            }
        }
    }

    /// Marks all pending tickets for `session_id` as cancelled. Idempotent.
    pub async fn cancel_session(&self, session_id: &str) {
        let Some(ids) = self.by_session.get(session_id).map(|v| v.clone()) else {
            return;
        };
        for id in ids {
            let _ = self.decide(&id, ApprovalDecision::Cancelled).await;
        }
    }

    /// Snapshot of pending (unresolved) tickets for a session, oldest first.
    pub async fn pending_for_session(&self, session_id: &str) -> Vec<ApprovalTicket> {
        let Some(ids) = self.by_session.get(session_id).map(|v| v.clone()) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for id in ids {
            if let Some(entry) = self.tickets.get(&id) {
                let guard = entry.lock().await;
                if guard.resolved.is_none() {
                    out.push(guard.ticket.clone());
                }
            }
        }
        out
    }
}

impl Default for ApprovalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let hub = ApprovalHub::new();
        let id = hub.enqueue("s1", "exec rm -rf /", "exec", serde_json::json!({}));
        hub.decide(&id, ApprovalDecision::Approve).await.unwrap();
        hub.decide(&id, ApprovalDecision::Deny).await.unwrap(); // no-op
        let decision = hub.wait(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let hub = ApprovalHub::new();
        let id = hub.enqueue("s1", "reason", "exec", serde_json::json!({}));
        let decision = hub.wait(&id, Duration::from_millis(20)).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Timeout);
    }

    #[tokio::test]
    async fn cancel_session_resolves_all_pending() {
        let hub = ApprovalHub::new();
        let a = hub.enqueue("s1", "r1", "exec", serde_json::json!({}));
        let b = hub.enqueue("s1", "r2", "send", serde_json::json!({}));
        hub.cancel_session("s1").await;
        assert_eq!(
            hub.wait(&a, Duration::from_secs(1)).await.unwrap(),
            ApprovalDecision::Cancelled
        );
        assert_eq!(
            hub.wait(&b, Duration::from_secs(1)).await.unwrap(),
            ApprovalDecision::Cancelled
        );
    }

    #[tokio::test]
    async fn decide_then_wait_does_not_block() {
        let hub = ApprovalHub::new();
        let id = hub.enqueue("s1", "r", "web", serde_json::json!({}));
        hub.decide(&id, ApprovalDecision::Deny).await.unwrap();
        let decision = hub.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn pending_subscriber_sees_enqueue() {
        let hub = ApprovalHub::new();
        let mut rx = hub.subscribe();
        let id = hub.enqueue("s1", "r", "exec", serde_json::json!({"cmd":"ls"}));
        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.ticket.approval_id, id);
    }
}
