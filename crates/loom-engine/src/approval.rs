//! Plan approval: how a submitted plan gets a yes or no.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use loom_core::ids::SessionId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanDecision {
    Approved,
    Rejected { feedback: Option<String> },
}

impl PlanDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Decides on plans submitted through `ExitPlanMode`.
#[async_trait]
pub trait PlanApprover: Send + Sync {
    async fn decide(&self, session_id: &SessionId, plan: &str) -> PlanDecision;
}

/// Approves everything. For unattended runs.
pub struct AutoApprove;

#[async_trait]
impl PlanApprover for AutoApprove {
    async fn decide(&self, _session_id: &SessionId, _plan: &str) -> PlanDecision {
        PlanDecision::Approved
    }
}

/// Rejects everything, keeping the session in plan mode.
pub struct AutoReject;

#[async_trait]
impl PlanApprover for AutoReject {
    async fn decide(&self, _session_id: &SessionId, _plan: &str) -> PlanDecision {
        PlanDecision::Rejected { feedback: None }
    }
}

/// A pending decision handed to whoever is on the other end of a [`ChannelApprover`].
#[derive(Debug)]
pub struct ApprovalRequest {
    pub session_id: SessionId,
    pub plan: String,
    pub reply: oneshot::Sender<PlanDecision>,
}

/// Forwards each plan over a channel and waits for the reply.
///
/// A closed channel or a dropped reply sender counts as a rejection.
pub struct ChannelApprover {
    tx: mpsc::Sender<ApprovalRequest>,
}

impl ChannelApprover {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PlanApprover for ChannelApprover {
    async fn decide(&self, session_id: &SessionId, plan: &str) -> PlanDecision {
        let (reply, answer) = oneshot::channel();
        let request = ApprovalRequest {
            session_id: session_id.clone(),
            plan: plan.to_string(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            warn!(session_id = %session_id, "approval channel closed, treating plan as rejected");
            return PlanDecision::Rejected { feedback: None };
        }
        answer.await.unwrap_or_else(|_| {
            warn!(session_id = %session_id, "approval reply dropped, treating plan as rejected");
            PlanDecision::Rejected { feedback: None }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_approvers() {
        let id = SessionId::new();
        assert!(AutoApprove.decide(&id, "plan").await.is_approved());
        assert_eq!(
            AutoReject.decide(&id, "plan").await,
            PlanDecision::Rejected { feedback: None }
        );
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let (approver, mut rx) = ChannelApprover::new(1);
        let id = SessionId::new();
        let responder = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.plan, "1. read\n2. edit");
            request
                .reply
                .send(PlanDecision::Rejected {
                    feedback: Some("use smaller steps".into()),
                })
                .unwrap();
            request.session_id
        });

        let decision = approver.decide(&id, "1. read\n2. edit").await;
        assert_eq!(
            decision,
            PlanDecision::Rejected {
                feedback: Some("use smaller steps".into())
            }
        );
        assert_eq!(responder.await.unwrap(), id);
    }

    #[tokio::test]
    async fn closed_channel_rejects() {
        let (approver, rx) = ChannelApprover::new(1);
        drop(rx);
        assert!(!approver.decide(&SessionId::new(), "p").await.is_approved());
    }

    #[tokio::test]
    async fn dropped_reply_rejects() {
        let (approver, mut rx) = ChannelApprover::new(1);
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            drop(request.reply);
        });
        assert!(!approver.decide(&SessionId::new(), "p").await.is_approved());
    }
}
