//! Approval gate for high-risk plans

use crate::error::{RemediationError, Result};
use crate::models::RemediationPlan;
use crate::risk::MAX_RISK_SCORE;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// State of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for votes
    Pending,
    /// Enough approvals recorded
    Approved,
    /// Approved without human involvement
    AutoApproved,
    /// An approver voted against
    Rejected,
    /// The window closed before enough approvals arrived
    Expired,
}

/// One recorded vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalVote {
    /// Who voted
    pub approver: String,
    /// For or against
    pub approved: bool,
    /// Free-form comment
    #[serde(default)]
    pub comment: Option<String>,
    /// When the vote was cast
    pub timestamp: DateTime<Utc>,
}

/// Approval record of one plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier
    pub id: String,
    /// Plan awaiting approval
    pub plan_id: String,
    /// Risk score at request time
    pub risk_score: f64,
    /// Current state
    pub status: ApprovalStatus,
    /// Approvals needed
    pub min_approvers: u32,
    /// Allowed approvers; empty allows anyone
    pub approvers: Vec<String>,
    /// Votes in arrival order
    pub votes: Vec<ApprovalVote>,
    /// Request time
    pub requested_at: DateTime<Utc>,
    /// Votes after this instant are refused
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    fn approval_count(&self) -> usize {
        self.votes.iter().filter(|v| v.approved).count()
    }

    fn is_granted(&self) -> bool {
        matches!(
            self.status,
            ApprovalStatus::Approved | ApprovalStatus::AutoApproved
        )
    }
}

/// Tracks approvals of plans whose risk crosses the auto-approval threshold
pub struct ApprovalManager {
    threshold: f64,
    requests: RwLock<HashMap<String, ApprovalRequest>>,
}

impl ApprovalManager {
    /// Create a manager; plans scoring strictly below `threshold` auto-approve
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Auto-approval threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Ask for approval of a plan
    ///
    /// Returns `Ok(true)` when the plan is approved, either automatically or
    /// by earlier votes. Otherwise the plan is parked and an error tells the
    /// caller why it may not proceed. Repeated calls never create a second
    /// record.
    pub async fn request_approval(&self, plan: &RemediationPlan) -> Result<bool> {
        let mut requests = self.requests.write().await;

        if let Some(request) = requests.get_mut(&plan.id) {
            Self::expire_if_due(request, Utc::now());
            return match request.status {
                ApprovalStatus::Approved | ApprovalStatus::AutoApproved => Ok(true),
                ApprovalStatus::Pending => Err(RemediationError::ApprovalRequired {
                    plan_id: plan.id.clone(),
                    risk_score: request.risk_score,
                }),
                ApprovalStatus::Rejected => Err(RemediationError::ApprovalRejected(plan.id.clone())),
                ApprovalStatus::Expired => Err(RemediationError::ApprovalExpired(plan.id.clone())),
            };
        }

        let risk_score = plan.risk_score();
        let auto = !plan.requires_approval && risk_score.is_some_and(|r| r < self.threshold);
        let risk_score = risk_score.unwrap_or(MAX_RISK_SCORE);
        let now = Utc::now();
        let timeout_secs = plan.approval_config.timeout_secs.min(i64::MAX as u64 / 1_000);
        let timeout = Duration::seconds(timeout_secs as i64);

        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan.id.clone(),
            risk_score,
            status: if auto {
                ApprovalStatus::AutoApproved
            } else {
                ApprovalStatus::Pending
            },
            min_approvers: plan.approval_config.min_approvers,
            approvers: plan.approval_config.approvers.clone(),
            votes: Vec::new(),
            requested_at: now,
            expires_at: now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        requests.insert(plan.id.clone(), request);

        if auto {
            info!(plan_id = %plan.id, risk_score, threshold = self.threshold, "Plan auto-approved");
            Ok(true)
        } else {
            info!(plan_id = %plan.id, risk_score, threshold = self.threshold, "Plan requires manual approval");
            Err(RemediationError::ApprovalRequired {
                plan_id: plan.id.clone(),
                risk_score,
            })
        }
    }

    /// Record one vote on a pending request
    pub async fn add_approval(
        &self,
        plan_id: &str,
        approver: &str,
        approve: bool,
        comment: Option<String>,
    ) -> Result<ApprovalStatus> {
        self.add_approval_at(plan_id, approver, approve, comment, Utc::now())
            .await
    }

    pub(crate) async fn add_approval_at(
        &self,
        plan_id: &str,
        approver: &str,
        approve: bool,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStatus> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(plan_id)
            .ok_or_else(|| RemediationError::NotFound(format!("approval request for plan {plan_id}")))?;

        Self::expire_if_due(request, now);
        match request.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Expired => {
                warn!(plan_id, approver, "Vote after approval timeout refused");
                return Err(RemediationError::ApprovalExpired(plan_id.to_string()));
            }
            status => {
                return Err(RemediationError::InvalidApproval(format!(
                    "plan {plan_id} is already {status:?}"
                )))
            }
        }

        if !request.approvers.is_empty() && !request.approvers.iter().any(|a| a == approver) {
            return Err(RemediationError::InvalidApproval(format!(
                "{approver} is not an allowed approver for plan {plan_id}"
            )));
        }
        if request.votes.iter().any(|v| v.approver == approver) {
            return Err(RemediationError::InvalidApproval(format!(
                "{approver} has already voted on plan {plan_id}"
            )));
        }

        request.votes.push(ApprovalVote {
            approver: approver.to_string(),
            approved: approve,
            comment,
            timestamp: now,
        });

        if !approve {
            request.status = ApprovalStatus::Rejected;
        } else if request.approval_count() >= request.min_approvers as usize {
            request.status = ApprovalStatus::Approved;
        }

        info!(
            plan_id,
            approver,
            approve,
            approvals = request.approval_count(),
            required = request.min_approvers,
            status = ?request.status,
            "Approval vote recorded"
        );
        Ok(request.status)
    }

    /// Whether the plan may proceed
    pub async fn is_approved(&self, plan_id: &str) -> bool {
        self.requests
            .read()
            .await
            .get(plan_id)
            .is_some_and(ApprovalRequest::is_granted)
    }

    /// Approval record of a plan
    pub async fn get_request(&self, plan_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(plan_id).cloned()
    }

    /// Plans waiting on votes
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    fn expire_if_due(request: &mut ApprovalRequest, now: DateTime<Utc>) {
        if request.status == ApprovalStatus::Pending && now > request.expires_at {
            warn!(plan_id = %request.plan_id, "Approval request expired");
            request.status = ApprovalStatus::Expired;
        }
    }
}
