// src/workflow.rs
use std::sync::Arc;

use metrics::counter;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entry::validate_amount;
use crate::ledger::abort;
use crate::{
    AuditAction, AuditEvent, AuditObserver, BalanceRecord, BankAccountRegistry, Caller, Ledger,
    LedgerEntry, LedgerError, LedgerTransaction, Page, Pagination, Posting, Reference, Resolution,
    TracingAudit, TransactionType, WithdrawalFilter, WithdrawalPolicy, WithdrawalRequest,
    WithdrawalStatus,
};

/// Admin decision on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn target(self) -> WithdrawalStatus {
        match self {
            Decision::Approve => WithdrawalStatus::Completed,
            Decision::Reject => WithdrawalStatus::Rejected,
        }
    }

    fn action(self) -> AuditAction {
        match self {
            Decision::Approve => AuditAction::WithdrawalApproved,
            Decision::Reject => AuditAction::WithdrawalRejected,
        }
    }
}

fn record_outcome(outcome: &'static str) {
    counter!("saldo.withdrawals.total", "outcome" => outcome).increment(1);
}

/// Drives withdrawal requests from creation to completion or rejection.
///
/// Funds are held (debited) when the request is made, so two requests can
/// never spend the same balance. Approval only confirms the hold; rejection
/// credits the full requested amount back. All balance effects go through
/// [`Ledger`].
#[derive(Clone)]
pub struct Withdrawals {
    ledger: Ledger,
    accounts: Arc<dyn BankAccountRegistry>,
    policy: WithdrawalPolicy,
    audit: Arc<dyn AuditObserver>,
}

impl Withdrawals {
    pub fn new(
        ledger: Ledger,
        accounts: Arc<dyn BankAccountRegistry>,
        policy: WithdrawalPolicy,
    ) -> Self {
        Self {
            ledger,
            accounts,
            policy,
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditObserver>) -> Self {
        self.audit = audit;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn policy(&self) -> &WithdrawalPolicy {
        &self.policy
    }

    /// The caller's balance, created at zero on first access.
    pub async fn get_my_balance(&self, caller: &Caller) -> Result<BalanceRecord, LedgerError> {
        self.ledger.get_or_create_balance(caller.user_id).await
    }

    pub async fn list_my_ledger(
        &self,
        caller: &Caller,
        pagination: Pagination,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        self.ledger.list_entries(caller.user_id, pagination).await
    }

    /// Hold `amount` from the caller's balance and open a pending request.
    ///
    /// Validation failures touch nothing. The debit and the request row are
    /// written in one transaction: either both exist afterwards or neither.
    pub async fn request_withdrawal(
        &self,
        caller: &Caller,
        amount: Decimal,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let user_id = caller.user_id;

        validate_amount(amount)?;
        if amount < self.policy.minimum_withdrawal {
            return Err(LedgerError::BelowMinimumWithdrawal {
                minimum: self.policy.minimum_withdrawal,
                requested: amount,
            });
        }

        let account = self
            .accounts
            .verified_account(user_id)
            .await?
            .ok_or(LedgerError::NoVerifiedAccount(user_id))?;

        let fee = self.policy.admin_fee;
        if amount - fee < Decimal::ZERO {
            return Err(LedgerError::FeeExceedsAmount {
                fee,
                requested: amount,
            });
        }

        let request = WithdrawalRequest::new_pending(Uuid::now_v7(), user_id, &account, amount, fee);

        let mut tx = self.ledger.begin().await?;
        match self.reserve(&mut tx, &request).await {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                abort(tx).await;
                record_outcome("refused");
                info!(%user_id, %amount, error = %e, "withdrawal refused");
                return Err(e);
            }
        }

        record_outcome("requested");
        info!(
            withdrawal_id = %request.id,
            %user_id,
            %amount,
            payable = %request.amount_payable,
            "withdrawal requested"
        );
        self.audit.observe(&AuditEvent::new(
            AuditAction::WithdrawalRequested,
            user_id,
            None,
            request.clone(),
        ));

        Ok(request)
    }

    async fn reserve(
        &self,
        tx: &mut Box<dyn LedgerTransaction>,
        request: &WithdrawalRequest,
    ) -> Result<(), LedgerError> {
        let hold = Posting::new(
            request.user_id,
            request.amount_requested,
            TransactionType::WithdrawalHold,
        )
        .reference(Reference::withdrawal(request.id))
        .note(format!(
            "withdrawal to {} {}",
            request.bank_name, request.account_number
        ));

        self.ledger.debit(hold, Some(&mut *tx)).await?;
        tx.insert_withdrawal(request).await
    }

    pub async fn list_my_withdrawals(
        &self,
        caller: &Caller,
        pagination: Pagination,
    ) -> Result<Page<WithdrawalRequest>, LedgerError> {
        self.ledger
            .adapter()
            .list_withdrawals(WithdrawalFilter::for_user(caller.user_id), pagination)
            .await
    }

    /// Admin queue across all users. `status: None` lists every status.
    pub async fn list_pending_withdrawals(
        &self,
        caller: &Caller,
        pagination: Pagination,
        status: Option<WithdrawalStatus>,
    ) -> Result<Page<WithdrawalRequest>, LedgerError> {
        caller.require_admin()?;
        self.ledger
            .adapter()
            .list_withdrawals(WithdrawalFilter::with_status(status), pagination)
            .await
    }

    /// Visible to its owner and to admins; anyone else gets `NotFound`.
    pub async fn get_withdrawal(
        &self,
        caller: &Caller,
        id: Uuid,
    ) -> Result<WithdrawalRequest, LedgerError> {
        match self.ledger.adapter().get_withdrawal(id).await? {
            Some(request) if caller.is_admin() || request.user_id == caller.user_id => Ok(request),
            _ => Err(LedgerError::NotFound(id)),
        }
    }

    /// Mark a pending request as paid out. The held funds stay debited; a
    /// zero-amount `withdrawal_completed` entry records the confirmation.
    pub async fn approve_withdrawal(
        &self,
        caller: &Caller,
        id: Uuid,
        resolution: Resolution,
    ) -> Result<WithdrawalRequest, LedgerError> {
        self.decide(caller, id, Decision::Approve, resolution).await
    }

    /// Refuse a pending request and return the full held amount.
    pub async fn reject_withdrawal(
        &self,
        caller: &Caller,
        id: Uuid,
        admin_notes: Option<String>,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let resolution = Resolution {
            admin_notes,
            ..Resolution::default()
        };
        self.decide(caller, id, Decision::Reject, resolution).await
    }

    async fn decide(
        &self,
        caller: &Caller,
        id: Uuid,
        decision: Decision,
        resolution: Resolution,
    ) -> Result<WithdrawalRequest, LedgerError> {
        caller.require_admin()?;

        let mut tx = self.ledger.begin().await?;
        let (before, after) = match self
            .resolve(&mut tx, caller.user_id, id, decision, resolution)
            .await
        {
            Ok(snapshots) => snapshots,
            Err(e) => {
                abort(tx).await;
                if matches!(e, LedgerError::AlreadyProcessed { .. }) {
                    warn!(withdrawal_id = %id, ?decision, "withdrawal already processed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        record_outcome(after.status.as_str());
        info!(
            withdrawal_id = %id,
            admin = %caller.user_id,
            user_id = %after.user_id,
            status = %after.status,
            "withdrawal resolved"
        );
        self.audit.observe(&AuditEvent::new(
            decision.action(),
            caller.user_id,
            Some(before),
            after.clone(),
        ));

        Ok(after)
    }

    /// Lock order: request row first, then the balance.
    async fn resolve(
        &self,
        tx: &mut Box<dyn LedgerTransaction>,
        admin: Uuid,
        id: Uuid,
        decision: Decision,
        resolution: Resolution,
    ) -> Result<(WithdrawalRequest, WithdrawalRequest), LedgerError> {
        let before = tx
            .lock_withdrawal(id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        let mut after = before.clone();
        after.resolve(decision.target(), admin, resolution)?;

        let reference = Reference::withdrawal(id);
        match decision {
            Decision::Approve => {
                let note = match &after.bank_reference {
                    Some(bank_ref) => format!("withdrawal paid out, bank reference {bank_ref}"),
                    None => "withdrawal paid out".to_string(),
                };
                self.ledger
                    .record_confirmation(
                        after.user_id,
                        TransactionType::WithdrawalCompleted,
                        reference,
                        note,
                        tx.as_mut(),
                    )
                    .await?;
            }
            Decision::Reject => {
                let reversal = Posting::new(
                    after.user_id,
                    after.amount_requested,
                    TransactionType::WithdrawalReversed,
                )
                .reference(reference)
                .note("withdrawal rejected, hold returned");
                self.ledger.credit(reversal, Some(&mut *tx)).await?;
            }
        }

        tx.update_withdrawal(&after).await?;
        Ok((before, after))
    }
}
