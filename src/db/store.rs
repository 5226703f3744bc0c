//! Ledger Store
//!
//! Composes [`Queries`] calls into atomic units of work.
//!
//! # Transaction executor
//!
//! [`Store::exec_tx`] opens a transaction, runs the unit of work, commits on
//! success and rolls back on failure. A failed rollback is reported together
//! with the original error ([`StoreError::Rollback`]).
//!
//! # Lock order
//!
//! Every path that updates account balances goes through [`lock_order`]:
//! rows are locked in ascending account id, whatever the transfer direction.
//! Two opposite transfers between the same pair of accounts therefore queue
//! on the same first row instead of deadlocking.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Transfer, User,
    VerifyEmail,
};
use super::queries::{Backend, Queries, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Everything written by one transfer. Accounts are post-update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

#[derive(Debug, Clone)]
pub struct CreateUserTxResult {
    pub user: User,
}

#[derive(Debug, Clone)]
pub struct VerifyEmailTxParams {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Clone)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

/// Work that must succeed for a new user to be committed.
///
/// Runs inside the registration transaction after the user row is written.
/// Returning an error rolls the user back.
#[async_trait]
pub trait AfterCreate: Send + Sync {
    async fn after_create(&self, user: &User) -> anyhow::Result<()>;
}

/// Transaction executor and the composite operations built on it.
pub struct Store<B: Backend> {
    backend: B,
    tx_timeout: Option<Duration>,
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tx_timeout: None,
        }
    }

    /// Abort any unit of work that runs longer than `timeout`.
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = Some(timeout);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `f` inside one transaction.
    ///
    /// `f` must not open another top-level transaction.
    pub async fn exec_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut B::Tx) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let deadline = self.tx_timeout.map(|t| Instant::now() + t);
        self.run_tx(deadline, f).await
    }

    /// Like [`Store::exec_tx`] but with a caller-supplied deadline. The
    /// transaction is rolled back if the deadline passes before commit.
    pub async fn exec_tx_until<T, F>(&self, deadline: Instant, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut B::Tx) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let deadline = match self.tx_timeout {
            Some(t) => deadline.min(Instant::now() + t),
            None => deadline,
        };
        self.run_tx(Some(deadline), f).await
    }

    async fn run_tx<T, F>(&self, deadline: Option<Instant>, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut B::Tx) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let mut tx = self.backend.begin().await?;

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, f(&mut tx))
                .await
                .unwrap_or(Err(StoreError::DeadlineExceeded)),
            None => f(&mut tx).await,
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rb_err) = tx.rollback().await {
                    error!(error = %err, rollback_error = %rb_err, "Transaction rollback failed");
                    return Err(StoreError::Rollback {
                        tx: Box::new(err),
                        rollback: Box::new(rb_err),
                    });
                }
                debug!(error = %err, "Transaction rolled back");
                Err(err)
            }
        }
    }

    /// Move `amount` from one account to another.
    ///
    /// Writes the transfer row, a debit and a credit entry, and applies both
    /// balance deltas under row locks, all in one transaction.
    pub async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        if arg.amount <= 0 {
            return Err(StoreError::InvalidArgument(
                "amount must be greater than zero".to_string(),
            ));
        }
        if arg.from_account_id == arg.to_account_id {
            return Err(StoreError::InvalidArgument(
                "source and target account cannot be the same".to_string(),
            ));
        }

        let result = self
            .exec_tx(move |q| {
                Box::pin(async move {
                    let transfer = q
                        .create_transfer(CreateTransferParams {
                            from_account_id: arg.from_account_id,
                            to_account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let from_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.from_account_id,
                            amount: -arg.amount,
                        })
                        .await?;

                    let to_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let [from_account, to_account] = add_money(
                        q,
                        [
                            AddAccountBalanceParams {
                                id: arg.from_account_id,
                                amount: -arg.amount,
                            },
                            AddAccountBalanceParams {
                                id: arg.to_account_id,
                                amount: arg.amount,
                            },
                        ],
                    )
                    .await?;

                    Ok(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await;

        match &result {
            Ok(r) => debug!(
                transfer_id = r.transfer.id,
                from = arg.from_account_id,
                to = arg.to_account_id,
                amount = arg.amount,
                "Transfer committed"
            ),
            Err(e) => warn!(
                from = arg.from_account_id,
                to = arg.to_account_id,
                amount = arg.amount,
                error = %e,
                "Transfer failed"
            ),
        }
        result
    }

    /// Insert a user and run `after_create` in the same transaction.
    ///
    /// The hook usually enqueues the verification email task. The enqueue
    /// talks to the broker, not this transaction, so a crash between the
    /// broker acknowledging and the commit leaves a task pointing at a user
    /// that never appears; the task handler treats that as retryable.
    pub async fn create_user_tx(
        &self,
        arg: CreateUserParams,
        after_create: Arc<dyn AfterCreate>,
    ) -> Result<CreateUserTxResult, StoreError> {
        self.exec_tx(move |q| {
            Box::pin(async move {
                let user = q.create_user(arg).await?;
                after_create
                    .after_create(&user)
                    .await
                    .map_err(StoreError::AfterCreate)?;
                Ok(CreateUserTxResult { user })
            })
        })
        .await
    }

    /// Consume a verification code and mark the user's email as verified.
    pub async fn verify_email_tx(
        &self,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        self.exec_tx(move |q| {
            Box::pin(async move {
                let verify_email = q.use_verify_email(arg.email_id, &arg.secret_code).await?;
                let user = q.update_user_email_verified(&verify_email.username).await?;
                Ok(VerifyEmailTxResult { user, verify_email })
            })
        })
        .await
    }

    pub async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.create_account(arg).await }))
            .await
    }

    pub async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_account(id).await }))
            .await
    }

    pub async fn list_entries(&self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.list_entries(account_id).await }))
            .await
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_transfer(id).await }))
            .await
    }

    pub async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        self.exec_tx(move |q| Box::pin(async move { q.get_user(&username).await }))
            .await
    }

    pub async fn create_verify_email(
        &self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.create_verify_email(arg).await }))
            .await
    }

    pub async fn get_verify_email(&self, id: i64) -> Result<VerifyEmail, StoreError> {
        self.exec_tx(move |q| Box::pin(async move { q.get_verify_email(id).await }))
            .await
    }
}

/// Indices of `ids` in the order their rows must be locked: ascending id.
pub fn lock_order(ids: &[i64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by_key(|&i| ids[i]);
    order
}

/// Apply balance deltas, locking rows in [`lock_order`]. Results come back
/// in the order of `deltas`.
async fn add_money<Q, const N: usize>(
    q: &mut Q,
    deltas: [AddAccountBalanceParams; N],
) -> Result<[Account; N], StoreError>
where
    Q: Queries + ?Sized,
{
    let ids = deltas.map(|d| d.id);
    let mut updated: [Option<Account>; N] = std::array::from_fn(|_| None);

    for i in lock_order(&ids) {
        q.get_account_for_update(deltas[i].id).await?;
        updated[i] = Some(q.add_account_balance(deltas[i]).await?);
    }

    let mut out = Vec::with_capacity(N);
    for account in updated {
        out.push(account.ok_or(StoreError::NotFound)?);
    }
    out.try_into()
        .map_err(|_| StoreError::Database("balance update count mismatch".to_string()))
}
