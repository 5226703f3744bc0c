//! Ledger repository interface
//!
//! Single-row operations executed inside one transaction. Implemented by the
//! PostgreSQL transaction handle and by the in-memory backend.

use async_trait::async_trait;

use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Transfer, User,
    VerifyEmail,
};

#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Read an account and hold its row lock until the transaction ends.
    ///
    /// The lock does not conflict with foreign-key checks from `entries` and
    /// `transfers` inserts (`FOR NO KEY UPDATE`).
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;

    /// `balance = balance + amount`, computed by the store under the row lock.
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError>;

    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;

    async fn update_user_email_verified(&mut self, username: &str) -> Result<User, StoreError>;

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;

    async fn get_verify_email(&mut self, id: i64) -> Result<VerifyEmail, StoreError>;

    /// Mark an unused, unexpired record with a matching code as used.
    async fn use_verify_email(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError>;
}

/// A transaction handle: repository calls plus the two ways to end it.
///
/// Dropping a handle without calling either discards its writes.
#[async_trait]
pub trait Transaction: Queries + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Something that can open transactions: the PostgreSQL pool or the
/// in-memory store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Tx: Transaction + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}
