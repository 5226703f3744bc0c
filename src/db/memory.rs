//! In-memory ledger backend
//!
//! Behaves like the PostgreSQL backend for everything the store relies on:
//!
//! - writes are staged per transaction and applied atomically on commit
//! - `get_account_for_update` / `add_account_balance` / `use_verify_email` take
//!   a per-row async lock held until commit or rollback, so conflicting
//!   transactions wait
//! - unique and foreign-key constraints are enforced, re-checked at commit
//!
//! Faults can be injected at named points to exercise rollback paths.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::OwnedMutexGuard;

use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Transfer, User,
    VerifyEmail,
};
use super::queries::{Backend, Queries, Transaction};
use crate::currency::Currency;

const ACCOUNTS_OWNER_CURRENCY_KEY: &str = "accounts_owner_currency_key";

/// Where an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    CreateTransfer,
    CreateEntry,
    GetAccountForUpdate,
    AddAccountBalance,
    CreateUser,
    GetUser,
    CreateVerifyEmail,
    Commit,
    Rollback,
}

/// Row lock namespace. Accounts and verify emails have independent id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RowKey {
    Account(i64),
    VerifyEmail(i64),
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
}

struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
    verify_emails: AtomicI64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            accounts: AtomicI64::new(1),
            entries: AtomicI64::new(1),
            transfers: AtomicI64::new(1),
            verify_emails: AtomicI64::new(1),
        }
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    seq: Sequences,
    faults: Mutex<HashSet<FaultPoint>>,
}

impl Shared {
    fn check_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        if self.faults.lock().contains(&point) {
            return Err(StoreError::Transient(format!("injected fault at {:?}", point)));
        }
        Ok(())
    }

    fn row_lock(&self, key: RowKey) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks.lock().entry(key).or_default().clone()
    }
}

/// Shared in-memory database. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call at `point` fail with a transient error.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.shared.faults.lock().insert(point);
    }

    pub fn clear_fault(&self, point: FaultPoint) {
        self.shared.faults.lock().remove(&point);
    }

    /// Committed accounts, ordered by id.
    pub fn accounts(&self) -> Vec<Account> {
        self.shared.tables.lock().accounts.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.shared.tables.lock().entries.values().cloned().collect()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.shared.tables.lock().transfers.values().cloned().collect()
    }

    pub fn users(&self) -> Vec<User> {
        self.shared.tables.lock().users.values().cloned().collect()
    }

    pub fn verify_emails(&self) -> Vec<VerifyEmail> {
        self.shared
            .tables
            .lock()
            .verify_emails
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Backend for MemoryDatabase {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        self.shared.check_fault(FaultPoint::Begin)?;
        Ok(MemoryTx {
            shared: self.shared.clone(),
            locks: BTreeMap::new(),
            pending: Pending::default(),
        })
    }
}

#[derive(Default)]
struct Pending {
    accounts: BTreeMap<i64, Account>,
    balance_deltas: BTreeMap<i64, i64>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    users: BTreeMap<String, User>,
    verified_users: HashSet<String>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    used_verify_emails: HashSet<i64>,
}

/// Transaction on a [`MemoryDatabase`]. Row locks are released when the
/// handle is committed, rolled back or dropped.
pub struct MemoryTx {
    shared: Arc<Shared>,
    locks: BTreeMap<RowKey, OwnedMutexGuard<()>>,
    pending: Pending,
}

impl MemoryTx {
    async fn lock_row(&mut self, key: RowKey) {
        if self.locks.contains_key(&key) {
            return;
        }
        let lock = self.shared.row_lock(key);
        let guard = lock.lock_owned().await;
        self.locks.insert(key, guard);
    }

    /// Account as seen by this transaction: committed or staged row plus
    /// this transaction's balance deltas.
    fn visible_account(&self, id: i64) -> Option<Account> {
        let base = self
            .pending
            .accounts
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables.lock().accounts.get(&id).cloned());
        base.map(|mut account| {
            account.balance += self.pending.balance_deltas.get(&id).copied().unwrap_or(0);
            account
        })
    }

    fn account_exists(&self, id: i64) -> bool {
        self.pending.accounts.contains_key(&id)
            || self.shared.tables.lock().accounts.contains_key(&id)
    }

    fn visible_user(&self, username: &str) -> Option<User> {
        let base = self
            .pending
            .users
            .get(username)
            .cloned()
            .or_else(|| self.shared.tables.lock().users.get(username).cloned());
        base.map(|mut user| {
            if self.pending.verified_users.contains(username) {
                user.is_email_verified = true;
            }
            user
        })
    }

    fn visible_verify_email(&self, id: i64) -> Option<VerifyEmail> {
        let base = self
            .pending
            .verify_emails
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables.lock().verify_emails.get(&id).cloned());
        base.map(|mut record| {
            if self.pending.used_verify_emails.contains(&id) {
                record.is_used = true;
            }
            record
        })
    }

    fn email_taken(tables: &Tables, pending: &BTreeMap<String, User>, email: &str) -> bool {
        tables.users.values().any(|u| u.email == email) || pending.values().any(|u| u.email == email)
    }

    fn has_account(accounts: &BTreeMap<i64, Account>, owner: &str, currency: Currency) -> bool {
        accounts
            .values()
            .any(|a| a.owner == owner && a.currency == currency)
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.shared.check_fault(FaultPoint::Commit)?;
        let pending = std::mem::take(&mut self.pending);
        let mut tables = self.shared.tables.lock();

        // Concurrent inserts of the same key are resolved at commit
        for user in pending.users.values() {
            if tables.users.contains_key(&user.username) {
                return Err(StoreError::UniqueViolation("users_pkey".to_string()));
            }
            if tables.users.values().any(|u| u.email == user.email) {
                return Err(StoreError::UniqueViolation("users_email_key".to_string()));
            }
        }
        for account in pending.accounts.values() {
            if Self::has_account(&tables.accounts, &account.owner, account.currency) {
                return Err(StoreError::UniqueViolation(
                    ACCOUNTS_OWNER_CURRENCY_KEY.to_string(),
                ));
            }
        }
        for id in &pending.used_verify_emails {
            if tables.verify_emails.get(id).is_some_and(|r| r.is_used) {
                return Err(StoreError::NotFound);
            }
        }

        tables.accounts.extend(pending.accounts);
        for (id, delta) in pending.balance_deltas {
            if let Some(account) = tables.accounts.get_mut(&id) {
                account.balance += delta;
            }
        }
        tables
            .entries
            .extend(pending.entries.into_iter().map(|e| (e.id, e)));
        tables
            .transfers
            .extend(pending.transfers.into_iter().map(|t| (t.id, t)));
        tables.users.extend(pending.users);
        for username in pending.verified_users {
            if let Some(user) = tables.users.get_mut(&username) {
                user.is_email_verified = true;
            }
        }
        tables.verify_emails.extend(pending.verify_emails);
        for id in pending.used_verify_emails {
            if let Some(record) = tables.verify_emails.get_mut(&id) {
                record.is_used = true;
            }
        }
        drop(tables);

        self.locks.clear();
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.shared.check_fault(FaultPoint::Rollback)?;
        Ok(())
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let taken = Self::has_account(&self.pending.accounts, &arg.owner, arg.currency)
            || Self::has_account(&self.shared.tables.lock().accounts, &arg.owner, arg.currency);
        if taken {
            return Err(StoreError::UniqueViolation(
                ACCOUNTS_OWNER_CURRENCY_KEY.to_string(),
            ));
        }
        let account = Account {
            id: self.shared.seq.accounts.fetch_add(1, Ordering::SeqCst),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.pending.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.visible_account(id).ok_or(StoreError::NotFound)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.shared.check_fault(FaultPoint::GetAccountForUpdate)?;
        self.lock_row(RowKey::Account(id)).await;
        self.visible_account(id).ok_or(StoreError::NotFound)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.shared.check_fault(FaultPoint::AddAccountBalance)?;
        self.lock_row(RowKey::Account(arg.id)).await;
        if !self.account_exists(arg.id) {
            return Err(StoreError::NotFound);
        }
        *self.pending.balance_deltas.entry(arg.id).or_insert(0) += arg.amount;
        self.visible_account(arg.id).ok_or(StoreError::NotFound)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.shared.check_fault(FaultPoint::CreateEntry)?;
        if !self.account_exists(arg.account_id) {
            return Err(StoreError::ForeignKeyViolation(
                "entries_account_id_fkey".to_string(),
            ));
        }
        let entry = Entry {
            id: self.shared.seq.entries.fetch_add(1, Ordering::SeqCst),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.pending.entries.push(entry.clone());
        Ok(entry)
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let mut entries: Vec<Entry> = self
            .shared
            .tables
            .lock()
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.extend(
            self.pending
                .entries
                .iter()
                .filter(|e| e.account_id == account_id)
                .cloned(),
        );
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.shared.check_fault(FaultPoint::CreateTransfer)?;
        if !self.account_exists(arg.from_account_id) {
            return Err(StoreError::ForeignKeyViolation(
                "transfers_from_account_id_fkey".to_string(),
            ));
        }
        if !self.account_exists(arg.to_account_id) {
            return Err(StoreError::ForeignKeyViolation(
                "transfers_to_account_id_fkey".to_string(),
            ));
        }
        let transfer = Transfer {
            id: self.shared.seq.transfers.fetch_add(1, Ordering::SeqCst),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.pending.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        if let Some(t) = self.pending.transfers.iter().find(|t| t.id == id) {
            return Ok(t.clone());
        }
        self.shared
            .tables
            .lock()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        self.shared.check_fault(FaultPoint::CreateUser)?;
        {
            let tables = self.shared.tables.lock();
            if tables.users.contains_key(&arg.username)
                || self.pending.users.contains_key(&arg.username)
            {
                return Err(StoreError::UniqueViolation("users_pkey".to_string()));
            }
            if Self::email_taken(&tables, &self.pending.users, &arg.email) {
                return Err(StoreError::UniqueViolation("users_email_key".to_string()));
            }
        }
        let now = Utc::now();
        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: chrono::DateTime::<Utc>::MIN_UTC,
            created_at: now,
        };
        self.pending.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.shared.check_fault(FaultPoint::GetUser)?;
        self.visible_user(username).ok_or(StoreError::NotFound)
    }

    async fn update_user_email_verified(&mut self, username: &str) -> Result<User, StoreError> {
        if self.visible_user(username).is_none() {
            return Err(StoreError::NotFound);
        }
        self.pending.verified_users.insert(username.to_string());
        self.visible_user(username).ok_or(StoreError::NotFound)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.shared.check_fault(FaultPoint::CreateVerifyEmail)?;
        if self.visible_user(&arg.username).is_none() {
            return Err(StoreError::ForeignKeyViolation(
                "verify_emails_username_fkey".to_string(),
            ));
        }
        let record = VerifyEmail {
            id: self.shared.seq.verify_emails.fetch_add(1, Ordering::SeqCst),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expired_at: arg.expired_at,
        };
        self.pending.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_verify_email(&mut self, id: i64) -> Result<VerifyEmail, StoreError> {
        self.visible_verify_email(id).ok_or(StoreError::NotFound)
    }

    async fn use_verify_email(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError> {
        self.lock_row(RowKey::VerifyEmail(id)).await;
        let record = self.visible_verify_email(id).ok_or(StoreError::NotFound)?;
        if record.is_used || record.secret_code != secret_code || record.expired_at <= Utc::now() {
            return Err(StoreError::NotFound);
        }
        self.pending.used_verify_emails.insert(id);
        self.visible_verify_email(id).ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seed_account(db: &MemoryDatabase, owner: &str, balance: i64) -> Account {
        let mut tx = db.begin().await.unwrap();
        let account = tx
            .create_account(CreateAccountParams {
                owner: owner.to_string(),
                balance,
                currency: Currency::Usd,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.create_account(CreateAccountParams {
            owner: "bob".into(),
            balance: 10,
            currency: Currency::Eur,
        })
        .await
        .unwrap();
        assert!(db.accounts().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(db.accounts().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_tx_discards_writes() {
        let db = MemoryDatabase::new();
        let account = seed_account(&db, "bob", 100).await;
        {
            let mut tx = db.begin().await.unwrap();
            tx.add_account_balance(AddAccountBalanceParams {
                id: account.id,
                amount: 50,
            })
            .await
            .unwrap();
        }
        assert_eq!(db.accounts()[0].balance, 100);

        // The row lock was released with the dropped handle
        let mut tx = db.begin().await.unwrap();
        let locked = tokio::time::timeout(
            Duration::from_secs(1),
            tx.get_account_for_update(account.id),
        )
        .await;
        assert!(locked.is_ok(), "row lock leaked from dropped transaction");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_row_lock_blocks_second_writer_until_commit() {
        let db = MemoryDatabase::new();
        let account = seed_account(&db, "carol", 0).await;

        let mut first = db.begin().await.unwrap();
        first.get_account_for_update(account.id).await.unwrap();

        let db2 = db.clone();
        let id = account.id;
        let second = tokio::spawn(async move {
            let mut tx = db2.begin().await.unwrap();
            let updated = tx
                .add_account_balance(AddAccountBalanceParams { id, amount: 5 })
                .await
                .unwrap();
            tx.commit().await.unwrap();
            updated.balance
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second writer must wait for the lock");

        first
            .add_account_balance(AddAccountBalanceParams { id, amount: 10 })
            .await
            .unwrap();
        first.commit().await.unwrap();

        assert_eq!(second.await.unwrap(), 15);
        assert_eq!(db.accounts()[0].balance, 15);
    }

    #[tokio::test]
    async fn test_entry_requires_existing_account() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let err = tx
            .create_entry(CreateEntryParams {
                account_id: 42,
                amount: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_username_and_email() {
        let db = MemoryDatabase::new();
        let params = |username: &str, email: &str| CreateUserParams {
            username: username.into(),
            hashed_password: "hash".into(),
            full_name: "Alice A".into(),
            email: email.into(),
        };

        let mut tx = db.begin().await.unwrap();
        tx.create_user(params("alice", "alice@example.com"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let err = tx
            .create_user(params("alice", "other@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(ref c) if c == "users_pkey"));

        let err = tx
            .create_user(params("alice2", "alice@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(ref c) if c == "users_email_key"));
    }

    #[tokio::test]
    async fn test_concurrent_same_username_fails_at_commit() {
        let db = MemoryDatabase::new();
        let params = CreateUserParams {
            username: "dave".into(),
            hashed_password: "hash".into(),
            full_name: "Dave D".into(),
            email: "dave@example.com".into(),
        };
        let mut a = db.begin().await.unwrap();
        let mut b = db.begin().await.unwrap();
        a.create_user(params.clone()).await.unwrap();
        b.create_user(params).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.users().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_owner_currency() {
        let db = MemoryDatabase::new();
        let params = |currency| CreateAccountParams {
            owner: "alice".into(),
            balance: 0,
            currency,
        };

        let mut tx = db.begin().await.unwrap();
        tx.create_account(params(Currency::Usd)).await.unwrap();
        let err = tx.create_account(params(Currency::Usd)).await.unwrap_err();
        assert!(
            matches!(err, StoreError::UniqueViolation(ref c) if c == "accounts_owner_currency_key")
        );
        tx.create_account(params(Currency::Eur)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let err = tx.create_account(params(Currency::Eur)).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.accounts().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_owner_currency_fails_at_commit() {
        let db = MemoryDatabase::new();
        let params = CreateAccountParams {
            owner: "alice".into(),
            balance: 0,
            currency: Currency::Usd,
        };
        let mut a = db.begin().await.unwrap();
        let mut b = db.begin().await.unwrap();
        a.create_account(params.clone()).await.unwrap();
        b.create_account(params).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.accounts().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verify_email_consumed_by_one_transaction() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.create_user(CreateUserParams {
            username: "alice".into(),
            hashed_password: "hash".into(),
            full_name: "Alice A".into(),
            email: "alice@example.com".into(),
        })
        .await
        .unwrap();
        let record = tx
            .create_verify_email(CreateVerifyEmailParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                secret_code: "s".repeat(32),
                expired_at: Utc::now() + chrono::Duration::minutes(15),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut first = db.begin().await.unwrap();
        first
            .use_verify_email(record.id, &record.secret_code)
            .await
            .unwrap();

        let db2 = db.clone();
        let (id, code) = (record.id, record.secret_code.clone());
        let second = tokio::spawn(async move {
            let mut tx = db2.begin().await.unwrap();
            tx.use_verify_email(id, &code).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second consumer must wait for the lock");

        first.commit().await.unwrap();
        let err = second.await.unwrap().unwrap_err();
        assert!(err.is_not_found());
        assert!(db.verify_emails()[0].is_used);
    }

    #[tokio::test]
    async fn test_verify_email_lock_independent_of_account_lock() {
        let db = MemoryDatabase::new();
        let account = seed_account(&db, "bob", 0).await;

        let mut holder = db.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        // Same numeric id in the verify email namespace does not wait
        let mut tx = db.begin().await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            tx.use_verify_email(account.id, "code"),
        )
        .await
        .expect("verify email lock shares no state with account locks");
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let db = MemoryDatabase::new();
        db.inject_fault(FaultPoint::Begin);
        assert!(db.begin().await.is_err());
        db.clear_fault(FaultPoint::Begin);
        assert!(db.begin().await.is_ok());
    }
}
