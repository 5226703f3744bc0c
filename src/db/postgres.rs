//! PostgreSQL transaction handle
//!
//! Runtime-checked `sqlx::query_as` statements against the ledger tables.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction as SqlxTransaction};

use super::Database;
use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Transfer, User,
    VerifyEmail,
};
use super::queries::{Backend, Queries, Transaction};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

/// An open PostgreSQL transaction. sqlx rolls it back if dropped.
pub struct PgTx {
    tx: SqlxTransaction<'static, Postgres>,
}

#[async_trait]
impl Backend for Database {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let tx = self.pool().begin().await?;
        Ok(PgTx { tx })
    }
}

#[async_trait]
impl Transaction for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Queries for PgTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(&arg.owner)
            .bind(arg.balance)
            .bind(arg.currency.as_str())
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE");
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(arg.amount)
            .bind(arg.id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"INSERT INTO entries (account_id, amount) VALUES ($1, $2)
               RETURNING id, account_id, amount, created_at"#,
        )
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(entry)
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let entries = sqlx::query_as::<_, Entry>(
            r#"SELECT id, account_id, amount, created_at
               FROM entries WHERE account_id = $1 ORDER BY id"#,
        )
        .bind(account_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(
            r#"INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3)
               RETURNING id, from_account_id, to_account_id, amount, created_at"#,
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(
            r#"SELECT id, from_account_id, to_account_id, amount, created_at
               FROM transfers WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(transfer)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let sql = format!(
            "INSERT INTO users (username, hashed_password, full_name, email) VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(&arg.username)
            .bind(&arg.hashed_password)
            .bind(&arg.full_name)
            .bind(&arg.email)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn update_user_email_verified(&mut self, username: &str) -> Result<User, StoreError> {
        let sql = format!(
            "UPDATE users SET is_email_verified = TRUE WHERE username = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let sql = format!(
            "INSERT INTO verify_emails (username, email, secret_code, expired_at) VALUES ($1, $2, $3, $4) RETURNING {VERIFY_EMAIL_COLUMNS}"
        );
        let record = sqlx::query_as::<_, VerifyEmail>(&sql)
            .bind(&arg.username)
            .bind(&arg.email)
            .bind(&arg.secret_code)
            .bind(arg.expired_at)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(record)
    }

    async fn get_verify_email(&mut self, id: i64) -> Result<VerifyEmail, StoreError> {
        let sql = format!("SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails WHERE id = $1");
        let record = sqlx::query_as::<_, VerifyEmail>(&sql)
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(record)
    }

    async fn use_verify_email(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError> {
        let sql = format!(
            r#"UPDATE verify_emails SET is_used = TRUE
               WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > NOW()
               RETURNING {VERIFY_EMAIL_COLUMNS}"#
        );
        let record = sqlx::query_as::<_, VerifyEmail>(&sql)
            .bind(id)
            .bind(secret_code)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(record)
    }
}
