//! Row types and query parameters for the ledger tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::currency::Currency;

/// Ledger account. `balance` is in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    #[sqlx(try_from = "String")]
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// Immutable balance movement. Positive = credit, negative = debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Email verification record, consumed once through `verify_email_tx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct VerifyEmail {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Fields for a new user. The password is hashed by the caller.
#[derive(Debug, Clone)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub expired_at: DateTime<Utc>,
}
