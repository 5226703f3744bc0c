//! Simple Bank - ledger transfers and user registration core
//!
//! # Modules
//!
//! - [`db`] - transaction executor, ledger repository, transfer engine,
//!   registration with an after-create hook
//! - [`worker`] - task queue broker (distributor, processor) and the
//!   verification email workflow
//! - [`mail`] - outgoing email interface
//! - [`currency`] - supported account currencies
//! - [`config`] / [`logging`] - process configuration and tracing setup

pub mod config;
pub mod currency;
pub mod db;
pub mod logging;
pub mod mail;
pub mod worker;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use currency::Currency;
pub use db::{
    Account, AfterCreate, Backend, Database, Entry, MemoryDatabase, Store, StoreError, Transfer,
    TransferTxParams, TransferTxResult, User, VerifyEmail,
};
pub use mail::{Email, EmailSender, LogSender};
pub use worker::{
    Broker, BrokerTaskDistributor, EnqueueVerifyEmail, MemoryBroker, PgBroker,
    SendVerifyEmailHandler, TaskDistributor, TaskOptions, TaskProcessor,
};
