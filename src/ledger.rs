//! Currency ledger.
//!
//! Balances live in the `bank` table of the marketplace store so that ledger
//! movements share the listing's unit of work. Issuance (deposit) and burning
//! (withdraw without a matching deposit) are the only non-conserving moves.

use rusqlite::{params, OptionalExtension};
use serde_json::json;

use crate::error::{MarketError, MarketResult};
use crate::logging::{log, obj, Domain, Level};
use crate::store::UnitOfWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Account {
    pub user: u64,
    pub scope: u64,
}

impl Account {
    pub fn new(user: u64, scope: u64) -> Self {
        Self { user, scope }
    }
}

/// Ledger operations always run inside a caller-supplied unit of work; use
/// `Store::run(None, ..)` for a standalone call.
pub trait Ledger: Send + Sync {
    fn balance(&self, uow: &UnitOfWork, account: Account) -> MarketResult<i64>;
    fn deposit(&self, uow: &mut UnitOfWork, account: Account, amount: i64) -> MarketResult<()>;
    fn withdraw(&self, uow: &mut UnitOfWork, account: Account, amount: i64) -> MarketResult<()>;

    fn transfer(&self, uow: &mut UnitOfWork, from: Account, to: Account, amount: i64) -> MarketResult<()> {
        if from == to {
            return Err(MarketError::SameAccount);
        }
        if amount <= 0 {
            return Err(MarketError::InvalidAmount(amount));
        }
        self.withdraw(uow, from, amount)?;
        self.deposit(uow, to, amount)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SqliteBank;

impl Ledger for SqliteBank {
    fn balance(&self, uow: &UnitOfWork, account: Account) -> MarketResult<i64> {
        let bal: Option<i64> = uow
            .conn()
            .query_row(
                "SELECT balance FROM bank WHERE user_id = ?1 AND scope = ?2",
                params![account.user as i64, account.scope as i64],
                |r| r.get(0),
            )
            .optional()?;
        Ok(bal.unwrap_or(0))
    }

    fn deposit(&self, uow: &mut UnitOfWork, account: Account, amount: i64) -> MarketResult<()> {
        if amount < 0 {
            return Err(MarketError::InvalidAmount(amount));
        }
        uow.conn().execute(
            "INSERT INTO bank (user_id, scope, balance) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, scope) DO UPDATE SET balance = balance + excluded.balance",
            params![account.user as i64, account.scope as i64, amount],
        )?;
        log(
            Level::Debug,
            Domain::Ledger,
            "deposit",
            obj(&[("user_id", json!(account.user)), ("amount", json!(amount))]),
        );
        Ok(())
    }

    fn withdraw(&self, uow: &mut UnitOfWork, account: Account, amount: i64) -> MarketResult<()> {
        if amount < 0 {
            return Err(MarketError::InvalidAmount(amount));
        }
        let available = self.balance(uow, account)?;
        if available < amount {
            return Err(MarketError::InsufficientFunds { needed: amount, available });
        }
        if amount > 0 {
            uow.conn().execute(
                "UPDATE bank SET balance = balance - ?3 WHERE user_id = ?1 AND scope = ?2",
                params![account.user as i64, account.scope as i64, amount],
            )?;
        }
        log(
            Level::Debug,
            Domain::Ledger,
            "withdraw",
            obj(&[("user_id", json!(account.user)), ("amount", json!(amount))]),
        );
        Ok(())
    }
}
