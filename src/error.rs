use std::io;

use thiserror::Error;

/// Failures of a single marketplace operation. None of these are fatal to the
/// process; each one aborts (and rolls back) only the operation that raised it.
#[derive(Error, Debug)]
pub enum MarketError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("duplicate image detected (hamming distance {distance})")]
    DuplicateDetected { distance: u32 },
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },
    #[error("user {actor} does not own listing {item_id}")]
    NotOwner { actor: u64, item_id: i64 },
    #[error("listing {0} not found")]
    ListingNotFound(i64),
    #[error("no listing is displayed at thread {thread_id} message {message_id}")]
    NoListingAt { thread_id: u64, message_id: u64 },
    #[error("listing {item_id} is not on sale")]
    NotOnSale { item_id: i64 },
    #[error("listing {item_id} is not locked")]
    NotLocked { item_id: i64 },
    #[error("cannot buy your own listing {item_id}")]
    SelfPurchase { item_id: i64 },
    #[error("price {price} is below the minimum of {minimum}")]
    PriceTooLow { price: i64, minimum: i64 },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("display target unavailable: {0}")]
    DisplayTargetUnavailable(String),
    #[error("display error: {0}")]
    Display(String),
    #[error("cannot transfer to the same account")]
    SameAccount,
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("SQLite error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MarketError {
    /// Short machine-readable tag used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::Decode(_) => "decode_error",
            MarketError::DuplicateDetected { .. } => "duplicate_detected",
            MarketError::InsufficientFunds { .. } => "insufficient_funds",
            MarketError::NotOwner { .. } => "not_owner",
            MarketError::ListingNotFound(_) | MarketError::NoListingAt { .. } => "listing_not_found",
            MarketError::NotOnSale { .. } => "not_on_sale",
            MarketError::NotLocked { .. } => "not_locked",
            MarketError::SelfPurchase { .. } => "self_purchase",
            MarketError::PriceTooLow { .. } => "price_too_low",
            MarketError::InvalidTransition(_) => "invalid_transition",
            MarketError::DisplayTargetUnavailable(_) => "display_target_unavailable",
            MarketError::Display(_) => "display_error",
            MarketError::SameAccount => "same_account",
            MarketError::InvalidAmount(_) => "invalid_amount",
            MarketError::Store(_) => "store_error",
            MarketError::Io(_) => "io_error",
        }
    }
}

pub type MarketResult<T> = Result<T, MarketError>;
