//! Listing lifecycle.
//!
//! ```text
//!            Buy                     Resell(price >= floor)
//!  on_sale ───────▶ owned ◀──┐  owned ─────────────────────▶ on_sale
//!                    │  ▲    │
//!        Lock/Unlock └──┘    └── ForcedBuyout (locked only, price x2)
//! ```
//!
//! `apply_event` validates and mutates an in-memory copy and returns the
//! ledger movements the caller must perform in the same unit of work. On any
//! error the listing is left untouched.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{MarketError, MarketResult};
use crate::gallery::DisplayLocation;
use crate::pricing::{scale_bp, to_bp, Grade, BP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    OnSale,
    Owned,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::OnSale => "on_sale",
            ListingStatus::Owned => "owned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_sale" => Some(ListingStatus::OnSale),
            // older rows used "sold" for owned items
            "owned" | "sold" => Some(ListingStatus::Owned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub item_id: i64,
    pub seller_id: u64,
    /// Current owner once sold.
    pub buyer_id: Option<u64>,
    pub image_url: String,
    pub image_hash: Option<String>,
    pub score: f64,
    pub price: i64,
    pub status: ListingStatus,
    pub grade: Grade,
    pub tags: Vec<String>,
    pub is_locked: bool,
    pub display: Option<DisplayLocation>,
}

impl Listing {
    pub fn owner(&self) -> Option<u64> {
        match self.status {
            ListingStatus::Owned => self.buyer_id,
            ListingStatus::OnSale => None,
        }
    }

    pub fn invariant_violations(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.buyer_id.is_some() != (self.status == ListingStatus::Owned) {
            out.push("buyer_id set iff owned");
        }
        if self.is_locked && self.status != ListingStatus::Owned {
            out.push("lock only while owned");
        }
        if self.price < 0 {
            out.push("price non-negative");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Buy { buyer: u64 },
    /// Already-confirmed purchase of a locked item at the buyout premium.
    ForcedBuyout { buyer: u64 },
    Lock { actor: u64 },
    Unlock { actor: u64 },
    Resell { actor: u64, price: i64 },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Buy { .. } => "buy",
            Event::ForcedBuyout { .. } => "forced_buyout",
            Event::Lock { .. } => "lock",
            Event::Unlock { .. } => "unlock",
            Event::Resell { .. } => "resell",
        }
    }

    pub fn actor(&self) -> u64 {
        match self {
            Event::Buy { buyer } | Event::ForcedBuyout { buyer } => *buyer,
            Event::Lock { actor } | Event::Unlock { actor } | Event::Resell { actor, .. } => *actor,
        }
    }
}

/// Economic parameters of settlement, in basis points.
#[derive(Debug, Clone)]
pub struct Rules {
    pub house_id: u64,
    pub tax_bp: i64,
    pub inflation_bp: i64,
    pub forced_multiplier: i64,
    pub min_resell_price: i64,
}

impl Rules {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            house_id: cfg.house_id,
            tax_bp: to_bp(cfg.tax_rate),
            inflation_bp: to_bp(cfg.inflation_rate),
            forced_multiplier: cfg.forced_buyout_multiplier,
            min_resell_price: cfg.min_resell_price,
        }
    }
}

/// Ledger movements implied by a purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub item_id: i64,
    pub buyer: u64,
    pub seller: u64,
    /// Debited from the buyer.
    pub paid: i64,
    /// Credited to the seller; zero for house sales.
    pub payout: i64,
    /// Leaves circulation: the tax on user sales, the whole price on house sales.
    pub burned: i64,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    Settle(Settlement),
}

pub fn apply_event(listing: &mut Listing, event: Event, rules: &Rules) -> MarketResult<Effect> {
    let item_id = listing.item_id;
    match event {
        Event::Buy { buyer } => {
            if listing.status != ListingStatus::OnSale {
                return Err(MarketError::NotOnSale { item_id });
            }
            if buyer == listing.seller_id {
                return Err(MarketError::SelfPurchase { item_id });
            }
            let settlement = settlement_for(listing, buyer, listing.seller_id, listing.price, false, rules);
            transfer_ownership(listing, buyer, listing.seller_id, rules);
            Ok(Effect::Settle(settlement))
        }
        Event::ForcedBuyout { buyer } => {
            let owner = match (listing.status, listing.buyer_id) {
                (ListingStatus::Owned, Some(owner)) => owner,
                _ => {
                    return Err(MarketError::InvalidTransition(format!(
                        "forced buyout of listing {} requires an owned item",
                        item_id
                    )))
                }
            };
            if !listing.is_locked {
                return Err(MarketError::NotLocked { item_id });
            }
            if buyer == owner {
                return Err(MarketError::SelfPurchase { item_id });
            }
            let paid = listing
                .price
                .checked_mul(rules.forced_multiplier)
                .ok_or_else(|| MarketError::InvalidTransition("buyout price overflow".to_string()))?;
            let settlement = settlement_for(listing, buyer, owner, paid, true, rules);
            transfer_ownership(listing, buyer, owner, rules);
            Ok(Effect::Settle(settlement))
        }
        Event::Lock { actor } => {
            ensure_owner(listing, actor)?;
            listing.is_locked = true;
            Ok(Effect::None)
        }
        Event::Unlock { actor } => {
            ensure_owner(listing, actor)?;
            listing.is_locked = false;
            Ok(Effect::None)
        }
        Event::Resell { actor, price } => {
            ensure_owner(listing, actor)?;
            if price < rules.min_resell_price {
                return Err(MarketError::PriceTooLow { price, minimum: rules.min_resell_price });
            }
            listing.status = ListingStatus::OnSale;
            listing.price = price;
            listing.seller_id = actor;
            listing.buyer_id = None;
            listing.is_locked = false;
            Ok(Effect::None)
        }
    }
}

fn ensure_owner(listing: &Listing, actor: u64) -> MarketResult<()> {
    if listing.owner() == Some(actor) {
        Ok(())
    } else {
        Err(MarketError::NotOwner { actor, item_id: listing.item_id })
    }
}

fn settlement_for(listing: &Listing, buyer: u64, seller: u64, paid: i64, forced: bool, rules: &Rules) -> Settlement {
    let payout = if seller == rules.house_id {
        0
    } else {
        scale_bp(paid, BP - rules.tax_bp)
    };
    Settlement {
        item_id: listing.item_id,
        buyer,
        seller,
        paid,
        payout,
        burned: paid - payout,
        forced,
    }
}

fn transfer_ownership(listing: &mut Listing, buyer: u64, seller: u64, rules: &Rules) {
    listing.status = ListingStatus::Owned;
    listing.buyer_id = Some(buyer);
    listing.seller_id = seller;
    listing.is_locked = false;
    listing.price = scale_bp(listing.price, BP + rules.inflation_bp);
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUSE: u64 = 1;

    fn rules() -> Rules {
        Rules::from_config(&Config { house_id: HOUSE, ..Config::default() })
    }

    fn on_sale(seller: u64, price: i64) -> Listing {
        Listing {
            item_id: 7,
            seller_id: seller,
            buyer_id: None,
            image_url: "https://cdn.example/a.png".into(),
            image_hash: None,
            score: 8.0,
            price,
            status: ListingStatus::OnSale,
            grade: Grade::A,
            tags: vec![],
            is_locked: false,
            display: None,
        }
    }

    #[test]
    fn test_buy_from_house_burns_full_price() {
        let mut l = on_sale(HOUSE, 1000);
        let effect = apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap();
        let Effect::Settle(s) = effect else { panic!("expected settlement") };
        assert_eq!((s.paid, s.payout, s.burned), (1000, 0, 1000));
        assert_eq!(l.status, ListingStatus::Owned);
        assert_eq!(l.buyer_id, Some(5));
        assert_eq!(l.price, 1100);
        assert!(l.invariant_violations().is_empty());
    }

    #[test]
    fn test_buy_from_user_pays_after_tax() {
        let mut l = on_sale(9, 1001);
        let Effect::Settle(s) = apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap() else {
            panic!("expected settlement")
        };
        assert_eq!(s.payout, 800);
        assert_eq!(s.burned, 201);
        assert_eq!(s.seller, 9);
    }

    #[test]
    fn test_buy_rejections_leave_listing_unchanged() {
        let mut l = on_sale(9, 500);
        let before = l.clone();
        assert!(matches!(
            apply_event(&mut l, Event::Buy { buyer: 9 }, &rules()),
            Err(MarketError::SelfPurchase { .. })
        ));
        assert_eq!(l, before);

        apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap();
        let owned = l.clone();
        assert!(matches!(
            apply_event(&mut l, Event::Buy { buyer: 6 }, &rules()),
            Err(MarketError::NotOnSale { .. })
        ));
        assert_eq!(l, owned);
    }

    #[test]
    fn test_lock_requires_owner() {
        let mut l = on_sale(9, 500);
        assert!(matches!(
            apply_event(&mut l, Event::Lock { actor: 9 }, &rules()),
            Err(MarketError::NotOwner { .. })
        ));
        apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap();
        assert!(matches!(
            apply_event(&mut l, Event::Lock { actor: 6 }, &rules()),
            Err(MarketError::NotOwner { .. })
        ));
        apply_event(&mut l, Event::Lock { actor: 5 }, &rules()).unwrap();
        assert!(l.is_locked);
        apply_event(&mut l, Event::Unlock { actor: 5 }, &rules()).unwrap();
        assert!(!l.is_locked);
    }

    #[test]
    fn test_forced_buyout_doubles_price() {
        let mut l = on_sale(HOUSE, 1000);
        apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap();
        apply_event(&mut l, Event::Lock { actor: 5 }, &rules()).unwrap();
        let Effect::Settle(s) = apply_event(&mut l, Event::ForcedBuyout { buyer: 6 }, &rules()).unwrap() else {
            panic!("expected settlement")
        };
        assert_eq!(s.paid, 2200);
        assert_eq!(s.seller, 5);
        assert_eq!(s.payout, 1760);
        assert!(s.forced);
        assert_eq!(l.buyer_id, Some(6));
        assert!(!l.is_locked);
        assert_eq!(l.price, 1210);
    }

    #[test]
    fn test_forced_buyout_requires_lock() {
        let mut l = on_sale(HOUSE, 1000);
        assert!(matches!(
            apply_event(&mut l, Event::ForcedBuyout { buyer: 6 }, &rules()),
            Err(MarketError::InvalidTransition(_))
        ));
        apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap();
        assert!(matches!(
            apply_event(&mut l, Event::ForcedBuyout { buyer: 6 }, &rules()),
            Err(MarketError::NotLocked { .. })
        ));
    }

    #[test]
    fn test_resell_floor() {
        let mut l = on_sale(HOUSE, 1000);
        apply_event(&mut l, Event::Buy { buyer: 5 }, &rules()).unwrap();
        let owned = l.clone();
        assert!(matches!(
            apply_event(&mut l, Event::Resell { actor: 5, price: 99 }, &rules()),
            Err(MarketError::PriceTooLow { price: 99, minimum: 100 })
        ));
        assert_eq!(l, owned);
        apply_event(&mut l, Event::Resell { actor: 5, price: 100 }, &rules()).unwrap();
        assert_eq!(l.status, ListingStatus::OnSale);
        assert_eq!(l.seller_id, 5);
        assert_eq!(l.buyer_id, None);
        assert_eq!(l.price, 100);
        assert!(l.invariant_violations().is_empty());
    }

    #[test]
    fn test_status_parse_accepts_legacy_sold() {
        assert_eq!(ListingStatus::parse("sold"), Some(ListingStatus::Owned));
        assert_eq!(ListingStatus::parse("gone"), None);
    }
}
