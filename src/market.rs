//! Marketplace service.
//!
//! Every state transition runs inside one `UnitOfWork`: the listing read, the
//! state check, ledger movements, trend counters and the display relocation
//! either all commit or all roll back. Gallery posts made before a failed
//! commit are retracted.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use crate::appraisal::{Appraisal, Appraiser, TagResult};
use crate::config::Config;
use crate::duplicate;
use crate::error::{MarketError, MarketResult};
use crate::gallery::{DisplayLocation, DisplayTarget, GalleryPoster, PostContent, PostError};
use crate::ledger::{Account, Ledger, SqliteBank};
use crate::listing::{apply_event, Effect, Event, Listing, ListingStatus, Rules, Settlement};
use crate::logging::{
    content_digest, log, log_listing, log_rejection, log_settlement, obj, v_str, Domain, Level,
};
use crate::phash::phash;
use crate::pricing::{self, Grade};
use crate::store::{Store, UnitOfWork};
use crate::trends;

const FORUM_TITLE_CHARS: usize = 30;
pub const MARKET_PAGE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub item_id: i64,
    /// Credited to the uploader.
    pub payout: i64,
    /// Ask shown to buyers (payout with house markup).
    pub listing_price: i64,
    pub grade: Grade,
    pub score: f64,
    pub tags: Vec<String>,
    pub characters: Vec<String>,
    pub display: DisplayLocation,
    pub appraisal_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalleryRegistration {
    pub thread_id: u64,
    pub created: bool,
    pub bonus: i64,
}

pub struct Marketplace {
    cfg: Config,
    rules: Rules,
    store: Store,
    ledger: Arc<dyn Ledger>,
    gallery: Arc<dyn GalleryPoster>,
    appraiser: Appraiser,
}

fn post_error(err: PostError) -> MarketError {
    match err {
        PostError::NotFound(why) => MarketError::DisplayTargetUnavailable(why),
        PostError::Transient(why) => MarketError::Display(why),
    }
}

fn report<T>(operation: &str, result: MarketResult<T>) -> MarketResult<T> {
    if let Err(err) = &result {
        log_rejection(Domain::Market, operation, err.kind(), &err.to_string());
    }
    result
}

pub fn forum_title(grade: Grade, summary: &str) -> String {
    if summary.is_empty() {
        return format!("[{}] Item", grade.as_str());
    }
    let mut chars = summary.chars();
    let head: String = chars.by_ref().take(FORUM_TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("[{}] {}...", grade.as_str(), head)
    } else {
        format!("[{}] {}", grade.as_str(), head)
    }
}

fn sale_content(listing: &Listing, seller_label: &str, characters: &[String]) -> PostContent {
    let mut body = format!(
        "Seller: {}\nPrice: {} credits\nGrade: {} ({:.2})",
        seller_label,
        listing.price,
        listing.grade.as_str(),
        listing.score
    );
    if !characters.is_empty() {
        body.push_str(&format!("\nCharacters: {}", characters.join(", ")));
    }
    let tags = if listing.tags.is_empty() { "None".to_string() } else { listing.tags.join(", ") };
    body.push_str(&format!("\nTags: {}\nImage: {}", tags, listing.image_url));
    PostContent::new(format!("For sale (ID: #{})", listing.item_id), body)
}

fn owned_content(listing: &Listing, owner: u64) -> PostContent {
    PostContent::new(
        format!("Owned (ID: #{})", listing.item_id),
        format!(
            "Owner: {}\nImage: {}\nTags: {}",
            owner,
            listing.image_url,
            listing.tags.join(", ")
        ),
    )
}

fn sold_content(listing: &Listing) -> PostContent {
    PostContent::new(format!("Sold (ID: #{})", listing.item_id), String::new())
}

impl Marketplace {
    pub fn new(cfg: Config, store: Store, gallery: Arc<dyn GalleryPoster>, appraiser: Appraiser) -> Self {
        Self {
            rules: Rules::from_config(&cfg),
            cfg,
            store,
            ledger: Arc::new(SqliteBank),
            gallery,
            appraiser,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn appraiser(&self) -> &Appraiser {
        &self.appraiser
    }

    fn account(&self, user: u64) -> Account {
        Account::new(user, self.cfg.ledger_scope)
    }

    fn house_label(&self, seller: u64) -> String {
        if seller == self.cfg.house_id {
            "house".to_string()
        } else {
            seller.to_string()
        }
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Full upload pipeline: fingerprint, duplicate gate, appraisal, pricing
    /// and listing.
    pub async fn upload(&self, uploader: u64, image_url: &str, bytes: &[u8]) -> MarketResult<UploadReceipt> {
        report("upload", self.upload_inner(uploader, image_url, bytes).await)
    }

    async fn upload_inner(&self, uploader: u64, image_url: &str, bytes: &[u8]) -> MarketResult<UploadReceipt> {
        let digest = content_digest(bytes);
        let hash = phash(bytes)?.to_hex();
        log(
            Level::Info,
            Domain::Market,
            "upload_received",
            obj(&[
                ("user_id", json!(uploader)),
                ("sha256", v_str(&digest)),
                ("phash", v_str(&hash)),
            ]),
        );

        let verdict = {
            let uow = self.store.begin().await?;
            duplicate::evaluate(&uow, Some(hash.as_str()), self.cfg.duplicate_threshold)?
        };
        if verdict.is_duplicate() {
            return Err(MarketError::DuplicateDetected { distance: verdict.nearest });
        }

        let mut file = tempfile::Builder::new().prefix("appraisal-").suffix(".img").tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;

        let appraisal = self.appraiser.appraise(file.path()).await;
        self.list_appraised(uploader, image_url, Some(&hash), &appraisal, Some(file.path()))
            .await
    }

    /// List transition: house listing at the marked-up price, uploader paid the
    /// unmarked price, tag saturation bumped, item posted. All or nothing.
    pub async fn list_appraised(
        &self,
        uploader: u64,
        image_url: &str,
        hash: Option<&str>,
        appraisal: &Appraisal,
        image: Option<&Path>,
    ) -> MarketResult<UploadReceipt> {
        let mut uow = self.store.begin().await?;
        if hash.is_some() {
            // another upload of the same image may have committed meanwhile
            let verdict = duplicate::evaluate(&uow, hash, self.cfg.duplicate_threshold)?;
            if verdict.is_duplicate() {
                return Err(MarketError::DuplicateDetected { distance: verdict.nearest });
            }
        }

        let tags = &appraisal.tags.general;
        let saturation = trends::snapshot(&uow, tags)?;
        let quote = pricing::price(appraisal.score, tags, &appraisal.tags.characters, |t| {
            saturation.get(t).copied()
        });
        let listing_price = pricing::house_listing_price(quote.final_price, self.cfg.house_markup);
        log(
            Level::Info,
            Domain::Pricing,
            "quote",
            obj(&[
                ("user_id", json!(uploader)),
                ("base", json!(quote.base)),
                ("modifier", json!(quote.modifier)),
                ("character_bonus", json!(quote.character_bonus)),
                ("final_price", json!(quote.final_price)),
                ("listing_price", json!(listing_price)),
                ("grade", v_str(quote.grade.as_str())),
            ]),
        );

        let mut listing = Listing {
            item_id: 0,
            seller_id: self.cfg.house_id,
            buyer_id: None,
            image_url: image_url.to_string(),
            image_hash: hash.map(str::to_string),
            score: quote.score,
            price: listing_price,
            status: ListingStatus::OnSale,
            grade: quote.grade,
            tags: tags.clone(),
            is_locked: false,
            display: None,
        };
        listing.item_id = uow.insert_listing(&listing)?;

        let content = sale_content(&listing, "house", &appraisal.tags.characters);
        let house_thread = uow.gallery_thread(self.cfg.house_id)?;
        let location = self
            .post_listing(house_thread, &listing, &appraisal.tags, &content, image)
            .await?;
        listing.display = Some(location);

        let staged = self.stage_listing(&mut uow, uploader, quote.final_price, &listing);
        let committed = match staged {
            Ok(()) => uow.commit(),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            self.retract(&location).await;
            return Err(err);
        }

        log_listing(
            "listed",
            listing.item_id,
            uploader,
            &[
                ("payout", json!(quote.final_price)),
                ("listing_price", json!(listing_price)),
                ("thread_id", json!(location.thread_id)),
            ],
        );
        Ok(UploadReceipt {
            item_id: listing.item_id,
            payout: quote.final_price,
            listing_price,
            grade: quote.grade,
            score: quote.score,
            tags: listing.tags,
            characters: appraisal.tags.characters.clone(),
            display: location,
            appraisal_fallback: appraisal.tags.is_fallback() || appraisal.score_fallback,
        })
    }

    fn stage_listing(&self, uow: &mut UnitOfWork, uploader: u64, payout: i64, listing: &Listing) -> MarketResult<()> {
        self.ledger.deposit(uow, self.account(uploader), payout)?;
        trends::increment(uow, &listing.tags)?;
        uow.save_listing(listing)
    }

    /// House gallery first; a missing house thread falls back to a new forum
    /// thread. A missing forum aborts the listing.
    async fn post_listing(
        &self,
        house_thread: Option<u64>,
        listing: &Listing,
        tags: &TagResult,
        content: &PostContent,
        image: Option<&Path>,
    ) -> MarketResult<DisplayLocation> {
        if let Some(thread) = house_thread {
            match self
                .gallery
                .post(&DisplayTarget::Thread(thread), content, image, listing.item_id)
                .await
            {
                Ok(loc) => return Ok(loc),
                Err(PostError::NotFound(why)) => log(
                    Level::Warn,
                    Domain::Gallery,
                    "house_gallery_missing",
                    obj(&[("item_id", json!(listing.item_id)), ("msg", v_str(&why))]),
                ),
                Err(err) => return Err(post_error(err)),
            }
        }
        let target = DisplayTarget::Forum {
            forum: self.cfg.gallery_forum.clone(),
            title: forum_title(listing.grade, &tags.summary),
        };
        self.gallery
            .post(&target, content, image, listing.item_id)
            .await
            .map_err(post_error)
    }

    // =========================================================================
    // Purchases
    // =========================================================================

    pub async fn buy(&self, buyer: u64, item_id: i64) -> MarketResult<Settlement> {
        report("buy", self.settle(item_id, Event::Buy { buyer }).await)
    }

    /// Buy button path: the listing is identified by the post it is shown in.
    pub async fn buy_at(&self, buyer: u64, location: DisplayLocation) -> MarketResult<Settlement> {
        let item_id = {
            let uow = self.store.begin().await?;
            uow.listing_at(&location)?.map(|l| l.item_id)
        };
        match item_id {
            Some(id) => self.buy(buyer, id).await,
            None => report(
                "buy",
                Err(MarketError::NoListingAt {
                    thread_id: location.thread_id,
                    message_id: location.message_id,
                }),
            ),
        }
    }

    /// Purchase of a locked item at the buyout premium. Confirmation happens
    /// upstream; this call executes it.
    pub async fn force_buy(&self, buyer: u64, item_id: i64) -> MarketResult<Settlement> {
        report("forced_buyout", self.settle(item_id, Event::ForcedBuyout { buyer }).await)
    }

    async fn settle(&self, item_id: i64, event: Event) -> MarketResult<Settlement> {
        let mut uow = self.store.begin().await?;
        let mut listing = uow
            .load_listing(item_id)?
            .ok_or(MarketError::ListingNotFound(item_id))?;
        let previous = listing.display;

        let settlement = match apply_event(&mut listing, event, &self.rules)? {
            Effect::Settle(s) => s,
            Effect::None => {
                return Err(MarketError::InvalidTransition("purchase without settlement".to_string()))
            }
        };
        self.ledger.withdraw(&mut uow, self.account(settlement.buyer), settlement.paid)?;
        if settlement.payout > 0 {
            self.ledger.deposit(&mut uow, self.account(settlement.seller), settlement.payout)?;
        }

        let buyer_thread = uow.gallery_thread(settlement.buyer)?;
        let relocated = self
            .post_to_gallery(buyer_thread, &owned_content(&listing, settlement.buyer), listing.item_id)
            .await?;
        listing.display = relocated;

        let committed = match uow.save_listing(&listing) {
            Ok(()) => uow.commit(),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            if let Some(loc) = relocated {
                self.retract(&loc).await;
            }
            return Err(err);
        }

        if let Some(old) = previous {
            self.take_down(&old, &listing).await;
        }
        log_settlement(
            item_id,
            settlement.buyer,
            settlement.seller,
            settlement.paid,
            settlement.payout,
            settlement.burned,
            settlement.forced,
        );
        Ok(settlement)
    }

    /// Posts to a user's gallery. No gallery, or a gallery whose thread is
    /// gone, leaves the item as a store-only record.
    async fn post_to_gallery(
        &self,
        thread: Option<u64>,
        content: &PostContent,
        item_id: i64,
    ) -> MarketResult<Option<DisplayLocation>> {
        let Some(thread) = thread else {
            log(
                Level::Info,
                Domain::Gallery,
                "no_gallery",
                obj(&[("item_id", json!(item_id)), ("msg", v_str("kept as store-only record"))]),
            );
            return Ok(None);
        };
        match self
            .gallery
            .post(&DisplayTarget::Thread(thread), content, None, item_id)
            .await
        {
            Ok(loc) => Ok(Some(loc)),
            Err(PostError::NotFound(why)) => {
                log(
                    Level::Warn,
                    Domain::Gallery,
                    "gallery_missing",
                    obj(&[("item_id", json!(item_id)), ("thread_id", json!(thread)), ("msg", v_str(&why))]),
                );
                Ok(None)
            }
            Err(err) => Err(post_error(err)),
        }
    }

    async fn retract(&self, location: &DisplayLocation) {
        if let Err(err) = self.gallery.delete(location).await {
            log(
                Level::Error,
                Domain::Gallery,
                "retract_failed",
                obj(&[
                    ("thread_id", json!(location.thread_id)),
                    ("message_id", json!(location.message_id)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
    }

    /// Removes the seller-side post after a committed sale; falls back to
    /// marking it sold when it cannot be deleted.
    async fn take_down(&self, location: &DisplayLocation, listing: &Listing) {
        if self.gallery.delete(location).await.is_ok() {
            return;
        }
        if let Err(err) = self.gallery.edit(location, &sold_content(listing)).await {
            log(
                Level::Warn,
                Domain::Gallery,
                "take_down_failed",
                obj(&[("item_id", json!(listing.item_id)), ("error", v_str(&err.to_string()))]),
            );
        }
    }

    // =========================================================================
    // Owner actions
    // =========================================================================

    pub async fn lock(&self, actor: u64, item_id: i64) -> MarketResult<Listing> {
        report("lock", self.transition(item_id, Event::Lock { actor }).await)
    }

    pub async fn unlock(&self, actor: u64, item_id: i64) -> MarketResult<Listing> {
        report("unlock", self.transition(item_id, Event::Unlock { actor }).await)
    }

    async fn transition(&self, item_id: i64, event: Event) -> MarketResult<Listing> {
        let name = event.name();
        let actor = event.actor();
        let mut uow = self.store.begin().await?;
        let mut listing = uow
            .load_listing(item_id)?
            .ok_or(MarketError::ListingNotFound(item_id))?;
        apply_event(&mut listing, event, &self.rules)?;
        uow.save_listing(&listing)?;
        uow.commit()?;
        log_listing(name, item_id, actor, &[("locked", json!(listing.is_locked))]);
        Ok(listing)
    }

    /// Puts an owned item back on sale at `price`. The existing post is edited
    /// in place; if it is gone the item is posted to the reseller's gallery.
    pub async fn resell(&self, actor: u64, item_id: i64, price: i64) -> MarketResult<Listing> {
        report("resell", self.resell_inner(actor, item_id, price).await)
    }

    async fn resell_inner(&self, actor: u64, item_id: i64, price: i64) -> MarketResult<Listing> {
        let mut uow = self.store.begin().await?;
        let mut listing = uow
            .load_listing(item_id)?
            .ok_or(MarketError::ListingNotFound(item_id))?;
        let before = listing.clone();
        apply_event(&mut listing, Event::Resell { actor, price }, &self.rules)?;

        let content = sale_content(&listing, &self.house_label(actor), &[]);
        let mut edited = None;
        if let Some(loc) = listing.display {
            match self.gallery.edit(&loc, &content).await {
                Ok(()) => edited = Some(loc),
                Err(PostError::NotFound(_)) => {}
                Err(err) => return Err(post_error(err)),
            }
        }
        let posted = match edited {
            Some(_) => None,
            None => {
                let thread = uow.gallery_thread(actor)?;
                self.post_to_gallery(thread, &content, item_id).await?
            }
        };
        listing.display = edited.or(posted);

        let committed = match uow.save_listing(&listing) {
            Ok(()) => uow.commit(),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            if let Some(loc) = posted {
                self.retract(&loc).await;
            }
            if let Some(loc) = edited {
                let _ = self.gallery.edit(&loc, &owned_content(&before, actor)).await;
            }
            return Err(err);
        }
        log_listing(
            "resell",
            item_id,
            actor,
            &[("price", json!(price)), ("store_only", json!(listing.display.is_none()))],
        );
        Ok(listing)
    }

    // =========================================================================
    // Galleries and ledger
    // =========================================================================

    /// Registers a gallery thread for `user` and pays the welcome bonus.
    /// Already-registered users get their existing thread back.
    pub async fn join(&self, user: u64, display_name: &str) -> MarketResult<GalleryRegistration> {
        report("join", self.join_inner(user, display_name).await)
    }

    async fn join_inner(&self, user: u64, display_name: &str) -> MarketResult<GalleryRegistration> {
        let mut uow = self.store.begin().await?;
        if let Some(thread_id) = uow.gallery_thread(user)? {
            return Ok(GalleryRegistration { thread_id, created: false, bonus: 0 });
        }
        let target = DisplayTarget::Forum {
            forum: self.cfg.gallery_forum.clone(),
            title: format!("Gallery: {}", display_name),
        };
        let content = PostContent::new(format!("{}'s gallery", display_name), String::new());
        let location = self
            .gallery
            .post(&target, &content, None, 0)
            .await
            .map_err(post_error)?;

        let bonus = if user == self.cfg.house_id { 0 } else { self.cfg.welcome_bonus };
        let staged = match uow.register_gallery(user, location.thread_id) {
            Ok(()) => self.ledger.deposit(&mut uow, self.account(user), bonus),
            Err(err) => Err(err),
        };
        let committed = match staged {
            Ok(()) => uow.commit(),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            self.retract(&location).await;
            return Err(err);
        }
        log(
            Level::Info,
            Domain::Gallery,
            "gallery_registered",
            obj(&[("user_id", json!(user)), ("thread_id", json!(location.thread_id)), ("bonus", json!(bonus))]),
        );
        Ok(GalleryRegistration { thread_id: location.thread_id, created: true, bonus })
    }

    pub async fn balance(&self, user: u64) -> MarketResult<i64> {
        let uow = self.store.begin().await?;
        self.ledger.balance(&uow, self.account(user))
    }

    /// Issues new currency to `user`.
    pub async fn deposit(&self, user: u64, amount: i64) -> MarketResult<()> {
        let account = self.account(user);
        let ledger = self.ledger.clone();
        report("deposit", self.store.run(None, |uow| ledger.deposit(uow, account, amount)).await)
    }

    pub async fn transfer(&self, from: u64, to: u64, amount: i64) -> MarketResult<()> {
        let (a, b) = (self.account(from), self.account(to));
        let ledger = self.ledger.clone();
        report("transfer", self.store.run(None, |uow| ledger.transfer(uow, a, b, amount)).await)
    }

    // =========================================================================
    // Queries and admin
    // =========================================================================

    pub async fn listing(&self, item_id: i64) -> MarketResult<Listing> {
        let uow = self.store.begin().await?;
        uow.load_listing(item_id)?.ok_or(MarketError::ListingNotFound(item_id))
    }

    pub async fn inventory(&self, user: u64) -> MarketResult<Vec<Listing>> {
        let uow = self.store.begin().await?;
        uow.inventory(user)
    }

    pub async fn market(&self) -> MarketResult<Vec<Listing>> {
        let uow = self.store.begin().await?;
        uow.on_sale(MARKET_PAGE)
    }

    /// Forgets all fingerprints; earlier uploads stop counting as duplicates.
    pub async fn reset_risk(&self) -> MarketResult<usize> {
        let uow = self.store.begin().await?;
        let cleared = uow.clear_hashes()?;
        uow.commit()?;
        log(Level::Info, Domain::System, "risk_reset", obj(&[("cleared", json!(cleared))]));
        Ok(cleared)
    }

    /// Wipes listings, trends, galleries and balances.
    pub async fn reset(&self) -> MarketResult<()> {
        let uow = self.store.begin().await?;
        uow.wipe()?;
        uow.commit()?;
        log(Level::Warn, Domain::System, "store_reset", obj(&[]));
        Ok(())
    }

    pub async fn decay_trends(&self) -> MarketResult<usize> {
        trends::run_decay(&self.store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forum_title() {
        assert_eq!(forum_title(Grade::A, ""), "[A] Item");
        assert_eq!(forum_title(Grade::S, "1girl, smile"), "[S] 1girl, smile");
        let long = "a".repeat(40);
        assert_eq!(forum_title(Grade::B, &long), format!("[B] {}...", "a".repeat(30)));
        let exact = "b".repeat(30);
        assert_eq!(forum_title(Grade::B, &exact), format!("[B] {}", exact));
    }

    #[test]
    fn test_owned_content_keeps_image() {
        let listing = Listing {
            item_id: 9,
            seller_id: 0,
            buyer_id: Some(3),
            image_url: "https://cdn.example.com/9.png".into(),
            image_hash: None,
            score: 6.0,
            price: 500,
            status: ListingStatus::Owned,
            grade: Grade::B,
            tags: vec!["smile".into()],
            is_locked: false,
            display: None,
        };
        let c = owned_content(&listing, 3);
        assert_eq!(c.headline, "Owned (ID: #9)");
        assert!(c.body.contains("Image: https://cdn.example.com/9.png"));
        assert!(c.body.contains("Owner: 3"));
    }

    #[test]
    fn test_sale_content_lists_tags() {
        let listing = Listing {
            item_id: 4,
            seller_id: 0,
            buyer_id: None,
            image_url: String::new(),
            image_hash: None,
            score: 7.5,
            price: 1234,
            status: ListingStatus::OnSale,
            grade: Grade::A,
            tags: vec!["smile".into()],
            is_locked: false,
            display: None,
        };
        let c = sale_content(&listing, "house", &["alice".to_string()]);
        assert_eq!(c.headline, "For sale (ID: #4)");
        assert!(c.body.contains("Price: 1234 credits"));
        assert!(c.body.contains("Characters: alice"));
        assert!(c.body.contains("Tags: smile"));
    }
}
