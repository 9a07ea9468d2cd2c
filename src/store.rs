//! SQLite persistence and the unit of work.
//!
//! A single connection sits behind an async mutex. `Store::begin` takes the
//! lock and opens an IMMEDIATE transaction; the returned `UnitOfWork` holds
//! both until it is committed or dropped (drop rolls back). Every read-check-
//! write sequence that must be atomic runs inside one unit.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::MarketResult;
use crate::gallery::DisplayLocation;
use crate::listing::{Listing, ListingStatus};
use crate::pricing::Grade;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS listings (
    item_id INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id INTEGER NOT NULL,
    buyer_id INTEGER,
    image_url TEXT NOT NULL,
    image_hash TEXT,
    score REAL NOT NULL,
    price INTEGER NOT NULL CHECK (price >= 0),
    status TEXT NOT NULL,
    grade TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    is_locked INTEGER NOT NULL DEFAULT 0,
    display_thread INTEGER,
    display_message INTEGER
);
CREATE INDEX IF NOT EXISTS idx_listings_thread ON listings(display_thread);
CREATE INDEX IF NOT EXISTS idx_listings_buyer ON listings(buyer_id);
CREATE TABLE IF NOT EXISTS market_trends (
    tag_name TEXT PRIMARY KEY,
    saturation INTEGER NOT NULL DEFAULT 0 CHECK (saturation >= 0)
);
CREATE TABLE IF NOT EXISTS galleries (
    user_id INTEGER PRIMARY KEY,
    display_thread INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS bank (
    user_id INTEGER NOT NULL,
    scope INTEGER NOT NULL,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    PRIMARY KEY (user_id, scope)
);";

const LISTING_COLUMNS: &str = "item_id, seller_id, buyer_id, image_url, image_hash, score, price, status, grade, tags, is_locked, display_thread, display_message";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> MarketResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(60))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> MarketResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> MarketResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn begin(&self) -> MarketResult<UnitOfWork> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(UnitOfWork { conn, open: true })
    }

    /// Runs `f` inside `shared` when given, otherwise inside a fresh unit that
    /// is committed on success.
    pub async fn run<T, F>(&self, shared: Option<&mut UnitOfWork>, f: F) -> MarketResult<T>
    where
        F: FnOnce(&mut UnitOfWork) -> MarketResult<T>,
    {
        match shared {
            Some(uow) => f(uow),
            None => {
                let mut uow = self.begin().await?;
                let out = f(&mut uow)?;
                uow.commit()?;
                Ok(out)
            }
        }
    }
}

pub struct UnitOfWork {
    conn: OwnedMutexGuard<Connection>,
    open: bool,
}

impl UnitOfWork {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn commit(mut self) -> MarketResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    pub fn rollback(mut self) -> MarketResult<()> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // listings
    // ---------------------------------------------------------------------

    pub fn insert_listing(&self, listing: &Listing) -> MarketResult<i64> {
        self.conn.execute(
            "INSERT INTO listings (seller_id, buyer_id, image_url, image_hash, score, price, status, grade, tags, is_locked, display_thread, display_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                listing.seller_id as i64,
                listing.buyer_id.map(|b| b as i64),
                listing.image_url,
                listing.image_hash,
                listing.score,
                listing.price,
                listing.status.as_str(),
                listing.grade.as_str(),
                encode_tags(&listing.tags),
                listing.is_locked,
                listing.display.map(|d| d.thread_id as i64),
                listing.display.map(|d| d.message_id as i64),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn save_listing(&self, listing: &Listing) -> MarketResult<()> {
        self.conn.execute(
            "UPDATE listings SET seller_id = ?2, buyer_id = ?3, image_hash = ?4, price = ?5, status = ?6,
                 is_locked = ?7, display_thread = ?8, display_message = ?9
             WHERE item_id = ?1",
            params![
                listing.item_id,
                listing.seller_id as i64,
                listing.buyer_id.map(|b| b as i64),
                listing.image_hash,
                listing.price,
                listing.status.as_str(),
                listing.is_locked,
                listing.display.map(|d| d.thread_id as i64),
                listing.display.map(|d| d.message_id as i64),
            ],
        )?;
        Ok(())
    }

    pub fn load_listing(&self, item_id: i64) -> MarketResult<Option<Listing>> {
        let sql = format!("SELECT {} FROM listings WHERE item_id = ?1", LISTING_COLUMNS);
        Ok(self.conn.query_row(&sql, params![item_id], row_to_listing).optional()?)
    }

    /// The listing shown by one post. Gallery threads hold many posts, so the
    /// message id is part of the key.
    pub fn listing_at(&self, location: &DisplayLocation) -> MarketResult<Option<Listing>> {
        let sql = format!(
            "SELECT {} FROM listings WHERE display_thread = ?1 AND display_message = ?2",
            LISTING_COLUMNS
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![location.thread_id as i64, location.message_id as i64],
                row_to_listing,
            )
            .optional()?)
    }

    /// Largest thread or message id referenced anywhere in the store, 0 when
    /// none is.
    pub fn max_display_id(&self) -> MarketResult<u64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(id) FROM (
                 SELECT MAX(display_thread) AS id FROM listings
                 UNION ALL SELECT MAX(display_message) FROM listings
                 UNION ALL SELECT MAX(display_thread) FROM galleries
             )",
            [],
            |r| r.get(0),
        )?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    /// Items owned by `user`, newest first.
    pub fn inventory(&self, user: u64) -> MarketResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {} FROM listings WHERE buyer_id = ?1 AND status IN ('owned', 'sold') ORDER BY item_id DESC",
            LISTING_COLUMNS
        );
        self.query_listings(&sql, params![user as i64])
    }

    pub fn on_sale(&self, limit: usize) -> MarketResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {} FROM listings WHERE status = 'on_sale' ORDER BY item_id DESC LIMIT ?1",
            LISTING_COLUMNS
        );
        self.query_listings(&sql, params![limit as i64])
    }

    fn query_listings(&self, sql: &str, args: impl rusqlite::Params) -> MarketResult<Vec<Listing>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, row_to_listing)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn stored_hashes(&self) -> MarketResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT image_hash FROM listings WHERE image_hash IS NOT NULL")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Forgets every fingerprint so earlier uploads no longer count as
    /// duplicates. Returns the number of rows touched.
    pub fn clear_hashes(&self) -> MarketResult<usize> {
        Ok(self
            .conn
            .execute("UPDATE listings SET image_hash = NULL WHERE image_hash IS NOT NULL", [])?)
    }

    // ---------------------------------------------------------------------
    // galleries
    // ---------------------------------------------------------------------

    pub fn gallery_thread(&self, user: u64) -> MarketResult<Option<u64>> {
        let thread: Option<i64> = self
            .conn
            .query_row(
                "SELECT display_thread FROM galleries WHERE user_id = ?1",
                params![user as i64],
                |r| r.get(0),
            )
            .optional()?;
        Ok(thread.map(|t| t as u64))
    }

    pub fn register_gallery(&self, user: u64, thread_id: u64) -> MarketResult<()> {
        self.conn.execute(
            "INSERT INTO galleries (user_id, display_thread) VALUES (?1, ?2)",
            params![user as i64, thread_id as i64],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // admin
    // ---------------------------------------------------------------------

    /// Wipes every table and restarts listing ids at 1.
    pub fn wipe(&self) -> MarketResult<()> {
        self.conn.execute_batch(
            "DELETE FROM listings;
             DELETE FROM market_trends;
             DELETE FROM galleries;
             DELETE FROM bank;
             DELETE FROM sqlite_sequence WHERE name = 'listings';",
        )?;
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.open {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn decode_tags(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn row_to_listing(row: &Row<'_>) -> rusqlite::Result<Listing> {
    let status: String = row.get(7)?;
    let status = ListingStatus::parse(&status)
        .ok_or_else(|| conversion_error(7, format!("unknown status {}", status)))?;
    let grade: String = row.get(8)?;
    let grade = Grade::parse(&grade).ok_or_else(|| conversion_error(8, format!("unknown grade {}", grade)))?;
    let tags: String = row.get(9)?;
    let thread: Option<i64> = row.get(11)?;
    let message: Option<i64> = row.get(12)?;
    let display = match thread {
        Some(t) if t != 0 => Some(DisplayLocation {
            thread_id: t as u64,
            message_id: message.unwrap_or(0) as u64,
        }),
        _ => None,
    };
    Ok(Listing {
        item_id: row.get(0)?,
        seller_id: row.get::<_, i64>(1)? as u64,
        buyer_id: row.get::<_, Option<i64>>(2)?.map(|b| b as u64),
        image_url: row.get(3)?,
        image_hash: row.get(4)?,
        score: row.get(5)?,
        price: row.get(6)?,
        status,
        grade,
        tags: decode_tags(&tags),
        is_locked: row.get(10)?,
        display,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Listing {
        Listing {
            item_id: 0,
            seller_id: 1,
            buyer_id: None,
            image_url: "https://cdn.example/a.png".into(),
            image_hash: Some("00ff000000000001".into()),
            score: 7.5,
            price: 1500,
            status: ListingStatus::OnSale,
            grade: Grade::A,
            tags: vec!["1girl".into(), "smile".into()],
            is_locked: false,
            display: Some(DisplayLocation { thread_id: 10, message_id: 11 }),
        }
    }

    #[tokio::test]
    async fn test_listing_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let uow = store.begin().await.unwrap();
        let id = uow.insert_listing(&sample()).unwrap();
        let loaded = uow.load_listing(id).unwrap().unwrap();
        assert_eq!(loaded, Listing { item_id: id, ..sample() });
        let at = DisplayLocation { thread_id: 10, message_id: 11 };
        assert_eq!(uow.listing_at(&at).unwrap().unwrap().item_id, id);
        uow.commit().unwrap();
    }

    #[tokio::test]
    async fn test_listing_at_matches_message() {
        let store = Store::open_in_memory().unwrap();
        let uow = store.begin().await.unwrap();
        let first = uow.insert_listing(&sample()).unwrap();
        let mut second = sample();
        second.display = Some(DisplayLocation { thread_id: 10, message_id: 12 });
        let second = uow.insert_listing(&second).unwrap();

        let at = |message_id| DisplayLocation { thread_id: 10, message_id };
        assert_eq!(uow.listing_at(&at(11)).unwrap().unwrap().item_id, first);
        assert_eq!(uow.listing_at(&at(12)).unwrap().unwrap().item_id, second);
        assert!(uow.listing_at(&at(13)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_display_id() {
        let store = Store::open_in_memory().unwrap();
        let uow = store.begin().await.unwrap();
        assert_eq!(uow.max_display_id().unwrap(), 0);
        uow.insert_listing(&sample()).unwrap();
        assert_eq!(uow.max_display_id().unwrap(), 11);
        uow.register_gallery(4, 2500).unwrap();
        assert_eq!(uow.max_display_id().unwrap(), 2500);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        {
            let uow = store.begin().await.unwrap();
            uow.insert_listing(&sample()).unwrap();
        }
        let uow = store.begin().await.unwrap();
        assert!(uow.on_sale(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_commits_own_unit() {
        let store = Store::open_in_memory().unwrap();
        let id = store.run(None, |uow| uow.insert_listing(&sample())).await.unwrap();
        let uow = store.begin().await.unwrap();
        assert!(uow.load_listing(id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wipe_resets_ids() {
        let store = Store::open_in_memory().unwrap();
        let uow = store.begin().await.unwrap();
        uow.insert_listing(&sample()).unwrap();
        uow.insert_listing(&sample()).unwrap();
        uow.register_gallery(3, 99).unwrap();
        uow.wipe().unwrap();
        assert_eq!(uow.insert_listing(&sample()).unwrap(), 1);
        assert_eq!(uow.gallery_thread(3).unwrap(), None);
        uow.commit().unwrap();
    }

    #[tokio::test]
    async fn test_clear_hashes() {
        let store = Store::open_in_memory().unwrap();
        let uow = store.begin().await.unwrap();
        uow.insert_listing(&sample()).unwrap();
        assert_eq!(uow.stored_hashes().unwrap().len(), 1);
        assert_eq!(uow.clear_hashes().unwrap(), 1);
        assert!(uow.stored_hashes().unwrap().is_empty());
    }
}
