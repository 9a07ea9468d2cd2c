//! Per-tag market saturation.
//!
//! Each listing bumps every distinct tag it carries by one. Once a day every
//! positive counter decays to `floor(0.9 * x)`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::MarketResult;
use crate::logging::{log, obj, Domain, Level, ProfileScope};
use crate::store::{Store, UnitOfWork};

pub fn decay_value(saturation: i64) -> i64 {
    if saturation <= 0 {
        0
    } else {
        saturation * 9 / 10
    }
}

pub fn increment(uow: &mut UnitOfWork, tags: &[String]) -> MarketResult<()> {
    let distinct: BTreeSet<&str> = tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
    for tag in distinct {
        uow.conn().execute(
            "INSERT INTO market_trends (tag_name, saturation) VALUES (?1, 1)
             ON CONFLICT(tag_name) DO UPDATE SET saturation = saturation + 1",
            params![tag],
        )?;
    }
    Ok(())
}

pub fn saturation(uow: &UnitOfWork, tag: &str) -> MarketResult<Option<i64>> {
    Ok(uow
        .conn()
        .query_row(
            "SELECT saturation FROM market_trends WHERE tag_name = ?1",
            params![tag],
            |r| r.get(0),
        )
        .optional()?)
}

/// Saturation of each known tag in `tags`; unknown tags are absent.
pub fn snapshot(uow: &UnitOfWork, tags: &[String]) -> MarketResult<HashMap<String, i64>> {
    let mut out = HashMap::new();
    for tag in tags {
        if let Some(sat) = saturation(uow, tag)? {
            out.insert(tag.clone(), sat);
        }
    }
    Ok(out)
}

/// Applies `decay_value` to every positive record. Returns the number of rows
/// changed.
pub fn decay_all(uow: &mut UnitOfWork) -> MarketResult<usize> {
    let rows: Vec<(String, i64)> = {
        let mut stmt = uow
            .conn()
            .prepare("SELECT tag_name, saturation FROM market_trends WHERE saturation > 0")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        let collected = rows.collect::<Result<Vec<_>, _>>()?;
        collected
    };
    for (tag, sat) in &rows {
        uow.conn().execute(
            "UPDATE market_trends SET saturation = ?2 WHERE tag_name = ?1",
            params![tag, decay_value(*sat)],
        )?;
    }
    Ok(rows.len())
}

/// Delay from `now` until the next `hour:00` UTC strictly after `now`.
pub fn until_next_run(now: DateTime<Utc>, hour: u32) -> Duration {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|n| Utc.from_utc_datetime(&n))
        .unwrap_or(now);
    let next = if today > now { today } else { today + ChronoDuration::days(1) };
    (next - now).to_std().unwrap_or(Duration::from_secs(0))
}

pub async fn run_decay(store: &Store) -> MarketResult<usize> {
    let _scope = ProfileScope::new("trend_decay");
    let mut uow = store.begin().await?;
    let changed = decay_all(&mut uow)?;
    uow.commit()?;
    log(
        Level::Info,
        Domain::Trends,
        "decay",
        obj(&[("records", json!(changed))]),
    );
    Ok(changed)
}

/// Runs `run_decay` every day at `hour` UTC until `shutdown` flips to true.
pub fn spawn_daily_decay(store: Store, hour: u32, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let wait = until_next_run(now, hour);
            log(
                Level::Debug,
                Domain::Trends,
                "decay_scheduled",
                obj(&[("in_secs", json!(wait.as_secs())), ("hour", json!(hour))]),
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(err) = run_decay(&store).await {
                        log(
                            Level::Error,
                            Domain::Trends,
                            "decay_failed",
                            obj(&[("error", json!(err.to_string()))]),
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_value() {
        assert_eq!(decay_value(0), 0);
        assert_eq!(decay_value(1), 0);
        assert_eq!(decay_value(10), 9);
        assert_eq!(decay_value(19), 17);
        for x in 1..500 {
            let once = decay_value(x);
            assert!(once >= 0);
            assert!(decay_value(once) <= once);
            assert!(once < x);
        }
    }

    #[tokio::test]
    async fn test_decay_all_follows_decay_value() {
        let store = Store::open_in_memory().unwrap();
        let mut uow = store.begin().await.unwrap();
        for x in [1i64, 2, 9, 10, 11, 57, 1000] {
            uow.conn()
                .execute(
                    "INSERT INTO market_trends (tag_name, saturation) VALUES (?1, ?2)",
                    params![format!("t{}", x), x],
                )
                .unwrap();
        }
        assert_eq!(decay_all(&mut uow).unwrap(), 7);
        for x in [1i64, 2, 9, 10, 11, 57, 1000] {
            let tag = format!("t{}", x);
            assert_eq!(saturation(&uow, &tag).unwrap(), Some(decay_value(x)));
        }
    }

    #[test]
    fn test_until_next_run() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).single().unwrap();
        assert_eq!(until_next_run(now, 12), Duration::from_secs(90 * 60));
        assert_eq!(until_next_run(now, 0), Duration::from_secs(13 * 3600 + 30 * 60));
        let exact = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap();
        assert_eq!(until_next_run(exact, 0), Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_increment_and_decay() {
        let store = Store::open_in_memory().unwrap();
        let mut uow = store.begin().await.unwrap();
        let tags: Vec<String> = vec!["a".into(), "b".into(), "a".into()];
        for _ in 0..10 {
            increment(&mut uow, &tags).unwrap();
        }
        increment(&mut uow, &["c".to_string()]).unwrap();
        assert_eq!(saturation(&uow, "a").unwrap(), Some(10));
        assert_eq!(saturation(&uow, "missing").unwrap(), None);
        assert_eq!(decay_all(&mut uow).unwrap(), 3);
        assert_eq!(saturation(&uow, "a").unwrap(), Some(9));
        assert_eq!(saturation(&uow, "c").unwrap(), Some(0));
        // zero stays zero and is not touched
        assert_eq!(decay_all(&mut uow).unwrap(), 2);
        assert_eq!(saturation(&uow, "c").unwrap(), Some(0));
        let snap = snapshot(&uow, &["a".to_string(), "zzz".to_string()]).unwrap();
        assert_eq!(snap.get("a"), Some(&8));
        assert!(!snap.contains_key("zzz"));
    }
}
