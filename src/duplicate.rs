//! Near-duplicate detection over stored fingerprints.
//!
//! A linear scan: the candidate is compared with every non-null fingerprint
//! and the smallest Hamming distance decides the verdict.

use crate::error::MarketResult;
use crate::phash::ImageHash;
use crate::store::UnitOfWork;

pub const HIGH_RISK: u8 = 100;
pub const LOW_RISK: u8 = 0;
pub const UNKNOWN_RISK: u8 = 10;
/// Reported when nothing comparable is stored; wider than any 64-bit distance.
pub const NO_MATCH_DISTANCE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskVerdict {
    pub risk: u8,
    pub reason: String,
    pub nearest: u32,
}

impl RiskVerdict {
    pub fn is_duplicate(&self) -> bool {
        self.risk >= 50
    }

    fn unknown() -> Self {
        Self { risk: UNKNOWN_RISK, reason: "unknown".to_string(), nearest: 0 }
    }
}

/// Evaluates `candidate` against `stored`. An empty or unparseable candidate
/// yields the soft-failure verdict `(10, "unknown", 0)`; stored entries that
/// fail to parse are skipped.
pub fn evaluate_against<I, S>(candidate: Option<&str>, stored: I, threshold: u32) -> RiskVerdict
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let candidate = match candidate.filter(|c| !c.trim().is_empty()).and_then(ImageHash::from_hex) {
        Some(h) => h,
        None => return RiskVerdict::unknown(),
    };
    let nearest = stored
        .into_iter()
        .filter_map(|s| ImageHash::from_hex(s.as_ref()))
        .map(|h| candidate.distance(&h))
        .min()
        .unwrap_or(NO_MATCH_DISTANCE);

    if nearest <= threshold {
        RiskVerdict {
            risk: HIGH_RISK,
            reason: format!("similar image exists (distance {})", nearest),
            nearest,
        }
    } else {
        RiskVerdict { risk: LOW_RISK, reason: "OK".to_string(), nearest }
    }
}

pub fn evaluate(uow: &UnitOfWork, candidate: Option<&str>, threshold: u32) -> MarketResult<RiskVerdict> {
    let stored = uow.stored_hashes()?;
    Ok(evaluate_against(candidate, stored, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(v: u64) -> String {
        ImageHash(v).to_hex()
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let base = 0u64;
        let stored = vec![hex(0b11111)]; // distance 5
        let v = evaluate_against(Some(hex(base).as_str()), &stored, 5);
        assert!(v.is_duplicate());
        assert_eq!(v.nearest, 5);

        let stored = vec![hex(0b111111)]; // distance 6
        let v = evaluate_against(Some(hex(base).as_str()), &stored, 5);
        assert!(!v.is_duplicate());
        assert_eq!(v.risk, LOW_RISK);
        assert_eq!(v.nearest, 6);
    }

    #[test]
    fn test_minimum_over_all() {
        let stored = vec![hex(u64::MAX), "garbage".to_string(), hex(0b1), hex(0xff)];
        let v = evaluate_against(Some(hex(0).as_str()), &stored, 5);
        assert_eq!(v.nearest, 1);
    }

    #[test]
    fn test_empty_store_is_low_risk() {
        let v = evaluate_against(Some(hex(42).as_str()), Vec::<String>::new(), 5);
        assert_eq!(v.risk, LOW_RISK);
        assert_eq!(v.nearest, NO_MATCH_DISTANCE);
    }

    #[test]
    fn test_missing_candidate_is_unknown() {
        let stored = vec![hex(0)];
        for c in [None, Some(""), Some("zz")] {
            let v = evaluate_against(c, &stored, 5);
            assert_eq!((v.risk, v.reason.as_str(), v.nearest), (10, "unknown", 0));
            assert!(!v.is_duplicate());
        }
    }
}
