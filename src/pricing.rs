//! Deterministic valuation of an appraised item.
//!
//! `final = floor(floor(1000 * s^2) * modifier) + 2000 * characters`
//! where `modifier` is the worst per-tag saturation damping, `min(1, 1/log10(sat + 2))`
//! floored at 0.1. Tags without a trend record do not dampen.

use serde::{Deserialize, Serialize};

pub const BASE_UNIT: f64 = 1000.0;
pub const CHARACTER_BONUS: i64 = 2000;
pub const MIN_TAG_MODIFIER: f64 = 0.1;

/// Basis points in one whole.
pub const BP: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    S,
    A,
    B,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::S => "S",
            Grade::A => "A",
            Grade::B => "B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "S" => Some(Grade::S),
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            _ => None,
        }
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 10.0)
    } else {
        0.0
    }
}

pub fn grade_for(score: f64) -> Grade {
    let s = clamp_score(score);
    if s >= 9.0 {
        Grade::S
    } else if s >= 7.0 {
        Grade::A
    } else {
        Grade::B
    }
}

pub fn base_value(score: f64) -> i64 {
    let s = clamp_score(score);
    (BASE_UNIT * s * s).floor() as i64
}

/// Damping for one tag's saturation.
pub fn tag_modifier(saturation: Option<i64>) -> f64 {
    match saturation {
        None => 1.0,
        Some(sat) => {
            let sat = sat.max(0) as f64;
            (1.0 / (sat + 2.0).log10()).clamp(MIN_TAG_MODIFIER, 1.0)
        }
    }
}

/// Worst-case modifier over all tags; one saturated tag drags the whole item.
pub fn tag_value_modifier<F>(tags: &[String], saturation: F) -> f64
where
    F: Fn(&str) -> Option<i64>,
{
    tags.iter()
        .map(|t| tag_modifier(saturation(t)))
        .fold(1.0, f64::min)
        .max(MIN_TAG_MODIFIER)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub base: i64,
    pub modifier: f64,
    pub character_bonus: i64,
    /// Paid to the uploader.
    pub final_price: i64,
    pub grade: Grade,
    pub score: f64,
}

pub fn price<F>(score: f64, tags: &[String], characters: &[String], saturation: F) -> PriceQuote
where
    F: Fn(&str) -> Option<i64>,
{
    let score = clamp_score(score);
    let base = base_value(score);
    let modifier = tag_value_modifier(tags, saturation);
    let adjusted = (base as f64 * modifier).floor() as i64;
    let character_bonus = CHARACTER_BONUS * characters.len() as i64;
    PriceQuote {
        base,
        modifier,
        character_bonus,
        final_price: adjusted + character_bonus,
        grade: grade_for(score),
        score,
    }
}

/// Converts a fractional rate (0.2, 1.5, ...) to basis points.
pub fn to_bp(rate: f64) -> i64 {
    (rate * BP as f64).round() as i64
}

/// `floor(amount * bp / 10000)` without float drift.
pub fn scale_bp(amount: i64, bp: i64) -> i64 {
    let scaled = (amount as i128 * bp as i128).div_euclid(BP as i128);
    scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Ask shown to buyers for a fresh house listing.
pub fn house_listing_price(final_price: i64, markup: f64) -> i64 {
    scale_bp(final_price, to_bp(markup))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reference_scenario() {
        let q = price(8.0, &tags(&["1girl", "smile"]), &tags(&["alice", "bob"]), |_| None);
        assert_eq!(q.base, 64_000);
        assert_eq!(q.character_bonus, 4_000);
        assert_eq!(q.modifier, 1.0);
        assert_eq!(q.final_price, 68_000);
        assert_eq!(q.grade, Grade::A);
        assert_eq!(house_listing_price(q.final_price, 1.5), 102_000);
    }

    #[test]
    fn test_grade_boundaries_exact() {
        assert_eq!(grade_for(9.0), Grade::S);
        assert_eq!(grade_for(7.0), Grade::A);
        assert_eq!(grade_for(6.999), Grade::B);
        assert_eq!(grade_for(8.999), Grade::A);
        assert_eq!(grade_for(42.0), Grade::S);
    }

    #[test]
    fn test_base_monotone_and_clamped() {
        let mut prev = -1;
        for i in 0..=1000 {
            let b = base_value(i as f64 / 100.0);
            assert!(b >= prev);
            prev = b;
        }
        assert_eq!(base_value(-3.0), 0);
        assert_eq!(base_value(12.0), 100_000);
        assert_eq!(base_value(f64::NAN), 0);
    }

    #[test]
    fn test_modifier_is_worst_case() {
        let t = tags(&["fresh", "flooded"]);
        let m = tag_value_modifier(&t, |tag| if tag == "flooded" { Some(98) } else { None });
        assert!((m - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_modifier_bounds() {
        assert_eq!(tag_value_modifier(&[], |_| Some(1_000_000)), 1.0);
        // low saturation never boosts
        assert_eq!(tag_modifier(Some(0)), 1.0);
        assert_eq!(tag_modifier(Some(8)), 1.0);
        let huge = tag_value_modifier(&tags(&["x"]), |_| Some(i64::MAX / 2));
        assert!(huge >= MIN_TAG_MODIFIER);
    }

    #[test]
    fn test_modifier_scales_base_only() {
        let q = price(10.0, &tags(&["x"]), &tags(&["c"]), |_| Some(98));
        assert_eq!(q.base, 100_000);
        assert_eq!(q.final_price, 50_000 + 2_000);
    }

    #[test]
    fn test_scale_bp_floors() {
        assert_eq!(scale_bp(1001, to_bp(0.8)), 800);
        assert_eq!(scale_bp(999, to_bp(1.1)), 1098);
        assert_eq!(scale_bp(0, to_bp(1.5)), 0);
    }
}
