use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub sqlite_path: String,
    pub tagger_url: Option<String>,
    pub scorer_url: Option<String>,
    pub hf_token: Option<String>,
    pub appraisal_timeout_secs: u64,
    /// Account of the house, the default seller of freshly appraised items.
    pub house_id: u64,
    /// Ledger scope (the guild the economy lives in).
    pub ledger_scope: u64,
    pub decay_hour_utc: u32,
    pub gallery_forum: String,
    pub welcome_bonus: i64,
    pub duplicate_threshold: u32,
    pub min_resell_price: i64,
    pub tax_rate: f64,
    pub house_markup: f64,
    pub inflation_rate: f64,
    pub forced_buyout_multiplier: i64,
    pub tag_threshold: f64,
    pub character_threshold: f64,
    pub max_general_tags: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./market.sqlite".to_string(),
            tagger_url: None,
            scorer_url: None,
            hf_token: None,
            appraisal_timeout_secs: 30,
            house_id: 0,
            ledger_scope: 0,
            decay_hour_utc: 0,
            gallery_forum: "gallery".to_string(),
            welcome_bonus: 3000,
            duplicate_threshold: 5,
            min_resell_price: 100,
            tax_rate: 0.20,
            house_markup: 1.5,
            inflation_rate: 0.10,
            forced_buyout_multiplier: 2,
            tag_threshold: 0.35,
            character_threshold: 0.5,
            max_general_tags: 20,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            tagger_url: std::env::var("TAGGER_URL").ok().filter(|v| !v.is_empty()),
            scorer_url: std::env::var("SCORER_URL").ok().filter(|v| !v.is_empty()),
            hf_token: std::env::var("HF_TOKEN").ok().filter(|v| !v.is_empty()),
            appraisal_timeout_secs: std::env::var("APPRAISAL_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.appraisal_timeout_secs),
            house_id: std::env::var("HOUSE_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(d.house_id),
            ledger_scope: std::env::var("LEDGER_SCOPE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.ledger_scope),
            decay_hour_utc: std::env::var("DECAY_HOUR_UTC").ok().and_then(|v| v.parse().ok()).filter(|h| *h < 24).unwrap_or(d.decay_hour_utc),
            gallery_forum: std::env::var("GALLERY_FORUM").unwrap_or(d.gallery_forum),
            welcome_bonus: std::env::var("WELCOME_BONUS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.welcome_bonus),
            duplicate_threshold: std::env::var("DUPLICATE_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.duplicate_threshold),
            min_resell_price: std::env::var("MIN_RESELL_PRICE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.min_resell_price),
            tax_rate: std::env::var("TAX_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.tax_rate),
            house_markup: std::env::var("HOUSE_MARKUP").ok().and_then(|v| v.parse().ok()).unwrap_or(d.house_markup),
            inflation_rate: std::env::var("INFLATION_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.inflation_rate),
            forced_buyout_multiplier: std::env::var("FORCED_BUYOUT_MULTIPLIER").ok().and_then(|v| v.parse().ok()).unwrap_or(d.forced_buyout_multiplier),
            tag_threshold: std::env::var("TAG_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.tag_threshold),
            character_threshold: std::env::var("CHARACTER_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.character_threshold),
            max_general_tags: std::env::var("MAX_GENERAL_TAGS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_general_tags),
        }
    }

    pub fn appraisal_timeout(&self) -> Duration {
        Duration::from_secs(self.appraisal_timeout_secs)
    }
}
