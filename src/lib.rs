pub mod appraisal;
pub mod config;
pub mod duplicate;
pub mod error;
pub mod fetch;
pub mod gallery;
pub mod ledger;
pub mod listing;
pub mod logging;
pub mod market;
pub mod phash;
pub mod pricing;
pub mod store;
pub mod trends;
