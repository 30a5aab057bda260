//! Data validation
//!
//! Freshness, structure, quality, and frequency checks per active symbol
//! against the configured SLO. Validation reports problems; it never
//! blocks ingestion.

mod validator;

pub use validator::{
    CheckOutcome, DataValidator, SymbolVerdict, ValidationReport, ValidationThresholds,
};
