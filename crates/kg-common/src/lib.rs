pub mod config;
pub mod error;
pub mod sink;
pub mod types;

pub use config::AppConfig;
pub use error::{IngestError, Result};
pub use sink::{EventSink, NullSink};
pub use types::*;

/// Normalize an entity name for exact-match comparison during resolution
/// (§4.6.1): strip a trailing parenthesized qualifier, lowercase, strip
/// non-alphanumeric (keeping spaces), collapse whitespace, replace spaces
/// with hyphens.
///
/// ```
/// assert_eq!(kg_common::normalize("Lake Street Church"), "lake-street-church");
/// assert_eq!(kg_common::normalize("Lake St. Church!!!"), "lake-st-church");
/// assert_eq!(kg_common::normalize("  Multiple   Spaces  "), "multiple-spaces");
/// assert_eq!(kg_common::normalize("User (system)"), "user");
/// ```
pub fn normalize(name: &str) -> String {
    let trailing_paren = regex::Regex::new(r"\s*\([^()]*\)\s*$").expect("valid regex");
    let without_suffix = trailing_paren.replace(name, "");
    let lowered = without_suffix.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<&str>>().join("-")
}
