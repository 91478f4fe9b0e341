//! Contract holder aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::HolderId;
use crate::version::Version;

/// A person or entity holding one or more contracts (aggregate root).
///
/// `email` is unique across holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    /// Unique holder identifier.
    pub id: HolderId,
    /// Optimistic-concurrency version.
    pub version: Version,
    /// Full legal name.
    pub full_name: String,
    /// Contact e-mail, unique per holder.
    pub email: String,
    /// ISO 3166-1 alpha-2 country of residence.
    pub country_code: String,
    /// When the row was first written.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl Holder {
    /// Create a holder at [`Version::INITIAL`].
    pub fn new(full_name: &str, email: &str, country_code: &str) -> Self {
        let now = Utc::now();
        Self {
            id: HolderId::new(),
            version: Version::INITIAL,
            full_name: full_name.to_owned(),
            email: email.trim().to_ascii_lowercase(),
            country_code: country_code.trim().to_ascii_uppercase(),
            created_at: now,
            updated_at: now,
        }
    }
}
