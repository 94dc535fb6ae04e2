//! Run identifier generation.

use uuid::Uuid;

/// Allocate a globally unique, URL-safe run id of the form `run_<12 hex>`.
///
/// # Examples
///
/// ```rust
/// let id = flowgraph::utils::ids::generate_run_id();
/// assert!(id.starts_with("run_"));
/// assert_eq!(id.len(), 16);
/// ```
#[must_use]
pub fn generate_run_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("run_{}", &hex[..12])
}
