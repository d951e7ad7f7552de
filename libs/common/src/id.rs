use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = subscriber_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Broker session (reassigned on every physical reconnect).
    pub const SESSION: &str = "ses";
    /// Client name advertised to the broker.
    pub const CLIENT: &str = "sub";
}
