//! Checksum calculation for migrations
//!
//! Checksums detect migrations that were edited after being applied. They are a fast,
//! non-cryptographic xxh3 hash so the value is identical on every platform and every run.

use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Fingerprint of a migration's content (scripts) or identity (procedural migrations)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u64);

impl Checksum {
    /// Hash raw script bytes
    ///
    /// With `normalize_line_endings`, `\r\n` is folded to `\n` first so that a checkout
    /// with Windows line endings keeps the checksum it was applied with.
    pub fn of_content(content: &[u8], normalize_line_endings: bool) -> Self {
        if normalize_line_endings && content.contains(&b'\r') {
            let mut normalized = Vec::with_capacity(content.len());
            let mut bytes = content.iter().peekable();
            while let Some(&b) = bytes.next() {
                if b == b'\r' && bytes.peek() == Some(&&b'\n') {
                    continue;
                }
                normalized.push(b);
            }
            return Checksum(xxh3_64(&normalized));
        }
        Checksum(xxh3_64(content))
    }

    /// Hash the identity of a procedural migration, which has no content of its own
    pub fn of_identity(identity: &str) -> Self {
        Checksum(xxh3_64(identity.as_bytes()))
    }

    /// Value as stored in the `checksum bigint` column
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_column(self) -> i64 {
        self.0 as i64
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn from_column(value: i64) -> Self {
        Checksum(value as u64)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_checksum_is_deterministic() {
        let cql = b"CREATE TABLE ks.users (id uuid PRIMARY KEY);";
        assert_eq!(Checksum::of_content(cql, false), Checksum::of_content(cql, false));
        assert_ne!(
            Checksum::of_content(cql, false),
            Checksum::of_content(b"CREATE TABLE ks.users (id int PRIMARY KEY);", false)
        );
    }

    #[test]
    fn test_line_endings_only_normalized_when_configured() {
        let unix = b"CREATE TABLE a (id int PRIMARY KEY);\nDROP TABLE b;\n";
        let windows = b"CREATE TABLE a (id int PRIMARY KEY);\r\nDROP TABLE b;\r\n";

        assert_ne!(Checksum::of_content(unix, false), Checksum::of_content(windows, false));
        assert_eq!(Checksum::of_content(unix, true), Checksum::of_content(windows, true));
    }

    #[test]
    fn test_column_round_trip_keeps_high_bit() {
        let checksum = Checksum(u64::MAX - 7);
        assert!(checksum.to_column() < 0);
        assert_eq!(Checksum::from_column(checksum.to_column()), checksum);
    }

    #[test]
    fn test_identity_checksum() {
        let a = Checksum::of_identity("migrations::V3_0__Third");
        assert_eq!(a, Checksum::of_identity("migrations::V3_0__Third"));
        assert_ne!(a, Checksum::of_identity("migrations::V3_1__Fourth"));
    }
}
