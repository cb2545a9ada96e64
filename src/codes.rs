//! Redemption code minting.
//!
//! Codes look like `SHOP-PAGO-0042-517`: namespace, status prefix, the
//! store-issued sequence number padded to four digits, and the low three
//! digits of the millisecond clock. The unique index on
//! `transactions.redemption_code` is what actually guarantees uniqueness;
//! the clock suffix only separates codes minted from the same sequence slot.

use chrono::{DateTime, Utc};

/// Closed set of statuses that receive a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Success,
    Pending,
    Failed,
}

impl CodeKind {
    pub fn prefix(self) -> &'static str {
        match self {
            CodeKind::Success => "PAGO",
            CodeKind::Pending => "PEN",
            CodeKind::Failed => "DEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeGenerator {
    namespace: String,
}

impl CodeGenerator {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().to_uppercase(),
        }
    }

    /// Mint a code using the current instant.
    pub fn generate(&self, kind: CodeKind, sequence: i64) -> String {
        self.generate_at(kind, sequence, Utc::now())
    }

    /// Mint a code at a fixed instant (reproducible output for tests and replays).
    pub fn generate_at(&self, kind: CodeKind, sequence: i64, at: DateTime<Utc>) -> String {
        let millis = at.timestamp_millis().rem_euclid(1000);
        format!(
            "{}-{}-{:04}-{:03}",
            self.namespace,
            kind.prefix(),
            sequence,
            millis
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn fixed_instant() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_517).unwrap()
    }

    #[test]
    fn test_code_format() {
        let codes = CodeGenerator::new("shop");
        assert_eq!(
            codes.generate_at(CodeKind::Success, 42, fixed_instant()),
            "SHOP-PAGO-0042-517"
        );
        assert_eq!(
            codes.generate_at(CodeKind::Pending, 7, fixed_instant()),
            "SHOP-PEN-0007-517"
        );
        assert_eq!(
            codes.generate_at(CodeKind::Failed, 1, fixed_instant()),
            "SHOP-DEN-0001-517"
        );
    }

    #[test]
    fn test_sequence_wider_than_padding_is_kept_whole() {
        let codes = CodeGenerator::new("SHOP");
        assert_eq!(
            codes.generate_at(CodeKind::Success, 123456, fixed_instant()),
            "SHOP-PAGO-123456-517"
        );
    }

    #[test]
    fn test_millis_suffix_is_zero_padded() {
        let codes = CodeGenerator::new("SHOP");
        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_004).unwrap();
        assert_eq!(codes.generate_at(CodeKind::Success, 1, at), "SHOP-PAGO-0001-004");
    }

    #[test]
    fn test_distinct_sequences_in_same_millisecond_never_collide() {
        let codes = CodeGenerator::new("SHOP");
        let at = fixed_instant();
        let minted: HashSet<String> = (1..=10_000)
            .map(|seq| codes.generate_at(CodeKind::Success, seq, at))
            .collect();
        assert_eq!(minted.len(), 10_000);
    }

    #[test]
    fn test_same_slot_different_millisecond_differs() {
        let codes = CodeGenerator::new("SHOP");
        let a = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_100).unwrap();
        let b = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_101).unwrap();
        assert_ne!(
            codes.generate_at(CodeKind::Success, 9, a),
            codes.generate_at(CodeKind::Success, 9, b)
        );
    }
}
