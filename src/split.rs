//! Commission and tax split of a gross charge.
//!
//! The card fee is taken off first; VAT (IVA) and withholding (IRPF) are both
//! computed on what is left after the fee.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const COMMISSION_RATE: Decimal = dec!(0.014);
const COMMISSION_FIXED_FEE: Decimal = dec!(0.25);
const VAT_RATE: Decimal = dec!(0.21);
const WITHHOLDING_RATE: Decimal = dec!(0.15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub commission: Decimal,
    pub vat: Decimal,
    pub withholding: Decimal,
    pub net: Decimal,
}

fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Split a gross amount. Intermediates stay exact; each output is rounded on
/// its own, so `net` may differ by a cent from the rounded parts subtracted.
pub fn compute_split(gross: Decimal) -> Split {
    let commission = gross * COMMISSION_RATE + COMMISSION_FIXED_FEE;
    let taxable = gross - commission;
    let vat = taxable * VAT_RATE;
    let withholding = taxable * WITHHOLDING_RATE;
    let net = taxable - vat - withholding;

    Split {
        commission: round_cents(commission),
        vat: round_cents(vat),
        withholding: round_cents(withholding),
        net: round_cents(net),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_amount() {
        let split = compute_split(dec!(14.75));
        assert_eq!(split.commission, dec!(0.46));
        assert_eq!(split.vat, dec!(3.00));
        assert_eq!(split.withholding, dec!(2.14));
        assert_eq!(split.net, dec!(9.15));
    }

    #[test]
    fn test_half_cent_rounds_up() {
        // 0.5 * 0.014 + 0.25 = 0.257
        assert_eq!(compute_split(dec!(0.5)).commission, dec!(0.26));
        assert_eq!(compute_split(dec!(25)).commission, dec!(0.60));
        // 2.5 * 0.014 + 0.25 = 0.285, exactly on the midpoint
        assert_eq!(compute_split(dec!(2.5)).commission, dec!(0.29));
    }

    #[test]
    fn test_net_within_one_cent_of_gross_minus_parts() {
        let mut gross = dec!(1.00);
        while gross <= dec!(500.00) {
            let split = compute_split(gross);
            let derived = round_cents(gross - split.commission - split.vat - split.withholding);
            let diff = (split.net - derived).abs();
            assert!(diff <= dec!(0.01), "gross {gross}: net {} vs {derived}", split.net);
            gross += dec!(0.37);
        }
    }

    #[test]
    fn test_outputs_non_negative_for_realistic_amounts() {
        for cents in [100i64, 299, 1475, 4999, 19900, 250000] {
            let split = compute_split(Decimal::new(cents, 2));
            assert!(split.commission >= Decimal::ZERO);
            assert!(split.vat >= Decimal::ZERO);
            assert!(split.withholding >= Decimal::ZERO);
            assert!(split.net >= Decimal::ZERO);
        }
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(compute_split(dec!(59.90)), compute_split(dec!(59.90)));
    }
}
