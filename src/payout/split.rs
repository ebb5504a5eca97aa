use alloy_primitives::U256;

use crate::error::{AppResult, IntegrityError, PayoutError};
use crate::store::models::{Split, TOTAL_BPS};
use crate::store::sum_wei;

/// Derive basis points from lifetime donation totals per org.
///
/// Orgs are taken in ascending id order. Every org but the last gets its
/// share rounded half-up; the last takes the residual so the set sums to
/// exactly 10000. If rounding pushed the others past 10000, the residual is
/// clamped at zero and the excess is taken back one bps at a time from the
/// largest share (lowest org id on ties).
pub fn proportional_split(event_id: u64, totals: &[(u64, U256)]) -> AppResult<Vec<Split>> {
    let mut totals = totals.to_vec();
    totals.sort_by_key(|(org_id, _)| *org_id);

    let grand = sum_wei(totals.iter().map(|(_, amount)| amount))?;
    if totals.is_empty() || grand.is_zero() {
        return Err(PayoutError::NoAllocationOrDonations(event_id).into());
    }

    let Some(((last_org, _), head)) = totals.split_last() else {
        return Err(PayoutError::NoAllocationOrDonations(event_id).into());
    };

    let mut bps: Vec<(u64, u64)> = Vec::with_capacity(totals.len());
    for (org_id, amount) in head {
        bps.push((*org_id, rounded_bps(*amount, grand)?));
    }

    let assigned: u64 = bps.iter().map(|(_, b)| b).sum();
    bps.push((*last_org, TOTAL_BPS.saturating_sub(assigned)));

    let mut excess = assigned.saturating_sub(TOTAL_BPS);
    while excess > 0 {
        // max_by_key returns the last maximum; iterate in reverse to favour the lowest id
        let Some(largest) = bps.iter_mut().rev().max_by_key(|(_, b)| *b) else {
            break;
        };
        largest.1 -= 1;
        excess -= 1;
    }

    bps.into_iter()
        .map(|(org_id, b)| {
            let split_bps = u16::try_from(b).map_err(|_| IntegrityError::ValueOutOfRange {
                field: "split_bps",
                value: b.to_string(),
            })?;
            Ok(Split { org_id, split_bps })
        })
        .collect()
}

/// round(amount / grand * 10000), half-up, in integer arithmetic
fn rounded_bps(amount: U256, grand: U256) -> AppResult<u64> {
    let out_of_range = || IntegrityError::ValueOutOfRange {
        field: "donation total",
        value: grand.to_string(),
    };
    let numerator = amount
        .checked_mul(U256::from(2 * TOTAL_BPS))
        .and_then(|n| n.checked_add(grand))
        .ok_or_else(out_of_range)?;
    let denominator = grand.checked_mul(U256::from(2u64)).ok_or_else(out_of_range)?;
    Ok(u64::try_from(numerator / denominator).map_err(|_| out_of_range())?)
}

/// `total * bps / 10000`, floored
pub fn bps_share(total: U256, split_bps: u16) -> AppResult<U256> {
    let scaled = total
        .checked_mul(U256::from(split_bps))
        .ok_or_else(|| IntegrityError::ValueOutOfRange {
            field: "amount_wei",
            value: total.to_string(),
        })?;
    Ok(scaled / U256::from(TOTAL_BPS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(values: &[(u64, u64)]) -> Vec<(u64, U256)> {
        values.iter().map(|&(o, a)| (o, U256::from(a))).collect()
    }

    fn as_pairs(splits: &[Split]) -> Vec<(u64, u16)> {
        splits.iter().map(|s| (s.org_id, s.split_bps)).collect()
    }

    #[test]
    fn test_split_30_70() {
        let splits = proportional_split(1, &totals(&[(2, 700), (1, 300)])).unwrap();
        assert_eq!(as_pairs(&splits), vec![(1, 3000), (2, 7000)]);
    }

    #[test]
    fn test_equal_thirds_residual_goes_last() {
        let splits = proportional_split(1, &totals(&[(1, 1), (2, 1), (3, 1)])).unwrap();
        assert_eq!(as_pairs(&splits), vec![(1, 3333), (2, 3333), (3, 3334)]);
    }

    #[test]
    fn test_negative_residual_is_taken_from_largest() {
        // rounded heads are 3334 + 3334 + 3333 = 10001
        let splits =
            proportional_split(1, &totals(&[(1, 6667), (2, 6667), (3, 6665), (4, 1)])).unwrap();
        assert_eq!(as_pairs(&splits), vec![(1, 3333), (2, 3334), (3, 3333), (4, 0)]);
        let sum: u64 = splits.iter().map(|s| u64::from(s.split_bps)).sum();
        assert_eq!(sum, TOTAL_BPS);
    }

    #[test]
    fn test_single_org_gets_everything() {
        let splits = proportional_split(1, &totals(&[(9, 42)])).unwrap();
        assert_eq!(as_pairs(&splits), vec![(9, 10000)]);
    }

    #[test]
    fn test_tiny_donor_keeps_nonzero_when_rounding_allows() {
        // 1 / 2000 of the total = 5 bps
        let splits = proportional_split(1, &totals(&[(1, 1), (2, 1999)])).unwrap();
        assert_eq!(as_pairs(&splits), vec![(1, 5), (2, 9995)]);
    }

    #[test]
    fn test_no_donations() {
        let err = proportional_split(5, &[]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::AppError::Payout(PayoutError::NoAllocationOrDonations(5))
        ));
        assert!(proportional_split(5, &totals(&[(1, 0)])).is_err());
    }

    #[test]
    fn test_bps_share_floors() {
        assert_eq!(bps_share(U256::from(10u64), 3333).unwrap(), U256::from(3u64));
        assert_eq!(bps_share(U256::from(1u64), 5000).unwrap(), U256::ZERO);
        assert!(bps_share(U256::MAX, 2).is_err());
    }
}
