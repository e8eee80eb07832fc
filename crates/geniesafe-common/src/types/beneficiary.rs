//! Beneficiary shares of a will

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::user::UserId;
use crate::error::AllocationError;

/// A beneficiary and the percentage of funds they receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub user_id: UserId,
    pub percentage: Decimal,
}

impl Beneficiary {
    pub fn new(user_id: UserId, percentage: Decimal) -> Self {
        Self {
            user_id,
            percentage,
        }
    }
}

/// Check that shares are positive, unique per user and sum to exactly 100%
pub fn validate_allocation(beneficiaries: &[Beneficiary]) -> Result<(), AllocationError> {
    if beneficiaries.is_empty() {
        return Err(AllocationError::NoBeneficiaries);
    }

    let mut seen = HashSet::with_capacity(beneficiaries.len());
    for b in beneficiaries {
        if b.percentage <= Decimal::ZERO {
            return Err(AllocationError::NonPositiveShare(b.user_id));
        }
        if !seen.insert(b.user_id) {
            return Err(AllocationError::DuplicateBeneficiary(b.user_id));
        }
    }

    let expected = Decimal::from(crate::FULL_ALLOCATION_PERCENT);
    let actual: Decimal = beneficiaries.iter().map(|b| b.percentage).sum();
    if actual != expected {
        return Err(AllocationError::IncompleteAllocation { expected, actual });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[test]
    fn test_valid_split() {
        let split = vec![
            Beneficiary::new(Uuid::new_v4(), dec!(62.5)),
            Beneficiary::new(Uuid::new_v4(), dec!(37.5)),
        ];
        assert!(validate_allocation(&split).is_ok());
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(validate_allocation(&[]), Err(AllocationError::NoBeneficiaries));
    }

    #[test]
    fn test_under_allocation_rejected() {
        let split = vec![
            Beneficiary::new(Uuid::new_v4(), dec!(50)),
            Beneficiary::new(Uuid::new_v4(), dec!(40)),
        ];
        assert!(matches!(
            validate_allocation(&split),
            Err(AllocationError::IncompleteAllocation { .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let user = Uuid::new_v4();
        let split = vec![
            Beneficiary::new(user, dec!(50)),
            Beneficiary::new(user, dec!(50)),
        ];
        assert_eq!(
            validate_allocation(&split),
            Err(AllocationError::DuplicateBeneficiary(user))
        );
    }

    #[test]
    fn test_zero_share_rejected() {
        let user = Uuid::new_v4();
        let split = vec![
            Beneficiary::new(Uuid::new_v4(), dec!(100)),
            Beneficiary::new(user, dec!(0)),
        ];
        assert_eq!(
            validate_allocation(&split),
            Err(AllocationError::NonPositiveShare(user))
        );
    }
}
