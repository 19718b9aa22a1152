//! Pure stock arithmetic.
//!
//! Every aggregate operation is expressed as a [`StockMutation`] applied to a
//! [`StockLevel`]. Applying never touches storage, so the invariants
//! (`on_hand >= reserved >= 0` for limited variants) can be checked and
//! property-tested in isolation before the conditional write happens.

use crate::entities::inventory_transaction::TransactionType;
use crate::entities::variant_stock;
use crate::errors::ServiceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub on_hand: i32,
    pub reserved: i32,
    pub is_unlimited: bool,
}

impl From<&variant_stock::Model> for StockLevel {
    fn from(model: &variant_stock::Model) -> Self {
        Self {
            on_hand: model.on_hand,
            reserved: model.reserved,
            is_unlimited: model.is_unlimited,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockMutation {
    AddStock(i32),
    RemoveStock(i32),
    Adjust(i32),
    Damage(i32),
    Reserve(i32),
    Release(i32),
    Commit(i32),
    Return(i32),
}

/// Result of applying a mutation: the new level plus the ledger deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockTransition {
    pub before: StockLevel,
    pub after: StockLevel,
    pub quantity_delta: i32,
    pub reserved_delta: i32,
}

impl StockMutation {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            StockMutation::AddStock(_) => TransactionType::StockIn,
            StockMutation::RemoveStock(_) => TransactionType::StockOut,
            StockMutation::Adjust(_) => TransactionType::Adjustment,
            StockMutation::Damage(_) => TransactionType::Damage,
            StockMutation::Reserve(_) => TransactionType::Reservation,
            StockMutation::Release(_) => TransactionType::ReservationRelease,
            StockMutation::Commit(_) => TransactionType::Commit,
            StockMutation::Return(_) => TransactionType::Return,
        }
    }

    /// Label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        self.transaction_type().as_str()
    }

    /// Signed (on_hand, reserved) change this mutation requests.
    pub fn deltas(&self) -> (i32, i32) {
        match *self {
            StockMutation::AddStock(q) | StockMutation::Return(q) => (q, 0),
            StockMutation::RemoveStock(q) | StockMutation::Damage(q) => (-q, 0),
            StockMutation::Adjust(delta) => (delta, 0),
            StockMutation::Reserve(q) => (0, q),
            StockMutation::Release(q) => (0, -q),
            StockMutation::Commit(q) => (-q, -q),
        }
    }

    /// Input checks that need no stored state.
    pub fn validate(&self) -> Result<(), ServiceError> {
        match *self {
            StockMutation::Adjust(0) => Err(ServiceError::ValidationError(
                "adjustment delta must not be zero".to_string(),
            )),
            StockMutation::Adjust(_) => Ok(()),
            StockMutation::AddStock(q)
            | StockMutation::RemoveStock(q)
            | StockMutation::Damage(q)
            | StockMutation::Reserve(q)
            | StockMutation::Release(q)
            | StockMutation::Commit(q)
            | StockMutation::Return(q) => {
                if q <= 0 {
                    Err(ServiceError::ValidationError(format!(
                        "{} quantity must be positive, got {}",
                        self.kind(),
                        q
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl StockLevel {
    pub fn new(on_hand: i32, reserved: i32) -> Self {
        Self {
            on_hand,
            reserved,
            is_unlimited: false,
        }
    }

    pub fn unlimited(on_hand: i32, reserved: i32) -> Self {
        Self {
            on_hand,
            reserved,
            is_unlimited: true,
        }
    }

    pub fn available(&self) -> i32 {
        self.on_hand - self.reserved
    }

    /// Applies `mutation`, enforcing availability for limited variants.
    ///
    /// Reserved can never drop below zero, even for unlimited variants:
    /// releasing or committing more than is held is an illegal transition.
    pub fn apply(&self, mutation: StockMutation) -> Result<StockTransition, ServiceError> {
        mutation.validate()?;
        let (quantity_delta, reserved_delta) = mutation.deltas();

        let on_hand = self.on_hand.checked_add(quantity_delta).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "{} of {} overflows on-hand {}",
                mutation.kind(),
                quantity_delta,
                self.on_hand
            ))
        })?;
        let reserved = self.reserved.checked_add(reserved_delta).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "{} of {} overflows reserved {}",
                mutation.kind(),
                reserved_delta,
                self.reserved
            ))
        })?;

        if reserved < 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "cannot {} {} units, only {} reserved",
                mutation.kind(),
                -reserved_delta,
                self.reserved
            )));
        }

        if !self.is_unlimited {
            match mutation {
                StockMutation::RemoveStock(q)
                | StockMutation::Damage(q)
                | StockMutation::Reserve(q)
                    if q > self.available() =>
                {
                    return Err(ServiceError::InsufficientStock(format!(
                        "requested {}, available {}",
                        q,
                        self.available()
                    )));
                }
                StockMutation::Adjust(delta) if on_hand < reserved => {
                    return Err(ServiceError::InsufficientStock(format!(
                        "adjustment of {} would leave on-hand {} below reserved {}",
                        delta, on_hand, reserved
                    )));
                }
                _ => {}
            }
        }

        Ok(StockTransition {
            before: *self,
            after: StockLevel {
                on_hand,
                reserved,
                is_unlimited: self.is_unlimited,
            },
            quantity_delta,
            reserved_delta,
        })
    }

    /// Moves on-hand to the ledger-derived `expected` value.
    pub fn reconcile_to(&self, expected: i32) -> Result<StockLevel, ServiceError> {
        if !self.is_unlimited && expected < self.reserved {
            return Err(ServiceError::InvalidOperation(format!(
                "ledger total {} is below reserved {}",
                expected, self.reserved
            )));
        }
        Ok(StockLevel {
            on_hand: expected,
            ..*self
        })
    }

    pub fn holds_invariant(&self) -> bool {
        self.is_unlimited || (self.reserved >= 0 && self.on_hand >= self.reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(StockMutation::AddStock(0))]
    #[case(StockMutation::RemoveStock(-1))]
    #[case(StockMutation::Reserve(0))]
    #[case(StockMutation::Commit(-3))]
    #[case(StockMutation::Adjust(0))]
    fn rejects_non_positive_input(#[case] mutation: StockMutation) {
        assert_matches!(
            StockLevel::new(10, 0).apply(mutation),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn remove_checks_available_not_on_hand() {
        let level = StockLevel::new(10, 7);
        assert_matches!(
            level.apply(StockMutation::RemoveStock(5)),
            Err(ServiceError::InsufficientStock(_))
        );
        let t = level.apply(StockMutation::RemoveStock(3)).unwrap();
        assert_eq!(t.after, StockLevel::new(7, 7));
    }

    #[test]
    fn negative_adjustment_cannot_cut_into_reserved() {
        let level = StockLevel::new(10, 4);
        assert!(level.apply(StockMutation::Adjust(-6)).is_ok());
        assert_matches!(
            level.apply(StockMutation::Adjust(-7)),
            Err(ServiceError::InsufficientStock(_))
        );
    }

    #[test]
    fn commit_moves_both_counters() {
        let t = StockLevel::new(10, 7)
            .apply(StockMutation::Commit(7))
            .unwrap();
        assert_eq!(t.after, StockLevel::new(3, 0));
        assert_eq!((t.quantity_delta, t.reserved_delta), (-7, -7));
    }

    #[test]
    fn release_beyond_reserved_is_invalid() {
        assert_matches!(
            StockLevel::new(10, 2).apply(StockMutation::Release(3)),
            Err(ServiceError::InvalidOperation(_))
        );
        assert_matches!(
            StockLevel::unlimited(0, 0).apply(StockMutation::Commit(1)),
            Err(ServiceError::InvalidOperation(_))
        );
    }

    #[test]
    fn unlimited_variants_skip_availability() {
        let t = StockLevel::unlimited(0, 0)
            .apply(StockMutation::Reserve(50))
            .unwrap();
        assert_eq!(t.after.reserved, 50);
        let t = t.after.apply(StockMutation::Commit(50)).unwrap();
        assert_eq!(t.after.on_hand, -50);
    }

    #[test]
    fn reconcile_refuses_to_drop_below_reserved() {
        let level = StockLevel::new(10, 6);
        assert_eq!(level.reconcile_to(8).unwrap().on_hand, 8);
        assert_matches!(
            level.reconcile_to(5),
            Err(ServiceError::InvalidOperation(_))
        );
    }

    fn mutation_strategy() -> impl Strategy<Value = StockMutation> {
        prop_oneof![
            (1i32..50).prop_map(StockMutation::AddStock),
            (1i32..50).prop_map(StockMutation::RemoveStock),
            (-50i32..50).prop_map(StockMutation::Adjust),
            (1i32..50).prop_map(StockMutation::Damage),
            (1i32..50).prop_map(StockMutation::Reserve),
            (1i32..50).prop_map(StockMutation::Release),
            (1i32..50).prop_map(StockMutation::Commit),
            (1i32..50).prop_map(StockMutation::Return),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn invariant_survives_any_sequence(ops in prop::collection::vec(mutation_strategy(), 0..60)) {
            let mut level = StockLevel::new(0, 0);
            let mut ledger_sum = 0i64;
            for op in ops {
                if let Ok(t) = level.apply(op) {
                    prop_assert_eq!(t.before, level);
                    ledger_sum += i64::from(t.quantity_delta);
                    level = t.after;
                }
                prop_assert!(level.holds_invariant(), "broken after {:?}: {:?}", op, level);
                prop_assert_eq!(ledger_sum, i64::from(level.on_hand));
            }
        }

        #[test]
        fn reserve_then_release_restores_available(on_hand in 0i32..100, reserved in 0i32..100, qty in 1i32..100) {
            prop_assume!(reserved <= on_hand);
            let level = StockLevel::new(on_hand, reserved);
            if let Ok(held) = level.apply(StockMutation::Reserve(qty)) {
                let released = held.after.apply(StockMutation::Release(qty)).unwrap();
                prop_assert_eq!(released.after.available(), level.available());
            } else {
                prop_assert!(qty > level.available());
            }
        }
    }
}
