//! Loyalty points earned by a single purchase.
use crate::purchase::ItemType;

pub const CENTS_PER_POINT: i64 = 100;

/// Points per whole currency unit spent on an item of this type.
pub fn multiplier(item_type: ItemType) -> i64 {
    match item_type {
        ItemType::Game | ItemType::Dlc => 2,
        ItemType::SeasonPass => 3,
        ItemType::Cosmetic | ItemType::Currency => 1,
    }
}

/// The points a purchase is worth. Depends on nothing but the purchase itself, so totals
/// summed over a player's purchases do not depend on the order they are enriched in.
pub fn points_for(amount_cents: i64, item_type: ItemType) -> i64 {
    (amount_cents.max(0) / CENTS_PER_POINT).saturating_mul(multiplier(item_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_for_whole_units_only() {
        assert_eq!(points_for(0, ItemType::Game), 0);
        assert_eq!(points_for(99, ItemType::Game), 0);
        assert_eq!(points_for(100, ItemType::Game), 2);
        assert_eq!(points_for(5999, ItemType::Game), 118);
    }

    #[test]
    fn test_points_for_item_types() {
        assert_eq!(points_for(1000, ItemType::Dlc), 20);
        assert_eq!(points_for(1000, ItemType::SeasonPass), 30);
        assert_eq!(points_for(1000, ItemType::Cosmetic), 10);
        assert_eq!(points_for(1000, ItemType::Currency), 10);
    }

    #[test]
    fn test_points_for_is_monotonic_in_amount() {
        let mut previous = 0;
        for amount in (0..10_000).step_by(37) {
            let points = points_for(amount, ItemType::SeasonPass);
            assert!(points >= previous);
            previous = points;
        }
    }

    #[test]
    fn test_totals_do_not_depend_on_order() {
        let purchases = [
            (5999, ItemType::Game),
            (299, ItemType::Cosmetic),
            (1999, ItemType::SeasonPass),
        ];

        let forward: i64 = purchases.iter().map(|(a, t)| points_for(*a, *t)).sum();
        let backward: i64 = purchases.iter().rev().map(|(a, t)| points_for(*a, *t)).sum();

        assert_eq!(forward, backward);
    }
}
