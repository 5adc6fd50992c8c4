//! Discount arithmetic shared by coupon application and recommendation.
//!
//! Everything here is pure: callers resolve products, categories and coupon
//! associations first and hand in plain values. Amounts are exact decimals and
//! are never rounded along the way; [`settle_total`] is the single place a
//! total is brought to the currency's smallest unit.

use crate::entities::coupon::Model as CouponModel;
use crate::entities::order_item::Model as OrderItemModel;
use crate::entities::{CouponTarget, DiscountType};
use crate::errors::ServiceError;
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;
use std::collections::HashSet;
use uuid::Uuid;

/// One order line as seen by the calculator.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedItem {
    pub product_id: Uuid,
    pub unit_price: Decimal,
    /// Promotional unit price frozen at purchase; wins over `unit_price`
    pub discount_price: Option<Decimal>,
    pub quantity: i32,
    /// Names of the product's categories and all their ancestors
    pub category_names: HashSet<String>,
}

impl PricedItem {
    pub fn from_order_item(item: &OrderItemModel, category_names: HashSet<String>) -> Self {
        Self {
            product_id: item.product_id,
            unit_price: item.price_at_purchase,
            discount_price: item.discount_price_at_purchase,
            quantity: item.quantity,
            category_names,
        }
    }

    pub fn effective_unit_price(&self) -> Decimal {
        self.discount_price.unwrap_or(self.unit_price)
    }

    pub fn line_total(&self) -> Decimal {
        self.effective_unit_price() * Decimal::from(self.quantity)
    }
}

/// An order reduced to what discounting needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedOrder {
    pub sub_total: Decimal,
    pub items: Vec<PricedItem>,
}

/// A coupon's discount rule with its associations already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CouponRule {
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub target: CouponTarget,
    pub maximum_discount_amount: Option<Decimal>,
    pub product_ids: HashSet<Uuid>,
    pub category_names: HashSet<String>,
}

impl CouponRule {
    /// Builds the rule for a stored coupon, rejecting values no coupon may carry.
    pub fn from_coupon(
        coupon: &CouponModel,
        product_ids: HashSet<Uuid>,
        category_names: HashSet<String>,
    ) -> Result<Self, ServiceError> {
        validate_discount_values(
            coupon.discount_type,
            coupon.discount_value,
            coupon.maximum_discount_amount,
        )?;

        Ok(Self {
            discount_type: coupon.discount_type,
            discount_value: coupon.discount_value,
            target: coupon.target,
            maximum_discount_amount: coupon.maximum_discount_amount,
            product_ids,
            category_names,
        })
    }

    /// Whether this rule discounts the given line.
    pub fn covers(&self, item: &PricedItem) -> bool {
        match self.target {
            CouponTarget::All => true,
            CouponTarget::Single => {
                self.product_ids.contains(&item.product_id)
                    || !self.category_names.is_disjoint(&item.category_names)
            }
        }
    }

    /// Amount subtracted from the subtotal, before any rounding.
    pub fn discount_amount(&self, order: &PricedOrder) -> Decimal {
        let discount = match self.target {
            CouponTarget::All => self.discount_on(order.sub_total),
            CouponTarget::Single => {
                let mut eligible = order.items.iter().filter(|item| self.covers(item)).peekable();
                if eligible.peek().is_none() {
                    return Decimal::ZERO;
                }
                let base: Decimal = eligible.map(PricedItem::line_total).sum();
                self.discount_on(base)
            }
        };

        match self.maximum_discount_amount {
            Some(cap) => discount.min(cap),
            None => discount,
        }
    }

    fn discount_on(&self, base: Decimal) -> Decimal {
        match self.discount_type {
            DiscountType::Percentage => base * self.discount_value / Decimal::ONE_HUNDRED,
            DiscountType::Fixed => self.discount_value,
        }
    }
}

/// Checks the numeric fields of a coupon rule.
pub fn validate_discount_values(
    discount_type: DiscountType,
    discount_value: Decimal,
    maximum_discount_amount: Option<Decimal>,
) -> Result<(), ServiceError> {
    if discount_value.is_sign_negative() {
        return Err(ServiceError::ValidationError(
            "Discount value must not be negative".to_string(),
        ));
    }
    if discount_type == DiscountType::Percentage && discount_value > Decimal::ONE_HUNDRED {
        return Err(ServiceError::ValidationError(
            "Percentage discount must be between 0 and 100".to_string(),
        ));
    }
    if maximum_discount_amount.map_or(false, |cap| cap.is_sign_negative()) {
        return Err(ServiceError::ValidationError(
            "Maximum discount amount must not be negative".to_string(),
        ));
    }
    Ok(())
}

/// Final total of `order` with `rule` applied, unrounded.
///
/// A fixed discount on the whole order may push the result below zero; callers
/// settle the value with [`settle_total`] before storing or showing it.
pub fn compute_final_total(order: &PricedOrder, rule: Option<&CouponRule>) -> Decimal {
    match rule {
        None => order.sub_total,
        Some(rule) => order.sub_total - rule.discount_amount(order),
    }
}

/// Rounds a total to `scale` decimal places (half away from zero) and floors it at zero.
pub fn settle_total(total: Decimal, scale: u32) -> Decimal {
    total
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
        .max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn names(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn item(price: Decimal, quantity: i32, categories: &[&str]) -> PricedItem {
        PricedItem {
            product_id: Uuid::new_v4(),
            unit_price: price,
            discount_price: None,
            quantity,
            category_names: names(categories),
        }
    }

    fn order(items: Vec<PricedItem>) -> PricedOrder {
        let sub_total = items.iter().map(PricedItem::line_total).sum();
        PricedOrder { sub_total, items }
    }

    fn rule(discount_type: DiscountType, value: Decimal, target: CouponTarget) -> CouponRule {
        CouponRule {
            discount_type,
            discount_value: value,
            target,
            maximum_discount_amount: None,
            product_ids: HashSet::new(),
            category_names: HashSet::new(),
        }
    }

    /// A pair of shorts at 20 x 2 and a t-shirt at 10 x 1
    fn apparel_order() -> PricedOrder {
        order(vec![
            item(dec!(20), 2, &["shorts", "bottoms", "clothing"]),
            item(dec!(10), 1, &["t-shirts", "tops", "clothing"]),
        ])
    }

    #[test]
    fn no_coupon_returns_subtotal() {
        let o = apparel_order();
        assert_eq!(compute_final_total(&o, None), dec!(50));
    }

    #[test]
    fn percentage_on_whole_order() {
        let o = apparel_order();
        let r = rule(DiscountType::Percentage, dec!(10), CouponTarget::All);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(45));
    }

    #[test]
    fn percentage_on_matching_category() {
        let o = apparel_order();
        let mut r = rule(DiscountType::Percentage, dec!(10), CouponTarget::Single);
        r.category_names = names(&["shorts"]);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(46));
    }

    #[test]
    fn ancestor_category_makes_item_eligible() {
        let o = apparel_order();
        let mut r = rule(DiscountType::Percentage, dec!(10), CouponTarget::Single);
        r.category_names = names(&["clothing"]);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(45));
    }

    #[test]
    fn discount_price_is_the_eligible_base() {
        let mut shorts = item(dec!(20), 2, &["shorts"]);
        shorts.discount_price = Some(dec!(18));
        let o = PricedOrder {
            sub_total: dec!(46),
            items: vec![shorts, item(dec!(10), 1, &["tops"])],
        };
        let mut r = rule(DiscountType::Percentage, dec!(10), CouponTarget::Single);
        r.category_names = names(&["shorts"]);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(42.4));
    }

    #[test]
    fn product_or_category_match_is_a_union() {
        let shorts = item(dec!(20), 2, &["shorts"]);
        let hat = item(dec!(10), 1, &["hats"]);
        let socks = item(dec!(5), 2, &["socks"]);
        let mut r = rule(DiscountType::Percentage, dec!(50), CouponTarget::Single);
        r.product_ids.insert(hat.product_id);
        r.product_ids.insert(shorts.product_id);
        r.category_names = names(&["shorts"]);
        let o = order(vec![shorts, hat, socks]);
        // shorts counted once even though both product and category match
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(35));
    }

    #[test]
    fn fixed_amount_on_whole_order() {
        let o = apparel_order();
        let r = rule(DiscountType::Fixed, dec!(10), CouponTarget::All);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(40));
    }

    #[test]
    fn fixed_amount_on_single_target_applies_once() {
        let o = apparel_order();
        let mut r = rule(DiscountType::Fixed, dec!(5), CouponTarget::Single);
        r.category_names = names(&["shorts"]);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(45));
    }

    #[test]
    fn single_target_without_eligible_items_changes_nothing() {
        let o = apparel_order();
        let mut r = rule(DiscountType::Fixed, dec!(5), CouponTarget::Single);
        r.category_names = names(&["shoes"]);
        assert_eq!(compute_final_total(&o, Some(&r)), dec!(50));
    }

    #[test]
    fn fixed_amount_may_exceed_subtotal_until_settled() {
        let o = apparel_order();
        let r = rule(DiscountType::Fixed, dec!(80), CouponTarget::All);
        let raw = compute_final_total(&o, Some(&r));
        assert_eq!(raw, dec!(-30));
        assert_eq!(settle_total(raw, 2), Decimal::ZERO);
    }

    #[test]
    fn maximum_discount_caps_both_types() {
        let o = apparel_order();
        let mut pct = rule(DiscountType::Percentage, dec!(50), CouponTarget::All);
        pct.maximum_discount_amount = Some(dec!(10));
        assert_eq!(compute_final_total(&o, Some(&pct)), dec!(40));

        let mut fixed = rule(DiscountType::Fixed, dec!(80), CouponTarget::All);
        fixed.maximum_discount_amount = Some(dec!(10));
        assert_eq!(compute_final_total(&o, Some(&fixed)), dec!(40));
    }

    #[test]
    fn no_rounding_before_settlement() {
        let o = order(vec![item(dec!(9.99), 3, &[])]);
        let r = rule(DiscountType::Percentage, dec!(15), CouponTarget::All);
        let raw = compute_final_total(&o, Some(&r));
        assert_eq!(raw, dec!(25.4745));
        assert_eq!(settle_total(raw, 2), dec!(25.47));
        assert_eq!(settle_total(dec!(0.125), 2), dec!(0.13));
    }

    #[test]
    fn calculation_is_idempotent() {
        let o = apparel_order();
        let before = o.clone();
        let mut r = rule(DiscountType::Percentage, dec!(12.5), CouponTarget::Single);
        r.category_names = names(&["clothing"]);
        let first = compute_final_total(&o, Some(&r));
        let second = compute_final_total(&o, Some(&r));
        assert_eq!(first, second);
        assert_eq!(o, before);
    }

    #[test]
    fn rule_values_are_validated() {
        assert!(validate_discount_values(DiscountType::Percentage, dec!(100), None).is_ok());
        assert!(validate_discount_values(DiscountType::Percentage, dec!(100.01), None).is_err());
        assert!(validate_discount_values(DiscountType::Fixed, dec!(250), None).is_ok());
        assert!(validate_discount_values(DiscountType::Fixed, dec!(-1), None).is_err());
        assert!(validate_discount_values(DiscountType::Fixed, dec!(1), Some(dec!(-1))).is_err());
    }

    proptest! {
        #[test]
        fn whole_order_total_never_increases_with_discount_value(
            cents in 0i64..1_000_000,
            a in 0u32..=100,
            b in 0u32..=100,
            fixed in any::<bool>(),
        ) {
            let discount_type = if fixed { DiscountType::Fixed } else { DiscountType::Percentage };
            let o = PricedOrder { sub_total: Decimal::new(cents, 2), items: Vec::new() };
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let low_rule = rule(discount_type, Decimal::from(low), CouponTarget::All);
            let high_rule = rule(discount_type, Decimal::from(high), CouponTarget::All);
            prop_assert!(
                compute_final_total(&o, Some(&high_rule)) <= compute_final_total(&o, Some(&low_rule))
            );
        }
    }
}
