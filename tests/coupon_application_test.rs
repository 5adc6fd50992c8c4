mod common;

use assert_matches::assert_matches;
use common::{coupon_request, days_from_today, TestApp};
use rust_decimal_macros::dec;
use storefront_coupons::{
    entities::{CouponTarget, DiscountType},
    ServiceError,
};

#[tokio::test]
async fn whole_order_percentage_coupon() {
    let mut app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let coupon = app
        .create_coupon(coupon_request("SAVE10", DiscountType::Percentage, dec!(10)))
        .await
        .coupon;

    let order = app
        .order(&[
            (catalog.cargo_shorts, dec!(10), None, 1),
            (catalog.plain_tee, dec!(20), None, 2),
        ])
        .await;
    assert_eq!(order.order.sub_total, dec!(50));
    app.drain_events();

    let updated = app
        .services
        .application
        .apply_coupon(&order, "SAVE10")
        .await
        .expect("apply coupon");

    assert_eq!(updated.final_total, dec!(45));
    assert_eq!(updated.coupon_id, Some(coupon.id));
    assert_eq!(updated.version, order.order.version + 1);

    let stored = app.stored_order(order.order.id).await;
    assert_eq!(stored.final_total, dec!(45));
    assert_eq!(stored.coupon_id, Some(coupon.id));
    assert_eq!(app.coupon(coupon.id).await.times_used, 1);
    assert_eq!(app.drain_events(), vec!["coupon_applied"]);
}

#[tokio::test]
async fn single_target_coupon_discounts_matching_category_only() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let mut request = coupon_request("SHORTS10", DiscountType::Percentage, dec!(10));
    request.target = CouponTarget::Single;
    request.categories = vec!["shorts".to_string()];
    app.create_coupon(request).await;

    let order = app
        .order(&[
            (catalog.cargo_shorts, dec!(10), None, 1),
            (catalog.plain_tee, dec!(20), None, 2),
        ])
        .await;

    let updated = app
        .services
        .application
        .apply_coupon(&order, "SHORTS10")
        .await
        .expect("apply coupon");
    assert_eq!(updated.final_total, dec!(46));
}

#[tokio::test]
async fn category_coupon_reaches_descendant_products() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let mut request = coupon_request("BOTTOMS", DiscountType::Fixed, dec!(4));
    request.target = CouponTarget::Single;
    request.categories = vec!["bottoms".to_string()];
    app.create_coupon(request).await;

    let order = app
        .order(&[
            (catalog.cargo_shorts, dec!(10), None, 1),
            (catalog.gift_card, dec!(40), None, 1),
        ])
        .await;

    let updated = app
        .services
        .application
        .apply_coupon(&order, "BOTTOMS")
        .await
        .expect("apply coupon");
    assert_eq!(updated.final_total, dec!(46));
}

#[tokio::test]
async fn product_coupon_with_no_matching_item_leaves_total() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let mut request = coupon_request("TEEONLY", DiscountType::Percentage, dec!(50));
    request.target = CouponTarget::Single;
    request.products = vec![catalog.plain_tee];
    app.create_coupon(request).await;

    let order = app.order(&[(catalog.cargo_shorts, dec!(30), None, 1)]).await;
    let updated = app
        .services
        .application
        .apply_coupon(&order, "TEEONLY")
        .await
        .expect("apply coupon");
    assert_eq!(updated.final_total, dec!(30));
}

#[tokio::test]
async fn fixed_discount_never_goes_below_zero() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    app.create_coupon(coupon_request("BIGFIXED", DiscountType::Fixed, dec!(80)))
        .await;

    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    let updated = app
        .services
        .application
        .apply_coupon(&order, "BIGFIXED")
        .await
        .expect("apply coupon");
    assert_eq!(updated.final_total, dec!(0));
}

#[tokio::test]
async fn exhausted_coupon_is_rejected_with_capacity_exceeded() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let mut request = coupon_request("LIMITED", DiscountType::Percentage, dec!(10));
    request.max_usage = Some(10);
    let coupon = app.create_coupon(request).await.coupon;
    let coupon = app.set_times_used(&coupon, 10).await;

    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    let result = app
        .services
        .application
        .apply_coupon(&order, "LIMITED")
        .await;

    assert_matches!(result, Err(ServiceError::CapacityExceeded(_)));
    let stored = app.stored_order(order.order.id).await;
    assert_eq!(stored.coupon_id, None);
    assert_eq!(stored.version, order.order.version);
    assert_eq!(app.coupon(coupon.id).await.times_used, 10);
}

#[tokio::test]
async fn unknown_or_expired_code_is_not_found_without_mutation() {
    let mut app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let mut expired = coupon_request("OLDNEWS", DiscountType::Percentage, dec!(10));
    expired.start_date = Some(days_from_today(-30));
    expired.end_date = Some(days_from_today(-1));
    let expired = app.create_coupon(expired).await.coupon;

    let mut upcoming = coupon_request("SOON", DiscountType::Percentage, dec!(10));
    upcoming.start_date = Some(days_from_today(3));
    upcoming.end_date = None;
    app.create_coupon(upcoming).await;

    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    app.drain_events();

    for code in ["NOSUCHCODE", "OLDNEWS", "SOON", "oldnews"] {
        let result = app.services.application.apply_coupon(&order, code).await;
        assert_matches!(result, Err(ServiceError::NotFound(_)), "code {}", code);
    }

    let stored = app.stored_order(order.order.id).await;
    assert_eq!(stored.final_total, dec!(50));
    assert_eq!(stored.version, order.order.version);
    assert_eq!(app.coupon(expired.id).await.times_used, 0);
    assert!(app.drain_events().is_empty());
}

#[tokio::test]
async fn blank_code_is_a_validation_error() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;

    let result = app.services.application.apply_coupon(&order, "   ").await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn padded_code_does_not_match() {
    let mut app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let coupon = app
        .create_coupon(coupon_request("SAVE10", DiscountType::Percentage, dec!(10)))
        .await
        .coupon;
    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    app.drain_events();

    for code in [" SAVE10 ", "SAVE10 ", "\tSAVE10"] {
        let result = app.services.application.apply_coupon(&order, code).await;
        assert_matches!(result, Err(ServiceError::NotFound(_)), "code {:?}", code);
    }

    let stored = app.stored_order(order.order.id).await;
    assert_eq!(stored.coupon_id, None);
    assert_eq!(stored.version, order.order.version);
    assert_eq!(app.coupon(coupon.id).await.times_used, 0);
    assert!(app.drain_events().is_empty());
}

#[tokio::test]
async fn stale_order_snapshot_conflicts_and_rolls_back() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let first = app
        .create_coupon(coupon_request("FIRST", DiscountType::Percentage, dec!(10)))
        .await
        .coupon;
    let second = app
        .create_coupon(coupon_request("SECOND", DiscountType::Fixed, dec!(5)))
        .await
        .coupon;

    let stale = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    app.services
        .application
        .apply_coupon(&stale, "FIRST")
        .await
        .expect("first application");

    let result = app.services.application.apply_coupon(&stale, "SECOND").await;
    assert_matches!(result, Err(ServiceError::Conflict(_)));

    let stored = app.stored_order(stale.order.id).await;
    assert_eq!(stored.coupon_id, Some(first.id));
    assert_eq!(stored.final_total, dec!(45));
    assert_eq!(app.coupon(first.id).await.times_used, 1);
    assert_eq!(app.coupon(second.id).await.times_used, 0);
}

#[tokio::test]
async fn switching_coupons_moves_the_use() {
    let mut app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let first = app
        .create_coupon(coupon_request("FIRST", DiscountType::Percentage, dec!(10)))
        .await
        .coupon;
    let second = app
        .create_coupon(coupon_request("SECOND", DiscountType::Fixed, dec!(15)))
        .await
        .coupon;

    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    app.services
        .application
        .apply_coupon(&order, "FIRST")
        .await
        .expect("first application");
    app.drain_events();

    let current = app.reload_order(order.order.id).await;
    let updated = app
        .services
        .application
        .apply_coupon(&current, "SECOND")
        .await
        .expect("second application");

    assert_eq!(updated.coupon_id, Some(second.id));
    assert_eq!(updated.final_total, dec!(35));
    assert_eq!(app.coupon(first.id).await.times_used, 0);
    assert_eq!(app.coupon(second.id).await.times_used, 1);
    assert_eq!(app.drain_events(), vec!["coupon_released", "coupon_applied"]);
}

#[tokio::test]
async fn reapplying_the_same_coupon_keeps_one_use() {
    let app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let coupon = app
        .create_coupon(coupon_request("AGAIN", DiscountType::Percentage, dec!(10)))
        .await
        .coupon;

    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    app.services
        .application
        .apply_coupon(&order, "AGAIN")
        .await
        .expect("first application");

    let current = app.reload_order(order.order.id).await;
    let updated = app
        .services
        .application
        .apply_coupon(&current, "AGAIN")
        .await
        .expect("second application");

    assert_eq!(updated.final_total, dec!(45));
    assert_eq!(updated.version, current.order.version + 1);
    assert_eq!(app.coupon(coupon.id).await.times_used, 1);
}

#[tokio::test]
async fn removing_a_coupon_restores_the_subtotal() {
    let mut app = TestApp::new().await;
    let catalog = app.seed_catalog().await;
    let coupon = app
        .create_coupon(coupon_request("GONE", DiscountType::Fixed, dec!(20)))
        .await
        .coupon;

    let order = app.order(&[(catalog.gift_card, dec!(50), None, 1)]).await;
    let applied = app
        .services
        .application
        .apply_coupon(&order, "GONE")
        .await
        .expect("apply coupon");
    assert_eq!(applied.final_total, dec!(30));
    app.drain_events();

    let removed = app
        .services
        .application
        .remove_coupon(&applied)
        .await
        .expect("remove coupon");

    assert_eq!(removed.coupon_id, None);
    assert_eq!(removed.final_total, dec!(50));
    assert_eq!(app.coupon(coupon.id).await.times_used, 0);
    assert_eq!(app.drain_events(), vec!["coupon_released"]);

    let again = app
        .services
        .application
        .remove_coupon(&removed)
        .await
        .expect("remove from order without coupon");
    assert_eq!(again, removed);
}
