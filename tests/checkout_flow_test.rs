mod common;

use assert_matches::assert_matches;
use common::{test_address, TestApp};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use storefront_api::{
    entities::{
        order::{OrderStatus, PaymentMethod},
        payment::PaymentState,
        Order, Payment,
    },
    errors::ServiceError,
    services::checkout::{BeginCheckoutInput, PaymentConfirmation},
};
use uuid::Uuid;

fn begin_input(method: PaymentMethod) -> BeginCheckoutInput {
    BeginCheckoutInput {
        payment_method: method,
        shipping_address: test_address(),
        billing_address: None,
        notes: None,
    }
}

#[tokio::test]
async fn two_phase_checkout_happy_path() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(100.00), dec!(10), 1).await;

    carts.add_item(customer, variant, 1).await.unwrap();

    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();

    // 100 − 10% = 90 subtotal; 8% tax = 7.20; shipping waived at >= 50.
    assert_eq!(outcome.pricing.subtotal, dec!(90.00));
    assert_eq!(outcome.pricing.tax_total, dec!(7.20));
    assert_eq!(outcome.pricing.shipping_total, dec!(0));
    assert_eq!(outcome.pricing.total, dec!(97.20));
    assert!(outcome.order.is_none());

    let intent = outcome.payment_intent.expect("intent for prepaid checkout");
    assert_eq!(intent.amount, dec!(97.20));

    // The cart stays locked through the payment window.
    let locked = carts.find_by_customer(customer).await.unwrap();
    assert!(locked.locked);

    let (payment_id, signature) = app.gateway.settle_intent(&intent.intent_id).unwrap();
    let order = checkout
        .confirm_checkout(
            customer,
            PaymentConfirmation {
                intent_id: intent.intent_id.clone(),
                payment_id,
                signature,
            },
        )
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentState::Paid);
    assert_eq!(order.payment_method, PaymentMethod::Prepaid);
    assert_eq!(order.total, dec!(97.20));

    // Frozen line prices match the oracle at commit time.
    let items = app.state.services.orders.order_items(order.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].unit_price, dec!(100.00));
    assert_eq!(items[0].final_price, dec!(90.00));
    assert_eq!(items[0].line_total, dec!(90.00));

    // Stock sold, payment linked, cart emptied and unlocked.
    assert_eq!(app.stock_of(variant).await, 0);
    let payment = Payment::find_by_id(intent.intent_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.order_id, Some(order.id));
    assert_eq!(payment.status, PaymentState::Paid);

    let cart = carts.get_cart(customer).await.unwrap();
    assert!(cart.items.is_empty());
    assert!(!cart.locked);
}

#[tokio::test]
async fn tampered_signature_is_rejected_without_an_order() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(40.00), dec!(0), 3).await;

    carts.add_item(customer, variant, 1).await.unwrap();
    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();

    let (payment_id, _) = app.gateway.settle_intent(&intent.intent_id).unwrap();
    let err = checkout
        .confirm_checkout(
            customer,
            PaymentConfirmation {
                intent_id: intent.intent_id,
                payment_id,
                signature: "deadbeef".repeat(8),
            },
        )
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::Unauthorized(_));

    // No order was created and no stock moved.
    let orders = Order::find().all(&*app.db).await.unwrap();
    assert!(orders.is_empty());
    assert_eq!(app.stock_of(variant).await, 3);

    // The lock came off on the failure exit.
    assert!(!carts.find_by_customer(customer).await.unwrap().locked);
}

#[tokio::test]
async fn confirm_is_idempotent_per_intent() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(60.00), dec!(0), 5).await;

    carts.add_item(customer, variant, 2).await.unwrap();
    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();
    let (payment_id, signature) = app.gateway.settle_intent(&intent.intent_id).unwrap();

    let confirmation = || PaymentConfirmation {
        intent_id: intent.intent_id.clone(),
        payment_id: payment_id.clone(),
        signature: signature.clone(),
    };

    let first = checkout
        .confirm_checkout(customer, confirmation())
        .await
        .unwrap();
    let second = checkout
        .confirm_checkout(customer, confirmation())
        .await
        .unwrap();

    // The retry returned the committed order; nothing happened twice.
    assert_eq!(first.id, second.id);
    assert_eq!(app.stock_of(variant).await, 3);
    assert_eq!(Order::find().all(&*app.db).await.unwrap().len(), 1);
}

#[tokio::test]
async fn overlapping_checkout_attempts_conflict() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(10.00), dec!(0), 10).await;

    carts.add_item(customer, variant, 1).await.unwrap();
    checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();

    // Duplicate tab: the same cart cannot enter checkout twice.
    let err = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn last_unit_goes_to_exactly_one_customer() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let variant = app.insert_variant(dec!(100.00), dec!(10), 1).await;

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    carts.add_item(alice, variant, 1).await.unwrap();
    carts.add_item(bob, variant, 1).await.unwrap();

    // Both pass the non-mutating pre-check while stock is still 1.
    let alice_outcome = checkout
        .begin_checkout(alice, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();
    let bob_outcome = checkout
        .begin_checkout(bob, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();

    let alice_intent = alice_outcome.payment_intent.unwrap();
    let bob_intent = bob_outcome.payment_intent.unwrap();
    let (alice_pay, alice_sig) = app.gateway.settle_intent(&alice_intent.intent_id).unwrap();
    let (bob_pay, bob_sig) = app.gateway.settle_intent(&bob_intent.intent_id).unwrap();

    let alice_order = checkout
        .confirm_checkout(
            alice,
            PaymentConfirmation {
                intent_id: alice_intent.intent_id,
                payment_id: alice_pay,
                signature: alice_sig,
            },
        )
        .await
        .unwrap();
    assert_eq!(alice_order.total, dec!(97.20));

    // The atomic reservation fails closed for the loser.
    let err = checkout
        .confirm_checkout(
            bob,
            PaymentConfirmation {
                intent_id: bob_intent.intent_id,
                payment_id: bob_pay,
                signature: bob_sig,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    assert_eq!(app.stock_of(variant).await, 0);
    assert_eq!(Order::find().all(&*app.db).await.unwrap().len(), 1);
    assert!(!carts.find_by_customer(bob).await.unwrap().locked);
}

#[tokio::test]
async fn gateway_outage_fails_checkout_and_releases_the_lock() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(30.00), dec!(0), 5).await;

    carts.add_item(customer, variant, 1).await.unwrap();
    app.gateway.set_available(false);

    let err = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::GatewayError(_));
    assert!(!carts.find_by_customer(customer).await.unwrap().locked);

    // Once the provider recovers, checkout goes through.
    app.gateway.set_available(true);
    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();
    assert!(outcome.payment_intent.is_some());
}

#[tokio::test]
async fn uncaptured_payment_is_rejected() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(30.00), dec!(0), 5).await;

    carts.add_item(customer, variant, 1).await.unwrap();
    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();

    // The gateway saw the payment fail; the signature itself is genuine.
    let (payment_id, signature) = app.gateway.fail_intent(&intent.intent_id);
    let err = checkout
        .confirm_checkout(
            customer,
            PaymentConfirmation {
                intent_id: intent.intent_id.clone(),
                payment_id,
                signature,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentFailed(_));

    let payment = Payment::find_by_id(intent.intent_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentState::Failed);
    assert_eq!(app.stock_of(variant).await, 5);
    assert!(Order::find().all(&*app.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn cash_on_delivery_commits_immediately() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(20.00), dec!(0), 4).await;

    carts.add_item(customer, variant, 2).await.unwrap();
    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::CashOnDelivery))
        .await
        .unwrap();

    assert!(outcome.payment_intent.is_none());
    let order = outcome.order.expect("cash on delivery commits in one step");
    assert_eq!(order.payment_status, PaymentState::Pending);
    assert_eq!(order.payment_method, PaymentMethod::CashOnDelivery);
    // 40 subtotal is under the threshold: 3.20 tax + 10 shipping.
    assert_eq!(order.total, dec!(53.20));

    assert_eq!(app.stock_of(variant).await, 2);
    let cart = carts.get_cart(customer).await.unwrap();
    assert!(cart.items.is_empty());
    assert!(!cart.locked);
}

#[tokio::test]
async fn invalid_items_are_stripped_and_surfaced() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let good = app.insert_variant(dec!(25.00), dec!(0), 10).await;
    let doomed = app.insert_variant(dec!(99.00), dec!(0), 10).await;

    carts.add_item(customer, good, 1).await.unwrap();
    carts.add_item(customer, doomed, 1).await.unwrap();

    // The second variant is retired between carting and checkout.
    {
        use sea_orm::{ActiveModelTrait, EntityTrait, Set};
        use storefront_api::entities::{product_variant, ProductVariant};
        let model = ProductVariant::find_by_id(doomed)
            .one(&*app.db)
            .await
            .unwrap()
            .unwrap();
        let mut active: product_variant::ActiveModel = model.into();
        active.is_active = Set(false);
        active.update(&*app.db).await.unwrap();
    }

    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();

    assert_eq!(outcome.removed_items.len(), 1);
    assert_eq!(outcome.removed_items[0].variant_id, doomed);
    // Only the surviving line is priced.
    assert_eq!(outcome.pricing.subtotal, dec!(25.00));

    // The strip is persisted, not just reported.
    let cart = {
        let checkout_cart = carts.find_by_customer(customer).await.unwrap();
        carts.unlock(checkout_cart.id).await.unwrap();
        carts.get_cart(customer).await.unwrap()
    };
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].variant_id, good);
}

#[tokio::test]
async fn empty_cart_cannot_check_out() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();

    carts.get_or_create(customer).await.unwrap();
    let err = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
    assert!(!carts.find_by_customer(customer).await.unwrap().locked);
}

#[tokio::test]
async fn frozen_prices_use_the_commit_time_catalog() {
    let app = TestApp::new().await;
    let carts = app.state.services.carts.clone();
    let checkout = app.state.services.checkout.clone();
    let customer = Uuid::new_v4();
    let variant = app.insert_variant(dec!(100.00), dec!(10), 5).await;

    carts.add_item(customer, variant, 1).await.unwrap();
    let outcome = checkout
        .begin_checkout(customer, begin_input(PaymentMethod::Prepaid))
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();

    // The price moves while the customer is at the payment page.
    {
        use sea_orm::{ActiveModelTrait, EntityTrait, Set};
        use storefront_api::entities::{product_variant, ProductVariant};
        let model = ProductVariant::find_by_id(variant)
            .one(&*app.db)
            .await
            .unwrap()
            .unwrap();
        let mut active: product_variant::ActiveModel = model.into();
        active.price = Set(dec!(120.00));
        active.update(&*app.db).await.unwrap();
    }

    let (payment_id, signature) = app.gateway.settle_intent(&intent.intent_id).unwrap();
    let order = checkout
        .confirm_checkout(
            customer,
            PaymentConfirmation {
                intent_id: intent.intent_id,
                payment_id,
                signature,
            },
        )
        .await
        .unwrap();

    // The frozen line equals the oracle applied to the variant as of commit.
    let items = app.state.services.orders.order_items(order.id).await.unwrap();
    assert_eq!(items[0].unit_price, dec!(120.00));
    assert_eq!(items[0].final_price, dec!(108.00));
    assert_eq!(order.subtotal, dec!(108.00));
}
