//! Turns a cart into a priced order and a pending order into a paid sale.
//!
//! Both phases run in a single transaction and take row locks on the prices
//! and stock they read, so concurrent checkouts serialize on the rows they
//! share and a failed attempt leaves nothing behind.

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::db::DbPool;
use shared::models::{CartItem, NewOrder, NewOrderItem, NewPayment, NewSale, Order, OrderItem};
use shared::schema::{cart_items, carts, order_items, orders, payments, product_metrics, products, sales, stocks};
use shared::{OrderStatus, PaymentStatus, PAYMENT_METHOD_CARD};
use tracing::info;
use uuid::Uuid;

use crate::error::{CheckoutError, CheckoutResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItemDetail {
    pub id: i32,
    pub product_id: i32,
    pub product_name: String,
    pub price: BigDecimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItemDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub order_id: i32,
    pub payment_id: i32,
    pub transaction_id: String,
    pub amount: BigDecimal,
    pub repriced: bool,
}

pub fn generate_transaction_id() -> String {
    format!("TXN-{}", Uuid::new_v4().simple())
}

pub fn line_total(price: &BigDecimal, quantity: i32) -> BigDecimal {
    price * BigDecimal::from(quantity)
}

pub fn order_total<'a>(lines: impl IntoIterator<Item = (&'a BigDecimal, i32)>) -> BigDecimal {
    lines
        .into_iter()
        .fold(BigDecimal::from(0), |total, (price, quantity)| {
            total + line_total(price, quantity)
        })
}

/// Units requested per product, in ascending product id order. Stock rows are
/// locked in this order so two checkouts can never wait on each other.
pub fn requested_units(items: &[OrderItem]) -> BTreeMap<i32, i32> {
    let mut units = BTreeMap::new();
    for item in items {
        *units.entry(item.product_id).or_insert(0) += item.quantity;
    }
    units
}

pub fn quote_expired(valid_until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > valid_until
}

#[derive(Clone)]
pub struct CheckoutCoordinator {
    pool: DbPool,
    price_validity: Duration,
}

impl CheckoutCoordinator {
    pub fn new(pool: DbPool, price_validity: Duration) -> Self {
        Self {
            pool,
            price_validity,
        }
    }

    /// Quote phase: converts the customer's active cart into a pending order.
    pub async fn generate_order(&self, customer_id: i32) -> CheckoutResult<OrderWithItems> {
        let mut conn = self.pool.get().await?;
        let validity = self.price_validity;

        let order = conn
            .transaction::<_, CheckoutError, _>(|conn| {
                Box::pin(async move {
                    let cart_id: i32 = carts::table
                        .filter(carts::customer_id.eq(customer_id))
                        .filter(carts::is_active.eq(true))
                        .select(carts::id)
                        .for_update()
                        .get_result(conn)
                        .await
                        .optional()?
                        .ok_or(CheckoutError::NoActiveCart(customer_id))?;

                    if find_pending_order(conn, customer_id).await?.is_some() {
                        return Err(CheckoutError::DuplicatePendingOrder(customer_id));
                    }

                    let mut items: Vec<CartItem> = cart_items::table
                        .filter(cart_items::cart_id.eq(cart_id))
                        .filter(cart_items::is_processed.eq(false))
                        .order(cart_items::id.asc())
                        .load(conn)
                        .await?;
                    if items.is_empty() {
                        return Err(CheckoutError::EmptyCart(customer_id));
                    }
                    items.sort_by_key(|item| item.product_id);

                    let mut lines = Vec::with_capacity(items.len());
                    for item in &items {
                        let price = lock_current_price(conn, item.product_id).await?;
                        lines.push((item.product_id, price, item.quantity));
                    }
                    let total = order_total(lines.iter().map(|(_, price, qty)| (price, *qty)));

                    let order: Order = diesel::insert_into(orders::table)
                        .values(&NewOrder {
                            customer_id,
                            total_price: total,
                            status: OrderStatus::Pending.to_string(),
                            price_valid_until: Utc::now() + validity,
                        })
                        .get_result(conn)
                        .await
                        .map_err(|e| CheckoutError::from_order_insert(customer_id, e))?;

                    let new_items: Vec<NewOrderItem> = lines
                        .into_iter()
                        .map(|(product_id, price, quantity)| NewOrderItem {
                            order_id: order.id,
                            product_id,
                            price,
                            quantity,
                        })
                        .collect();
                    diesel::insert_into(order_items::table)
                        .values(&new_items)
                        .execute(conn)
                        .await?;

                    let consumed: Vec<i32> = items.iter().map(|item| item.id).collect();
                    diesel::update(cart_items::table.filter(cart_items::id.eq_any(&consumed)))
                        .set(cart_items::is_processed.eq(true))
                        .execute(conn)
                        .await?;

                    let items = load_item_details(conn, order.id).await?;
                    Ok(OrderWithItems { order, items })
                })
            })
            .await?;

        info!(
            "Order {} created for customer {} ({} items, total {})",
            order.order.id,
            customer_id,
            order.items.len(),
            order.order.total_price
        );
        Ok(order)
    }

    pub async fn get_order_with_items(&self, customer_id: i32) -> CheckoutResult<OrderWithItems> {
        let mut conn = self.pool.get().await?;
        let order = find_pending_order(&mut conn, customer_id)
            .await?
            .ok_or(CheckoutError::NoPendingOrder(customer_id))?;
        let items = load_item_details(&mut conn, order.id).await?;
        Ok(OrderWithItems { order, items })
    }

    /// Moves the pending order to `cancelled`, freeing the customer to quote again.
    pub async fn cancel_order(&self, customer_id: i32) -> CheckoutResult<Order> {
        let mut conn = self.pool.get().await?;
        let order: Order = diesel::update(
            orders::table
                .filter(orders::customer_id.eq(customer_id))
                .filter(orders::status.eq(OrderStatus::Pending.as_str())),
        )
        .set((
            orders::status.eq(OrderStatus::Cancelled.as_str()),
            orders::updated_at.eq(Utc::now()),
        ))
        .get_result(&mut conn)
        .await
        .optional()?
        .ok_or(CheckoutError::NoPendingOrder(customer_id))?;

        info!("Order {} cancelled by customer {}", order.id, customer_id);
        Ok(order)
    }

    /// Payment phase: settles the pending order, re-pricing it first when the
    /// quote has expired. Payment itself always succeeds.
    pub async fn process_payment(&self, customer_id: i32) -> CheckoutResult<PaymentReceipt> {
        let mut conn = self.pool.get().await?;
        let validity = self.price_validity;

        let receipt = conn
            .transaction::<_, CheckoutError, _>(|conn| {
                Box::pin(async move {
                    let order: Order = orders::table
                        .filter(orders::customer_id.eq(customer_id))
                        .filter(orders::status.eq(OrderStatus::Pending.as_str()))
                        .for_update()
                        .get_result(conn)
                        .await
                        .optional()?
                        .ok_or(CheckoutError::NoPendingOrder(customer_id))?;

                    let mut items: Vec<OrderItem> = order_items::table
                        .filter(order_items::order_id.eq(order.id))
                        .order((order_items::product_id.asc(), order_items::id.asc()))
                        .load(conn)
                        .await?;

                    let now = Utc::now();
                    let repriced = quote_expired(order.price_valid_until, now);
                    let amount = if repriced {
                        for item in items.iter_mut() {
                            let current = lock_current_price(conn, item.product_id).await?;
                            diesel::update(order_items::table.find(item.id))
                                .set(order_items::price.eq(&current))
                                .execute(conn)
                                .await?;
                            item.price = current;
                        }
                        let total = order_total(items.iter().map(|item| (&item.price, item.quantity)));
                        diesel::update(orders::table.find(order.id))
                            .set((
                                orders::total_price.eq(&total),
                                orders::price_valid_until.eq(now + validity),
                                orders::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                        info!(
                            "Quote for order {} expired, repriced {} -> {}",
                            order.id, order.total_price, total
                        );
                        total
                    } else {
                        order.total_price.clone()
                    };

                    for (&product_id, &requested) in &requested_units(&items) {
                        let available: i32 = stocks::table
                            .filter(stocks::product_id.eq(product_id))
                            .select(stocks::quantity)
                            .for_update()
                            .get_result(conn)
                            .await
                            .optional()?
                            .ok_or(CheckoutError::ProductUnavailable(product_id))?;
                        if available < requested {
                            return Err(CheckoutError::InsufficientStock {
                                product_id,
                                available,
                                requested,
                            });
                        }
                    }

                    let transaction_id = generate_transaction_id();
                    let payment_id: i32 = diesel::insert_into(payments::table)
                        .values(&NewPayment {
                            order_id: order.id,
                            payment_method: PAYMENT_METHOD_CARD.to_string(),
                            amount: amount.clone(),
                            status: PaymentStatus::Success.as_str().to_string(),
                            transaction_id: transaction_id.clone(),
                        })
                        .returning(payments::id)
                        .get_result(conn)
                        .await?;

                    diesel::update(orders::table.find(order.id))
                        .set((
                            orders::status.eq(OrderStatus::Completed.as_str()),
                            orders::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    for item in &items {
                        diesel::insert_into(sales::table)
                            .values(&NewSale {
                                order_item_id: Some(item.id),
                                product_id: item.product_id,
                                sale_price: item.price.clone(),
                                quantity: item.quantity,
                            })
                            .execute(conn)
                            .await?;

                        diesel::update(stocks::table.filter(stocks::product_id.eq(item.product_id)))
                            .set((
                                stocks::quantity.eq(stocks::quantity - item.quantity),
                                stocks::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                    }

                    Ok(PaymentReceipt {
                        order_id: order.id,
                        payment_id,
                        transaction_id,
                        amount,
                        repriced,
                    })
                })
            })
            .await?;

        info!(
            "Payment {} settled order {} for customer {} ({})",
            receipt.transaction_id, receipt.order_id, customer_id, receipt.amount
        );
        Ok(receipt)
    }
}

async fn find_pending_order(
    conn: &mut AsyncPgConnection,
    customer_id: i32,
) -> CheckoutResult<Option<Order>> {
    let order = orders::table
        .filter(orders::customer_id.eq(customer_id))
        .filter(orders::status.eq(OrderStatus::Pending.as_str()))
        .first::<Order>(conn)
        .await
        .optional()?;
    Ok(order)
}

async fn lock_current_price(
    conn: &mut AsyncPgConnection,
    product_id: i32,
) -> CheckoutResult<BigDecimal> {
    product_metrics::table
        .filter(product_metrics::product_id.eq(product_id))
        .select(product_metrics::adjusted_price)
        .for_update()
        .get_result(conn)
        .await
        .optional()?
        .ok_or(CheckoutError::ProductUnavailable(product_id))
}

async fn load_item_details(
    conn: &mut AsyncPgConnection,
    order_id: i32,
) -> CheckoutResult<Vec<OrderItemDetail>> {
    let rows = order_items::table
        .inner_join(products::table)
        .filter(order_items::order_id.eq(order_id))
        .order(order_items::id.asc())
        .select((
            order_items::id,
            order_items::product_id,
            products::name,
            order_items::price,
            order_items::quantity,
        ))
        .load::<(i32, i32, String, BigDecimal, i32)>(conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(id, product_id, product_name, price, quantity)| OrderItemDetail {
            id,
            product_id,
            product_name,
            price,
            quantity,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn item(id: i32, product_id: i32, price: &str, quantity: i32) -> OrderItem {
        OrderItem {
            id,
            order_id: 1,
            product_id,
            price: BigDecimal::from_str(price).unwrap(),
            quantity,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn total_is_sum_of_price_times_quantity() {
        let items = [item(1, 3, "19.99", 2), item(2, 1, "5.25", 3), item(3, 7, "0.10", 1)];
        let total = order_total(items.iter().map(|i| (&i.price, i.quantity)));
        assert_eq!(total, BigDecimal::from_str("55.83").unwrap());
    }

    #[test]
    fn empty_order_totals_zero() {
        assert_eq!(order_total(std::iter::empty()), BigDecimal::from(0));
    }

    #[test]
    fn requested_units_are_merged_and_ascending() {
        let items = [item(1, 9, "1", 2), item(2, 3, "1", 1), item(3, 9, "1", 4)];
        let units: Vec<(i32, i32)> = requested_units(&items).into_iter().collect();
        assert_eq!(units, vec![(3, 1), (9, 6)]);
    }

    #[test]
    fn quote_expires_strictly_after_validity() {
        let until = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert!(!quote_expired(until, until));
        assert!(!quote_expired(until, until - Duration::minutes(1)));
        assert!(quote_expired(until, until + Duration::seconds(1)));
    }

    #[test]
    fn transaction_ids_are_unique_and_prefixed() {
        let a = generate_transaction_id();
        let b = generate_transaction_id();
        assert!(a.starts_with("TXN-"));
        assert_eq!(a.len(), 4 + 32);
        assert_ne!(a, b);
    }

    /// Database-backed checks. Run with
    /// `DATABASE_URL=postgres://... cargo test -p checkout-service -- --ignored`.
    mod store {
        use super::*;
        use diesel_async::AsyncPgConnection;

        struct Fixture {
            pool: DbPool,
            coordinator: CheckoutCoordinator,
        }

        async fn fixture() -> Fixture {
            let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
            shared::db::run_migrations(&url).unwrap();
            let pool = shared::db::build_pool(&url).await.unwrap();
            Fixture {
                coordinator: CheckoutCoordinator::new(pool.clone(), Duration::minutes(30)),
                pool,
            }
        }

        fn unique_customer() -> i32 {
            (Uuid::new_v4().as_u128() % 1_000_000_000) as i32 + 1
        }

        async fn product(conn: &mut AsyncPgConnection, price: &str, quantity: i32) -> i32 {
            use shared::schema::categories;

            let category_id: i32 = diesel::insert_into(categories::table)
                .values(categories::name.eq("checkout-test"))
                .returning(categories::id)
                .get_result(conn)
                .await
                .unwrap();
            let product_id: i32 = diesel::insert_into(products::table)
                .values((
                    products::category_id.eq(category_id),
                    products::name.eq(format!("item-{}", Uuid::new_v4())),
                ))
                .returning(products::id)
                .get_result(conn)
                .await
                .unwrap();
            let price = BigDecimal::from_str(price).unwrap();
            diesel::insert_into(product_metrics::table)
                .values((
                    product_metrics::product_id.eq(product_id),
                    product_metrics::base_price.eq(&price),
                    product_metrics::adjusted_price.eq(&price),
                ))
                .execute(conn)
                .await
                .unwrap();
            diesel::insert_into(stocks::table)
                .values((stocks::product_id.eq(product_id), stocks::quantity.eq(quantity)))
                .execute(conn)
                .await
                .unwrap();
            product_id
        }

        async fn cart(conn: &mut AsyncPgConnection, customer_id: i32, lines: &[(i32, i32)]) {
            let cart_id: i32 = diesel::insert_into(carts::table)
                .values(carts::customer_id.eq(customer_id))
                .returning(carts::id)
                .get_result(conn)
                .await
                .unwrap();
            for &(product_id, quantity) in lines {
                diesel::insert_into(cart_items::table)
                    .values((
                        cart_items::cart_id.eq(cart_id),
                        cart_items::product_id.eq(product_id),
                        cart_items::quantity.eq(quantity),
                    ))
                    .execute(conn)
                    .await
                    .unwrap();
            }
        }

        async fn stock_of(conn: &mut AsyncPgConnection, product_id: i32) -> i32 {
            stocks::table
                .filter(stocks::product_id.eq(product_id))
                .select(stocks::quantity)
                .get_result(conn)
                .await
                .unwrap()
        }

        #[tokio::test]
        #[ignore]
        async fn concurrent_payments_never_oversell() {
            let fx = fixture().await;
            let mut conn = fx.pool.get().await.unwrap();
            let product_id = product(&mut conn, "10.00", 5).await;
            let (alice, bob) = (unique_customer(), unique_customer());
            cart(&mut conn, alice, &[(product_id, 3)]).await;
            cart(&mut conn, bob, &[(product_id, 3)]).await;
            fx.coordinator.generate_order(alice).await.unwrap();
            fx.coordinator.generate_order(bob).await.unwrap();

            let (a, b) = tokio::join!(
                fx.coordinator.process_payment(alice),
                fx.coordinator.process_payment(bob)
            );

            let outcomes = [a, b];
            assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(outcomes.iter().any(|r| matches!(
                r,
                Err(CheckoutError::InsufficientStock {
                    available: 2,
                    requested: 3,
                    ..
                })
            )));
            assert_eq!(stock_of(&mut conn, product_id).await, 2);
        }

        #[tokio::test]
        #[ignore]
        async fn concurrent_quotes_leave_one_pending_order() {
            let fx = fixture().await;
            let mut conn = fx.pool.get().await.unwrap();
            let product_id = product(&mut conn, "4.00", 10).await;
            let customer = unique_customer();
            cart(&mut conn, customer, &[(product_id, 1)]).await;

            let (a, b) = tokio::join!(
                fx.coordinator.generate_order(customer),
                fx.coordinator.generate_order(customer)
            );

            let outcomes = [a, b];
            assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(outcomes
                .iter()
                .any(|r| matches!(r, Err(CheckoutError::DuplicatePendingOrder(_)))));

            let pending: i64 = orders::table
                .filter(orders::customer_id.eq(customer))
                .filter(orders::status.eq("pending"))
                .count()
                .get_result(&mut conn)
                .await
                .unwrap();
            assert_eq!(pending, 1);
        }

        #[tokio::test]
        #[ignore]
        async fn expired_quote_is_repriced_at_payment() {
            let fx = fixture().await;
            let mut conn = fx.pool.get().await.unwrap();
            let product_id = product(&mut conn, "20.00", 10).await;
            let customer = unique_customer();
            cart(&mut conn, customer, &[(product_id, 2)]).await;

            let quoted = fx.coordinator.generate_order(customer).await.unwrap();
            assert_eq!(quoted.order.total_price, BigDecimal::from(40));

            diesel::update(product_metrics::table.filter(product_metrics::product_id.eq(product_id)))
                .set(product_metrics::adjusted_price.eq(BigDecimal::from_str("22.50").unwrap()))
                .execute(&mut conn)
                .await
                .unwrap();
            diesel::update(orders::table.find(quoted.order.id))
                .set(orders::price_valid_until.eq(Utc::now() - Duration::minutes(1)))
                .execute(&mut conn)
                .await
                .unwrap();

            let receipt = fx.coordinator.process_payment(customer).await.unwrap();
            assert!(receipt.repriced);
            assert_eq!(receipt.amount, BigDecimal::from(45));

            let order: Order = orders::table.find(quoted.order.id).first(&mut conn).await.unwrap();
            assert_eq!(order.status, "completed");
            assert_eq!(order.total_price, BigDecimal::from(45));
            let item_price: BigDecimal = order_items::table
                .filter(order_items::order_id.eq(order.id))
                .select(order_items::price)
                .first(&mut conn)
                .await
                .unwrap();
            assert_eq!(item_price, BigDecimal::from_str("22.50").unwrap());
            assert_eq!(stock_of(&mut conn, product_id).await, 8);
        }

        #[tokio::test]
        #[ignore]
        async fn failed_stock_check_rolls_back_the_attempt() {
            let fx = fixture().await;
            let mut conn = fx.pool.get().await.unwrap();
            let plenty = product(&mut conn, "1.00", 10).await;
            let scarce = product(&mut conn, "1.00", 1).await;
            let customer = unique_customer();
            cart(&mut conn, customer, &[(plenty, 2), (scarce, 2)]).await;
            fx.coordinator.generate_order(customer).await.unwrap();

            let err = fx.coordinator.process_payment(customer).await.unwrap_err();
            assert!(matches!(err, CheckoutError::InsufficientStock { product_id, .. } if product_id == scarce));

            assert_eq!(stock_of(&mut conn, plenty).await, 10);
            let still_pending = fx.coordinator.get_order_with_items(customer).await.unwrap();
            assert_eq!(still_pending.items.len(), 2);

            fx.coordinator.cancel_order(customer).await.unwrap();
            assert!(matches!(
                fx.coordinator.get_order_with_items(customer).await,
                Err(CheckoutError::NoPendingOrder(_))
            ));
        }
    }
}
