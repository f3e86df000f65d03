diesel::table! {
    categories (id) {
        id -> Int4,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    products (id) {
        id -> Int4,
        category_id -> Int4,
        name -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    product_metrics (id) {
        id -> Int4,
        product_id -> Int4,
        average_rating -> Nullable<Float8>,
        review_count -> Int4,
        wishlist_count -> Int4,
        base_price -> Numeric,
        adjusted_price -> Numeric,
        last_price_update -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    stocks (id) {
        id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        threshold -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    carts (id) {
        id -> Int4,
        customer_id -> Int4,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    cart_items (id) {
        id -> Int4,
        cart_id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        is_processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Int4,
        customer_id -> Int4,
        total_price -> Numeric,
        status -> Varchar,
        price_valid_until -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Int4,
        order_id -> Int4,
        product_id -> Int4,
        price -> Numeric,
        quantity -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    payments (id) {
        id -> Int4,
        order_id -> Int4,
        payment_method -> Varchar,
        amount -> Numeric,
        status -> Varchar,
        transaction_id -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    sales (id) {
        id -> Int4,
        order_item_id -> Nullable<Int4>,
        product_id -> Int4,
        sale_price -> Numeric,
        quantity -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    price_model_coefficients (id) {
        id -> Int4,
        model_version -> Varchar,
        training_date -> Timestamptz,
        sample_size -> Int4,
        r_squared -> Float8,
        intercept -> Float8,
        sales_count_coef -> Float8,
        sales_value_coef -> Float8,
        sales_velocity_coef -> Float8,
        days_since_sale_coef -> Float8,
        category_rank_coef -> Float8,
        category_percentile_coef -> Float8,
        review_score_coef -> Float8,
        wishlist_ratio_coef -> Float8,
        days_in_stock_coef -> Float8,
        seasonal_factor_coef -> Float8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    price_adjustments (id) {
        id -> Int4,
        product_id -> Int4,
        old_price -> Numeric,
        new_price -> Numeric,
        model_version -> Varchar,
        confidence_score -> Float4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    pricing_features (id) {
        id -> Int4,
        product_id -> Int4,
        days_since_last_sale -> Int4,
        sales_velocity -> Float8,
        total_sales_count -> Int4,
        total_sales_value -> Float8,
        category_rank -> Int4,
        category_percentile -> Float8,
        review_score -> Float8,
        wishlist_to_sales_ratio -> Float8,
        days_in_stock -> Int4,
        seasonal_factor -> Float8,
        last_model_run -> Timestamptz,
    }
}

diesel::joinable!(products -> categories (category_id));
diesel::joinable!(product_metrics -> products (product_id));
diesel::joinable!(stocks -> products (product_id));
diesel::joinable!(cart_items -> carts (cart_id));
diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(order_items -> products (product_id));
diesel::joinable!(payments -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    categories,
    products,
    product_metrics,
    stocks,
    carts,
    cart_items,
    orders,
    order_items,
    payments,
    sales,
    price_model_coefficients,
    price_adjustments,
    pricing_features,
);
