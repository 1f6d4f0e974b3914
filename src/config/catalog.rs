//! Data bundle catalog.
//!
//! Prices are in pesewas (GHS minor units). The catalog is the source of truth for
//! what a product code costs; client-supplied amounts are checked against it.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Product {
    pub code: &'static str,
    /// Network slug used in the fulfillment provider's endpoint path.
    pub network: &'static str,
    pub volume_mb: u32,
    pub price_minor: u64,
    pub reference_prefix: &'static str,
}

const fn mtn(code: &'static str, volume_mb: u32, price_minor: u64) -> Product {
    Product {
        code,
        network: "mtn",
        volume_mb,
        price_minor,
        reference_prefix: "MTN_DATA",
    }
}

const fn at(code: &'static str, volume_mb: u32, price_minor: u64) -> Product {
    Product {
        code,
        network: "at",
        volume_mb,
        price_minor,
        reference_prefix: "AT_DATA",
    }
}

pub const PRODUCTS: &[Product] = &[
    mtn("mtn-1gb", 1_000, 550),
    mtn("mtn-2gb", 2_000, 1_200),
    mtn("mtn-5gb", 5_000, 2_700),
    mtn("mtn-10gb", 10_000, 4_600),
    at("at-1gb", 1_000, 500),
    at("at-2gb", 2_000, 900),
    at("at-3gb", 3_000, 1_300),
    at("at-4gb", 4_000, 1_800),
    at("at-5gb", 5_000, 2_000),
    at("at-6gb", 6_000, 2_300),
    at("at-7gb", 7_000, 2_700),
    at("at-8gb", 8_000, 3_500),
    at("at-9gb", 9_000, 3_600),
    at("at-10gb", 10_000, 4_200),
    at("at-15gb", 15_000, 6_150),
    at("at-20gb", 20_000, 8_000),
    at("at-50gb", 50_000, 14_000),
    at("at-100gb", 100_000, 25_000),
];

pub fn find_product(code: &str) -> Option<&'static Product> {
    let code = code.trim();
    PRODUCTS
        .iter()
        .find(|product| product.code.eq_ignore_ascii_case(code))
}

pub fn product_codes() -> Vec<&'static str> {
    PRODUCTS.iter().map(|product| product.code).collect()
}
