//! Common types used across the platform

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ledger key: one inventory record exists per (product, batch, location)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triplet {
    pub product_id: Uuid,
    pub batch_id: Uuid,
    pub location_id: Uuid,
}

impl Triplet {
    pub fn new(product_id: Uuid, batch_id: Uuid, location_id: Uuid) -> Self {
        Self {
            product_id,
            batch_id,
            location_id,
        }
    }

    /// Same product and batch, different location
    pub fn at(&self, location_id: Uuid) -> Self {
        Self {
            location_id,
            ..*self
        }
    }
}

/// Optional product/batch/location filter shared by reports and listings.
///
/// Every field left as `None` matches anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockFilter {
    pub product_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
}

impl StockFilter {
    pub fn for_product(product_id: Uuid) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    pub fn with_batch(mut self, batch_id: Option<Uuid>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_location(mut self, location_id: Option<Uuid>) -> Self {
        self.location_id = location_id;
        self
    }

    /// Whether a ledger key falls inside this filter
    pub fn matches(&self, key: &Triplet) -> bool {
        self.product_id.map_or(true, |p| p == key.product_id)
            && self.batch_id.map_or(true, |b| b == key.batch_id)
            && self.location_id.map_or(true, |l| l == key.location_id)
    }

    /// Product/batch part of the filter only; movements match locations
    /// on their own terms (from/to).
    pub fn matches_product_batch(&self, product_id: Uuid, batch_id: Uuid) -> bool {
        self.product_id.map_or(true, |p| p == product_id)
            && self.batch_id.map_or(true, |b| b == batch_id)
    }
}

/// Inclusive time window for history queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}
