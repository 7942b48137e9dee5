//! Stock Reservation Manager
//!
//! Reserve / Release / Promote over the reservation queue.
//!
//! The `*_in` functions run inside a caller-owned [`StoreTx`] so the state
//! machine can combine them with a status transition in one commit. The
//! [`ReservationManager`] methods open and commit their own transaction.
//!
//! Units are always taken in ascending id order, so two concurrent reservers
//! of the same product never wait on each other in opposite orders.

use std::sync::Arc;
use tracing::debug;

use crate::core_types::{OrderId, ProductId, UserId};
use crate::error::EngineError;
use crate::models::{StockStatus, StockUnit};
use crate::store::{ResourceStore, StoreTx};

/// Reserve exactly `quantity` ready units for an order.
///
/// Fewer than `quantity` available → `InsufficientStock` before any write.
/// The caller must drop (roll back) the transaction in that case.
pub async fn reserve_in(
    tx: &mut dyn StoreTx,
    order_id: OrderId,
    product_id: ProductId,
    quantity: i32,
) -> Result<Vec<StockUnit>, EngineError> {
    let units = tx.lock_ready_units(product_id, quantity as i64).await?;
    if units.len() < quantity as usize {
        return Err(EngineError::InsufficientStock {
            product_id,
            requested: quantity,
            available: units.len() as i64,
        });
    }

    let ids: Vec<_> = units.iter().map(|u| u.id).collect();
    tx.set_unit_status(&ids, StockStatus::Reserved, None).await?;
    tx.insert_reservations(order_id, &ids).await?;

    debug!(order_id, product_id, quantity, "Units reserved");
    Ok(units
        .into_iter()
        .map(|u| StockUnit {
            status: StockStatus::Reserved,
            ..u
        })
        .collect())
}

/// Return the order's queued units to READY. Returns the number released;
/// 0 when nothing is queued.
pub async fn release_in(tx: &mut dyn StoreTx, order_id: OrderId) -> Result<u64, EngineError> {
    let units = tx.reserved_units(order_id).await?;
    if units.is_empty() {
        return Ok(0);
    }

    let ids: Vec<_> = units.iter().map(|u| u.id).collect();
    tx.set_unit_status(&ids, StockStatus::Ready, None).await?;
    tx.delete_reservations(order_id).await?;

    debug!(order_id, released = ids.len(), "Units released");
    Ok(ids.len() as u64)
}

/// Mark the order's queued units SOLD and record their codes on the order.
///
/// Returns the codes in ascending unit id order; empty when nothing is queued
/// (already promoted or released), in which case the order is left untouched.
pub async fn promote_in(
    tx: &mut dyn StoreTx,
    order_id: OrderId,
    user_id: Option<UserId>,
) -> Result<Vec<String>, EngineError> {
    let units = tx.reserved_units(order_id).await?;
    if units.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<_> = units.iter().map(|u| u.id).collect();
    let codes: Vec<String> = units.into_iter().map(|u| u.code).collect();

    tx.set_unit_status(&ids, StockStatus::Sold, user_id).await?;
    tx.delete_reservations(order_id).await?;
    tx.set_assigned_codes(order_id, &codes).await?;

    debug!(order_id, sold = ids.len(), "Units promoted");
    Ok(codes)
}

/// Standalone reservation operations, one transaction each
pub struct ReservationManager {
    store: Arc<dyn ResourceStore>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    pub async fn reserve(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<Vec<StockUnit>, EngineError> {
        let mut tx = self.store.begin().await?;
        let units = reserve_in(tx.as_mut(), order_id, product_id, quantity).await?;
        tx.commit().await?;
        Ok(units)
    }

    pub async fn release(&self, order_id: OrderId) -> Result<u64, EngineError> {
        let mut tx = self.store.begin().await?;
        let released = release_in(tx.as_mut(), order_id).await?;
        tx.commit().await?;
        Ok(released)
    }

    pub async fn promote(
        &self,
        order_id: OrderId,
        user_id: Option<UserId>,
    ) -> Result<Vec<String>, EngineError> {
        let mut tx = self.store.begin().await?;
        let codes = promote_in(tx.as_mut(), order_id, user_id).await?;
        tx.commit().await?;
        Ok(codes)
    }
}
