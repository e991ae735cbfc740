//! Atomic admission control.
//!
//! One script evaluation decides a purchase attempt: sale window, duplicate
//! buyer, stock, then the decrement, the buyer record and (in stream mode)
//! the queue append. Nothing else touches the stock counter or the buyer set.

use std::sync::Arc;

use dianping_core::{
    DianpingResult, OrderId, Rejection, StoreError, Timestamp, UserId, VoucherId,
};
use dianping_storage::{
    AdmissionArgs, CoordinationStore, Script, ADMISSION_DUPLICATE, ADMISSION_ENDED,
    ADMISSION_GRANTED, ADMISSION_NOT_STARTED, ADMISSION_OUT_OF_STOCK,
};

use crate::constants::{begin_key, buyers_key, end_key, stock_key};

/// Outcome of one admission script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Granted,
    Rejected(Rejection),
}

impl AdmissionDecision {
    /// Map a script return code.
    pub fn from_code(code: i64) -> Result<Self, StoreError> {
        match code {
            ADMISSION_GRANTED => Ok(AdmissionDecision::Granted),
            ADMISSION_OUT_OF_STOCK => Ok(AdmissionDecision::Rejected(Rejection::OutOfStock)),
            ADMISSION_DUPLICATE => Ok(AdmissionDecision::Rejected(Rejection::DuplicateOrder)),
            ADMISSION_NOT_STARTED => Ok(AdmissionDecision::Rejected(Rejection::SaleNotStarted)),
            ADMISSION_ENDED => Ok(AdmissionDecision::Rejected(Rejection::SaleEnded)),
            other => Err(StoreError::Script {
                script: "seckill".to_string(),
                reason: format!("unexpected return code {other}"),
            }),
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, AdmissionDecision::Granted)
    }

    /// `Ok(())` when granted, the typed rejection otherwise.
    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            AdmissionDecision::Granted => Ok(()),
            AdmissionDecision::Rejected(rejection) => Err(rejection),
        }
    }
}

/// Evaluates the admission script against the coordination store.
pub struct AdmissionCheck<S: CoordinationStore> {
    store: Arc<S>,
}

impl<S: CoordinationStore> AdmissionCheck<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Decide whether `user` may buy `voucher`. On a grant the stock counter
    /// and buyer set are already updated, and when `stream` is set the order
    /// is already queued.
    pub async fn evaluate(
        &self,
        voucher: VoucherId,
        user: UserId,
        order: OrderId,
        now: Timestamp,
        stream: Option<&str>,
    ) -> DianpingResult<AdmissionDecision> {
        let script = Script::SeckillAdmission(AdmissionArgs {
            stock_key: stock_key(voucher),
            buyers_key: buyers_key(voucher),
            begin_key: begin_key(voucher),
            end_key: end_key(voucher),
            stream_key: stream.map(str::to_string),
            voucher_id: voucher,
            user_id: user,
            order_id: order,
            now_epoch_secs: now.timestamp(),
        });
        let code = self.store.eval(&script).await?;
        Ok(AdmissionDecision::from_code(code)?)
    }

    /// Undo a grant whose order will not be persisted: drop `user` from the
    /// buyer set and return the unit to stock. Returns `false` when the user
    /// held no grant, in which case nothing changes.
    pub async fn revert(&self, voucher: VoucherId, user: UserId) -> DianpingResult<bool> {
        let script = Script::SeckillRevert {
            stock_key: stock_key(voucher),
            buyers_key: buyers_key(voucher),
            user_id: user,
        };
        Ok(self.store.eval(&script).await? == 1)
    }
}

impl<S: CoordinationStore> std::fmt::Debug for AdmissionCheck<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionCheck").finish_non_exhaustive()
    }
}
