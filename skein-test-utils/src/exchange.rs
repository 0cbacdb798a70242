//! Recording implementation of the exchange trading surface.

use async_trait::async_trait;
use parking_lot::Mutex;

use skein_broker::{
    AlgoSubmission, ExchangeClient, ExchangeError, ExchangeResult, OrderSubmission,
};

/// [`ExchangeClient`] double that records every call and answers from a
/// configurable script.
#[derive(Default)]
pub struct RecordingExchangeClient {
    pub submitted_orders: Mutex<Vec<OrderSubmission>>,
    pub canceled_orders: Mutex<Vec<String>>,
    pub placed_algos: Mutex<Vec<AlgoSubmission>>,
    pub canceled_algos: Mutex<Vec<String>>,
    pub leverage_calls: Mutex<Vec<(String, u32)>>,
    /// When true, `cancel_algo` answers with a rejection after recording.
    pub fail_algo_cancels: bool,
    next_oid: Mutex<u64>,
}

impl RecordingExchangeClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_algo_cancels() -> Self {
        Self {
            fail_algo_cancels: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn canceled_algo_ids(&self) -> Vec<String> {
        self.canceled_algos.lock().clone()
    }
}

#[async_trait]
impl ExchangeClient for RecordingExchangeClient {
    async fn submit_order(&self, request: OrderSubmission) -> ExchangeResult<String> {
        let mut next = self.next_oid.lock();
        *next += 1;
        let oid = format!("mock-oid-{next}");
        drop(next);
        self.submitted_orders.lock().push(request);
        Ok(oid)
    }

    async fn cancel_order(&self, _symbol: &str, oid: &str) -> ExchangeResult<()> {
        self.canceled_orders.lock().push(oid.to_string());
        Ok(())
    }

    async fn place_algo(&self, request: AlgoSubmission) -> ExchangeResult<String> {
        let cloid = request.cloid.clone();
        self.placed_algos.lock().push(request);
        Ok(cloid)
    }

    async fn cancel_algo(&self, _symbol: &str, algo_cloid: &str) -> ExchangeResult<()> {
        self.canceled_algos.lock().push(algo_cloid.to_string());
        if self.fail_algo_cancels {
            Err(ExchangeError::Rejection("scripted failure".into()))
        } else {
            Ok(())
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.leverage_calls.lock().push((symbol.into(), leverage));
        Ok(())
    }
}
