//! Payment collaborator trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, PaymentMethodRef};

use crate::error::OrderError;

/// Result of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Reference assigned by the payment provider.
    pub reference: String,
}

/// External payment capture.
///
/// A declined or failed capture is reported as `OrderError::Payment`.
#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    async fn capture(
        &self,
        amount: Money,
        payment_method: &PaymentMethodRef,
    ) -> Result<PaymentReceipt, OrderError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    captures: HashMap<String, (Money, PaymentMethodRef)>,
    next_id: u32,
}

/// In-memory payment collaborator for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentCollaborator {
    state: Arc<Mutex<InMemoryPaymentState>>,
    fail_on_capture: Arc<AtomicBool>,
    delay: Option<Duration>,
}

impl InMemoryPaymentCollaborator {
    /// Creates a new in-memory payment collaborator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every capture, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Configures the collaborator to decline captures.
    pub fn set_fail_on_capture(&self, fail: bool) {
        self.fail_on_capture.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of captured payments.
    pub fn capture_count(&self) -> usize {
        self.state().captures.len()
    }

    /// Returns the captured amount for a provider reference.
    pub fn captured_amount(&self, reference: &str) -> Option<Money> {
        self.state().captures.get(reference).map(|(amount, _)| *amount)
    }

    fn state(&self) -> MutexGuard<'_, InMemoryPaymentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentCollaborator for InMemoryPaymentCollaborator {
    async fn capture(
        &self,
        amount: Money,
        payment_method: &PaymentMethodRef,
    ) -> Result<PaymentReceipt, OrderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_on_capture.load(Ordering::SeqCst) {
            return Err(OrderError::Payment("Payment declined".to_string()));
        }

        let mut state = self.state();
        state.next_id += 1;
        let reference = format!("PAY-{:04}", state.next_id);
        state
            .captures
            .insert(reference.clone(), (amount, payment_method.clone()));

        Ok(PaymentReceipt { reference })
    }
}
