//! Payment Gateway Adapter: the contract the engine requires from a payment
//! provider, plus local signature verification.
//!
//! Confirmation proofs are verified with an HMAC-SHA256 over the intent and
//! payment ids using a shared secret known only to the engine; verification
//! is always computed locally, never delegated to the provider.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// A provider-side payment intent for a quoted amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Authoritative payment status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    Created,
    Authorized,
    Captured,
    Failed,
    Refunded,
}

impl GatewayPaymentStatus {
    /// Whether money has actually been secured for this payment.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Authorized | Self::Captured)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub payment_id: String,
    pub intent_id: String,
    pub status: GatewayPaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
}

/// Contract the checkout engine requires from a payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a payment intent for the quoted total.
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        receipt: &str,
    ) -> Result<PaymentIntent, ServiceError>;

    /// Fetches the authoritative status of a payment.
    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError>;

    /// Initiates a refund for a captured payment.
    async fn create_refund(
        &self,
        payment_id: &str,
        amount: Decimal,
    ) -> Result<GatewayRefund, ServiceError>;
}

/// Computes the confirmation signature for an (intent, payment) pair.
pub fn sign_confirmation(secret: &str, intent_id: &str, payment_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{}|{}", intent_id, payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a confirmation signature in constant time.
pub fn verify_confirmation(
    secret: &str,
    intent_id: &str,
    payment_id: &str,
    signature: &str,
) -> bool {
    let expected = sign_confirmation(secret, intent_id, payment_id);
    constant_time_eq(&expected, signature)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

fn random_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("{}_{}", prefix, suffix)
}

/// In-memory gateway used for local development and tests. Intents settle
/// when the test (or demo driver) calls [`SandboxGateway::settle_intent`],
/// which also produces the confirmation signature a real provider's client
/// callback would carry.
pub struct SandboxGateway {
    secret: String,
    intents: Mutex<HashMap<String, PaymentIntent>>,
    payments: Mutex<HashMap<String, GatewayPayment>>,
    available: AtomicBool,
}

impl SandboxGateway {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            intents: Mutex::new(HashMap::new()),
            payments: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates a provider outage; subsequent calls fail with a gateway
    /// error until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), ServiceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::GatewayError(
                "payment provider unreachable".to_string(),
            ))
        }
    }

    /// Marks an intent as captured and returns the (payment id, signature)
    /// pair the customer's client would post back.
    pub fn settle_intent(&self, intent_id: &str) -> Result<(String, String), ServiceError> {
        let intents = self.intents.lock().expect("sandbox intents lock poisoned");
        if !intents.contains_key(intent_id) {
            return Err(ServiceError::NotFound(format!(
                "Intent {} not found",
                intent_id
            )));
        }
        drop(intents);

        let payment_id = random_id("pay");
        let payment = GatewayPayment {
            payment_id: payment_id.clone(),
            intent_id: intent_id.to_string(),
            status: GatewayPaymentStatus::Captured,
        };
        self.payments
            .lock()
            .expect("sandbox payments lock poisoned")
            .insert(payment_id.clone(), payment);

        let signature = sign_confirmation(&self.secret, intent_id, &payment_id);
        Ok((payment_id, signature))
    }

    /// Marks an intent's payment attempt as failed.
    pub fn fail_intent(&self, intent_id: &str) -> (String, String) {
        let payment_id = random_id("pay");
        let payment = GatewayPayment {
            payment_id: payment_id.clone(),
            intent_id: intent_id.to_string(),
            status: GatewayPaymentStatus::Failed,
        };
        self.payments
            .lock()
            .expect("sandbox payments lock poisoned")
            .insert(payment_id.clone(), payment);
        let signature = sign_confirmation(&self.secret, intent_id, &payment_id);
        (payment_id, signature)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        receipt: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        self.ensure_available()?;
        let intent = PaymentIntent {
            intent_id: random_id("pi"),
            amount,
            currency: currency.to_string(),
        };
        self.intents
            .lock()
            .expect("sandbox intents lock poisoned")
            .insert(intent.intent_id.clone(), intent.clone());
        info!(intent_id = %intent.intent_id, %amount, receipt, "sandbox intent created");
        Ok(intent)
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<GatewayPayment, ServiceError> {
        self.ensure_available()?;
        self.payments
            .lock()
            .expect("sandbox payments lock poisoned")
            .get(payment_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    async fn create_refund(
        &self,
        payment_id: &str,
        _amount: Decimal,
    ) -> Result<GatewayRefund, ServiceError> {
        self.ensure_available()?;
        let mut payments = self.payments.lock().expect("sandbox payments lock poisoned");
        let payment = payments.get_mut(payment_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Payment {} not found", payment_id))
        })?;
        payment.status = GatewayPaymentStatus::Refunded;
        Ok(GatewayRefund {
            refund_id: random_id("rf"),
        })
    }
}
