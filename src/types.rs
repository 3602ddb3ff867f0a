/// Type definitions for global use.
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NANOTONS_PER_TON: u64 = 1_000_000_000;

/// Catalog entry. Packs are defined up front and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditPack {
    pub id: String,
    /// Fiat price in whole currency units.
    pub price: u32,
    pub credits: u64,
    /// Chain-native amount in nanotons.
    pub amount_nano: u64,
}

impl CreditPack {
    pub fn new(id: &str, price: u32, credits: u64, amount_nano: u64) -> Self {
        Self {
            id: id.to_string(),
            price,
            credits,
            amount_nano,
        }
    }

    /// Decimal TON amount as the backend expects it in `amount_ton`.
    pub fn amount_ton(&self) -> String {
        format_ton(self.amount_nano)
    }
}

pub fn default_catalog() -> Vec<CreditPack> {
    vec![
        CreditPack::new("1", 1, 100, NANOTONS_PER_TON),
        CreditPack::new("5", 5, 200, 5 * NANOTONS_PER_TON),
        CreditPack::new("10", 10, 500, 10 * NANOTONS_PER_TON),
        CreditPack::new("20", 20, 1500, 20 * NANOTONS_PER_TON),
    ]
}

/// Formats nanotons as a decimal TON string without trailing zeros.
pub fn format_ton(nanotons: u64) -> String {
    let whole = nanotons / NANOTONS_PER_TON;
    let fraction = nanotons % NANOTONS_PER_TON;
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{fraction:09}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Wallet output for a sent transaction: the signed message as base64 bag of cells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub boc: String,
}

/// Lowercase hex hash that identifies a sent transaction to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionIdentity(String);

impl TransactionIdentity {
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hex::encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The one payment in flight for a purchase flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAttempt {
    pub transaction_identity: TransactionIdentity,
    pub chat_id: String,
    pub fiat_amount: u32,
    pub credit_amount: u64,
    pub amount_ton: String,
    pub sender_address: String,
}

/// Classified result of one verification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Confirmed {
        /// `None` when the backend confirmed without reporting an amount.
        credits_granted: Option<u64>,
        new_balance: Option<u64>,
    },
    /// Accepted but not yet visible to the chain indexer.
    Pending { message: String },
    AlreadyProcessed,
    RateLimited,
    Fatal { reason: String },
    /// No response reached us.
    NetworkError { message: String },
}

impl VerificationOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Pending { .. } | Self::NetworkError { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::AlreadyProcessed)
    }

    pub fn message(&self) -> String {
        match self {
            Self::Confirmed {
                credits_granted: Some(credits),
                ..
            } => format!("{credits} credits have been added to your account."),
            Self::Confirmed { .. } => "Payment confirmed.".to_string(),
            Self::Pending { message } | Self::NetworkError { message } => message.clone(),
            Self::AlreadyProcessed => "This transaction has already been processed".to_string(),
            Self::RateLimited => "Too many requests. Please wait a moment.".to_string(),
            Self::Fatal { reason } => reason.clone(),
        }
    }
}

/// Body of `POST /api/payments`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub telegram_chat_id: String,
    pub tx_hash: String,
    pub amount_ton: String,
    pub sender_address: String,
}

impl From<&PaymentAttempt> for PaymentConfirmation {
    fn from(attempt: &PaymentAttempt) -> Self {
        Self {
            telegram_chat_id: attempt.chat_id.clone(),
            tx_hash: attempt.transaction_identity.to_string(),
            amount_ton: attempt.amount_ton.clone(),
            sender_address: attempt.sender_address.clone(),
        }
    }
}

/// Body of `POST /api/payments/retry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPaymentRequest {
    pub telegram_chat_id: String,
    pub tx_hash: String,
}

/// Response shape shared by both verification endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub credits_granted: Option<u64>,
    #[serde(default)]
    pub new_balance: Option<u64>,
    #[serde(default)]
    pub already_completed: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentHistoryItem {
    pub tx_hash: String,
    #[serde(default)]
    pub verified_tx_hash: Option<String>,
    pub amount_ton: String,
    pub credits_granted: u64,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentHistory {
    #[serde(default)]
    pub payments: Vec<PaymentHistoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentStatus {
    pub status: String,
    pub credits_granted: u64,
    pub amount_ton: String,
    pub created_at: String,
}

/// Transfer the wallet is asked to sign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Unix timestamp after which the wallet must refuse to send.
    pub valid_until: u64,
    pub messages: Vec<TransferMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferMessage {
    pub address: String,
    /// Nanotons as a decimal string.
    pub amount: String,
}
