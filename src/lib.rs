pub mod config;
pub mod core;
pub mod retry;
pub mod ton;
pub mod types;
pub mod verifier;
pub mod wallet;

pub use config::{ConfigBuilder, ConfigError, ConfigManager, SdkConfig};
pub use self::core::{FlowState, PageState, PurchaseError, PurchaseFlow, PurchaseView};
pub use retry::{RetryEngine, RetryPolicy};
pub use types::{CreditPack, TransactionIdentity, VerificationOutcome};
pub use verifier::{HttpPaymentVerifier, PaymentVerifier};
pub use wallet::{WalletBridge, WalletError};
