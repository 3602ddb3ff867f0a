use crate::types::{TransactionReceipt, TransferRequest};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("Transaction was cancelled in the wallet")]
    Rejected,
    #[error("Wallet did not respond in time")]
    Timeout,
    #[error("Wallet is not connected")]
    NotConnected,
    #[error("Wallet error: {0}")]
    Bridge(String),
}

/// Connection to the user's wallet. Signing happens entirely on the wallet
/// side; the purchase flow only sees the signed message or the failure.
#[async_trait]
pub trait WalletBridge: Send + Sync {
    async fn send_transaction(
        &self,
        request: TransferRequest,
    ) -> Result<TransactionReceipt, WalletError>;

    /// Address of the connected account, in whatever format the wallet reports.
    fn connected_account(&self) -> Option<String>;

    async fn disconnect(&self) -> Result<(), WalletError>;
}
