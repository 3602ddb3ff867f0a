/// Purchase flow controller.
use crate::config::{ConfigError, SdkConfig};
use crate::retry::{
    RetryEngine, RetryObserver, RetryPhase, RetrySnapshot, RetryState, RetryTerminal,
};
use crate::ton::{TonAddress, extract_identity, normalize_address};
use crate::types::{
    CreditPack, PaymentAttempt, TransactionIdentity, TransferMessage, TransferRequest,
    VerificationOutcome,
};
use crate::verifier::{ApiError, HttpPaymentVerifier, PaymentVerifier};
use crate::wallet::{WalletBridge, WalletError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("Unknown credit pack: {0}")]
    UnknownPack(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("API client error: {0}")]
    Api(#[from] ApiError),
}

/// Screen the UI should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Default,
    Loading,
    Verifying,
    Success,
    Error,
}

/// Why a purchase ended on the error screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseFailure {
    MissingUser,
    WalletNotConnected,
    Wallet(WalletError),
    MalformedReceipt(String),
    RateLimited,
    /// Rejected by the backend; the reason is shown as is.
    Rejected(String),
    /// Automatic verification ran out of attempts.
    Exhausted {
        attempts: u32,
        transaction_id: TransactionIdentity,
    },
}

impl PurchaseFailure {
    pub fn message(&self) -> String {
        match self {
            Self::MissingUser => {
                "Unable to identify user. Please restart the app from Telegram.".to_string()
            }
            Self::WalletNotConnected => "Connect a wallet to purchase credits.".to_string(),
            Self::Wallet(e) => e.to_string(),
            Self::MalformedReceipt(reason) => {
                format!("Could not read the transaction returned by the wallet: {reason}")
            }
            Self::RateLimited => VerificationOutcome::RateLimited.message(),
            Self::Rejected(reason) => reason.clone(),
            Self::Exhausted {
                attempts,
                transaction_id,
            } => format!(
                "Payment verification timed out after {attempts} attempts. \
                 Please contact support with transaction ID {transaction_id}."
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Default,
    Loading {
        pack: CreditPack,
    },
    Verifying {
        pack: CreditPack,
        attempt: PaymentAttempt,
        phase: RetryPhase,
        retry: RetryState,
    },
    Success {
        pack: CreditPack,
        transaction_id: TransactionIdentity,
        credits_granted: u64,
        new_balance: Option<u64>,
        /// The backend had already credited this payment.
        already_processed: bool,
    },
    Error {
        pack: Option<CreditPack>,
        transaction_id: Option<TransactionIdentity>,
        failure: PurchaseFailure,
    },
}

impl FlowState {
    pub fn page(&self) -> PageState {
        match self {
            Self::Default => PageState::Default,
            Self::Loading { .. } => PageState::Loading,
            Self::Verifying { .. } => PageState::Verifying,
            Self::Success { .. } => PageState::Success,
            Self::Error { .. } => PageState::Error,
        }
    }

    pub fn transaction_id(&self) -> Option<&TransactionIdentity> {
        match self {
            Self::Verifying { attempt, .. } => Some(&attempt.transaction_identity),
            Self::Success { transaction_id, .. } => Some(transaction_id),
            Self::Error { transaction_id, .. } => transaction_id.as_ref(),
            Self::Default | Self::Loading { .. } => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Default => "Select a pack above to add credits".to_string(),
            Self::Loading { .. } => "Confirm the transfer in your wallet.".to_string(),
            Self::Verifying { retry, phase, .. } => match phase {
                RetryPhase::Retrying(attempt) if retry.remaining_seconds == 0 => {
                    format!("Checking payment (attempt {attempt})...")
                }
                _ => format!(
                    "Waiting for blockchain confirmation. Next check in {}s.",
                    retry.remaining_seconds
                ),
            },
            Self::Success {
                credits_granted,
                already_processed: false,
                ..
            } => format!("{credits_granted} credits have been added to your account."),
            Self::Success {
                credits_granted, ..
            } => format!(
                "This payment was already processed. {credits_granted} credits are on your account."
            ),
            Self::Error { failure, .. } => failure.message(),
        }
    }
}

/// Everything the purchase screen renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseView {
    pub state: FlowState,
    /// Result of a manual retry that did not end verification.
    pub notice: Option<String>,
}

impl PurchaseView {
    pub fn page(&self) -> PageState {
        self.state.page()
    }
}

struct FlowShared {
    flow_id: Uuid,
    state: FlowState,
    notice: Option<String>,
    updates: watch::Sender<PurchaseView>,
}

impl FlowShared {
    fn publish(&self) {
        self.updates.send_replace(PurchaseView {
            state: self.state.clone(),
            notice: self.notice.clone(),
        });
    }
}

fn lock(shared: &Mutex<FlowShared>) -> MutexGuard<'_, FlowShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies engine transitions to the flow that started the engine, and only
/// while that flow is still verifying.
struct FlowObserver {
    shared: Arc<Mutex<FlowShared>>,
    flow_id: Uuid,
}

impl RetryObserver for FlowObserver {
    fn on_progress(&self, new_phase: &RetryPhase, new_retry: &RetryState) {
        let mut shared = lock(&self.shared);
        if shared.flow_id != self.flow_id {
            return;
        }
        if let FlowState::Verifying { phase, retry, .. } = &mut shared.state {
            *phase = new_phase.clone();
            *retry = new_retry.clone();
            shared.publish();
        }
    }

    fn on_terminal(&self, terminal: &RetryTerminal) {
        let mut shared = lock(&self.shared);
        if shared.flow_id != self.flow_id {
            return;
        }
        let FlowState::Verifying { pack, attempt, .. } = &shared.state else {
            return;
        };
        let pack = pack.clone();
        let transaction_id = attempt.transaction_identity.clone();
        shared.state = match terminal {
            RetryTerminal::Confirmed {
                credits_granted,
                new_balance,
                already_processed,
            } => FlowState::Success {
                credits_granted: credits_granted.unwrap_or(pack.credits),
                already_processed: *already_processed,
                new_balance: *new_balance,
                transaction_id,
                pack,
            },
            RetryTerminal::Exhausted { attempts } => FlowState::Error {
                pack: Some(pack),
                failure: PurchaseFailure::Exhausted {
                    attempts: *attempts,
                    transaction_id: transaction_id.clone(),
                },
                transaction_id: Some(transaction_id),
            },
            RetryTerminal::Fatal { reason } => FlowState::Error {
                pack: Some(pack),
                transaction_id: Some(transaction_id),
                failure: PurchaseFailure::Rejected(reason.clone()),
            },
        };
        shared.notice = None;
        shared.publish();
    }
}

/// Drives one credit purchase at a time from pack selection to a final screen.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use ton_credits_sdk::config::ConfigBuilder;
/// use ton_credits_sdk::core::PurchaseFlow;
/// use ton_credits_sdk::wallet::WalletBridge;
///
/// # async fn example(wallet: Arc<dyn WalletBridge>) -> Result<(), Box<dyn std::error::Error>> {
/// let config = ConfigBuilder::new()
///     .with_base_url("https://credits.example.com")
///     .with_merchant_address("EQD2NmD_lH5f5u1Kj3KfGyTvhZSX0Eg6qp2a5IQUKXxOG21n")
///     .build()?;
/// let mut flow = PurchaseFlow::from_config(config, Some("123456".to_string()), wallet)?;
/// let mut updates = flow.subscribe();
///
/// flow.purchase("5").await?;
/// while updates.changed().await.is_ok() {
///     let view = updates.borrow().clone();
///     println!("{:?}: {}", view.page(), view.state.message());
/// }
/// # Ok(())
/// # }
/// ```
pub struct PurchaseFlow {
    config: SdkConfig,
    merchant: TonAddress,
    chat_id: Option<String>,
    verifier: Arc<dyn PaymentVerifier>,
    wallet: Arc<dyn WalletBridge>,
    shared: Arc<Mutex<FlowShared>>,
    engine: Option<RetryEngine>,
}

impl PurchaseFlow {
    pub fn new(
        config: SdkConfig,
        chat_id: Option<String>,
        verifier: Arc<dyn PaymentVerifier>,
        wallet: Arc<dyn WalletBridge>,
    ) -> Result<Self, PurchaseError> {
        config.validate()?;
        let merchant = TonAddress::parse(&config.payment.merchant_address).map_err(|e| {
            ConfigError::InvalidConfig(format!("payment.merchant_address: {e}"))
        })?;
        let initial = PurchaseView {
            state: FlowState::Default,
            notice: None,
        };
        let (updates, _) = watch::channel(initial);
        Ok(Self {
            config,
            merchant,
            chat_id,
            verifier,
            wallet,
            shared: Arc::new(Mutex::new(FlowShared {
                flow_id: Uuid::new_v4(),
                state: FlowState::Default,
                notice: None,
                updates,
            })),
            engine: None,
        })
    }

    /// Builds the flow with the HTTP verifier for `config.api`.
    pub fn from_config(
        config: SdkConfig,
        chat_id: Option<String>,
        wallet: Arc<dyn WalletBridge>,
    ) -> Result<Self, PurchaseError> {
        let verifier = HttpPaymentVerifier::new(&config.api)?;
        Self::new(config, chat_id, Arc::new(verifier), wallet)
    }

    pub fn packs(&self) -> &[CreditPack] {
        &self.config.catalog
    }

    pub fn view(&self) -> PurchaseView {
        let shared = lock(&self.shared);
        PurchaseView {
            state: shared.state.clone(),
            notice: shared.notice.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PurchaseView> {
        lock(&self.shared).updates.subscribe()
    }

    /// Buys `pack_id`: asks the wallet to send the payment, then confirms it
    /// with the backend. Returns the view after the immediate confirmation;
    /// a pending payment continues in the background on the verifying screen.
    ///
    /// Any previous purchase and its timers are discarded first.
    pub async fn purchase(&mut self, pack_id: &str) -> Result<PurchaseView, PurchaseError> {
        let pack = self
            .config
            .find_pack(pack_id)
            .cloned()
            .ok_or_else(|| PurchaseError::UnknownPack(pack_id.to_string()))?;
        let flow_id = self.begin(FlowState::Loading { pack: pack.clone() });
        info!(%flow_id, pack = %pack.id, credits = pack.credits, "purchase started");

        let Some(chat_id) = self.chat_id.clone().filter(|id| !id.is_empty()) else {
            return Ok(self.fail(flow_id, pack, PurchaseFailure::MissingUser));
        };
        let Some(account) = self.wallet.connected_account() else {
            return Ok(self.fail(flow_id, pack, PurchaseFailure::WalletNotConnected));
        };

        let request = self.transfer_request(&pack);
        let receipt = match self.wallet.send_transaction(request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(%flow_id, error = %e, "wallet did not send the transaction");
                return Ok(self.fail(flow_id, pack, PurchaseFailure::Wallet(e)));
            }
        };
        let identity = match extract_identity(&receipt) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(%flow_id, error = %e, "unusable wallet receipt");
                let failure = PurchaseFailure::MalformedReceipt(e.0.to_string());
                return Ok(self.fail(flow_id, pack, failure));
            }
        };

        let attempt = PaymentAttempt {
            transaction_identity: identity,
            chat_id,
            fiat_amount: pack.price,
            credit_amount: pack.credits,
            amount_ton: pack.amount_ton(),
            sender_address: normalize_address(&account),
        };
        info!(%flow_id, tx_hash = %attempt.transaction_identity, "transaction sent, verifying");

        let outcome = self.verifier.verify(&attempt).await;
        let transaction_id = attempt.transaction_identity.clone();
        let next = match outcome {
            VerificationOutcome::Confirmed {
                credits_granted,
                new_balance,
            } => FlowState::Success {
                credits_granted: credits_granted.unwrap_or(pack.credits),
                pack,
                transaction_id,
                new_balance,
                already_processed: false,
            },
            VerificationOutcome::AlreadyProcessed => FlowState::Success {
                credits_granted: pack.credits,
                pack,
                transaction_id,
                new_balance: None,
                already_processed: true,
            },
            VerificationOutcome::Pending { .. } | VerificationOutcome::NetworkError { .. } => {
                self.start_verifying(flow_id, pack, attempt);
                return Ok(self.view());
            }
            VerificationOutcome::RateLimited => FlowState::Error {
                pack: Some(pack),
                transaction_id: Some(transaction_id),
                failure: PurchaseFailure::RateLimited,
            },
            VerificationOutcome::Fatal { reason } => FlowState::Error {
                pack: Some(pack),
                transaction_id: Some(transaction_id),
                failure: PurchaseFailure::Rejected(reason),
            },
        };
        self.transition(flow_id, next);
        Ok(self.view())
    }

    /// Re-checks a verifying payment right away, without moving the
    /// automatic schedule. Returns `None` when nothing is being verified.
    pub async fn retry_now(&self) -> Option<VerificationOutcome> {
        let engine = self.engine.as_ref()?;
        let flow_id = {
            let shared = lock(&self.shared);
            if shared.state.page() != PageState::Verifying {
                return None;
            }
            shared.flow_id
        };
        let outcome = engine.manual_retry().await?;
        if !outcome.is_success() {
            let mut shared = lock(&self.shared);
            if shared.flow_id == flow_id && shared.state.page() == PageState::Verifying {
                shared.notice = Some(outcome.message());
                shared.publish();
            }
        }
        Some(outcome)
    }

    /// Back to pack selection. Stops any verification first.
    pub fn reset(&mut self) {
        self.begin(FlowState::Default);
    }

    /// Stops any verification, then disconnects the wallet.
    pub async fn disconnect(&mut self) -> Result<(), WalletError> {
        self.reset();
        info!("disconnecting wallet");
        self.wallet.disconnect().await
    }

    /// Snapshot of the engine driving the current verification, if any.
    pub fn retry_snapshot(&self) -> Option<RetrySnapshot> {
        self.engine.as_ref().map(RetryEngine::snapshot)
    }

    fn cancel_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.cancel();
        }
    }

    /// Cancels the engine and opens a new flow scope in `state`.
    fn begin(&mut self, state: FlowState) -> Uuid {
        self.cancel_engine();
        let flow_id = Uuid::new_v4();
        let mut shared = lock(&self.shared);
        shared.flow_id = flow_id;
        shared.state = state;
        shared.notice = None;
        shared.publish();
        flow_id
    }

    fn transition(&self, flow_id: Uuid, state: FlowState) {
        let mut shared = lock(&self.shared);
        if shared.flow_id != flow_id {
            return;
        }
        info!(%flow_id, page = ?state.page(), "purchase state changed");
        shared.state = state;
        shared.publish();
    }

    /// Error raised before the wallet produced a transaction identity.
    fn fail(
        &self,
        flow_id: Uuid,
        pack: CreditPack,
        failure: PurchaseFailure,
    ) -> PurchaseView {
        self.transition(
            flow_id,
            FlowState::Error {
                pack: Some(pack),
                transaction_id: None,
                failure,
            },
        );
        self.view()
    }

    fn start_verifying(&mut self, flow_id: Uuid, pack: CreditPack, attempt: PaymentAttempt) {
        let identity = attempt.transaction_identity.clone();
        let chat_id = attempt.chat_id.clone();
        self.transition(
            flow_id,
            FlowState::Verifying {
                pack,
                attempt,
                phase: RetryPhase::AwaitingConfirmationWindow,
                retry: RetryState::default(),
            },
        );
        let observer = Arc::new(FlowObserver {
            shared: Arc::clone(&self.shared),
            flow_id,
        });
        let mut engine = RetryEngine::new(
            self.config.retry.clone(),
            Arc::clone(&self.verifier),
            observer,
        );
        engine.start(identity, chat_id);
        self.engine = Some(engine);
    }

    fn transfer_request(&self, pack: &CreditPack) -> TransferRequest {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        TransferRequest {
            valid_until: now + self.config.payment.validity_secs,
            messages: vec![TransferMessage {
                address: self
                    .merchant
                    .to_friendly(true, self.config.payment.testnet),
                amount: pack.amount_nano.to_string(),
            }],
        }
    }
}
