/// Payment confirmation against the credits backend over HTTP.
use crate::config::ApiConfig;
use crate::types::{
    PaymentAttempt, PaymentConfirmation, PaymentHistory, PaymentResponse, PaymentStatus,
    RetryPaymentRequest, TransactionIdentity, VerificationOutcome,
};
use crate::verifier::{ApiError, PaymentVerifier};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const PAYMENTS_PATH: &str = "api/payments";
const RETRY_PATH: &str = "api/payments/retry";
const HISTORY_PATH: &str = "api/payments/history";
const STATUS_PATH: &str = "api/payments/status";

/// Which verification endpoint produced a response. The two differ only in
/// their fallback messages and in how 404 is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Confirm,
    Retry,
}

impl Endpoint {
    fn operation(self) -> &'static str {
        match self {
            Self::Confirm => "confirm_payment",
            Self::Retry => "retry_payment",
        }
    }

    fn pending_message(self) -> &'static str {
        match self {
            Self::Confirm => "Transaction pending blockchain confirmation",
            Self::Retry => "Transaction still pending",
        }
    }

    fn network_message(self) -> &'static str {
        match self {
            Self::Confirm => "Network error. Please check your connection.",
            Self::Retry => "Network error during retry",
        }
    }

    fn failure_message(self, status: StatusCode) -> String {
        match self {
            Self::Confirm => format!("Payment failed: {}", status.as_u16()),
            Self::Retry => "Retry failed".to_string(),
        }
    }
}

/// [`PaymentVerifier`] backed by the credits REST API.
///
/// # Examples
///
/// ```no_run
/// use ton_credits_sdk::config::ApiConfig;
/// use ton_credits_sdk::verifier::{HttpPaymentVerifier, PaymentVerifier};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let verifier = HttpPaymentVerifier::new(&ApiConfig {
///     base_url: "https://credits.example.com".to_string(),
///     timeout_ms: 10_000,
/// })?;
/// let history = verifier.history("123456").await?;
/// println!("{} payments", history.payments.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpPaymentVerifier {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpPaymentVerifier {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let base_url = parse_base_url(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { base_url, client })
    }

    /// Past payments for a chat, newest first as the backend orders them.
    pub async fn history(&self, chat_id: &str) -> Result<PaymentHistory, ApiError> {
        let mut url = self.endpoint(HISTORY_PATH)?;
        url.query_pairs_mut().append_pair("telegram_chat_id", chat_id);
        let response = self.get("payment_history", url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_status_error(
                response,
                format!("Failed to fetch payment history: {}", status.as_u16()),
            )
            .await);
        }
        decode("payment_history", response).await
    }

    /// Status of a single payment, `None` when the backend has no record of it.
    pub async fn status(
        &self,
        chat_id: &str,
        tx_hash: &str,
    ) -> Result<Option<PaymentStatus>, ApiError> {
        let mut url = self.endpoint(STATUS_PATH)?;
        url.query_pairs_mut()
            .append_pair("telegram_chat_id", chat_id)
            .append_pair("tx_hash", tx_hash);
        let response = self.get("payment_status", url).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(http_status_error(
                response,
                format!("Failed to get payment status: {}", status.as_u16()),
            )
            .await);
        }
        decode("payment_status", response).await.map(Some)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Config(format!("invalid endpoint {path}: {e}")))
    }

    async fn get(&self, op: &'static str, url: Url) -> Result<reqwest::Response, ApiError> {
        info!(operation = op, url = %url, "sending request");
        self.client.get(url).send().await.map_err(|e| {
            warn!(operation = op, error = %e, "request error");
            ApiError::Network(e.to_string())
        })
    }

    async fn post_verification<B>(
        &self,
        endpoint: Endpoint,
        path: &str,
        body: &B,
    ) -> VerificationOutcome
    where
        B: serde::Serialize + ?Sized,
    {
        let op = endpoint.operation();
        let url = match self.endpoint(path) {
            Ok(url) => url,
            Err(e) => {
                return VerificationOutcome::Fatal {
                    reason: e.to_string(),
                };
            }
        };
        info!(operation = op, url = %url, "sending request");
        let response = match self.client.post(url).json(body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(operation = op, error = %e, "request error");
                return VerificationOutcome::NetworkError {
                    message: endpoint.network_message().to_string(),
                };
            }
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(text) => serde_json::from_str::<PaymentResponse>(&text).ok(),
            Err(e) => {
                debug!(operation = op, error = %e, "response body unreadable");
                None
            }
        };
        let outcome = classify(endpoint, status, body);
        info!(
            operation = op,
            status = status.as_u16(),
            outcome = ?outcome,
            "verification response"
        );
        outcome
    }
}

#[async_trait]
impl PaymentVerifier for HttpPaymentVerifier {
    async fn verify(&self, attempt: &PaymentAttempt) -> VerificationOutcome {
        let body = PaymentConfirmation::from(attempt);
        self.post_verification(Endpoint::Confirm, PAYMENTS_PATH, &body)
            .await
    }

    async fn reverify(
        &self,
        identity: &TransactionIdentity,
        chat_id: &str,
    ) -> VerificationOutcome {
        let body = RetryPaymentRequest {
            telegram_chat_id: chat_id.to_string(),
            tx_hash: identity.to_string(),
        };
        self.post_verification(Endpoint::Retry, RETRY_PATH, &body)
            .await
    }
}

/// Maps a backend response onto the outcome taxonomy. The status code is
/// authoritative; the body only supplies amounts and messages.
fn classify(
    endpoint: Endpoint,
    status: StatusCode,
    body: Option<PaymentResponse>,
) -> VerificationOutcome {
    let body = body.unwrap_or_default();
    match status.as_u16() {
        202 => VerificationOutcome::Pending {
            message: body
                .message
                .unwrap_or_else(|| endpoint.pending_message().to_string()),
        },
        409 => VerificationOutcome::AlreadyProcessed,
        429 => VerificationOutcome::RateLimited,
        404 if endpoint == Endpoint::Retry => VerificationOutcome::Fatal {
            reason: "Payment not found".to_string(),
        },
        _ if status.is_success() => {
            if body.already_completed == Some(true) {
                return VerificationOutcome::AlreadyProcessed;
            }
            if body.success == Some(false) {
                if body.retry == Some(true) {
                    return VerificationOutcome::Pending {
                        message: body
                            .message
                            .unwrap_or_else(|| endpoint.pending_message().to_string()),
                    };
                }
                return VerificationOutcome::Fatal {
                    reason: body
                        .error
                        .or(body.message)
                        .unwrap_or_else(|| endpoint.failure_message(status)),
                };
            }
            VerificationOutcome::Confirmed {
                credits_granted: body.credits_granted,
                new_balance: body.new_balance,
            }
        }
        _ => VerificationOutcome::Fatal {
            reason: body
                .error
                .unwrap_or_else(|| endpoint.failure_message(status)),
        },
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Config("base_url is empty".to_string()));
    }
    // join() replaces the last path segment unless the base ends with a slash
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|e| ApiError::Config(format!("invalid base_url: {e}")))
}

async fn http_status_error(response: reqwest::Response, fallback: String) -> ApiError {
    let status = response.status().as_u16();
    let message = response
        .json::<PaymentResponse>()
        .await
        .ok()
        .and_then(|body| body.error)
        .unwrap_or(fallback);
    warn!(status, message = %message, "non-success status");
    ApiError::HttpStatus { status, message }
}

async fn decode<T: DeserializeOwned>(
    op: &'static str,
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let text = response
        .text()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;
    serde_json::from_str(&text)
        .map_err(|e| ApiError::Decode(e.to_string()))
        .inspect(|_| debug!(operation = op, "response decoded"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verifier(base_url: String) -> HttpPaymentVerifier {
        HttpPaymentVerifier::new(&ApiConfig {
            base_url,
            timeout_ms: 1_000,
        })
        .unwrap()
    }

    fn attempt() -> PaymentAttempt {
        PaymentAttempt {
            transaction_identity: TransactionIdentity::from_hash([0xab; 32]),
            chat_id: "42".to_string(),
            fiat_amount: 5,
            credit_amount: 200,
            amount_ton: "5".to_string(),
            sender_address: "0:".to_string() + &"11".repeat(32),
        }
    }

    async fn respond(server: &MockServer, route: &str, template: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn verify_posts_confirmation_body() {
        let server = MockServer::start().await;
        let attempt = attempt();
        Mock::given(method("POST"))
            .and(path("/api/payments"))
            .and(body_json(json!({
                "telegram_chat_id": "42",
                "tx_hash": "ab".repeat(32),
                "amount_ton": "5",
                "sender_address": attempt.sender_address,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "credits_granted": 200,
                "new_balance": 450
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = verifier(server.uri()).verify(&attempt).await;
        assert_eq!(
            outcome,
            VerificationOutcome::Confirmed {
                credits_granted: Some(200),
                new_balance: Some(450)
            }
        );
    }

    #[tokio::test]
    async fn verify_status_taxonomy() {
        let cases = [
            (
                ResponseTemplate::new(202).set_body_json(json!({"message": "not indexed yet"})),
                VerificationOutcome::Pending {
                    message: "not indexed yet".to_string(),
                },
            ),
            (
                ResponseTemplate::new(409),
                VerificationOutcome::AlreadyProcessed,
            ),
            (ResponseTemplate::new(429), VerificationOutcome::RateLimited),
            (
                ResponseTemplate::new(400).set_body_json(json!({"error": "Sender mismatch"})),
                VerificationOutcome::Fatal {
                    reason: "Sender mismatch".to_string(),
                },
            ),
            (
                ResponseTemplate::new(503).set_body_string("upstream down"),
                VerificationOutcome::Fatal {
                    reason: "Payment failed: 503".to_string(),
                },
            ),
        ];
        for (template, expected) in cases {
            let server = MockServer::start().await;
            respond(&server, "/api/payments", template).await;
            let outcome = verifier(server.uri()).verify(&attempt()).await;
            assert_eq!(outcome, expected);
        }
    }

    #[tokio::test]
    async fn reverify_maps_not_found_and_fallbacks() {
        let server = MockServer::start().await;
        respond(&server, "/api/payments/retry", ResponseTemplate::new(404)).await;
        let identity = TransactionIdentity::from_hash([1; 32]);
        let outcome = verifier(server.uri()).reverify(&identity, "42").await;
        assert_eq!(
            outcome,
            VerificationOutcome::Fatal {
                reason: "Payment not found".to_string()
            }
        );

        let server = MockServer::start().await;
        respond(&server, "/api/payments/retry", ResponseTemplate::new(202)).await;
        let outcome = verifier(server.uri()).reverify(&identity, "42").await;
        assert_eq!(
            outcome,
            VerificationOutcome::Pending {
                message: "Transaction still pending".to_string()
            }
        );

        let server = MockServer::start().await;
        respond(&server, "/api/payments/retry", ResponseTemplate::new(500)).await;
        let outcome = verifier(server.uri()).reverify(&identity, "42").await;
        assert_eq!(
            outcome,
            VerificationOutcome::Fatal {
                reason: "Retry failed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn reverify_after_confirmation_is_success_class() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/payments/retry"))
            .and(body_json(json!({"telegram_chat_id": "42", "tx_hash": "01".repeat(32)})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "credits_granted": 200,
                "new_balance": 200,
                "already_completed": true
            })))
            .expect(2)
            .mount(&server)
            .await;

        let verifier = verifier(server.uri());
        let identity = TransactionIdentity::from_hash([1; 32]);
        for _ in 0..2 {
            let outcome = verifier.reverify(&identity, "42").await;
            assert!(outcome.is_success(), "got {outcome:?}");
        }
    }

    #[tokio::test]
    async fn pending_signalled_inside_success_body() {
        let server = MockServer::start().await;
        respond(
            &server,
            "/api/payments",
            ResponseTemplate::new(200).set_body_json(json!({"success": false, "retry": true})),
        )
        .await;
        let outcome = verifier(server.uri()).verify(&attempt()).await;
        assert!(outcome.is_retryable());
    }

    #[tokio::test]
    async fn success_without_amount_leaves_credits_unknown() {
        let server = MockServer::start().await;
        respond(
            &server,
            "/api/payments",
            ResponseTemplate::new(200).set_body_json(json!({"success": true})),
        )
        .await;
        let outcome = verifier(server.uri()).verify(&attempt()).await;
        assert_eq!(
            outcome,
            VerificationOutcome::Confirmed {
                credits_granted: None,
                new_balance: None
            }
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        // nothing listens on the discard port
        let outcome = verifier("http://127.0.0.1:9".to_string())
            .verify(&attempt())
            .await;
        assert!(matches!(outcome, VerificationOutcome::NetworkError { .. }));
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept() {
        let server = MockServer::start().await;
        respond(&server, "/backend/api/payments", ResponseTemplate::new(409)).await;
        let outcome = verifier(format!("{}/backend", server.uri()))
            .verify(&attempt())
            .await;
        assert_eq!(outcome, VerificationOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn history_decodes_payments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payments/history"))
            .and(query_param("telegram_chat_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payments": [{
                    "tx_hash": "abc",
                    "amount_ton": "5",
                    "credits_granted": 200,
                    "status": "completed",
                    "created_at": "2024-01-01T00:00:00Z"
                }]
            })))
            .mount(&server)
            .await;

        let history = verifier(server.uri()).history("42").await.unwrap();
        assert_eq!(history.payments.len(), 1);
        assert_eq!(history.payments[0].credits_granted, 200);
        assert_eq!(history.payments[0].verified_tx_hash, None);
    }

    #[tokio::test]
    async fn history_error_uses_backend_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payments/history"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "db down"})))
            .mount(&server)
            .await;

        let result = verifier(server.uri()).history("42").await;
        match result {
            Err(ApiError::HttpStatus { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "db down");
            }
            other => panic!("expected HttpStatus error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payments/status"))
            .and(query_param("tx_hash", "abc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let status = verifier(server.uri()).status("42", "abc").await.unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn status_found_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payments/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "credits_granted": 500,
                "amount_ton": "10",
                "created_at": "2024-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let status = verifier(server.uri()).status("42", "abc").await.unwrap();
        assert_eq!(status.map(|s| s.credits_granted), Some(500));
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let result = HttpPaymentVerifier::new(&ApiConfig {
            base_url: " ".to_string(),
            timeout_ms: 1_000,
        });
        assert!(matches!(result, Err(ApiError::Config(_))));
    }
}
