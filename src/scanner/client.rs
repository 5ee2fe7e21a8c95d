use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::admission::AdmissionOrchestrator;
use crate::models::{AdmissionRequest, AdmissionResponse};
use crate::utils::error::ErrorCode;

const ADMISSIONS_PATH: &str = "/api/v1/admissions";

/// Longest slice of an unparseable body kept for the error message.
const BODY_EXCERPT_LEN: usize = 200;

/// Wording that marks a server-side failure as a connectivity problem rather
/// than a verdict on the ticket.
const NETWORK_HINTS: [&str; 5] = ["network", "timeout", "timed out", "connection", "unavailable"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("could not reach admission service: {0}")]
    Transport(String),

    #[error("admission service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("admission service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unreadable admission response: {0}")]
    Decode(String),

    /// A decoded response whose error code is worth another attempt.
    #[error("{code}: {message}")]
    Upstream { code: ErrorCode, message: String },
}

impl ScanError {
    /// Whether repeating the identical request may give a different answer.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::Transport(_) | ScanError::Timeout(_) => true,
            ScanError::Status { status, .. } => matches!(*status, 502..=504),
            ScanError::Decode(_) => false,
            ScanError::Upstream { code, message } => {
                *code == ErrorCode::VerificationFailed && mentions_network_problem(message)
            }
        }
    }

    /// Lifts a retryable failure carried inside a well-formed response into
    /// an error so the retry loop sees it.
    pub fn from_response(response: AdmissionResponse) -> Result<AdmissionResponse, ScanError> {
        // An admitted response already committed; resending it would admit again.
        let retryable = !response.admitted
            && response.error_code == Some(ErrorCode::VerificationFailed)
            && response
                .error_message
                .as_deref()
                .is_some_and(mentions_network_problem);
        if !retryable {
            return Ok(response);
        }
        Err(ScanError::Upstream {
            code: ErrorCode::VerificationFailed,
            message: response.error_message.unwrap_or_default(),
        })
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ScanError::Upstream { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn mentions_network_problem(message: &str) -> bool {
    let message = message.to_lowercase();
    NETWORK_HINTS.iter().any(|hint| message.contains(hint))
}

/// Anything that can answer a scan.
#[async_trait]
pub trait AdmissionClient: Send + Sync {
    async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionResponse, ScanError>;
}

/// Talks to a remote admission service over HTTP.
#[derive(Clone)]
pub struct HttpAdmissionClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpAdmissionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ScanError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), ADMISSIONS_PATH),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, err: reqwest::Error) -> ScanError {
        if err.is_timeout() {
            ScanError::Timeout(self.timeout)
        } else {
            ScanError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl AdmissionClient for HttpAdmissionClient {
    async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionResponse, ScanError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        debug!(status = status.as_u16(), bytes = body.len(), "Admission response received");

        // Business outcomes travel with 4xx/5xx statuses too, so the body
        // decides before the status does.
        decode(status, &body)
    }
}

fn decode(status: StatusCode, body: &[u8]) -> Result<AdmissionResponse, ScanError> {
    match serde_json::from_slice::<AdmissionResponse>(body) {
        Ok(response) => Ok(response),
        Err(e) if status.is_success() => Err(ScanError::Decode(e.to_string())),
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            Err(ScanError::Status {
                status: status.as_u16(),
                body: text.chars().take(BODY_EXCERPT_LEN).collect(),
            })
        }
    }
}

#[async_trait]
impl AdmissionClient for AdmissionOrchestrator {
    async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionResponse, ScanError> {
        Ok(self.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_statuses_are_transient() {
        for status in [502, 503, 504] {
            let err = ScanError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_transient(), "{status} should be retried");
        }
        let err = ScanError::Status {
            status: 500,
            body: String::new(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_verification_failure_classified_by_message() {
        let network = AdmissionResponse::failed(
            ErrorCode::VerificationFailed,
            "Ticket could not be verified: database connection timeout, try again",
        );
        let err = ScanError::from_response(network).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), Some(ErrorCode::VerificationFailed));

        let plain = AdmissionResponse::failed(ErrorCode::VerificationFailed, "Corrupt record");
        assert!(ScanError::from_response(plain).is_ok());
    }

    #[test]
    fn test_business_outcomes_pass_through() {
        let response = AdmissionResponse::failed(ErrorCode::TicketNotFound, "connection of nothing");
        assert!(ScanError::from_response(response).is_ok());
    }

    #[test]
    fn test_decode_prefers_body_over_status() {
        let body = serde_json::to_vec(&AdmissionResponse::failed(
            ErrorCode::TicketNotFound,
            "No ticket matches this code",
        ))
        .unwrap();

        let response = decode(StatusCode::NOT_FOUND, &body).unwrap();
        assert_eq!(response.error_code, Some(ErrorCode::TicketNotFound));
    }

    #[test]
    fn test_decode_non_json_gateway_error() {
        let err = decode(StatusCode::BAD_GATEWAY, b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, ScanError::Status { status: 502, .. }));
        assert!(err.is_transient());

        let err = decode(StatusCode::OK, b"not json").unwrap_err();
        assert!(matches!(err, ScanError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let client =
            HttpAdmissionClient::new("http://gate.local:3001/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://gate.local:3001/api/v1/admissions");
    }
}
