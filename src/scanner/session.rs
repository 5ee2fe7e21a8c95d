//! Door-side scan handling: local duplicate suppression, one outstanding
//! request per code, retries on transient failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{AdmissionClient, ScanError};
use super::feedback::{AlreadyUsedPolicy, IgnoreReason, ScanFeedback};
use super::retry::RetryPolicy;
use crate::models::AdmissionRequest;
use crate::utils::error::ErrorCode;

#[derive(Debug, Clone)]
pub struct ScanSessionConfig {
    /// Sent as `verified_by` on every request.
    pub device_id: String,
    pub local_window: Duration,
    pub max_recent: usize,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub already_used: AlreadyUsedPolicy,
}

impl ScanSessionConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            local_window: Duration::from_millis(1500),
            max_recent: 512,
            max_in_flight: 16,
            retry: RetryPolicy::default(),
            already_used: AlreadyUsedPolicy::default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Last scan time per code, bounded in both age and count.
#[derive(Debug)]
struct RecentScans {
    window: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
}

impl RecentScans {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
        }
    }

    /// Records the scan unless the same code was seen inside the window.
    fn try_record(&mut self, identifier: &str, now: Instant) -> bool {
        if let Some(last) = self.seen.get(identifier) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        self.touch(identifier, now);
        true
    }

    fn touch(&mut self, identifier: &str, now: Instant) {
        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);
        if !self.seen.contains_key(identifier) {
            while self.seen.len() >= self.capacity {
                let oldest = self
                    .seen
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(code, _)| code.clone());
                match oldest {
                    Some(code) => self.seen.remove(&code),
                    None => break,
                };
            }
        }
        self.seen.insert(identifier.to_string(), now);
    }
}

/// Codes with a request outstanding.
#[derive(Debug)]
struct InFlight {
    capacity: usize,
    codes: Mutex<HashSet<String>>,
}

impl InFlight {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            codes: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, identifier: &str) -> Result<InFlightGuard<'_>, IgnoreReason> {
        let mut codes = lock(&self.codes);
        if codes.contains(identifier) {
            return Err(IgnoreReason::InFlight);
        }
        if codes.len() >= self.capacity {
            return Err(IgnoreReason::Busy);
        }
        codes.insert(identifier.to_string());
        Ok(InFlightGuard {
            owner: self,
            identifier: identifier.to_string(),
        })
    }

    fn len(&self) -> usize {
        lock(&self.codes).len()
    }
}

/// Releases the claim when the scan finishes, fails or is dropped.
struct InFlightGuard<'a> {
    owner: &'a InFlight,
    identifier: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.owner.codes).remove(&self.identifier);
    }
}

/// One scanning device. Share it by reference across concurrent scans.
pub struct ScanSession<C> {
    client: C,
    config: ScanSessionConfig,
    recent: Mutex<RecentScans>,
    in_flight: InFlight,
}

impl<C: AdmissionClient> ScanSession<C> {
    pub fn new(client: C, config: ScanSessionConfig) -> Self {
        Self {
            recent: Mutex::new(RecentScans::new(config.local_window, config.max_recent)),
            in_flight: InFlight::new(config.max_in_flight),
            client,
            config,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub async fn scan(&self, raw: &str) -> ScanFeedback {
        let identifier = raw.trim();
        if identifier.is_empty() {
            return ScanFeedback::Denied {
                code: Some(ErrorCode::InvalidInput),
                message: ErrorCode::InvalidInput.default_message().to_string(),
                ticket: None,
            };
        }

        if !lock(&self.recent).try_record(identifier, Instant::now()) {
            debug!(identifier, "Repeat scan inside local window");
            return ScanFeedback::Ignored {
                reason: IgnoreReason::TooSoon,
            };
        }

        let _claim = match self.in_flight.claim(identifier) {
            Ok(claim) => claim,
            Err(reason) => {
                debug!(identifier, ?reason, "Scan suppressed");
                return ScanFeedback::Ignored { reason };
            }
        };

        let request = AdmissionRequest::admit(identifier, self.config.device_id.as_str());
        let (client, request) = (&self.client, &request);
        let result = self
            .config
            .retry
            .retry_with_predicate(
                move || async move {
                    let response = client.admit(request).await?;
                    ScanError::from_response(response)
                },
                ScanError::is_transient,
            )
            .await;

        // The window counts from the answer the operator saw.
        lock(&self.recent).touch(identifier, Instant::now());

        match result {
            Ok(response) => {
                let feedback = ScanFeedback::from_response(response, self.config.already_used);
                if let ScanFeedback::Welcome { .. } = feedback {
                    info!(
                        target: "admission_audit",
                        identifier,
                        device = %self.config.device_id,
                        "Already-used ticket welcomed back"
                    );
                }
                feedback
            }
            Err(err) => {
                warn!(identifier, error = %err, "Scan failed");
                ScanFeedback::Denied {
                    code: err.code(),
                    message: err.to_string(),
                    ticket: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionOrchestrator, AdmissionPolicy};
    use crate::models::AdmissionResponse;
    use crate::scanner::feedback::Signal;
    use crate::store::memory::{FlakyDetailsStore, MemoryTicketStore, Seed};
    use crate::store::TicketStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Reply = Result<AdmissionResponse, ScanError>;

    struct ScriptedClient {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                latency: Duration::ZERO,
            }
        }

        fn slow(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AdmissionClient for ScriptedClient {
        async fn admit(&self, _request: &AdmissionRequest) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(AdmissionResponse::failed(
                    ErrorCode::TicketNotFound,
                    ErrorCode::TicketNotFound.default_message(),
                ))
            })
        }
    }

    fn config(window_ms: u64) -> ScanSessionConfig {
        ScanSessionConfig {
            local_window: Duration::from_millis(window_ms),
            retry: RetryPolicy::default().with_initial_delay(Duration::from_millis(10)),
            ..ScanSessionConfig::new("gate-a")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_then_resolved() {
        let client = ScriptedClient::new(vec![
            Err(ScanError::Transport("connection refused".into())),
            Err(ScanError::Timeout(Duration::from_secs(5))),
            Ok(AdmissionResponse::failed(ErrorCode::AlreadyUsed, "used")),
        ]);
        let session = ScanSession::new(client, config(0));

        let feedback = session.scan("ORD-1").await;

        assert!(matches!(feedback, ScanFeedback::Welcome { .. }));
        assert_eq!(session.client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_business_outcome_not_retried() {
        let client = ScriptedClient::new(vec![Ok(AdmissionResponse::failed(
            ErrorCode::OrphanedTicket,
            ErrorCode::OrphanedTicket.default_message(),
        ))]);
        let session = ScanSession::new(client, config(0));

        let feedback = session.scan("ORD-1").await;

        assert_eq!(feedback.signal(), Signal::RedBuzz);
        assert_eq!(session.client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout_is_retried() {
        let client = ScriptedClient::new(vec![
            Ok(AdmissionResponse::failed(
                ErrorCode::VerificationFailed,
                "Ticket could not be verified: database connection timeout, try again",
            )),
            Ok(AdmissionResponse::failed(ErrorCode::TicketNotFound, "No ticket")),
        ]);
        let session = ScanSession::new(client, config(0));

        let feedback = session.scan("ORD-1").await;

        assert!(matches!(
            feedback,
            ScanFeedback::Denied {
                code: Some(ErrorCode::TicketNotFound),
                ..
            }
        ));
        assert_eq!(session.client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_deny_with_last_error() {
        let failures = (0..4)
            .map(|_| Err(ScanError::Status { status: 503, body: String::new() }))
            .collect();
        let session = ScanSession::new(ScriptedClient::new(failures), config(0));

        let feedback = session.scan("ORD-1").await;

        assert!(matches!(feedback, ScanFeedback::Denied { code: None, .. }));
        assert_eq!(session.client.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_inside_window_is_ignored() {
        let session = ScanSession::new(ScriptedClient::new(Vec::new()), config(1500));

        session.scan("ORD-1").await;
        let repeat = session.scan(" ORD-1 ").await;
        let other = session.scan("ORD-2").await;

        assert_eq!(
            repeat,
            ScanFeedback::Ignored {
                reason: IgnoreReason::TooSoon
            }
        );
        assert_ne!(other.signal(), Signal::None);
        assert_eq!(session.client.calls(), 2);

        tokio::time::advance(Duration::from_millis(1600)).await;
        session.scan("ORD-1").await;
        assert_eq!(session.client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_code_sends_one_request() {
        let session = ScanSession::new(ScriptedClient::slow(Duration::from_millis(200)), config(0));

        let (first, second) = tokio::join!(session.scan("ORD-1"), session.scan("ORD-1"));

        assert_ne!(first.signal(), Signal::None);
        assert_eq!(
            second,
            ScanFeedback::Ignored {
                reason: IgnoreReason::InFlight
            }
        );
        assert_eq!(session.client.calls(), 1);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_capacity_is_bounded() {
        let config = ScanSessionConfig {
            max_in_flight: 1,
            ..config(0)
        };
        let session = ScanSession::new(ScriptedClient::slow(Duration::from_millis(200)), config);

        let (_, second) = tokio::join!(session.scan("ORD-1"), session.scan("ORD-2"));

        assert_eq!(
            second,
            ScanFeedback::Ignored {
                reason: IgnoreReason::Busy
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_scan_releases_claim() {
        let session = ScanSession::new(ScriptedClient::slow(Duration::from_secs(10)), config(0));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), session.scan("ORD-1")).await;

        assert!(cancelled.is_err());
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn test_recent_scans_evict_oldest_at_capacity() {
        let mut recent = RecentScans::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();

        assert!(recent.try_record("a", t0));
        assert!(recent.try_record("b", t0 + Duration::from_millis(1)));
        assert!(recent.try_record("c", t0 + Duration::from_millis(2)));

        assert_eq!(recent.seen.len(), 2);
        assert!(!recent.seen.contains_key("a"));
        assert!(recent.try_record("a", t0 + Duration::from_millis(3)));
        assert!(!recent.try_record("c", t0 + Duration::from_millis(4)));
    }

    #[tokio::test]
    async fn test_session_over_in_process_orchestrator() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 1).await;
        let orchestrator =
            AdmissionOrchestrator::new(store, AdmissionPolicy::new(chrono::Duration::zero()));
        let session = ScanSession::new(orchestrator, config(0));

        let first = session.scan(&code).await;
        let second = session.scan(&code).await;

        assert!(first.is_admitted());
        assert_eq!(first.signal(), Signal::GreenChime);
        assert_eq!(second.signal(), Signal::AmberChime);
        assert_eq!(second.ticket().map(|t| t.purchase_code.as_str()), Some(code.as_str()));
    }

    #[tokio::test]
    async fn test_admission_without_details_is_not_resubmitted() {
        let store = Arc::new(MemoryTicketStore::new());
        let seed = Seed::new(&store).await;
        let code = seed.legacy_purchase(&store, 3).await;
        let orchestrator = AdmissionOrchestrator::new(
            Arc::new(FlakyDetailsStore::new(store.clone())),
            AdmissionPolicy::new(chrono::Duration::zero()),
        );
        let session = ScanSession::new(orchestrator, config(0));

        let feedback = session.scan(&code).await;

        assert!(feedback.is_admitted(), "{feedback:?}");
        assert_eq!(feedback.signal(), Signal::GreenChime);
        let outcomes: Vec<_> = store.audit_log().await.iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec!["SUCCESS"]);
        assert_eq!(store.find_unit(&code).await.unwrap().unwrap().used(), 1);
    }
}
