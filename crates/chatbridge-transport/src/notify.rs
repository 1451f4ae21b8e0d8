//! Per-peer delivery reports for external requests that ask for one.

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::protocol::PeerRef;

/// Timestamp layout of [`DeliveryReport::survey_submission_date`].
pub const REPORT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of delivering to one peer, as the completion endpoint expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Verification token from the request.
    pub survey_id: PeerRef,
    /// Peer as it appeared in the request.
    pub phone: String,
    /// `"SI"` on success, `"ERROR"` otherwise.
    pub survey_sent: String,
    /// Local wall-clock time of the attempt.
    pub survey_submission_date: String,
    /// Failure detail; `null` on success.
    pub observation: Option<String>,
}

impl DeliveryReport {
    /// Report a successful delivery, stamped now.
    #[must_use]
    pub fn sent(survey_id: PeerRef, phone: impl Into<String>) -> Self {
        Self::stamped(survey_id, phone.into(), "SI", None)
    }

    /// Report a failed delivery, stamped now.
    #[must_use]
    pub fn failed(survey_id: PeerRef, phone: impl Into<String>, observation: impl Into<String>) -> Self {
        Self::stamped(survey_id, phone.into(), "ERROR", Some(observation.into()))
    }

    fn stamped(survey_id: PeerRef, phone: String, sent: &str, observation: Option<String>) -> Self {
        Self {
            survey_id,
            phone,
            survey_sent: sent.to_string(),
            survey_submission_date: Local::now().format(REPORT_DATE_FORMAT).to_string(),
            observation,
        }
    }

    /// Whether the report is for a successful delivery.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.survey_sent == "SI"
    }
}

/// Receives delivery reports.
///
/// Fire-and-forget: implementations log their own failures, and nothing they
/// do may affect delivery to other peers.
#[async_trait]
pub trait DeliveryNotifier: Send + Sync {
    async fn notify(&self, report: &DeliveryReport);
}

/// Drops every report.
pub struct NoopNotifier;

#[async_trait]
impl DeliveryNotifier for NoopNotifier {
    async fn notify(&self, _report: &DeliveryReport) {}
}

#[cfg(feature = "http")]
pub use self::http::HttpNotifier;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use chatbridge_core::BridgeConfig;

    use super::{DeliveryNotifier, DeliveryReport};

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// POSTs each report as JSON to a completion endpoint.
    #[derive(Clone)]
    pub struct HttpNotifier {
        client: reqwest::Client,
        url: String,
    }

    impl HttpNotifier {
        /// Notifier posting to `url`.
        ///
        /// # Errors
        /// Returns error if the HTTP client cannot be built.
        pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
            let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
            Ok(Self {
                client,
                url: url.into(),
            })
        }

        /// Notifier posting to the endpoint configured in `config`.
        ///
        /// # Errors
        /// Returns error if the HTTP client cannot be built.
        pub fn from_config(config: &BridgeConfig) -> Result<Self, reqwest::Error> {
            Self::new(config.notifier_url())
        }

        #[must_use]
        pub fn url(&self) -> &str {
            &self.url
        }
    }

    #[async_trait]
    impl DeliveryNotifier for HttpNotifier {
        async fn notify(&self, report: &DeliveryReport) {
            let result = self
                .client
                .post(&self.url)
                .json(report)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);

            match result {
                Ok(_) => tracing::debug!(
                    phone = %report.phone,
                    sent = %report.survey_sent,
                    "Delivery report accepted"
                ),
                Err(e) => tracing::error!(
                    phone = %report.phone,
                    url = %self.url,
                    "Failed to post delivery report: {e}"
                ),
            }
        }
    }
}
