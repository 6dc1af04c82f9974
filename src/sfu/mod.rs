//! HTTP signaling against an SFU: WHIP ingest and WHEP egress
//!
//! Both protocols share one handshake shape:
//!
//! ```text
//! POST   <endpoint>  application/sdp               -> 201 + Location + SDP answer
//! PATCH  <resource>  application/trickle-ice-sdpfrag -> 204
//! DELETE <resource>                                 -> 2xx
//! ```
//!
//! [`HttpSession`] implements that shape; [`whip`] and [`whep`] add the
//! protocol-specific status handling and peer wiring.

pub mod whep;
pub mod whip;

pub use whep::{WhepClient, WhepConfig};
pub use whip::{WhipClient, WhipConfig};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::webrtc::IceCandidate;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_ICE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

pub use crate::webrtc::{ConnectionCallback, ErrorCallback};

/// Check that an endpoint URL is non-empty and uses http(s)
pub fn validate_endpoint_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(BridgeError::InvalidArgument(
            "endpoint URL is empty".to_string(),
        ));
    }

    let lower = url.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(BridgeError::InvalidArgument(format!(
            "endpoint URL must start with http:// or https://: {}",
            url
        )));
    }
    Ok(())
}

/// Resolve a `Location` header against the endpoint it came from
fn resolve_location(endpoint: &str, location: &str) -> String {
    reqwest::Url::parse(endpoint)
        .and_then(|base| base.join(location))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| location.to_string())
}

/// How non-2xx responses map onto errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusPolicy {
    /// 401 is distinguished, everything else is a protocol error
    Whip,
    /// 401, 403 and 404 are distinguished
    Whep,
}

fn classify_status(policy: StatusPolicy, label: &str, response: &HttpResponse) -> BridgeError {
    let detail = if response.body.trim().is_empty() {
        format!("{} server returned {}", label, response.status)
    } else {
        format!(
            "{} server returned {}: {}",
            label,
            response.status,
            response.body.trim()
        )
    };

    match (policy, response.status) {
        (_, 401) => BridgeError::Unauthorized(detail),
        (StatusPolicy::Whep, 403) => BridgeError::Forbidden(detail),
        (StatusPolicy::Whep, 404) => BridgeError::NotFound(detail),
        (_, status) => BridgeError::Http {
            status,
            message: detail,
        },
    }
}

#[derive(Debug, Default)]
struct SessionRecord {
    resource_url: Option<String>,
    connected: bool,
    /// An offer POST is in flight
    offering: bool,
}

/// Holds the in-flight offer slot; released on drop, including cancellation
struct OfferSlot<'a> {
    record: &'a Mutex<SessionRecord>,
}

impl Drop for OfferSlot<'_> {
    fn drop(&mut self) {
        self.record.lock().offering = false;
    }
}

/// One WHIP/WHEP resource on the server
pub(crate) struct HttpSession {
    label: &'static str,
    policy: StatusPolicy,
    url: String,
    bearer_token: Option<String>,
    http: Arc<dyn HttpClient>,
    record: Mutex<SessionRecord>,
}

impl HttpSession {
    pub(crate) fn new(
        label: &'static str,
        policy: StatusPolicy,
        url: String,
        bearer_token: Option<String>,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        validate_endpoint_url(&url)?;
        Ok(Self {
            label,
            policy,
            url,
            bearer_token,
            http,
            record: Mutex::new(SessionRecord::default()),
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.record.lock().connected
    }

    pub(crate) fn resource_url(&self) -> Option<String> {
        self.record.lock().resource_url.clone()
    }

    fn request(&self) -> HttpRequest {
        HttpRequest::new().with_bearer(self.bearer_token.as_deref())
    }

    /// POST the offer; on success the session is connected and the answer
    /// SDP is returned
    pub(crate) async fn post_offer(&self, sdp: &str) -> Result<String> {
        if sdp.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("offer SDP is empty".to_string()));
        }
        let _slot = {
            let mut record = self.record.lock();
            if record.connected {
                return Err(BridgeError::ProtocolState(format!(
                    "{} session already established, disconnect first",
                    self.label
                )));
            }
            if record.offering {
                return Err(BridgeError::ProtocolState(format!(
                    "{} offer already in flight",
                    self.label
                )));
            }
            record.offering = true;
            OfferSlot {
                record: &self.record,
            }
        };

        info!("{} sending offer to {} ({} bytes)", self.label, self.url, sdp.len());
        let request = self
            .request()
            .with_header("Accept", SDP_CONTENT_TYPE)
            .with_body(SDP_CONTENT_TYPE, sdp);
        let response = self.http.post(&self.url, request).await?;

        if !response.is_success() {
            let err = classify_status(self.policy, self.label, &response);
            warn!("{} offer rejected: {}", self.label, err);
            return Err(err);
        }

        let location = response
            .header("Location")
            .filter(|location| !location.trim().is_empty())
            .ok_or_else(|| {
                BridgeError::Protocol(format!(
                    "{} server answered {} without a Location header",
                    self.label, response.status
                ))
            })?;
        let resource_url = resolve_location(&self.url, location.trim());

        {
            let mut record = self.record.lock();
            record.resource_url = Some(resource_url.clone());
            record.connected = true;
        }

        info!("{} session established, resource {}", self.label, resource_url);
        Ok(response.body)
    }

    /// PATCH one candidate to the resource
    pub(crate) async fn patch_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if candidate.candidate.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "ICE candidate is empty".to_string(),
            ));
        }

        let resource_url = {
            let record = self.record.lock();
            match (record.connected, record.resource_url.as_ref()) {
                (true, Some(url)) => url.clone(),
                _ => {
                    return Err(BridgeError::ProtocolState(format!(
                        "{} session not established",
                        self.label
                    )))
                }
            }
        };

        debug!("{} trickling candidate to {}", self.label, resource_url);
        let request = self
            .request()
            .with_body(TRICKLE_ICE_CONTENT_TYPE, candidate.to_sdp_fragment());
        let response = self.http.patch(&resource_url, request).await?;

        if !response.is_success() {
            return Err(classify_status(self.policy, self.label, &response));
        }
        Ok(())
    }

    /// Forget the resource and DELETE it on the server
    ///
    /// Returns `None` when the session was not connected.
    pub(crate) async fn delete_resource(&self) -> Option<Result<()>> {
        let resource_url = {
            let mut record = self.record.lock();
            let was_connected = record.connected;
            record.connected = false;
            let resource_url = record.resource_url.take();
            if !was_connected {
                return None;
            }
            resource_url?
        };

        info!("{} deleting resource {}", self.label, resource_url);
        let result = match self.http.delete(&resource_url, self.request()).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(classify_status(self.policy, self.label, &response)),
            Err(e) => Err(e),
        };
        Some(result)
    }

    /// Detach the resource without talking to the server, for drop paths
    pub(crate) fn take_resource(&self) -> Option<String> {
        let mut record = self.record.lock();
        record.connected = false;
        record.resource_url.take()
    }

    /// Fire-and-forget DELETE used from `Drop`
    pub(crate) fn delete_in_background(&self, resource_url: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let http = self.http.clone();
        let request = self.request();
        let label = self.label;
        runtime.spawn(async move {
            if let Err(e) = http.delete(&resource_url, request).await {
                debug!("{} background DELETE of {} failed: {}", label, resource_url, e);
            }
        });
    }
}
