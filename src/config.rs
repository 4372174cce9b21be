//! Tunables for an [`Adapter`][crate::Adapter].

use std::time::Duration;

use crate::att::MAX_ATTRIBUTE_LEN;

/// Timeouts and queue sizes used by an [`Adapter`][crate::Adapter] and its connections.
///
/// All fields have sensible defaults; use the `with_*` methods to override individual values.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AdapterConfig {
    /// How long [`connect_device`][crate::Adapter::connect_device] waits for the link to come up.
    pub connect_timeout: Duration,
    /// How long a single ATT request waits for its response.
    ///
    /// The Bluetooth Core Specification mandates 30 seconds (Vol 3, Part F, §3.3.3).
    pub request_timeout: Duration,
    /// How long [`cancel_connection`][crate::Adapter::cancel_connection] waits for the transport to confirm a
    /// disconnection before tearing the link down locally.
    pub disconnect_timeout: Duration,
    /// Upper bound on the length of a value assembled by [`read_long`][crate::Characteristic::read_long].
    pub max_attribute_len: usize,
    /// Number of callers that may wait for the ATT bearer of a single connection before further requests fail
    /// with [`Busy`][crate::error::ErrorKind::Busy].
    pub max_queued_requests: usize,
    /// Capacity of each [`events`][crate::Adapter::events] stream. Older events are dropped on overflow.
    pub event_capacity: usize,
    /// Capacity of each [`notify`][crate::Characteristic::notify] stream. Older values are dropped on overflow.
    pub notification_capacity: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            max_attribute_len: MAX_ATTRIBUTE_LEN,
            max_queued_requests: 16,
            event_capacity: 128,
            notification_capacity: 16,
        }
    }
}

impl AdapterConfig {
    /// Sets [`connect_timeout`][Self::connect_timeout].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets [`request_timeout`][Self::request_timeout].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets [`disconnect_timeout`][Self::disconnect_timeout].
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets [`max_attribute_len`][Self::max_attribute_len].
    pub fn with_max_attribute_len(mut self, len: usize) -> Self {
        self.max_attribute_len = len;
        self
    }

    /// Sets [`max_queued_requests`][Self::max_queued_requests].
    pub fn with_max_queued_requests(mut self, n: usize) -> Self {
        self.max_queued_requests = n;
        self
    }

    /// Sets [`event_capacity`][Self::event_capacity]. Zero is raised to one.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Sets [`notification_capacity`][Self::notification_capacity]. Zero is raised to one.
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AdapterConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attribute_len, 512);

        let config = config.with_connect_timeout(Duration::from_millis(200)).with_event_capacity(0);
        assert_eq!(config.connect_timeout, Duration::from_millis(200));
        assert_eq!(config.event_capacity, 1);
    }
}
