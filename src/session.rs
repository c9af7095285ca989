use bytes::Bytes;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    cadence::{CadenceEstimator, CadenceUpdate, ZeroRevolutionPolicy},
    error::Result,
    protocol::decode,
    staleness::{sleep_until_deadline, StalenessMonitor},
    transport::{LinkEvent, LinkEventStream, NotificationStream},
    types::PeripheralHandle,
};

/// Something that happened on an established link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// Raw measurement notification
    Payload(Bytes),
    /// The stale-data deadline passed
    StaleDeadline,
    /// The link went away
    Lost(Option<String>),
}

/// One active peripheral link with its cadence pipeline
///
/// Nothing else holds the link streams or the cadence pipeline; dropping the
/// session releases them.
pub struct ConnectionSession {
    handle: PeripheralHandle,
    link_events: LinkEventStream,
    notifications: Option<NotificationStream>,
    estimator: CadenceEstimator,
    staleness: StalenessMonitor,
}

impl ConnectionSession {
    /// Wrap a freshly established link; cadence state starts from scratch
    #[must_use]
    pub fn new(
        handle: PeripheralHandle,
        link_events: LinkEventStream,
        stale_window: Duration,
        policy: ZeroRevolutionPolicy,
    ) -> Self {
        Self {
            handle,
            link_events,
            notifications: None,
            estimator: CadenceEstimator::with_policy(policy),
            staleness: StalenessMonitor::new(stale_window),
        }
    }

    /// Peripheral of this link
    #[must_use]
    pub const fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// Latest cadence in RPM
    #[must_use]
    pub const fn cadence_rpm(&self) -> f64 {
        self.estimator.cadence_rpm()
    }

    /// Pending stale-data deadline
    #[must_use]
    pub const fn stale_deadline(&self) -> Option<Instant> {
        self.staleness.deadline()
    }

    /// Start consuming notifications and arm the staleness watchdog
    ///
    /// Arming here covers a sensor that never sends a first packet.
    pub fn attach_notifications(&mut self, notifications: NotificationStream, now: Instant) {
        self.notifications = Some(notifications);
        self.staleness.arm(now);
    }

    /// Decode and apply one notification
    ///
    /// Returns the cadence to surface when the packet carried distinct crank
    /// data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CadenceError::Decode`] for a malformed packet. No
    /// state is touched in that case, so the caller may drop it and carry on.
    pub fn handle_payload(&mut self, payload: &[u8], now: Instant) -> Result<Option<f64>> {
        let measurement = decode(payload)?;

        let update = self.estimator.update(&measurement);
        if !update.is_distinct() {
            if update == CadenceUpdate::NoCrankData {
                debug!("CSC measurement without crank data");
            }
            return Ok(None);
        }

        self.staleness.arm(now);
        Ok(Some(self.estimator.cadence_rpm()))
    }

    /// Zero the cadence if the stale deadline has passed
    ///
    /// Returns `true` once per quiet period.
    pub fn check_stale(&mut self, now: Instant) -> bool {
        if !self.staleness.check(now) {
            return false;
        }
        info!(
            "No distinct crank data from {} within {}ms, cadence set to 0 RPM",
            self.handle,
            self.staleness.window().as_millis()
        );
        self.estimator.force_zero();
        true
    }

    /// Wait for the next link event, notification, or stale deadline
    pub async fn next_signal(&mut self) -> LinkSignal {
        loop {
            let deadline = self.staleness.deadline();
            let notifications = self.notifications.as_mut();

            tokio::select! {
                event = self.link_events.next() => match event {
                    Some(LinkEvent::Connected) => continue,
                    Some(LinkEvent::Disconnected(reason)) => return LinkSignal::Lost(reason),
                    None => return LinkSignal::Lost(None),
                },
                payload = next_payload(notifications) => match payload {
                    Some(payload) => return LinkSignal::Payload(payload),
                    None => return LinkSignal::Lost(Some("notification stream closed".to_string())),
                },
                () = sleep_until_deadline(deadline) => return LinkSignal::StaleDeadline,
            }
        }
    }

    /// Release the link, resetting cadence state and cancelling the watchdog
    pub fn teardown(mut self) -> PeripheralHandle {
        self.estimator.reset();
        self.staleness.cancel();
        self.handle
    }
}

async fn next_payload(notifications: Option<&mut NotificationStream>) -> Option<Bytes> {
    match notifications {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
