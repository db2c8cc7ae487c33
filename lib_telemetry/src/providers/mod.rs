//! # Status Providers
//!
//! The fan-out core does not know how a device's status or a subscriber's
//! dashboard aggregate is computed. It asks a `StatusProvider` while building
//! a consolidated payload and uses the answer as-is: no caching, no
//! invalidation on the provider's behalf.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{DeviceId, StatusSnapshot, SubscriberId};

/// External collaborator computing point-in-time status facts.
///
/// Calls must be free of side effects from the core's point of view. A failed
/// call is contained by the caller: the affected section is left out of the
/// payload and the rest is still delivered.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Current status of one device.
    async fn device_status(&self, device_id: &DeviceId) -> Result<StatusSnapshot>;

    /// Current dashboard aggregate for one subscriber.
    async fn dashboard_summary(&self, subscriber_id: &SubscriberId) -> Result<Value>;
}
