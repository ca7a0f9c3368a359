//! Publisher module
//!
//! The `Publisher` trait is the seam between the delivery coordinator and the
//! network. `HttpPublisher` is the production implementation.

mod http;

pub use http::HttpPublisher;

use crate::error::CloudResult;
use async_trait::async_trait;
use serde_json::Value;
use tbmon_core::{AttributeSet, Reading};

/// A payload for one publish call
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Time-series values
    Telemetry(&'a Reading),

    /// Static device metadata
    Attributes(&'a AttributeSet),
}

impl Payload<'_> {
    /// Last path segment of the device API endpoint
    pub fn endpoint(&self) -> &'static str {
        match self {
            Payload::Telemetry(_) => "telemetry",
            Payload::Attributes(_) => "attributes",
        }
    }

    /// JSON request body
    pub fn body(&self) -> Value {
        match self {
            Payload::Telemetry(reading) => reading.to_payload(),
            Payload::Attributes(attributes) => {
                Value::Object(attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
        }
    }
}

/// Sends payloads to the server on behalf of a device.
///
/// Implementations are stateless per call. Errors must classify as retryable
/// (`Unreachable`, `Timeout`, `Server`) or terminal (`Rejected`).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, key: &str, payload: Payload<'_>) -> CloudResult<()>;
}
