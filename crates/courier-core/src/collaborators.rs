//! Traits for the delivery mechanism and user preferences.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::request::NotificationRequest;

/// Identifier the delivery mechanism assigns to an accepted notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why the delivery mechanism refused a notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The user has not authorized notifications
    #[error("Not authorized to deliver notifications")]
    NotAuthorized,

    /// The target channel is unknown to the delivery mechanism
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Any other failure reported by the mechanism
    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// The mechanism that actually puts a notification in front of the user.
///
/// Implementations own their own transport, retries and cancellation. The
/// engine calls `dispatch` once per admitted request.
pub trait DeliveryChannel: Send + Sync {
    fn dispatch(&self, request: &NotificationRequest) -> Result<DeliveryId, DeliveryError>;
}

/// User or channel preferences consulted before dispatch.
pub trait PreferenceGate: Send + Sync {
    /// Whether the user currently accepts this notification.
    fn is_allowed(&self, request: &NotificationRequest) -> bool;
}

/// Gate that lets everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PreferenceGate for AllowAll {
    fn is_allowed(&self, _request: &NotificationRequest) -> bool {
        true
    }
}

/// Gate that refuses requests routed to muted channels.
///
/// Requests without a channel id always pass.
#[derive(Debug, Default, Clone)]
pub struct MutedChannels {
    muted: BTreeSet<String>,
}

impl MutedChannels {
    pub fn new(channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            muted: channels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_muted(&self, channel_id: &str) -> bool {
        self.muted.contains(channel_id)
    }
}

impl PreferenceGate for MutedChannels {
    fn is_allowed(&self, request: &NotificationRequest) -> bool {
        request
            .channel_id
            .as_deref()
            .map_or(true, |channel| !self.is_muted(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn muted_channels_only_block_listed_channels() {
        let gate = MutedChannels::new(["marketing"]);
        let plain = NotificationRequest::new("n-1", "Title", "Body");
        assert!(gate.is_allowed(&plain));
        assert!(gate.is_allowed(&plain.clone().with_channel("reminders")));
        assert!(!gate.is_allowed(&plain.with_channel("marketing")));
    }

    #[test]
    fn delivery_error_messages() {
        assert_eq!(
            DeliveryError::UnknownChannel("promo".into()).to_string(),
            "Unknown channel: promo"
        );
        assert_eq!(DeliveryId::new("abc").to_string(), "abc");
    }
}
