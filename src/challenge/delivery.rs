//! Out-of-band delivery of verification codes.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Transport for a verification message. Failures are reported, never fatal
/// to the challenge that was issued.
pub trait DeliveryChannel: Send + Sync {
    /// Deliver a message or return an error describing why it failed.
    ///
    /// # Errors
    /// Returns an error if the transport rejected the message.
    fn send(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Local dev channel that writes the message to the log instead of sending it.
#[derive(Clone, Debug, Default)]
pub struct LogDelivery;

impl DeliveryChannel for LogDelivery {
    fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        info!(to = %address, subject, "verification message send stub");
        debug!(target: "delivery", to = %address, "{body}");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub address: String,
    pub subject: String,
    pub body: String,
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingDelivery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<SentMessage> {
        self.sent.lock().last().cloned()
    }
}

impl DeliveryChannel for RecordingDelivery {
    fn send(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        self.sent.lock().push(SentMessage {
            address: address.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Always fails, to exercise outage handling.
#[derive(Clone, Debug, Default)]
pub struct FailingDelivery;

impl DeliveryChannel for FailingDelivery {
    fn send(&self, address: &str, _subject: &str, _body: &str) -> Result<()> {
        bail!("delivery to {address} failed: transport unavailable")
    }
}

pub const VERIFICATION_SUBJECT: &str = "Secure Authentication - Verification Code";

/// Plain text body of a verification message.
#[must_use]
pub fn verification_body(username: &str, code: &str, ttl_seconds: u64) -> String {
    let minutes = ttl_seconds.div_ceil(60).max(1);
    format!(
        "Hello {username},\n\n\
         Your two-factor authentication code is: {code}\n\n\
         This code expires in {minutes} minutes.\n\n\
         Security notice:\n\
         - Never share this code with anyone\n\
         - If you did not request this, ignore this message\n"
    )
}
