//! Frames exchanged between a signaling client and the rendezvous relay
//!
//! The relay is a plain pub/sub hub: clients subscribe to topics and publish
//! envelopes into them. Delivery is best-effort and unordered across senders;
//! nothing is replayed.

use serde::{Deserialize, Serialize};

use crate::signaling::envelope::Envelope;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayFrame {
    /// Start receiving envelopes published to a topic
    Subscribe { topic: String },
    /// Stop receiving envelopes for a topic
    Unsubscribe { topic: String },
    /// Publish an envelope to a topic
    Publish { topic: String, envelope: Envelope },
    /// An envelope delivered from a subscribed topic
    Deliver { envelope: Envelope },
    /// Relay-side error report
    Error { message: String },
    /// Keepalive
    Ping,
    Pong,
}

impl RelayFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use crate::signaling::envelope::{EnvelopeBody, Presence};

    #[test]
    fn test_frame_roundtrip() {
        let from = IdentityKeyPair::generate().peer_key();
        let envelope = Envelope::new(from, None, EnvelopeBody::Presence(Presence { online: true }));

        let frames = vec![
            RelayFrame::Subscribe {
                topic: "broadcast".into(),
            },
            RelayFrame::Unsubscribe {
                topic: "broadcast".into(),
            },
            RelayFrame::Publish {
                topic: "broadcast".into(),
                envelope: envelope.clone(),
            },
            RelayFrame::Deliver { envelope },
            RelayFrame::Error {
                message: "nope".into(),
            },
            RelayFrame::Ping,
            RelayFrame::Pong,
        ];

        for frame in frames {
            let json = frame.to_json();
            RelayFrame::from_json(&json).unwrap();
        }
    }

    #[test]
    fn test_invalid_frame_rejected() {
        assert!(RelayFrame::from_json("{\"type\":\"Takeover\"}").is_err());
        assert!(RelayFrame::from_json("not json").is_err());
    }
}
