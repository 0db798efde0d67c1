//! Scored multi-protocol classifier.
//!
//! Every protocol has an independent validator that either rejects the buffer or
//! returns a confidence in `[0, 100]`. The scored detector runs all validators and
//! picks the protocol with the highest fixed score; the fast path returns the first
//! validator that passes. Both are stateless: the same bytes always classify the same way.
//!
//! | Protocol | Score | Minimum length |
//! |----------|-------|----------------|
//! | TLS      | 20    | 5  (opt-in)    |
//! | QUIC     | 18    | 6  (opt-in)    |
//! | HTTP     | 15    | 14             |
//! | DNS      | 12    | 12             |
//! | MQTT     | 10    | 2              |
//! | CoAP     | 8     | 4              |

use tracing::{debug, trace};

use crate::protocol::{Protocol, Transport};

/// 4-tuple classification cache.
pub mod cache;
mod coap;
mod dns;
mod encrypted;
mod http;
mod mqtt;

#[cfg(test)]
mod tests;

pub use cache::DetectionCache;

/// Shortest buffer any validator accepts.
pub const MIN_DETECT_LEN: usize = 2;

/// Confidence bucket reported with a classification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfidenceTier {
    /// Below 50
    None,
    /// 50 to 69
    Low,
    /// 70 to 89
    Medium,
    /// 90 and above
    High,
}

impl ConfidenceTier {
    /// Threshold of the high tier.
    pub const HIGH: u8 = 90;
    /// Threshold of the medium tier.
    pub const MEDIUM: u8 = 70;
    /// Threshold of the low tier.
    pub const LOW: u8 = 50;

    /// Buckets a confidence value.
    pub fn from_confidence(confidence: u8) -> Self {
        match confidence {
            c if c >= Self::HIGH => ConfidenceTier::High,
            c if c >= Self::MEDIUM => ConfidenceTier::Medium,
            c if c >= Self::LOW => ConfidenceTier::Low,
            _ => ConfidenceTier::None,
        }
    }
}

/// Result of classifying a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Detection {
    /// Winning protocol, or `Unknown`
    pub protocol: Protocol,
    /// Confidence in `[0, 100]`; 0 for `Unknown`
    pub confidence: u8,
}

impl Detection {
    /// The unclassified result.
    pub const UNKNOWN: Detection = Detection { protocol: Protocol::Unknown, confidence: 0 };

    /// Returns true if a protocol was recognised.
    pub fn is_known(&self) -> bool {
        self.protocol != Protocol::Unknown
    }

    /// Confidence bucket of this result.
    pub fn tier(&self) -> ConfidenceTier {
        ConfidenceTier::from_confidence(self.confidence)
    }
}

type Validator = fn(&[u8], Transport) -> Option<u8>;

struct Candidate {
    protocol: Protocol,
    score: u8,
    validate: Validator,
}

// Priority order: ties keep the earlier entry.
const SCORED: [Candidate; 6] = [
    Candidate { protocol: Protocol::Tls, score: 20, validate: encrypted::validate_tls },
    Candidate { protocol: Protocol::Quic, score: 18, validate: encrypted::validate_quic },
    Candidate { protocol: Protocol::Http, score: 15, validate: http::validate },
    Candidate { protocol: Protocol::Dns, score: 12, validate: dns::validate },
    Candidate { protocol: Protocol::Mqtt, score: 10, validate: mqtt::validate },
    Candidate { protocol: Protocol::Coap, score: 8, validate: coap::validate },
];

// UDP-native protocols first.
const FAST: [(Protocol, Validator); 6] = [
    (Protocol::Dns, dns::validate),
    (Protocol::Coap, coap::validate),
    (Protocol::Http, http::validate),
    (Protocol::Mqtt, mqtt::validate),
    (Protocol::Quic, encrypted::validate_quic),
    (Protocol::Tls, encrypted::validate_tls),
];

/// Stateless protocol classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolDetector {
    detect_encrypted: bool,
}

impl ProtocolDetector {
    /// Creates a detector; `detect_encrypted` enables the TLS and QUIC validators.
    pub fn new(detect_encrypted: bool) -> Self {
        Self { detect_encrypted }
    }

    /// Returns true if TLS and QUIC are recognised.
    pub fn detects_encrypted(&self) -> bool {
        self.detect_encrypted
    }

    fn enabled(&self, protocol: Protocol) -> bool {
        self.detect_encrypted || !matches!(protocol, Protocol::Tls | Protocol::Quic)
    }

    /// Runs every validator and returns the highest-scoring protocol.
    pub fn detect(&self, bytes: &[u8], transport: Transport) -> Detection {
        if bytes.len() < MIN_DETECT_LEN {
            return Detection::UNKNOWN;
        }

        let mut best: Option<(u8, Detection)> = None;
        for candidate in SCORED.iter().filter(|c| self.enabled(c.protocol)) {
            let Some(confidence) = (candidate.validate)(bytes, transport) else {
                continue;
            };
            trace!(
                "[DETECTION] {} validation: PASS (score: {}, confidence: {})",
                candidate.protocol,
                candidate.score,
                confidence
            );
            if best.map_or(true, |(score, _)| candidate.score > score) {
                best = Some((candidate.score, Detection { protocol: candidate.protocol, confidence }));
            }
        }

        match best {
            Some((_, detection)) => {
                debug!(
                    "[DETECTION] {} detected over {} (confidence: {})",
                    detection.protocol, transport, detection.confidence
                );
                detection
            }
            None => {
                debug!("[DETECTION] no protocol matched {} bytes over {}", bytes.len(), transport);
                Detection::UNKNOWN
            }
        }
    }

    /// Returns the first protocol whose validator passes, skipping scoring.
    pub fn detect_fast(&self, bytes: &[u8], transport: Transport) -> Detection {
        if bytes.len() < MIN_DETECT_LEN {
            return Detection::UNKNOWN;
        }
        FAST.iter()
            .filter(|(protocol, _)| self.enabled(*protocol))
            .find_map(|(protocol, validate)| {
                validate(bytes, transport).map(|confidence| Detection { protocol: *protocol, confidence })
            })
            .unwrap_or(Detection::UNKNOWN)
    }
}
