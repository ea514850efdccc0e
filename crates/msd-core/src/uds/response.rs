//! Service reply parsing.
//!
//! A reassembled ISO-TP payload from the controller is either a positive
//! response (`SID + 0x40`, then service data) or a negative response
//! (`0x7F`, echoed SID, NRC).

use super::constants::{NEGATIVE_RESPONSE, Nrc, POSITIVE_OFFSET};

/// One parsed service reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsReply {
    Positive { service: u8, data: Vec<u8> },
    Negative { service: u8, nrc: Nrc },
}

impl UdsReply {
    /// Parse a raw reply payload. Returns `None` for frames too short or
    /// malformed to classify.
    pub fn parse(raw: &[u8]) -> Option<UdsReply> {
        match raw {
            [] => None,
            [NEGATIVE_RESPONSE, service, nrc, ..] => Some(UdsReply::Negative {
                service: *service,
                nrc: Nrc(*nrc),
            }),
            [NEGATIVE_RESPONSE, ..] => None,
            [sid, rest @ ..] if *sid >= POSITIVE_OFFSET => Some(UdsReply::Positive {
                service: sid - POSITIVE_OFFSET,
                data: rest.to_vec(),
            }),
            _ => None,
        }
    }

    /// True when this reply answers `service`.
    pub fn answers(&self, service: u8) -> bool {
        match self {
            UdsReply::Positive { service: s, .. } | UdsReply::Negative { service: s, .. } => {
                *s == service
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, UdsReply::Negative { nrc, .. } if *nrc == Nrc::RESPONSE_PENDING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_reply() {
        let reply = UdsReply::parse(&[0x50, 0x02, 0x00, 0x19]).unwrap();
        assert_eq!(
            reply,
            UdsReply::Positive {
                service: 0x10,
                data: vec![0x02, 0x00, 0x19]
            }
        );
        assert!(reply.answers(0x10));
        assert!(!reply.answers(0x27));
    }

    #[test]
    fn negative_reply() {
        let reply = UdsReply::parse(&[0x7F, 0x27, 0x35]).unwrap();
        assert_eq!(
            reply,
            UdsReply::Negative {
                service: 0x27,
                nrc: Nrc::INVALID_KEY
            }
        );
        assert!(reply.answers(0x27));
    }

    #[test]
    fn pending_detection() {
        let reply = UdsReply::parse(&[0x7F, 0x31, 0x78]).unwrap();
        assert!(reply.is_pending());
    }

    #[test]
    fn malformed_replies() {
        assert!(UdsReply::parse(&[]).is_none());
        assert!(UdsReply::parse(&[0x7F]).is_none());
        assert!(UdsReply::parse(&[0x7F, 0x31]).is_none());
        assert!(UdsReply::parse(&[0x10, 0x02]).is_none());
    }
}
