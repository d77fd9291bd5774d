//! Gap repair over the control channel: announce / request / deliver.
//!
//! Control messages are UTF-8 text of the form `KIND|field|field...`. Text whose
//! first field is not a known kind is a plain peer-to-peer message.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::holders::ChunkHolderIndex;

pub const ANNOUNCE_KIND: &str = "CHUNK_ANNOUNCE";
pub const REQUEST_KIND: &str = "REQUEST_CHUNK";
pub const DELIVER_KIND: &str = "CHUNK_DATA";

const SEP: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Sender now holds chunk `index` of `file_name`.
    Announce { file_name: String, index: u32 },
    /// Please deliver chunk `index` of `file_name`. Unanswered if not held.
    Request { file_name: String, index: u32 },
    /// Answer to a satisfied request.
    Deliver {
        file_name: String,
        index: u32,
        payload: Vec<u8>,
    },
    /// Anything else: surfaced verbatim.
    Text(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlParseError {
    #[error("{kind} message missing fields")]
    MissingField { kind: &'static str },
    #[error("{kind} message has an empty file name")]
    EmptyFileName { kind: &'static str },
    #[error("bad chunk index {0:?}")]
    BadIndex(String),
    #[error("bad base64 payload: {0}")]
    BadPayload(String),
}

impl ControlMessage {
    /// Classify and parse one received message.
    pub fn parse(text: &str) -> Result<Self, ControlParseError> {
        let Some((kind, rest)) = text.split_once(SEP) else {
            return Ok(ControlMessage::Text(text.to_string()));
        };
        match kind {
            ANNOUNCE_KIND => {
                let (file_name, index) = file_and_index(ANNOUNCE_KIND, rest)?;
                Ok(ControlMessage::Announce { file_name, index })
            }
            REQUEST_KIND => {
                let (file_name, index) = file_and_index(REQUEST_KIND, rest)?;
                Ok(ControlMessage::Request { file_name, index })
            }
            DELIVER_KIND => {
                // base64 and the index never contain the separator; the file name may.
                let (head, encoded) = rest.rsplit_once(SEP).ok_or(ControlParseError::MissingField {
                    kind: DELIVER_KIND,
                })?;
                let (file_name, index) = file_and_index(DELIVER_KIND, head)?;
                let payload = BASE64
                    .decode(encoded.trim_end())
                    .map_err(|e| ControlParseError::BadPayload(e.to_string()))?;
                Ok(ControlMessage::Deliver {
                    file_name,
                    index,
                    payload,
                })
            }
            _ => Ok(ControlMessage::Text(text.to_string())),
        }
    }

    /// Wire form.
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Announce { file_name, index } => {
                format!("{ANNOUNCE_KIND}{SEP}{file_name}{SEP}{index}")
            }
            ControlMessage::Request { file_name, index } => {
                format!("{REQUEST_KIND}{SEP}{file_name}{SEP}{index}")
            }
            ControlMessage::Deliver {
                file_name,
                index,
                payload,
            } => format!(
                "{DELIVER_KIND}{SEP}{file_name}{SEP}{index}{SEP}{}",
                BASE64.encode(payload)
            ),
            ControlMessage::Text(text) => text.clone(),
        }
    }

    pub fn is_repair(&self) -> bool {
        !matches!(self, ControlMessage::Text(_))
    }
}

fn file_and_index(kind: &'static str, rest: &str) -> Result<(String, u32), ControlParseError> {
    let (file_name, index) = rest
        .rsplit_once(SEP)
        .ok_or(ControlParseError::MissingField { kind })?;
    if file_name.is_empty() {
        return Err(ControlParseError::EmptyFileName { kind });
    }
    let index = index
        .trim()
        .parse::<u32>()
        .map_err(|_| ControlParseError::BadIndex(index.to_string()))?;
    Ok((file_name.to_string(), index))
}

/// One repair request to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub peer: IpAddr,
    pub file_name: String,
    pub index: u32,
}

impl RepairRequest {
    pub fn message(&self) -> ControlMessage {
        ControlMessage::Request {
            file_name: self.file_name.clone(),
            index: self.index,
        }
    }
}

/// One request per missing index that has at least one known holder, aimed at a holder
/// picked at random. Indices without a holder wait for a future announce.
pub fn plan_requests<R: Rng + ?Sized>(
    file_name: &str,
    missing: &BTreeSet<u32>,
    holders: &ChunkHolderIndex,
    rng: &mut R,
) -> Vec<RepairRequest> {
    missing
        .iter()
        .filter_map(|&index| {
            let candidates = holders.holders(file_name, index);
            candidates.choose(rng).map(|&peer| RepairRequest {
                peer,
                file_name: file_name.to_string(),
                index,
            })
        })
        .collect()
}

/// Spaces out repeated requests for the same chunk: after attempt `n` the next one is
/// allowed `base * 2^n` later, capped at `max`. A silent miss is retried by a later
/// planning round, possibly against another holder.
#[derive(Debug)]
pub struct RequestBackoff {
    base: Duration,
    max: Duration,
    entries: HashMap<(String, u32), (Instant, u32)>,
}

impl RequestBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            entries: HashMap::new(),
        }
    }

    /// True if a request for this chunk may go out at `now`; records the attempt.
    pub fn try_schedule(&mut self, file_name: &str, index: u32, now: Instant) -> bool {
        let key = (file_name.to_string(), index);
        let attempts = match self.entries.get(&key) {
            Some(&(next_allowed, _)) if now < next_allowed => return false,
            Some(&(_, attempts)) => attempts,
            None => 0,
        };
        let delay = self
            .base
            .checked_mul(1u32 << attempts.min(16))
            .map_or(self.max, |d| d.min(self.max));
        self.entries.insert(key, (now + delay, attempts + 1));
        true
    }

    pub fn attempts(&self, file_name: &str, index: u32) -> u32 {
        self.entries
            .get(&(file_name.to_string(), index))
            .map_or(0, |&(_, n)| n)
    }

    /// The chunk arrived; stop tracking it.
    pub fn clear(&mut self, file_name: &str, index: u32) {
        self.entries.remove(&(file_name.to_string(), index));
    }

    pub fn forget_file(&mut self, file_name: &str) {
        self.entries.retain(|(name, _), _| name != file_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn parse_known_kinds() {
        assert_eq!(
            ControlMessage::parse("CHUNK_ANNOUNCE|lecture.pdf|3").unwrap(),
            ControlMessage::Announce {
                file_name: "lecture.pdf".into(),
                index: 3
            }
        );
        assert_eq!(
            ControlMessage::parse("REQUEST_CHUNK|lecture.pdf|0").unwrap(),
            ControlMessage::Request {
                file_name: "lecture.pdf".into(),
                index: 0
            }
        );
        assert_eq!(
            ControlMessage::parse("CHUNK_DATA|lecture.pdf|1|aGVsbG8=").unwrap(),
            ControlMessage::Deliver {
                file_name: "lecture.pdf".into(),
                index: 1,
                payload: b"hello".to_vec()
            }
        );
    }

    #[test]
    fn file_names_may_contain_separator() {
        let msg = ControlMessage::Deliver {
            file_name: "a|b.txt".into(),
            index: 7,
            payload: vec![0, 1, 2, 255],
        };
        assert_eq!(ControlMessage::parse(&msg.encode()).unwrap(), msg);
        let msg = ControlMessage::Announce {
            file_name: "x|y|z".into(),
            index: 2,
        };
        assert_eq!(ControlMessage::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn unknown_text_is_plain_message() {
        for text in ["hello class", "CHUNK_ANNOUNCEMENT|soon", "NOTE|x|1", ""] {
            assert_eq!(
                ControlMessage::parse(text).unwrap(),
                ControlMessage::Text(text.to_string())
            );
        }
        assert!(!ControlMessage::Text("x".into()).is_repair());
    }

    #[test]
    fn malformed_repair_messages_are_errors() {
        assert_eq!(
            ControlMessage::parse("REQUEST_CHUNK|file"),
            Err(ControlParseError::MissingField { kind: REQUEST_KIND })
        );
        assert!(matches!(
            ControlMessage::parse("CHUNK_ANNOUNCE|file|one"),
            Err(ControlParseError::BadIndex(_))
        ));
        assert!(matches!(
            ControlMessage::parse("CHUNK_ANNOUNCE||1"),
            Err(ControlParseError::EmptyFileName { .. })
        ));
        assert!(matches!(
            ControlMessage::parse("CHUNK_DATA|file|1|!!!"),
            Err(ControlParseError::BadPayload(_))
        ));
    }

    #[test]
    fn plan_targets_one_known_holder_per_missing_index() {
        let mut holders = ChunkHolderIndex::new();
        holders.add("f", 1, ip(2));
        holders.add("f", 1, ip(3));
        holders.add("f", 4, ip(9));
        holders.add("g", 2, ip(5));
        let missing = BTreeSet::from([1, 2, 4]);

        let plan = plan_requests("f", &missing, &holders, &mut rand::thread_rng());
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].index, 1);
        assert!([ip(2), ip(3)].contains(&plan[0].peer));
        assert_eq!(plan[1].index, 4);
        assert_eq!(plan[1].peer, ip(9));
        assert_eq!(
            plan[1].message(),
            ControlMessage::Request {
                file_name: "f".into(),
                index: 4
            }
        );
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let mut b = RequestBackoff::new(Duration::from_secs(1), Duration::from_secs(3));
        let t0 = Instant::now();
        assert!(b.try_schedule("f", 1, t0));
        assert!(!b.try_schedule("f", 1, t0 + Duration::from_millis(999)));
        assert!(b.try_schedule("f", 1, t0 + Duration::from_secs(1)));
        // Second attempt waits 2s.
        assert!(!b.try_schedule("f", 1, t0 + Duration::from_secs(2)));
        assert!(b.try_schedule("f", 1, t0 + Duration::from_secs(3)));
        // Capped at 3s.
        assert!(b.try_schedule("f", 1, t0 + Duration::from_secs(6)));
        assert_eq!(b.attempts("f", 1), 4);
        // Other chunks are independent.
        assert!(b.try_schedule("f", 2, t0));
    }

    #[test]
    fn backoff_clear_and_forget() {
        let mut b = RequestBackoff::new(Duration::from_secs(60), Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(b.try_schedule("f", 1, t0));
        b.clear("f", 1);
        assert!(b.try_schedule("f", 1, t0));
        assert!(b.try_schedule("g", 0, t0));
        b.forget_file("f");
        assert_eq!(b.attempts("f", 1), 0);
        assert_eq!(b.attempts("g", 0), 1);
    }

    #[test]
    fn plan_empty_without_holders() {
        let holders = ChunkHolderIndex::new();
        let plan = plan_requests("f", &BTreeSet::from([0]), &holders, &mut rand::thread_rng());
        assert!(plan.is_empty());
    }
}
