//! Malware signatures and the strategies that look for them.
//!
//! A [`SignatureMatcher`] only answers "where are the hits in this
//! buffer". Stream handling (per-flow buffering, overlap across packet
//! boundaries, alert de-duplication) lives in [`FlowTracker`].

use crate::logger::SharedLogger;
use crate::monitor::config::MIN_NOP_SLED;
use crate::monitor::error::MonitorError;
use crate::monitor::flow::FlowTracker;

use aho_corasick::{AhoCorasick, MatchKind};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// A named byte pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub id:      String,
    pub pattern: Vec<u8>,
}

impl Signature {
    pub fn new(id: impl Into<String>, pattern: impl Into<Vec<u8>>) -> Self {
        Self { id: id.into(), pattern: pattern.into() }
    }
}

/// One hit reported by a matcher, relative to the scanned slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub id:     String,
    pub offset: usize,
    pub len:    usize,
}

/// Matching strategy.
pub trait SignatureMatcher: Send {
    /// Every occurrence of every signature in `haystack`, with offsets
    /// relative to its start. Signatures sharing a start offset (one a prefix
    /// of another) are all reported. Ordered by offset, longer hits first
    /// at equal offsets.
    ///
    /// Implementations scan the buffer once; cost is linear in the buffer
    /// plus the number of hits.
    ///
    /// # Errors
    /// [`MonitorError::Analysis`] when the buffer cannot be scanned.
    fn find_all(&self, haystack: &[u8]) -> Result<Vec<SignatureMatch>, MonitorError>;

    /// Leftmost hit in `haystack`, if any.
    ///
    /// # Errors
    /// As [`SignatureMatcher::find_all`].
    fn find(&self, haystack: &[u8]) -> Result<Option<SignatureMatch>, MonitorError> {
        Ok(self.find_all(haystack)?.into_iter().next())
    }

    /// Length of the longest pattern this matcher can report. Stream
    /// buffers keep `longest() - 1` bytes of context between packets.
    fn longest(&self) -> usize;
}

/// Sorts hits into the order promised by [`SignatureMatcher::find_all`].
fn ordered(mut hits: Vec<SignatureMatch>) -> Vec<SignatureMatch> {
    hits.sort_by(|a, b| a.offset.cmp(&b.offset).then(b.len.cmp(&a.len)));
    hits
}

// ── Plain substring scan ─────────────────────────────────────────────────────

/// Naive scan of each signature in turn. Fine for a handful of patterns.
pub struct SubstringMatcher {
    signatures: Vec<Signature>,
}

impl SubstringMatcher {
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self { signatures }
    }
}

impl SignatureMatcher for SubstringMatcher {
    fn find_all(&self, haystack: &[u8]) -> Result<Vec<SignatureMatch>, MonitorError> {
        let mut hits = Vec::new();
        for sig in &self.signatures {
            let needle = sig.pattern.as_slice();
            if needle.is_empty() || needle.len() > haystack.len() {
                continue;
            }
            hits.extend(
                haystack
                    .windows(needle.len())
                    .enumerate()
                    .filter(|(_, w)| *w == needle)
                    .map(|(offset, _)| SignatureMatch {
                        id:  sig.id.clone(),
                        offset,
                        len: needle.len(),
                    }),
            );
        }
        Ok(ordered(hits))
    }

    fn longest(&self) -> usize {
        self.signatures.iter().map(|s| s.pattern.len()).max().unwrap_or(0)
    }
}

// ── Aho-Corasick pattern set ─────────────────────────────────────────────────

/// All signatures compiled into a single automaton.
pub struct PatternSetMatcher {
    automaton:  AhoCorasick,
    signatures: Vec<Signature>,
}

impl PatternSetMatcher {
    /// # Errors
    /// [`MonitorError::Analysis`] if the automaton cannot be built (for
    /// example when the pattern set exceeds the automaton's size limits).
    pub fn new(signatures: Vec<Signature>) -> Result<Self, MonitorError> {
        // Overlapping search needs standard semantics.
        let automaton = AhoCorasick::builder()
            .match_kind(MatchKind::Standard)
            .build(signatures.iter().map(|s| &s.pattern))
            .map_err(|e| MonitorError::Analysis(format!("cannot compile signatures: {}", e)))?;
        Ok(Self { automaton, signatures })
    }
}

impl SignatureMatcher for PatternSetMatcher {
    fn find_all(&self, haystack: &[u8]) -> Result<Vec<SignatureMatch>, MonitorError> {
        let hits = self
            .automaton
            .try_find_overlapping_iter(haystack)
            .map_err(|e| MonitorError::Analysis(e.to_string()))?
            .map(|m| SignatureMatch {
                id:     self.signatures[m.pattern().as_usize()].id.clone(),
                offset: m.start(),
                len:    m.end() - m.start(),
            })
            .collect();
        Ok(ordered(hits))
    }

    fn longest(&self) -> usize {
        self.signatures.iter().map(|s| s.pattern.len()).max().unwrap_or(0)
    }
}

// ── Heuristics ───────────────────────────────────────────────────────────────

/// Reports runs of x86 NOP (`0x90`) bytes typical of shellcode sleds.
///
/// Each run of at least `min_run` NOPs yields one hit at the run's start,
/// `min_run` bytes long, however long the run is.
pub struct HeuristicMatcher {
    min_run: usize,
}

pub const NOP_SLED_ID: &str = "heuristic:nop-sled";

const NOP: u8 = 0x90;

impl HeuristicMatcher {
    pub fn new(min_run: usize) -> Self {
        Self { min_run: min_run.max(1) }
    }
}

impl Default for HeuristicMatcher {
    fn default() -> Self {
        Self::new(MIN_NOP_SLED)
    }
}

impl SignatureMatcher for HeuristicMatcher {
    fn find_all(&self, haystack: &[u8]) -> Result<Vec<SignatureMatch>, MonitorError> {
        let mut hits = Vec::new();
        let mut run = 0;
        for (i, &byte) in haystack.iter().enumerate() {
            if byte != NOP {
                run = 0;
                continue;
            }
            run += 1;
            if run == self.min_run {
                hits.push(SignatureMatch {
                    id:     NOP_SLED_ID.to_string(),
                    offset: i + 1 - run,
                    len:    self.min_run,
                });
            }
        }
        Ok(hits)
    }

    fn longest(&self) -> usize {
        self.min_run
    }
}

// ── Composition ──────────────────────────────────────────────────────────────

/// Runs several matchers over the same buffer and merges their hits.
pub struct CompositeMatcher(pub Vec<Box<dyn SignatureMatcher>>);

impl SignatureMatcher for CompositeMatcher {
    fn find_all(&self, haystack: &[u8]) -> Result<Vec<SignatureMatch>, MonitorError> {
        let mut hits = Vec::new();
        for matcher in &self.0 {
            hits.extend(matcher.find_all(haystack)?);
        }
        Ok(ordered(hits))
    }

    fn longest(&self) -> usize {
        self.0.iter().map(|m| m.longest()).max().unwrap_or(0)
    }
}

// ── Signature sets ───────────────────────────────────────────────────────────

/// Entry of a JSON signature file: exactly one of `text` or `bytes`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SignatureEntry {
    id:    String,
    #[serde(default)]
    text:  Option<String>,
    #[serde(default)]
    bytes: Option<Vec<u8>>,
}

/// Indicators shipped with the binary.
const BUILTIN: &[(&str, &str)] = &[
    ("eicar-test-file", r"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"),
    ("pe-dropper-base64", "TVqQAAMAAAAEAAAA//8AALgAAAAAAAAAQAAAAAAAAAA"),
    ("bash-reverse-shell", "bash -i >& /dev/tcp/"),
    ("mirai-busybox-probe", "/bin/busybox MIRAI"),
    ("powershell-download-cradle", "IEX (New-Object Net.WebClient).DownloadString("),
];

/// Loads and validates signature sets.
pub struct SignatureSet;

impl SignatureSet {
    pub fn builtin() -> Vec<Signature> {
        BUILTIN
            .iter()
            .map(|(id, text)| Signature::new(*id, text.as_bytes()))
            .collect()
    }

    /// Parses a JSON array of signature entries.
    ///
    /// # Errors
    /// [`MonitorError::Signatures`] on malformed JSON, an entry with neither
    /// or both of `text`/`bytes`, an empty pattern or a duplicate id.
    pub fn from_json(origin: &str, json: &str) -> Result<Vec<Signature>, MonitorError> {
        let invalid = |reason: String| MonitorError::Signatures {
            path: origin.to_string(),
            reason,
        };

        let entries: Vec<SignatureEntry> =
            serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut signatures = Vec::with_capacity(entries.len());
        for entry in entries {
            let pattern = match (entry.text, entry.bytes) {
                (Some(text), None) => text.into_bytes(),
                (None, Some(bytes)) => bytes,
                _ => return Err(invalid(format!("'{}' needs exactly one of text/bytes", entry.id))),
            };
            if pattern.is_empty() {
                return Err(invalid(format!("'{}' has an empty pattern", entry.id)));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(invalid(format!("duplicate signature id '{}'", entry.id)));
            }
            signatures.push(Signature { id: entry.id, pattern });
        }
        Ok(signatures)
    }

    /// # Errors
    /// As [`SignatureSet::from_json`], plus unreadable files.
    pub fn from_file(path: &Path) -> Result<Vec<Signature>, MonitorError> {
        let origin = path.display().to_string();
        let json = fs::read_to_string(path).map_err(|e| MonitorError::Signatures {
            path:   origin.clone(),
            reason: e.to_string(),
        })?;
        Self::from_json(&origin, &json)
    }

    /// The production matcher: the pattern set plus the NOP-sled heuristic.
    ///
    /// # Errors
    /// See [`PatternSetMatcher::new`].
    pub fn matcher(signatures: Vec<Signature>) -> Result<Box<dyn SignatureMatcher>, MonitorError> {
        Ok(Box::new(CompositeMatcher(vec![
            Box::new(PatternSetMatcher::new(signatures)?),
            Box::new(HeuristicMatcher::default()),
        ])))
    }
}

// ── Detector facade ──────────────────────────────────────────────────────────

/// Result of scanning a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVerdict {
    pub is_malware: bool,
    /// First hit of every distinct signature, in file order.
    pub details:    Vec<SignatureMatch>,
}

/// String-keyed streaming interface plus offline file scanning.
///
/// Shares the stream-buffering logic of the live TCP path, keyed by an
/// arbitrary flow identifier instead of a 4-tuple.
pub struct MalwareDetector {
    tracker: FlowTracker<String>,
}

impl MalwareDetector {
    pub fn new(matcher: Box<dyn SignatureMatcher>, window: usize, logger: SharedLogger) -> Self {
        Self { tracker: FlowTracker::new(matcher, window, logger) }
    }

    /// Feeds the next chunk of `flow_id`'s stream. Returns `true` when this
    /// chunk completed at least one signature not yet reported on the flow.
    pub fn analyze_stream(&mut self, payload: &[u8], flow_id: &str) -> bool {
        !self
            .tracker
            .ingest(flow_id.to_string(), payload, Instant::now())
            .is_empty()
    }

    /// Scans a whole file.
    ///
    /// # Errors
    /// [`MonitorError::Io`] if the file cannot be read, or
    /// [`MonitorError::Analysis`] if the matcher fails.
    pub fn analyze_file(&self, path: &Path) -> Result<FileVerdict, MonitorError> {
        let data = fs::read(path)?;
        let mut seen = HashSet::new();
        let details: Vec<SignatureMatch> = self
            .tracker
            .matcher()
            .find_all(&data)?
            .into_iter()
            .filter(|hit| seen.insert(hit.id.clone()))
            .collect();

        Ok(FileVerdict { is_malware: !details.is_empty(), details })
    }
}
