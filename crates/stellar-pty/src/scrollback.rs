use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Longest line kept as one entry under `Lines` before it is split.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024;

/// Unit in which scrollback capacity is counted and evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionGranularity {
    /// Each delivered output chunk is one entry. Chunks are never split.
    #[default]
    Chunks,
    /// Output is split after every `\n`; an unterminated tail keeps growing
    /// until its newline arrives or it reaches the line byte limit.
    Lines,
}

impl std::str::FromStr for EvictionGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunks" => Ok(Self::Chunks),
            "lines" => Ok(Self::Lines),
            other => Err(format!("unknown eviction granularity: {other}")),
        }
    }
}

impl std::fmt::Display for EvictionGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Chunks => "chunks",
            Self::Lines => "lines",
        })
    }
}

/// Bounded history of delivered output, oldest entries evicted first.
pub struct Scrollback {
    entries: VecDeque<Vec<u8>>,
    capacity: usize,
    granularity: EvictionGranularity,
    max_line_bytes: usize,
    /// Whether the newest entry is an unterminated line (`Lines` only).
    open_line: bool,
    bytes: usize,
}

impl Scrollback {
    pub fn new(capacity: usize, granularity: EvictionGranularity) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            granularity,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            open_line: false,
            bytes: 0,
        }
    }

    /// Cap on a single `Lines` entry. Longer lines continue in a new entry.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Append delivered bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        match self.granularity {
            EvictionGranularity::Chunks => self.push_entry(chunk.to_vec()),
            EvictionGranularity::Lines => {
                for line in chunk.split_inclusive(|&b| b == b'\n') {
                    let mut rest = line;
                    if self.open_line {
                        if let Some(tail) = self.entries.back_mut() {
                            let room = self.max_line_bytes.saturating_sub(tail.len());
                            let (head, overflow) = rest.split_at(room.min(rest.len()));
                            tail.extend_from_slice(head);
                            self.bytes += head.len();
                            rest = overflow;
                        }
                    }
                    for piece in rest.chunks(self.max_line_bytes) {
                        self.push_entry(piece.to_vec());
                    }
                    self.open_line = line.last() != Some(&b'\n');
                }
            }
        }

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    fn push_entry(&mut self, entry: Vec<u8>) {
        self.bytes += entry.len();
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn granularity(&self) -> EvictionGranularity {
        self.granularity
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Total bytes retained.
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(Vec::as_slice)
    }

    /// Copy out every retained entry, oldest first.
    pub fn dump(&self) -> Vec<Vec<u8>> {
        self.entries.iter().cloned().collect()
    }
}
