//! `ChunkEngine`: deterministic content splitting.
//!
//! Two strategies:
//!
//! * **Small content** (below `small_threshold`): plain UTF-8 text is split
//!   after each run of sentence or phrase separators, so words and short
//!   phrases become reusable chunks across similar documents. Anything that
//!   is not valid UTF-8 stays whole.
//!
//! * **Large content**: content-defined chunking with a rolling polynomial
//!   hash over a 32-byte window. A boundary is declared when the mixed hash
//!   has its low `mask` bits clear, when a repeated 16-byte pattern is seen,
//!   or when the chunk reaches `max_size`. Boundaries are nudged back onto
//!   punctuation where that keeps the chunk above `min_size`.
//!
//! JSON-looking content (first non-whitespace byte is `{`) that fits in one
//! chunk is kept whole in either case.
//!
//! The engine is a pure function of its input and config: the same bytes
//! always produce the same boundaries, and concatenating the returned slices
//! reproduces the input exactly.

use super::ChunkingConfig;

/// Rolling-hash window length in bytes.
pub const WINDOW_SIZE: usize = 32;
/// Fixed 56-bit multiplier for the rolling hash.
pub const POLYNOMIAL: u64 = 0x3D_A335_8B4D_C173;
/// Length of the repeated-pattern detector window.
pub const PATTERN_SIZE: usize = 16;
/// How far back (in window positions) a repeat is looked for.
const PATTERN_HISTORY: usize = 4 * PATTERN_SIZE;

const SENTENCE_LOOKBACK: usize = 16;
const PHRASE_LOOKBACK: usize = 8;

/// POLYNOMIAL^n, wrapping.
const fn poly_pow(n: usize) -> u64 {
    let mut acc: u64 = 1;
    let mut i = 0;
    while i < n {
        acc = acc.wrapping_mul(POLYNOMIAL);
        i += 1;
    }
    acc
}

const WINDOW_OUT: u64 = poly_pow(WINDOW_SIZE);
const PATTERN_OUT: u64 = poly_pow(PATTERN_SIZE);

fn is_sentence_end(b: u8) -> bool {
    matches!(b, b'.' | b'!' | b'?')
}

fn is_phrase_separator(b: u8) -> bool {
    matches!(b, b',' | b';' | b':' | b'-') || b.is_ascii_whitespace()
}

fn is_separator(b: u8) -> bool {
    is_sentence_end(b) || is_phrase_separator(b)
}

/// Content whose first non-whitespace byte is `{`.
pub fn looks_like_json(data: &[u8]) -> bool {
    data.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{')
}

/// Polynomial rolling hash over a fixed-size window.
#[derive(Debug, Clone, Copy)]
struct RollingHash {
    hash: u64,
    out_factor: u64,
    width: usize,
}

impl RollingHash {
    fn new(width: usize, out_factor: u64) -> Self {
        Self { hash: 0, out_factor, width }
    }

    /// Push `data[pos]` in (and drop `data[pos - width]` once the window is full).
    /// `filled` is the number of bytes pushed since the last reset, including this one.
    fn roll(&mut self, data: &[u8], pos: usize, filled: usize) {
        self.hash = self
            .hash
            .wrapping_mul(POLYNOMIAL)
            .wrapping_add(data[pos] as u64 + 1);
        if filled > self.width {
            let out = data[pos - self.width] as u64 + 1;
            self.hash = self.hash.wrapping_sub(out.wrapping_mul(self.out_factor));
        }
    }

    fn mixed(&self) -> u64 {
        self.hash ^ (self.hash >> 32)
    }
}

/// Remembers recent 16-byte windows and reports exact repeats.
#[derive(Debug)]
struct PatternDetector {
    rolling: RollingHash,
    /// `(hash, window start)` of the last `PATTERN_HISTORY` windows.
    ring: Vec<(u64, usize)>,
    next: usize,
}

impl PatternDetector {
    fn new() -> Self {
        Self {
            rolling: RollingHash::new(PATTERN_SIZE, PATTERN_OUT),
            ring: Vec::with_capacity(PATTERN_HISTORY),
            next: 0,
        }
    }

    fn reset(&mut self) {
        self.rolling.hash = 0;
        self.ring.clear();
        self.next = 0;
    }

    /// Feed `data[pos]`; true when the window ending at `pos` repeats one
    /// seen within the history.
    fn feed(&mut self, data: &[u8], pos: usize, filled: usize) -> bool {
        self.rolling.roll(data, pos, filled);
        if filled < PATTERN_SIZE {
            return false;
        }
        let start = pos + 1 - PATTERN_SIZE;
        let hash = self.rolling.hash;
        let window = &data[start..start + PATTERN_SIZE];
        let repeat = self.ring.iter().any(|&(h, s)| {
            h == hash && s != start && &data[s..s + PATTERN_SIZE] == window
        });

        if self.ring.len() < PATTERN_HISTORY {
            self.ring.push((hash, start));
        } else {
            self.ring[self.next] = (hash, start);
        }
        self.next = (self.next + 1) % PATTERN_HISTORY;
        repeat
    }
}

/// Splits content into chunks. Cheap to construct; holds only config.
#[derive(Debug, Clone, Default)]
pub struct ChunkEngine {
    config: ChunkingConfig,
}

impl ChunkEngine {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `data` into chunks. Empty input yields no chunks.
    pub fn split<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        if data.is_empty() {
            return Vec::new();
        }
        if looks_like_json(data) && data.len() <= self.config.max_size {
            return vec![data];
        }
        if data.len() < self.config.small_threshold {
            return match std::str::from_utf8(data) {
                Ok(_) => split_text(data),
                Err(_) => vec![data],
            };
        }
        self.split_content_defined(data)
    }

    /// Effective `(min, mask)` for content of `len` bytes.
    fn params(&self, len: usize) -> (usize, u64) {
        let c = &self.config;
        if len > c.large_content_threshold {
            (c.min_size.saturating_mul(4), mask_for(c.large_avg_mask_bits))
        } else {
            (c.min_size, mask_for(c.avg_mask_bits))
        }
    }

    fn split_content_defined<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        let n = data.len();
        let (min, mask) = self.params(n);
        let min = min.max(1);
        let max = self.config.max_size.max(min);

        let mut bounds: Vec<(usize, usize)> = Vec::with_capacity(n / 256 + 1);
        let mut rolling = RollingHash::new(WINDOW_SIZE, WINDOW_OUT);
        let mut patterns = PatternDetector::new();
        let mut start = 0;

        while start < n {
            rolling.hash = 0;
            patterns.reset();
            let mut cut = n;
            let mut pos = start;
            while pos < n {
                let filled = pos - start + 1;
                rolling.roll(data, pos, filled);
                let repeat = patterns.feed(data, pos, filled);
                pos += 1;

                if filled >= max {
                    cut = refine(data, start, pos, min);
                    break;
                }
                if filled >= min && (rolling.mixed() & mask == 0 || repeat) {
                    cut = refine(data, start, pos, min);
                    break;
                }
            }
            bounds.push((start, cut));
            start = cut;
        }

        // A short tail is folded into its predecessor, or rebalanced when the
        // merge would overflow `max`.
        if bounds.len() > 1 {
            let (tail_start, tail_end) = bounds[bounds.len() - 1];
            if tail_end - tail_start < min {
                bounds.pop();
                if let Some(last) = bounds.last_mut() {
                    if tail_end - last.0 <= max {
                        last.1 = tail_end;
                    } else {
                        let split = tail_end - min;
                        last.1 = split;
                        bounds.push((split, tail_end));
                    }
                }
            }
        }

        bounds.into_iter().map(|(s, e)| &data[s..e]).collect()
    }
}

fn mask_for(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Move a boundary at `cut` back onto natural punctuation if the chunk
/// `[start, new_cut)` stays at least `min` long.
fn refine(data: &[u8], start: usize, cut: usize, min: usize) -> usize {
    let floor = start + min;
    // Sentence end followed by whitespace: cut after the whitespace.
    for back in 0..SENTENCE_LOOKBACK {
        let Some(p) = cut.checked_sub(back) else { break };
        if p < floor || p < start + 2 {
            break;
        }
        if is_sentence_end(data[p - 2]) && data[p - 1].is_ascii_whitespace() {
            return p;
        }
    }
    for back in 0..PHRASE_LOOKBACK {
        let Some(p) = cut.checked_sub(back) else { break };
        if p < floor || p < start + 1 {
            break;
        }
        if is_phrase_separator(data[p - 1]) {
            return p;
        }
    }
    cut
}

/// Cut text after every run of separator bytes. Separators are ASCII, so
/// every cut lands on a UTF-8 character boundary.
fn split_text(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut seen_word = false;
    let mut i = 0;
    while i < data.len() {
        if is_separator(data[i]) {
            if seen_word {
                while i < data.len() && is_separator(data[i]) {
                    i += 1;
                }
                out.push(&data[start..i]);
                start = i;
                seen_word = false;
                continue;
            }
        } else {
            seen_word = true;
        }
        i += 1;
    }
    if start < data.len() {
        out.push(&data[start..]);
    }
    out
}
