//! Splitting long replies to fit the gateway's per-message limit.
//!
//! Text is packed greedily on paragraph boundaries first, then sentence
//! boundaries, then words. A single word longer than a chunk is cut on a char
//! boundary. When more than one chunk results, each is prefixed with
//! `[i/n]\n\n`.
//!
//! Lengths are counted in chars, which is what the gateway counts.

/// Room left in each chunk for the `[i/n]\n\n` prefix.
const INDICATOR_RESERVE: usize = 25;

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Greedy packer: appends pieces with `separator` while they fit.
struct Packer {
    limit: usize,
    chunks: Vec<String>,
    current: String,
}

impl Packer {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            chunks: Vec::new(),
            current: String::new(),
        }
    }

    fn flush(&mut self) {
        let trimmed = self.current.trim();
        if !trimmed.is_empty() {
            self.chunks.push(trimmed.to_string());
        }
        self.current.clear();
    }

    /// Try to append `piece`; returns false if it does not fit even in an
    /// empty chunk.
    fn push(&mut self, piece: &str, separator: &str) -> bool {
        let piece_len = char_len(piece);
        if self.current.is_empty() {
            if piece_len > self.limit {
                return false;
            }
            self.current.push_str(piece);
            return true;
        }

        if char_len(&self.current) + char_len(separator) + piece_len <= self.limit {
            self.current.push_str(separator);
            self.current.push_str(piece);
            return true;
        }

        self.flush();
        self.push(piece, separator)
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

/// Split a paragraph into sentences, keeping terminal punctuation.
fn sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?' | '؟' | '。') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    let end = i + c.len_utf8();
                    out.push(paragraph[start..end].trim());
                    start = end;
                }
            }
        }
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out.retain(|s| !s.is_empty());
    out
}

fn hard_split(word: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars.chunks(limit.max(1)).map(|c| c.iter().collect()).collect()
}

fn pack_words(packer: &mut Packer, sentence: &str) {
    for word in sentence.split_whitespace() {
        if !packer.push(word, " ") {
            for piece in hard_split(word, packer.limit) {
                packer.push(&piece, " ");
            }
        }
    }
}

/// Split `text` so that every returned message is at most `max_len` chars,
/// indicator included.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    let text = text.trim();
    if char_len(text) <= max_len {
        return vec![text.to_string()];
    }

    let limit = max_len.saturating_sub(INDICATOR_RESERVE).max(1);
    let mut packer = Packer::new(limit);

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if packer.push(paragraph, "\n\n") {
            continue;
        }
        // Too long for a chunk of its own: start fresh and go finer
        packer.flush();
        for sentence in sentences(paragraph) {
            if !packer.push(sentence, " ") {
                packer.flush();
                pack_words(&mut packer, sentence);
            }
        }
        packer.flush();
    }

    let chunks = packer.finish();
    let total = chunks.len();
    if total <= 1 {
        return chunks;
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("[{}/{}]\n\n{}", i + 1, total, chunk))
        .collect()
}
