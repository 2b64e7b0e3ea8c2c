//! Personal dictionary: spoken-form to written-form replacement.
//!
//! Process-local, mutated through the admin endpoints, gone on exit.
//! Matching is longest-spoken-wins with Unicode-aware word boundaries.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_whole_word() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub spoken: String,
    pub written: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_whole_word")]
    pub whole_word: bool,
}

/// Key used for set membership: trimmed, case-folded spoken form
fn normalize_spoken(spoken: &str) -> String {
    spoken.trim().to_lowercase()
}

/// Thread-safe replacement dictionary. Reads vastly outnumber writes, so a
/// plain reader-writer lock fits.
pub struct PersonalDictionary {
    entries: RwLock<Vec<DictionaryEntry>>,
}

impl PersonalDictionary {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Insert an entry; an existing entry with the same normalized spoken
    /// form is updated in place, keeping its insertion rank.
    pub fn upsert(&self, entry: DictionaryEntry) {
        let key = normalize_spoken(&entry.spoken);
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| normalize_spoken(&e.spoken) == key)
        {
            *existing = entry;
        } else {
            debug!("Dictionary entry added: '{}'", entry.spoken);
            entries.push(entry);
        }
    }

    /// Remove by spoken form; true when something was removed
    pub fn remove(&self, spoken: &str) -> bool {
        let key = normalize_spoken(spoken);
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| normalize_spoken(&e.spoken) != key);
        entries.len() != before
    }

    pub fn list(&self) -> Vec<DictionaryEntry> {
        self.entries.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply all replacements to `text`, returning the rewritten text and
    /// the number of substitutions made.
    ///
    /// At each position the entry with the longest spoken form wins; equal
    /// lengths fall back to insertion order. Replacement leaves surrounding
    /// spacing untouched.
    pub fn apply(&self, text: &str) -> (String, usize) {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() || text.is_empty() {
            return (text.to_string(), 0);
        }

        let mut output = String::with_capacity(text.len());
        let mut replacements = 0usize;
        let mut pos = 0usize;

        while pos < text.len() {
            let rest = &text[pos..];
            let prev_char = text[..pos].chars().next_back();

            // Insertion order iteration makes the tie-break implicit: only a
            // strictly longer match displaces the current best.
            let mut best: Option<(usize, &DictionaryEntry)> = None;
            for entry in entries.iter() {
                if entry.whole_word && prev_char.map(is_word_joining).unwrap_or(false) {
                    continue;
                }
                if let Some(len) = match_len(rest, &entry.spoken, entry.case_sensitive) {
                    if entry.whole_word {
                        let next = rest[len..].chars().next();
                        if next.map(is_word_joining).unwrap_or(false) {
                            continue;
                        }
                    }
                    if best.map(|(l, _)| len > l).unwrap_or(true) {
                        best = Some((len, entry));
                    }
                }
            }

            match best {
                Some((len, entry)) if len > 0 => {
                    output.push_str(&entry.written);
                    replacements += 1;
                    pos += len;
                }
                _ => {
                    let ch = rest.chars().next().expect("pos is on a char boundary");
                    output.push(ch);
                    pos += ch.len_utf8();
                }
            }
        }

        (output, replacements)
    }
}

impl Default for PersonalDictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte length of `spoken` matched at the start of `text`, or None
fn match_len(text: &str, spoken: &str, case_sensitive: bool) -> Option<usize> {
    if spoken.is_empty() {
        return None;
    }
    let mut text_chars = text.char_indices();
    let mut end = 0usize;
    for spoken_char in spoken.chars() {
        let (idx, text_char) = text_chars.next()?;
        let matches = if case_sensitive {
            text_char == spoken_char
        } else {
            text_char.to_lowercase().eq(spoken_char.to_lowercase())
        };
        if !matches {
            return None;
        }
        end = idx + text_char.len_utf8();
    }
    Some(end)
}

/// Whether a character glues onto its neighbors for word-boundary purposes.
/// CJK characters stand alone, so dictionary entries can match inside CJK
/// runs while "api" still refuses to match inside "rapid".
pub fn is_word_joining(c: char) -> bool {
    c.is_alphanumeric() && !is_cjk(c)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'     // CJK Unified Ideographs
        | '\u{3400}'..='\u{4DBF}'   // CJK Extension A
        | '\u{3040}'..='\u{30FF}'   // Hiragana + Katakana
        | '\u{AC00}'..='\u{D7AF}'   // Hangul syllables
    )
}
