//! Prefix/suffix text diff and operation application.
//!
//! The diff is a single-splice heuristic: strip the longest common prefix and
//! the longest common suffix, and whatever remains in the middle is one delete
//! followed by one insert at the same index.
//!
//! ```text
//! old:  hello ␣world
//! new:  hello there ␣world
//!       └─p=6─┘      └─s=5─┘   →  Insert { index: 6, text: "there " }
//! ```
//!
//! Indices and lengths count UTF-16 code units, the unit browser editors use
//! for string offsets. A character outside the Basic Multilingual Plane (most
//! emoji) counts as two. An offset that falls between the two halves of such a
//! character cannot be applied exactly and is clamped like an out-of-range one.

use serde::{Deserialize, Serialize};

/// A single transformation of a text buffer.
///
/// Wire shape: `{"type":"insert","index":6,"text":"there "}` or
/// `{"type":"delete","index":5,"length":6}`. Missing `text`/`length`
/// fields decode as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        index: usize,
        #[serde(default)]
        text: String,
    },
    Delete {
        index: usize,
        #[serde(default)]
        length: usize,
    },
}

/// Outcome of applying an operation to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Indices were in range.
    Exact,
    /// At least one index exceeded the buffer and was clamped; the local
    /// buffer has probably drifted from the sender's.
    Clamped,
}

impl Applied {
    pub fn is_clamped(self) -> bool {
        self == Applied::Clamped
    }

    fn merge(self, other: Applied) -> Applied {
        if self.is_clamped() || other.is_clamped() {
            Applied::Clamped
        } else {
            Applied::Exact
        }
    }
}

impl Operation {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            index,
            text: text.into(),
        }
    }

    pub fn delete(index: usize, length: usize) -> Self {
        Operation::Delete { index, length }
    }

    /// UTF-16 offset the operation starts at.
    pub fn index(&self) -> usize {
        match self {
            Operation::Insert { index, .. } | Operation::Delete { index, .. } => *index,
        }
    }

    /// True for an empty insert or a zero-length delete.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert { text, .. } => text.is_empty(),
            Operation::Delete { length, .. } => *length == 0,
        }
    }

    /// Apply this operation to `buffer` in place.
    ///
    /// Never panics: indices past the end are clamped to the buffer bounds
    /// and reported as [`Applied::Clamped`].
    pub fn apply(&self, buffer: &mut String) -> Applied {
        match self {
            Operation::Insert { index, text } => {
                let (at, clamped) = byte_offset(buffer, *index);
                buffer.insert_str(at, text);
                clamped
            }
            Operation::Delete { index, length } => {
                let (start, start_clamped) = byte_offset(buffer, *index);
                let (len, end_clamped) = byte_offset(&buffer[start..], *length);
                buffer.replace_range(start..start + len, "");
                start_clamped.merge(end_clamped)
            }
        }
    }
}

/// Apply `ops` in order, returning whether any of them had to be clamped.
pub fn apply_all<'a>(
    ops: impl IntoIterator<Item = &'a Operation>,
    buffer: &mut String,
) -> Applied {
    ops.into_iter()
        .fold(Applied::Exact, |acc, op| acc.merge(op.apply(buffer)))
}

/// Compute the operations that turn `old` into `new`.
///
/// Returns at most one `Delete` followed by at most one `Insert`, both at the
/// end of the common prefix. Identical inputs produce no operations.
pub fn diff(old: &str, new: &str) -> Vec<Operation> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();

    // Scanning only past the prefix keeps p + s <= min(len(old), len(new)).
    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mut ops = Vec::with_capacity(2);
    let index = utf16_len(&old_chars[..prefix]);

    let deleted = utf16_len(&old_chars[prefix..old_chars.len() - suffix]);
    if deleted > 0 {
        ops.push(Operation::delete(index, deleted));
    }

    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    if !inserted.is_empty() {
        ops.push(Operation::insert(index, inserted));
    }

    ops
}

fn utf16_len(chars: &[char]) -> usize {
    chars.iter().map(|c| c.len_utf16()).sum()
}

/// Byte offset of the UTF-16 offset `units` in `text`.
///
/// Past the end clamps to `text.len()`. Inside a surrogate pair clamps to the
/// start of that character.
fn byte_offset(text: &str, units: usize) -> (usize, Applied) {
    let mut seen = 0;
    for (offset, ch) in text.char_indices() {
        if seen == units {
            return (offset, Applied::Exact);
        }
        seen += ch.len_utf16();
        if seen > units {
            return (offset, Applied::Clamped);
        }
    }
    if seen == units {
        (text.len(), Applied::Exact)
    } else {
        (text.len(), Applied::Clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(old: &str, new: &str) {
        let ops = diff(old, new);
        let mut buffer = old.to_string();
        let applied = apply_all(&ops, &mut buffer);
        assert_eq!(buffer, new, "diff({old:?}, {new:?}) = {ops:?}");
        assert_eq!(applied, Applied::Exact);
        assert!(ops.len() <= 2);
    }

    #[test]
    fn test_identical_strings_yield_nothing() {
        assert!(diff("hello world", "hello world").is_empty());
        assert!(diff("", "").is_empty());
    }

    #[test]
    fn test_insert_in_middle() {
        let ops = diff("hello world", "hello there world");
        assert_eq!(ops, vec![Operation::insert(6, "there ")]);
    }

    #[test]
    fn test_truncation() {
        let ops = diff("hello world", "hello");
        assert_eq!(ops, vec![Operation::delete(5, 6)]);
    }

    #[test]
    fn test_append_and_prepend() {
        assert_eq!(diff("abc", "abcdef"), vec![Operation::insert(3, "def")]);
        assert_eq!(diff("abc", "xyzabc"), vec![Operation::insert(0, "xyz")]);
        assert_eq!(diff("", "new file"), vec![Operation::insert(0, "new file")]);
    }

    #[test]
    fn test_replacement_is_delete_then_insert() {
        let ops = diff("let x = 1;", "let y = 1;");
        assert_eq!(
            ops,
            vec![Operation::delete(4, 1), Operation::insert(4, "y")]
        );
    }

    #[test]
    fn test_suffix_does_not_overlap_prefix() {
        // "aaa" -> "aa": prefix eats two chars, suffix must not count them again
        assert_eq!(diff("aaa", "aa"), vec![Operation::delete(2, 1)]);
        assert_eq!(diff("aa", "aaa"), vec![Operation::insert(2, "a")]);
        roundtrip("abab", "ab");
        roundtrip("ab", "abab");
    }

    #[test]
    fn test_clear_everything() {
        assert_eq!(diff("gone", ""), vec![Operation::delete(0, 4)]);
    }

    #[test]
    fn test_multibyte_indices_count_utf16_units() {
        let ops = diff("héllo", "héllo wörld");
        assert_eq!(ops, vec![Operation::insert(5, " wörld")]);
        roundtrip("日本語のテキスト", "日本語テキスト");
        roundtrip("emoji 🎉 here", "emoji 🎉🎉 here");
    }

    #[test]
    fn test_astral_chars_count_two_units() {
        // "🎉".length === 2 in a browser editor.
        assert_eq!(diff("🎉ab", "🎉xab"), vec![Operation::insert(2, "x")]);
        assert_eq!(diff("a🎉b", "ab"), vec![Operation::delete(1, 2)]);

        let mut buffer = String::from("🎉ab");
        assert_eq!(Operation::insert(2, "x").apply(&mut buffer), Applied::Exact);
        assert_eq!(buffer, "🎉xab");

        let mut buffer = String::from("🎉🎉b");
        assert_eq!(Operation::delete(2, 2).apply(&mut buffer), Applied::Exact);
        assert_eq!(buffer, "🎉b");
        assert_eq!(Operation::insert(3, "!").apply(&mut buffer), Applied::Exact);
        assert_eq!(buffer, "🎉b!");
    }

    #[test]
    fn test_offset_inside_surrogate_pair_is_clamped() {
        let mut buffer = String::from("a🎉b");
        let applied = Operation::insert(2, "x").apply(&mut buffer);
        assert!(applied.is_clamped());
        assert_eq!(buffer, "ax🎉b");

        let mut buffer = String::from("a🎉b");
        let applied = Operation::delete(0, 2).apply(&mut buffer);
        assert!(applied.is_clamped());
        assert_eq!(buffer, "🎉b");
    }

    #[test]
    fn test_roundtrip_interleaved_edits() {
        let cases = [
            ("fn main() {}", "fn main() {\n    println!(\"hi\");\n}"),
            ("one two three", "one 2 three"),
            ("abcdef", "azcdyf"),
            ("const a = [1, 2, 3];", "const b = [1, 3];"),
            ("x", "y"),
            ("", "x"),
        ];
        for (old, new) in cases {
            roundtrip(old, new);
            roundtrip(new, old);
        }
    }

    #[test]
    fn test_roundtrip_pseudo_random_edits() {
        // Deterministic LCG so failures reproduce.
        let mut seed: u64 = 0x5eed;
        let mut next = move |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound.max(1)
        };
        let alphabet: Vec<char> = "ab c\né🎉".chars().collect();

        let mut text = String::from("seed text");
        for _ in 0..300 {
            let mut chars: Vec<char> = text.chars().collect();
            let at = next(chars.len() + 1);
            let cut = next(4).min(chars.len() - at.min(chars.len()));
            chars.drain(at..at + cut);
            for _ in 0..next(4) {
                chars.insert(at, alphabet[next(alphabet.len())]);
            }
            let edited: String = chars.into_iter().collect();
            roundtrip(&text, &edited);
            text = edited;
        }
    }

    #[test]
    fn test_apply_sequence_reconstructs_sender() {
        let snapshots = ["", "h", "hello", "hello world", "hello brave world", "hello world!"];
        let mut receiver = String::new();
        for pair in snapshots.windows(2) {
            for op in diff(pair[0], pair[1]) {
                op.apply(&mut receiver);
            }
        }
        assert_eq!(receiver, "hello world!");
    }

    #[test]
    fn test_insert_past_end_is_clamped() {
        let mut buffer = String::from("abc");
        let applied = Operation::insert(10, "!").apply(&mut buffer);
        assert_eq!(buffer, "abc!");
        assert!(applied.is_clamped());
    }

    #[test]
    fn test_delete_past_end_is_clamped() {
        let mut buffer = String::from("abcdef");
        let applied = Operation::delete(4, 10).apply(&mut buffer);
        assert_eq!(buffer, "abcd");
        assert!(applied.is_clamped());

        let mut buffer = String::from("abc");
        let applied = Operation::delete(7, 2).apply(&mut buffer);
        assert_eq!(buffer, "abc");
        assert!(applied.is_clamped());
    }

    #[test]
    fn test_insert_at_end_is_exact() {
        let mut buffer = String::from("abc");
        assert_eq!(Operation::insert(3, "d").apply(&mut buffer), Applied::Exact);
        assert_eq!(buffer, "abcd");
    }

    #[test]
    fn test_noop_operations() {
        assert!(Operation::insert(0, "").is_noop());
        assert!(Operation::delete(3, 0).is_noop());
        assert!(!Operation::delete(3, 1).is_noop());
        assert_eq!(Operation::delete(3, 1).index(), 3);
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(Operation::insert(6, "there ")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "insert", "index": 6, "text": "there "})
        );
        let json = serde_json::to_value(Operation::delete(5, 6)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "delete", "index": 5, "length": 6}));
    }

    #[test]
    fn test_lenient_decode() {
        // Editors commonly send both fields on every op.
        let op: Operation =
            serde_json::from_str(r#"{"type":"delete","index":2,"text":"","length":3}"#).unwrap();
        assert_eq!(op, Operation::delete(2, 3));

        let op: Operation = serde_json::from_str(r#"{"type":"insert","index":0}"#).unwrap();
        assert_eq!(op, Operation::insert(0, ""));

        assert!(serde_json::from_str::<Operation>(r#"{"type":"move","index":0}"#).is_err());
        assert!(serde_json::from_str::<Operation>(r#"{"type":"insert","index":-1}"#).is_err());
    }
}
