//! Citation markers in generated text
//!
//! Recognizes `[1]`, `[1, 2]` and `[[1]]`. Markers inside fenced code blocks
//! are left alone.

use regex_lite::Regex;
use std::sync::OnceLock;

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[\[(\d+)\]\]|\[(\d+(?:, ?\d+)*)\]").expect("citation pattern is valid")
    })
}

/// Byte ranges of fenced code blocks; an unterminated fence runs to the end
fn code_fences(text: &str) -> Vec<(usize, usize)> {
    let mut fences = Vec::new();
    let mut open: Option<usize> = None;
    let mut search_from = 0;

    while let Some(pos) = text[search_from..].find("```") {
        let at = search_from + pos;
        match open.take() {
            Some(start) => fences.push((start, at + 3)),
            None => open = Some(at),
        }
        search_from = at + 3;
    }
    if let Some(start) = open {
        fences.push((start, text.len()));
    }
    fences
}

/// A marker found in text, with the numbers it cites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub start: usize,
    pub end: usize,
    pub numbers: Vec<usize>,
}

/// All citation markers outside code fences, in text order
pub fn find_markers(text: &str) -> Vec<Marker> {
    let fences = code_fences(text);
    let in_fence = |pos: usize| fences.iter().any(|&(s, e)| pos >= s && pos < e);

    marker_pattern()
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            if in_fence(whole.start()) {
                return None;
            }
            let digits = cap.get(1).or_else(|| cap.get(2))?.as_str();
            let numbers = digits
                .split(',')
                .filter_map(|n| n.trim().parse::<usize>().ok())
                .collect();
            Some(Marker { start: whole.start(), end: whole.end(), numbers })
        })
        .collect()
}

/// Rewrite every marker through `map`.
///
/// Each cited number becomes its own `[m]` where `map(n) = Some(m)`; numbers
/// mapping to `None` are removed. Returns the new text plus the byte offset
/// and number of every marker written, in order.
pub fn rewrite_markers<F>(text: &str, mut map: F) -> (String, Vec<(usize, usize)>)
where
    F: FnMut(usize) -> Option<usize>,
{
    let mut out = String::with_capacity(text.len());
    let mut written = Vec::new();
    let mut cursor = 0;

    for marker in find_markers(text) {
        out.push_str(&text[cursor..marker.start]);
        for n in marker.numbers {
            if let Some(m) = map(n) {
                written.push((out.len(), m));
                out.push_str(&format!("[{}]", m));
            }
        }
        cursor = marker.end;
    }
    out.push_str(&text[cursor..]);

    (out, written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_forms() {
        let markers = find_markers("A [1]. B [2, 3]. C [[4]]. D [5,6].");
        let numbers: Vec<_> = markers.iter().map(|m| m.numbers.clone()).collect();
        assert_eq!(numbers, vec![vec![1], vec![2, 3], vec![4], vec![5, 6]]);
    }

    #[test]
    fn test_code_fence_ignored() {
        let text = "See [1].\n```\nlet x = arr[2];\n```\nAlso [3]";
        let numbers: Vec<_> = find_markers(text).into_iter().flat_map(|m| m.numbers).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn test_unterminated_fence() {
        let text = "Cited [1]\n```\n[2]";
        assert_eq!(find_markers(text).len(), 1);
    }

    #[test]
    fn test_rewrite_splits_and_drops() {
        let (text, written) = rewrite_markers("Refunds [1, 2] apply [[3]].", |n| (n != 2).then_some(n + 10));
        assert_eq!(text, "Refunds [11] apply [13].");
        assert_eq!(written, vec![(8, 11), (19, 13)]);
        assert_eq!(&text[8..12], "[11]");
    }

    #[test]
    fn test_rewrite_without_markers() {
        let (text, written) = rewrite_markers("no citations here", |n| Some(n));
        assert_eq!(text, "no citations here");
        assert!(written.is_empty());
    }

    #[test]
    fn test_non_citation_brackets_untouched() {
        let (text, _) = rewrite_markers("[note] and [a1]", |_| None);
        assert_eq!(text, "[note] and [a1]");
    }
}
