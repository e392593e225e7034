//! Splits an agent's reply into channel-deliverable chunks bounded by a
//! maximum length, preferring to break on a paragraph, then a line, then a
//! word boundary before falling back to a hard cut.

/// Default chunk length used when a channel has no tighter limit of its own.
pub const DEFAULT_MAX_CHUNK_LEN: usize = 4_000;

/// Split `text` into chunks no longer than `max_len` bytes.
///
/// Returns an empty vector for empty input or a zero `max_len`. Splits only
/// at UTF-8 char boundaries, so no chunk can split a multi-byte character.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() || max_len == 0 {
        return Vec::new();
    }
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let split_at = best_split(remaining, max_len);
        let (head, tail) = remaining.split_at(split_at);
        let head = head.trim_end();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        remaining = tail.trim_start_matches(['\n', ' ']);
    }
    chunks
}

/// Find the best split point at or before `max_len`: a paragraph break, a
/// line break, a word boundary, or (as a last resort) the last char
/// boundary within budget.
fn best_split(text: &str, max_len: usize) -> usize {
    let window_end = max_len.min(text.len());
    let window = &text[..window_end];

    if let Some(idx) = window.rfind("\n\n") {
        return idx + 2;
    }
    if let Some(idx) = window.rfind('\n') {
        return idx + 1;
    }
    if let Some(idx) = window.rfind(' ') {
        return idx + 1;
    }

    let mut cut = window_end;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunk_text("", 100).is_empty());
        assert!(chunk_text("hello", 0).is_empty());
    }

    #[test]
    fn splits_on_paragraph_boundary_when_possible() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_text(&text, 60);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(50));
        assert_eq!(chunks[1], "b".repeat(50));
    }

    #[test]
    fn falls_back_to_word_boundary() {
        let text = "word ".repeat(50);
        let chunks = chunk_text(&text, 30);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 30);
            assert!(!chunk.starts_with(' '));
        }
    }

    #[test]
    fn never_exceeds_max_len_and_never_splits_mid_char() {
        let text = "α".repeat(200);
        let chunks = chunk_text(&text, 10);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.len() <= 10);
            assert!(chunk.chars().all(|c| c == 'α'));
        }
    }

    #[test]
    fn hard_cut_on_unbreakable_text() {
        let text = "a".repeat(100);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.len() == 10));
    }
}
