//! Marker-delimited blocks inside arbitrary text files.
//!
//! Both operations work on lines. Everything outside the first
//! begin/end pair is kept as is, including whether the file ended with a
//! newline, so inserting and then deleting a block gives back the
//! original bytes.

struct Lines<'a> {
    lines: Vec<&'a str>,
    trailing_newline: bool,
}

impl<'a> Lines<'a> {
    fn split(content: &'a str) -> Self {
        if content.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: true,
            };
        }
        let trailing_newline = content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(content);
        Self {
            lines: body.split('\n').collect(),
            trailing_newline,
        }
    }

    fn position(&self, marker: &str, from: usize) -> Option<usize> {
        self.lines
            .iter()
            .skip(from)
            .position(|line| line.trim_end_matches('\r') == marker)
            .map(|i| i + from)
    }

    /// Begin index and, if the block is terminated, end index.
    fn find_block(&self, begin: &str, end: &str) -> Option<(usize, Option<usize>)> {
        let b = self.position(begin, 0)?;
        Some((b, self.position(end, b + 1)))
    }

    fn join(lines: &[&str], trailing_newline: bool) -> String {
        if lines.is_empty() {
            return String::new();
        }
        let mut out = lines.join("\n");
        if trailing_newline {
            out.push('\n');
        }
        out
    }
}

fn block_lines(block: &str) -> Vec<&str> {
    let block = block.trim_end_matches('\n');
    if block.is_empty() {
        Vec::new()
    } else {
        block.split('\n').collect()
    }
}

/// Returns `content` with `block` between `begin` and `end`.
///
/// - terminated block: the lines between the markers are replaced
/// - begin without end: everything after the begin marker is taken as the
///   stale block and replaced, then the end marker is appended
/// - no begin marker: begin, block and end are appended
pub fn insert_block(content: &str, begin: &str, end: &str, block: &str) -> String {
    let parsed = Lines::split(content);
    let new_block = block_lines(block);
    let mut out: Vec<&str> = Vec::with_capacity(parsed.lines.len() + new_block.len() + 2);

    match parsed.find_block(begin, end) {
        Some((b, Some(e))) => {
            out.extend_from_slice(&parsed.lines[..=b]);
            out.extend_from_slice(&new_block);
            out.extend_from_slice(&parsed.lines[e..]);
        }
        Some((b, None)) => {
            out.extend_from_slice(&parsed.lines[..=b]);
            out.extend_from_slice(&new_block);
            out.push(end);
        }
        None => {
            out.extend_from_slice(&parsed.lines);
            out.push(begin);
            out.extend_from_slice(&new_block);
            out.push(end);
        }
    }

    Lines::join(&out, parsed.trailing_newline)
}

/// Removes the first block including its markers. An unterminated block
/// is removed up to the end of the file. Without a begin marker the
/// content comes back unchanged.
pub fn delete_block(content: &str, begin: &str, end: &str) -> String {
    let parsed = Lines::split(content);
    let (b, e) = match parsed.find_block(begin, end) {
        Some((b, Some(e))) => (b, e + 1),
        Some((b, None)) => (b, parsed.lines.len()),
        None => return content.to_string(),
    };

    let mut out: Vec<&str> = Vec::with_capacity(parsed.lines.len());
    out.extend_from_slice(&parsed.lines[..b]);
    out.extend_from_slice(&parsed.lines[e..]);
    Lines::join(&out, parsed.trailing_newline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BEGIN: &str = "BEGIN";
    const END: &str = "END";

    #[test]
    fn test_insert_into_file_without_markers() {
        assert_eq!(
            insert_block("line0\nline1\n", BEGIN, END, "new"),
            "line0\nline1\nBEGIN\nnew\nEND\n"
        );
    }

    #[test]
    fn test_insert_into_empty_file() {
        assert_eq!(insert_block("", BEGIN, END, "a\nb"), "BEGIN\na\nb\nEND\n");
    }

    #[test]
    fn test_replace_existing_block() {
        let content = "line0\nBEGIN\nold1\nold2\nEND\nline9\n";
        assert_eq!(
            insert_block(content, BEGIN, END, "new"),
            "line0\nBEGIN\nnew\nEND\nline9\n"
        );
    }

    #[test]
    fn test_unterminated_block_is_closed() {
        let content = "line0\nline1\nBEGIN\nline11";
        assert_eq!(
            insert_block(content, BEGIN, END, "line11"),
            "line0\nline1\nBEGIN\nline11\nEND"
        );
    }

    #[test]
    fn test_unterminated_block_drops_stale_tail() {
        let content = "keep\nBEGIN\nstale1\nstale2\n";
        let out = insert_block(content, BEGIN, END, "fresh");
        assert_eq!(out, "keep\nBEGIN\nfresh\nEND\n");
        assert_eq!(out.matches("BEGIN").count(), 1);
        assert_eq!(out.matches("END").count(), 1);
    }

    #[test]
    fn test_only_first_block_is_touched() {
        let content = "BEGIN\na\nEND\nBEGIN\nb\nEND\n";
        assert_eq!(
            insert_block(content, BEGIN, END, "x"),
            "BEGIN\nx\nEND\nBEGIN\nb\nEND\n"
        );
        assert_eq!(delete_block(content, BEGIN, END), "BEGIN\nb\nEND\n");
    }

    #[test]
    fn test_end_before_begin_is_ignored() {
        let content = "END\nfoo\nBEGIN\nbar\nEND\n";
        assert_eq!(
            insert_block(content, BEGIN, END, "x"),
            "END\nfoo\nBEGIN\nx\nEND\n"
        );
    }

    #[test]
    fn test_crlf_markers_match() {
        let content = "a\r\nBEGIN\r\nold\r\nEND\r\nb\r\n";
        assert_eq!(delete_block(content, BEGIN, END), "a\r\nb\r\n");
    }

    #[test]
    fn test_block_trailing_newline_is_ignored() {
        assert_eq!(
            insert_block("x\n", BEGIN, END, "y\n"),
            insert_block("x\n", BEGIN, END, "y")
        );
    }

    #[test]
    fn test_delete_without_markers_is_noop() {
        assert_eq!(delete_block("a\nb", BEGIN, END), "a\nb");
    }

    #[test]
    fn test_delete_unterminated_to_eof() {
        assert_eq!(delete_block("a\nBEGIN\nb\nc\n", BEGIN, END), "a\n");
    }

    #[test]
    fn test_delete_whole_file_block() {
        assert_eq!(delete_block("BEGIN\nb\nEND\n", BEGIN, END), "");
    }

    #[test]
    fn test_insert_then_delete_restores_original() {
        for original in ["", "a", "a\n", "a\nb\n\n", "# comment\n127.0.0.1 localhost\n"] {
            let inserted = insert_block(original, BEGIN, END, "10.0.0.1 db\n10.0.0.2 cache");
            assert_eq!(delete_block(&inserted, BEGIN, END), original, "original: {:?}", original);
        }
    }

    proptest! {
        #[test]
        fn prop_insert_is_idempotent(
            lines in proptest::collection::vec("[a-z0-9 ]{0,12}", 0..8),
            block in proptest::collection::vec("[a-z0-9 ]{0,12}", 0..4),
            trailing in any::<bool>(),
        ) {
            let mut original = lines.join("\n");
            if trailing && !original.is_empty() {
                original.push('\n');
            }
            let block = block.join("\n");

            let once = insert_block(&original, BEGIN, END, &block);
            let twice = insert_block(&once, BEGIN, END, &block);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(delete_block(&once, BEGIN, END), original);
        }
    }
}
