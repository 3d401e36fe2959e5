//! Line diff between two text blobs. Pure: no filesystem, no shared state.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub rendered: String,
    pub additions: usize,
    pub removals: usize,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.removals == 0
    }
}

/// Unified diff of `old` against `new`, labeled with `path` in the header.
/// Equal inputs yield an empty rendering and zero counts.
pub fn generate_diff(old: &str, new: &str, path: &str) -> FileDiff {
    let diff = TextDiff::from_lines(old, new);

    let mut additions = 0;
    let mut removals = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => removals += 1,
            ChangeTag::Equal => {}
        }
    }

    let rendered = if additions == 0 && removals == 0 {
        String::new()
    } else {
        diff.unified_diff()
            .context_radius(3)
            .header(&format!("a/{path}"), &format!("b/{path}"))
            .to_string()
    };

    FileDiff {
        rendered,
        additions,
        removals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_input_is_a_no_op() {
        let diff = generate_diff("fn main() {}\n", "fn main() {}\n", "src/main.rs");
        assert!(diff.is_empty());
        assert_eq!(diff.rendered, "");
        assert_eq!(diff.additions, 0);
        assert_eq!(diff.removals, 0);
    }

    #[test]
    fn counts_added_and_removed_lines() {
        let old = "one\ntwo\nthree\n";
        let new = "one\n2\nthree\nfour\n";
        let diff = generate_diff(old, new, "notes.txt");
        assert_eq!(diff.additions, 2); // "2" and "four"
        assert_eq!(diff.removals, 1); // "two"
        assert!(diff.rendered.contains("--- a/notes.txt"));
        assert!(diff.rendered.contains("+++ b/notes.txt"));
        assert!(diff.rendered.contains("-two"));
        assert!(diff.rendered.contains("+2"));
    }

    #[test]
    fn new_file_counts_every_line_as_added() {
        let diff = generate_diff("", "hello\n", "notes.txt");
        assert_eq!(diff.additions, 1);
        assert_eq!(diff.removals, 0);
        assert!(diff.rendered.contains("+hello"));
    }

    #[test]
    fn deterministic_across_calls() {
        let a = generate_diff("alpha\nbeta\n", "alpha\ngamma\n", "f");
        let b = generate_diff("alpha\nbeta\n", "alpha\ngamma\n", "f");
        assert_eq!(a.rendered, b.rendered);
        assert_eq!(a.additions, b.additions);
        assert_eq!(a.removals, b.removals);
    }

    #[test]
    fn empty_counts_iff_empty_rendering_iff_equal_content() {
        let cases = [
            ("", ""),
            ("same\n", "same\n"),
            ("a\n", "b\n"),
            ("a\nb\n", "a\n"),
            ("", "fresh\n"),
        ];
        for (old, new) in cases {
            let diff = generate_diff(old, new, "case");
            let zero = diff.additions + diff.removals == 0;
            assert_eq!(zero, diff.rendered.is_empty(), "case {old:?} -> {new:?}");
            assert_eq!(zero, old == new, "case {old:?} -> {new:?}");
        }
    }

    #[test]
    fn handles_missing_trailing_newline() {
        let diff = generate_diff("line", "line\nmore", "f");
        assert!(diff.additions >= 1);
        assert!(!diff.rendered.is_empty());
    }
}
