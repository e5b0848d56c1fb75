//! Unified diffs between two line sequences.
//!
//! The algorithm is a black box behind [`DiffEngine`]; the store only supplies
//! the two resolved revisions and forwards the output verbatim.

use similar::{ChangeTag, DiffOp, DiffTag, TextDiff};

pub trait DiffEngine: Send + Sync {
    /// Unified-diff lines turning `lines_a` into `lines_b`, with `context`
    /// unchanged lines around each hunk. Identical inputs yield no lines.
    fn diff(
        &self,
        name_a: &str,
        lines_a: &[String],
        name_b: &str,
        lines_b: &[String],
        context: usize,
    ) -> Vec<String>;
}

/// Default engine, backed by `similar` (Myers diff).
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedDiff;

impl DiffEngine for UnifiedDiff {
    fn diff(
        &self,
        name_a: &str,
        lines_a: &[String],
        name_b: &str,
        lines_b: &[String],
        context: usize,
    ) -> Vec<String> {
        let old: Vec<&str> = lines_a.iter().map(String::as_str).collect();
        let new: Vec<&str> = lines_b.iter().map(String::as_str).collect();
        let diff = TextDiff::from_slices(&old, &new);
        if diff.ops().iter().all(|op| op.tag() == DiffTag::Equal) {
            return Vec::new();
        }

        let mut out = vec![format!("--- {name_a}"), format!("+++ {name_b}")];
        for group in diff.grouped_ops(context) {
            out.push(hunk_header(&group));
            for op in &group {
                for change in diff.iter_changes(op) {
                    let sign = match change.tag() {
                        ChangeTag::Equal => ' ',
                        ChangeTag::Delete => '-',
                        ChangeTag::Insert => '+',
                    };
                    out.push(format!("{sign}{}", change.value()));
                }
            }
        }
        out
    }
}

fn hunk_header(group: &[DiffOp]) -> String {
    let (Some(first), Some(last)) = (group.first(), group.last()) else {
        return "@@ -0,0 +0,0 @@".to_string();
    };
    let old = first.old_range().start..last.old_range().end;
    let new = first.new_range().start..last.new_range().end;
    format!(
        "@@ -{} +{} @@",
        hunk_range(old.start, old.len()),
        hunk_range(new.start, new.len())
    )
}

/// `start,len` in unified-diff form (1-based; an empty range names the line
/// before it).
fn hunk_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{len}", start + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn run(a: &str, b: &str) -> Vec<String> {
        UnifiedDiff.diff("a", &lines(a), "b", &lines(b), 3)
    }

    #[test]
    fn test_identical_inputs_produce_nothing() {
        assert!(run("x\ny\n", "x\ny\n").is_empty());
        assert!(run("", "").is_empty());
    }

    #[test]
    fn test_single_line_change() {
        let out = run("one\ntwo\nthree\n", "one\n2\nthree\n");
        assert_eq!(
            out,
            vec!["--- a", "+++ b", "@@ -1,3 +1,3 @@", " one", "-two", "+2", " three"]
        );
    }

    #[test]
    fn test_swapped_inputs_mirror_each_other() {
        let a = "alpha\nbeta\ngamma\ndelta\n";
        let b = "alpha\nBETA\ngamma\nepsilon\ndelta\n";
        let forward = run(a, b);
        let backward = run(b, a);
        assert_eq!(forward.len(), backward.len());

        let count = |out: &[String], sign: char| {
            out.iter()
                .skip(2)
                .filter(|l| l.starts_with(sign) && !l.starts_with("@@"))
                .count()
        };
        assert_eq!(count(&forward, '+'), count(&backward, '-'));
        assert_eq!(count(&forward, '-'), count(&backward, '+'));
    }

    #[test]
    fn test_context_limits_hunks() {
        let a: Vec<String> = (1..=20).map(|i| i.to_string()).collect();
        let mut b = a.clone();
        b[1] = "two".to_string();
        b[18] = "nineteen".to_string();
        let out = UnifiedDiff.diff("a", &a, "b", &b, 1);
        let hunks = out.iter().filter(|l| l.starts_with("@@")).count();
        assert_eq!(hunks, 2);
    }

    #[test]
    fn test_insert_into_empty() {
        let out = run("", "new\n");
        assert_eq!(out, vec!["--- a", "+++ b", "@@ -0,0 +1 @@", "+new"]);
    }
}
