/// Outputs larger than this are not diffed line by line.
pub const DIFF_SIZE_CAP: usize = 59_999;

/// Stored in place of the diff when either output exceeds the cap.
pub const DIFF_TOO_LONG: &str = "too long to diff; please check manually";

/// Line diff of two captured outputs for bug records.
///
/// Unchanged lines are prefixed with two spaces, lines only in `left` with
/// `- `, lines only in `right` with `+ `. Invalid UTF-8 degrades lossily;
/// the diff is operator-facing material, not a byte-exact artifact.
pub fn diff_outputs(left: &[u8], right: &[u8]) -> String {
    if left.len() > DIFF_SIZE_CAP || right.len() > DIFF_SIZE_CAP {
        return DIFF_TOO_LONG.to_string();
    }
    let left = String::from_utf8_lossy(left);
    let right = String::from_utf8_lossy(right);
    let a: Vec<&str> = left.lines().collect();
    let b: Vec<&str> = right.lines().collect();

    // Longest-common-subsequence table, suffix oriented.
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            push_line(&mut out, "  ", a[i]);
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            // Deletions before insertions on ties.
            push_line(&mut out, "- ", a[i]);
            i += 1;
        } else {
            push_line(&mut out, "+ ", b[j]);
            j += 1;
        }
    }
    while i < a.len() {
        push_line(&mut out, "- ", a[i]);
        i += 1;
    }
    while j < b.len() {
        push_line(&mut out, "+ ", b[j]);
        j += 1;
    }
    out
}

fn push_line(out: &mut String, prefix: &str, line: &str) {
    out.push_str(prefix);
    out.push_str(line);
    out.push('\n');
}
