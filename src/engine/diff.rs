use serde::{Deserialize, Serialize};

/// A single span of a text delta.
///
/// Serialized form: `{"op": "insert", "text": " world"}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", content = "text", rename_all = "lowercase")]
pub enum DiffOp {
    Equal(String),
    Insert(String),
    Delete(String),
}

impl DiffOp {
    pub fn text(&self) -> &str {
        match self {
            DiffOp::Equal(s) | DiffOp::Insert(s) | DiffOp::Delete(s) => s,
        }
    }

    pub fn is_equal(&self) -> bool {
        matches!(self, DiffOp::Equal(_))
    }
}

/// Equalities of at most this many chars between two edit runs get folded
/// into the surrounding edits during cleanup.
const SEMANTIC_FOLD_MAX: usize = 3;

/// Compute the delta between two texts as an ordered edit script.
///
/// The script covers the whole of `old`: replaying it (see
/// [`crate::engine::patch::apply`]) reproduces `new` exactly. Output is
/// cleaned up before being returned, so adjacent spans of the same kind are
/// already merged.
pub fn diff(old: &str, new: &str) -> Vec<DiffOp> {
    if old == new {
        if old.is_empty() {
            return Vec::new();
        }
        return vec![DiffOp::Equal(old.to_string())];
    }

    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();

    // Trim the unchanged ends so the edit-graph search only sees the middle.
    let prefix = common_prefix(&a, &b);
    let suffix = common_suffix(&a[prefix..], &b[prefix..]);

    let mut ops = Vec::new();
    if prefix > 0 {
        ops.push(DiffOp::Equal(a[..prefix].iter().collect()));
    }
    ops.extend(myers(&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]));
    if suffix > 0 {
        ops.push(DiffOp::Equal(a[a.len() - suffix..].iter().collect()));
    }

    cleanup(ops)
}

/// Merge adjacent spans, drop empties, surface deletes before inserts within
/// an edit run, and fold trivially short equalities into their neighbours.
pub fn cleanup(ops: Vec<DiffOp>) -> Vec<DiffOp> {
    let merged = coalesce(ops);

    // Fold short unchanged islands sandwiched between edits; a Delete+Insert
    // of the same text replays identically to an Equal.
    let mut folded = Vec::with_capacity(merged.len());
    let mut changed = false;
    for (i, op) in merged.iter().enumerate() {
        let fold = match op {
            DiffOp::Equal(s) => {
                s.chars().count() <= SEMANTIC_FOLD_MAX
                    && i > 0
                    && i + 1 < merged.len()
                    && !merged[i - 1].is_equal()
                    && !merged[i + 1].is_equal()
            }
            _ => false,
        };
        if fold {
            folded.push(DiffOp::Delete(op.text().to_string()));
            folded.push(DiffOp::Insert(op.text().to_string()));
            changed = true;
        } else {
            folded.push(op.clone());
        }
    }

    if changed {
        coalesce(folded)
    } else {
        folded
    }
}

fn coalesce(ops: Vec<DiffOp>) -> Vec<DiffOp> {
    let mut out = Vec::with_capacity(ops.len());
    let mut eq = String::new();
    let mut del = String::new();
    let mut ins = String::new();

    for op in ops {
        match op {
            DiffOp::Equal(s) => {
                if s.is_empty() {
                    continue;
                }
                if !del.is_empty() {
                    out.push(DiffOp::Delete(std::mem::take(&mut del)));
                }
                if !ins.is_empty() {
                    out.push(DiffOp::Insert(std::mem::take(&mut ins)));
                }
                eq.push_str(&s);
            }
            DiffOp::Delete(s) => {
                if !eq.is_empty() {
                    out.push(DiffOp::Equal(std::mem::take(&mut eq)));
                }
                del.push_str(&s);
            }
            DiffOp::Insert(s) => {
                if !eq.is_empty() {
                    out.push(DiffOp::Equal(std::mem::take(&mut eq)));
                }
                ins.push_str(&s);
            }
        }
    }

    if !del.is_empty() {
        out.push(DiffOp::Delete(del));
    }
    if !ins.is_empty() {
        out.push(DiffOp::Insert(ins));
    }
    if !eq.is_empty() {
        out.push(DiffOp::Equal(eq));
    }

    out
}

fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Greedy Myers shortest-edit-script search over two char slices, followed by
/// a backtrack over the recorded frontier states. Emits single-char ops; the
/// caller's cleanup pass merges them into spans.
fn myers(a: &[char], b: &[char]) -> Vec<DiffOp> {
    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }
    if a.is_empty() {
        return vec![DiffOp::Insert(b.iter().collect())];
    }
    if b.is_empty() {
        return vec![DiffOp::Delete(a.iter().collect())];
    }

    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    let offset = max;
    let mut v = vec![0isize; (2 * max + 1) as usize];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let i = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[i - 1] < v[i + 1]) {
                v[i + 1]
            } else {
                v[i - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[i] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut rev: Vec<DiffOp> = Vec::new();
    let mut x = n;
    let mut y = m;
    for d in (0..trace.len() as isize).rev() {
        let v = &trace[d as usize];
        let k = x - y;
        let i = (k + offset) as usize;
        let prev_k = if k == -d || (k != d && v[i - 1] < v[i + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            rev.push(DiffOp::Equal(a[(x - 1) as usize].to_string()));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                rev.push(DiffOp::Insert(b[(y - 1) as usize].to_string()));
                y -= 1;
            } else {
                rev.push(DiffOp::Delete(a[(x - 1) as usize].to_string()));
                x -= 1;
            }
        }
    }

    rev.reverse();
    rev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::patch::apply;

    fn roundtrip(old: &str, new: &str) {
        let d = diff(old, new);
        let rebuilt = apply(old, &d).expect("diff should replay cleanly");
        assert_eq!(rebuilt, new, "diff({old:?}, {new:?}) = {d:?}");
    }

    #[test]
    fn diff_of_identical_texts_is_one_equal_span() {
        assert_eq!(diff("hello", "hello"), vec![DiffOp::Equal("hello".into())]);
        assert_eq!(diff("", ""), Vec::<DiffOp>::new());
    }

    #[test]
    fn diff_of_pure_append() {
        assert_eq!(
            diff("hello", "hello world"),
            vec![
                DiffOp::Equal("hello".into()),
                DiffOp::Insert(" world".into())
            ]
        );
    }

    #[test]
    fn diff_of_pure_removal() {
        assert_eq!(
            diff("hello world", "hello"),
            vec![
                DiffOp::Equal("hello".into()),
                DiffOp::Delete(" world".into())
            ]
        );
    }

    #[test]
    fn diff_roundtrips_arbitrary_pairs() {
        let cases = [
            ("", "hello"),
            ("hello", ""),
            ("hello", "hello"),
            ("hello", "hallo"),
            ("the quick brown fox", "the slow brown dog"),
            ("abcdef", "fedcba"),
            ("line one\nline two\n", "line one\nline 2\nline three\n"),
            ("naïve café", "naive cafe"),
            ("αβγδ", "αγδε"),
            ("same", "completely different text"),
        ];
        for (old, new) in cases {
            roundtrip(old, new);
        }
    }

    #[test]
    fn cleanup_merges_adjacent_runs_and_drops_empties() {
        let ops = vec![
            DiffOp::Equal("ab".into()),
            DiffOp::Equal("".into()),
            DiffOp::Equal("cd".into()),
            DiffOp::Insert("x".into()),
            DiffOp::Insert("y".into()),
        ];
        assert_eq!(
            cleanup(ops),
            vec![DiffOp::Equal("abcd".into()), DiffOp::Insert("xy".into())]
        );
    }

    #[test]
    fn cleanup_orders_deletes_before_inserts() {
        let ops = vec![
            DiffOp::Insert("new".into()),
            DiffOp::Delete("old".into()),
            DiffOp::Equal("tail".into()),
        ];
        assert_eq!(
            cleanup(ops),
            vec![
                DiffOp::Delete("old".into()),
                DiffOp::Insert("new".into()),
                DiffOp::Equal("tail".into())
            ]
        );
    }

    #[test]
    fn cleanup_folds_short_equalities_between_edits() {
        let ops = vec![
            DiffOp::Delete("aaaa".into()),
            DiffOp::Insert("bbbb".into()),
            DiffOp::Equal("x".into()),
            DiffOp::Delete("cccc".into()),
            DiffOp::Insert("dddd".into()),
        ];
        assert_eq!(
            cleanup(ops),
            vec![
                DiffOp::Delete("aaaaxcccc".into()),
                DiffOp::Insert("bbbbxdddd".into())
            ]
        );
    }

    #[test]
    fn cleanup_keeps_long_equalities() {
        let ops = vec![
            DiffOp::Delete("aa".into()),
            DiffOp::Equal("unchanged middle".into()),
            DiffOp::Insert("bb".into()),
        ];
        assert_eq!(cleanup(ops.clone()), ops);
    }

    #[test]
    fn diff_output_has_no_adjacent_duplicate_tags() {
        let d = diff("the quick brown fox", "the slow brown dog");
        for w in d.windows(2) {
            assert!(
                std::mem::discriminant(&w[0]) != std::mem::discriminant(&w[1]),
                "adjacent ops of the same kind: {d:?}"
            );
        }
        roundtrip("the quick brown fox", "the slow brown dog");
    }

    #[test]
    fn diffop_wire_shape() {
        let json = serde_json::to_string(&DiffOp::Insert(" world".into())).unwrap();
        assert_eq!(json, r#"{"op":"insert","text":" world"}"#);
        let back: DiffOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DiffOp::Insert(" world".into()));
    }
}
