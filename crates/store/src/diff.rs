use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Field-level change counts between two resource specs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Count leaf-level differences taking `base` to `target`.
/// Arrays compare by position; a type change counts as one update.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    let mut sum = DiffSummary::default();
    walk(target, base, &mut sum);
    sum
}

fn walk(target: &Json, base: &Json, sum: &mut DiffSummary) {
    if target == base {
        return;
    }
    match (target, base) {
        (Json::Object(t), Json::Object(b)) => {
            for (k, tv) in t {
                match b.get(k) {
                    Some(bv) => walk(tv, bv, sum),
                    None => sum.adds += 1,
                }
            }
            sum.removes += b.keys().filter(|k| !t.contains_key(*k)).count();
        }
        (Json::Array(t), Json::Array(b)) => {
            for (tv, bv) in t.iter().zip(b.iter()) {
                if tv != bv {
                    sum.updates += 1;
                }
            }
            sum.adds += t.len().saturating_sub(b.len());
            sum.removes += b.len().saturating_sub(t.len());
        }
        (t, Json::Null) if !t.is_null() => sum.adds += 1,
        (Json::Null, _) => sum.removes += 1,
        _ => sum.updates += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3], "gone": true });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        // adds: b.y, d; updates: a, c[1]; removes: c[2], gone
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 2 });
    }

    #[test]
    fn fresh_spec_against_nothing() {
        let s = diff_summary(&serde_json::json!({ "a": 1 }), &Json::Null);
        assert_eq!(s.adds, 1);
        assert!(diff_summary(&Json::Null, &Json::Null).is_empty());
    }
}
