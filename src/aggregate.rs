//! Cross-database result aggregation: global ranking, duplicate-SMILES
//! collapsing, and truncation to the requested budget.

use std::collections::HashMap;

/// Separator joining the identifiers of results that share a SMILES.
pub const ID_SEPARATOR: &str = ";:;";

/// One database hit entering aggregation; borrows the database's arrays.
#[derive(Debug, Clone, Copy)]
pub struct DbHit<'a> {
    pub score: f32,
    pub smiles: &'a str,
    pub id: &'a str,
}

/// The final, owned result set for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResults {
    pub smiles: Vec<String>,
    pub ids: Vec<String>,
    pub scores: Vec<f32>,
    pub approximate_total: u64,
}

impl QueryResults {
    pub fn len(&self) -> usize {
        self.smiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.smiles.is_empty()
    }
}

/// Merge per-database hits into one ranked list.
///
/// Hits sort by descending score with ties broken by `(smiles, id)`
/// ascending, making the output deterministic regardless of database
/// iteration order. Hits sharing a SMILES then collapse into a single entry
/// at the first-seen position whose identifier is the `;:;`-join of every
/// constituent id in that order. Truncation to `k` happens after collapsing.
pub fn merge(mut hits: Vec<DbHit<'_>>, k: usize, approximate_total: u64) -> QueryResults {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.smiles.cmp(b.smiles))
            .then_with(|| a.id.cmp(b.id))
    });

    let mut slot_of: HashMap<&str, usize> = HashMap::with_capacity(hits.len());
    let mut entries: Vec<(f32, &str, Vec<&str>)> = Vec::with_capacity(hits.len());
    for hit in &hits {
        match slot_of.get(hit.smiles) {
            Some(&slot) => entries[slot].2.push(hit.id),
            None => {
                slot_of.insert(hit.smiles, entries.len());
                entries.push((hit.score, hit.smiles, vec![hit.id]));
            }
        }
    }
    entries.truncate(k);

    let mut results = QueryResults {
        smiles: Vec::with_capacity(entries.len()),
        ids: Vec::with_capacity(entries.len()),
        scores: Vec::with_capacity(entries.len()),
        approximate_total,
    };
    for (score, smiles, ids) in entries {
        results.scores.push(score);
        results.smiles.push(smiles.to_string());
        results.ids.push(ids.join(ID_SEPARATOR));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit<'a>(score: f32, smiles: &'a str, id: &'a str) -> DbHit<'a> {
        DbHit { score, smiles, id }
    }

    #[test]
    fn sorts_descending_with_lexicographic_tiebreak() {
        let results = merge(
            vec![
                hit(0.5, "sE", "E"),
                hit(0.9, "sB", "B"),
                hit(0.5, "sC", "C"),
                hit(0.5, "sC", "A"),
            ],
            10,
            4,
        );
        assert_eq!(results.smiles, vec!["sB", "sC", "sE"]);
        assert_eq!(results.ids, vec!["B", "A;:;C", "E"]);
        assert_eq!(results.scores, vec![0.9, 0.5, 0.5]);
        assert_eq!(results.approximate_total, 4);
    }

    #[test]
    fn duplicate_smiles_collapse_with_joined_ids() {
        let results = merge(
            vec![
                hit(1.0, "CCO", "X"),
                hit(1.0, "CCO", "X"),
                hit(0.7, "CCN", "Y"),
            ],
            10,
            3,
        );
        assert_eq!(results.smiles, vec!["CCO", "CCN"]);
        assert_eq!(results.ids, vec!["X;:;X", "Y"]);
        // SMILES strings are unique in the output.
        let mut unique = results.smiles.clone();
        unique.dedup();
        assert_eq!(unique.len(), results.smiles.len());
    }

    #[test]
    fn truncates_after_collapsing() {
        let results = merge(
            vec![
                hit(0.9, "a", "1"),
                hit(0.9, "a", "2"),
                hit(0.8, "b", "3"),
                hit(0.7, "c", "4"),
            ],
            2,
            4,
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results.smiles, vec!["a", "b"]);
        assert_eq!(results.ids, vec!["1;:;2", "3"]);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let results = merge(Vec::new(), 5, 0);
        assert!(results.is_empty());
        assert_eq!(results.approximate_total, 0);
    }

    #[test]
    fn identical_inputs_merge_identically() {
        let hits = vec![
            hit(0.6, "m", "1"),
            hit(0.6, "n", "2"),
            hit(0.4, "o", "3"),
        ];
        let a = merge(hits.clone(), 3, 3);
        let b = merge(hits, 3, 3);
        assert_eq!(a, b);
    }
}
