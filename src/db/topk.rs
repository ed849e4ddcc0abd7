//! Partial top-K selection over a score vector.

/// Modified bubble pass placing the `k` largest scores, in descending order,
/// at the front of both slices. Positions beyond `k` are left unspecified.
///
/// Each outer pass walks from the high end down, swapping adjacent pairs when
/// the later score is strictly greater; equal scores keep the earlier index
/// first. `O(k * n)`, which beats a full sort for the small `k` a similarity
/// query asks for.
pub fn partial_top_k(indices: &mut [usize], scores: &mut [f32], k: usize) {
    debug_assert_eq!(indices.len(), scores.len());
    let n = scores.len();
    let k = k.min(n);
    for i in 0..k {
        for j in ((i + 1)..n).rev() {
            if scores[j] > scores[j - 1] {
                scores.swap(j, j - 1);
                indices.swap(j, j - 1);
            }
        }
    }
}
