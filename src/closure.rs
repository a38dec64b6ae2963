//! Transitive closure over a successor function.
//!
//! The closure is a worklist fixpoint: pop an item, ask for its successors,
//! keep the ones not seen before. Each item is yielded once, so cycles
//! terminate. Seeds are not part of the result unless requested or reached
//! again through the relation.
//!
//! The successor function is fallible because the rewriter's relations read
//! dependency records from disk.

use std::collections::HashSet;
use std::convert::Infallible;
use std::hash::Hash;

/// Everything reachable from `seed` in one or more steps, in discovery order.
/// With `include_seed`, the seed comes first.
pub fn transitive<T, I, F>(relation: F, seed: T, include_seed: bool) -> Vec<T>
where
    T: Clone + Eq + Hash,
    F: FnMut(&T) -> I,
    I: IntoIterator<Item = T>,
{
    transitive_from_many(relation, [seed], include_seed)
}

/// Like [`transitive`] with several seeds.
pub fn transitive_from_many<T, I, F, S>(mut relation: F, seeds: S, include_seeds: bool) -> Vec<T>
where
    T: Clone + Eq + Hash,
    F: FnMut(&T) -> I,
    I: IntoIterator<Item = T>,
    S: IntoIterator<Item = T>,
{
    let result: Result<Vec<T>, Infallible> =
        try_transitive_from_many(|x| Ok(relation(x)), seeds, include_seeds);
    match result {
        Ok(items) => items,
        Err(never) => match never {},
    }
}

/// Fallible single-seed closure; the first error from `relation` aborts.
pub fn try_transitive<T, I, E, F>(relation: F, seed: T, include_seed: bool) -> Result<Vec<T>, E>
where
    T: Clone + Eq + Hash,
    F: FnMut(&T) -> Result<I, E>,
    I: IntoIterator<Item = T>,
{
    try_transitive_from_many(relation, [seed], include_seed)
}

/// Fallible multi-seed closure.
pub fn try_transitive_from_many<T, I, E, F, S>(
    mut relation: F,
    seeds: S,
    include_seeds: bool,
) -> Result<Vec<T>, E>
where
    T: Clone + Eq + Hash,
    F: FnMut(&T) -> Result<I, E>,
    I: IntoIterator<Item = T>,
    S: IntoIterator<Item = T>,
{
    let mut seen: HashSet<T> = HashSet::new();
    let mut result = Vec::new();
    let mut pending = Vec::new();

    for seed in seeds {
        if include_seeds && seen.insert(seed.clone()) {
            result.push(seed.clone());
        }
        pending.push(seed);
    }

    while let Some(item) = pending.pop() {
        for next in relation(&item)? {
            if seen.insert(next.clone()) {
                result.push(next.clone());
                pending.push(next);
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn cycle_mod_three_reaches_every_node() {
        let reached: BTreeSet<u32> = transitive(|x| [(x + 1) % 3], 0, false).into_iter().collect();
        assert_eq!(reached, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn seed_excluded_unless_reached() {
        let reached = transitive(|x: &u32| if *x < 3 { vec![x + 1] } else { vec![] }, 0, false);
        assert_eq!(reached, vec![1, 2, 3]);
    }

    #[test]
    fn include_seed_puts_it_first() {
        let reached = transitive(|x: &u32| if *x < 2 { vec![x + 1] } else { vec![] }, 0, true);
        assert_eq!(reached, vec![0, 1, 2]);
    }

    #[test]
    fn substrings_of_abcd() {
        let drop_one_end = |s: &String| {
            if s.is_empty() {
                vec![]
            } else {
                vec![s[1..].to_string(), s[..s.len() - 1].to_string()]
            }
        };
        let reached: BTreeSet<String> = transitive(drop_one_end, "abcd".to_string(), true)
            .into_iter()
            .collect();

        let expected: BTreeSet<String> = [
            "abcd", "abc", "bcd", "ab", "bc", "cd", "a", "b", "c", "d", "",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(reached.len(), 11);
        assert_eq!(reached, expected);
    }

    #[test]
    fn results_have_no_duplicates() {
        let reached = transitive(|x: &u32| [x / 2, x / 3], 100, false);
        let unique: BTreeSet<u32> = reached.iter().copied().collect();
        assert_eq!(reached.len(), unique.len());
    }

    #[test]
    fn many_seeds_share_one_visited_set() {
        let reached: BTreeSet<u32> =
            transitive_from_many(|x: &u32| if *x > 0 { vec![x - 1] } else { vec![] }, [2, 5], false)
                .into_iter()
                .collect();
        // 2 is reached again from 5, so it is part of the result
        assert_eq!(reached, BTreeSet::from([0, 1, 2, 3, 4]));
    }

    #[test]
    fn relation_error_aborts_closure() {
        let result: Result<Vec<u32>, String> = try_transitive(
            |x| if *x == 2 { Err(format!("stuck at {x}")) } else { Ok(vec![x + 1]) },
            0,
            false,
        );
        assert_eq!(result.unwrap_err(), "stuck at 2");
    }
}
