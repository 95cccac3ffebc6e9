//! Key-by-key comparison of two snapshot tables.

use std::collections::BTreeMap;

/// Difference between an old and a new table.
///
/// Every key lands in at most one of the three lists; unchanged keys in
/// none. Updated entries carry the new value, deleted entries the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDiff<K, V> {
    pub added: Vec<(K, V)>,
    pub updated: Vec<(K, V)>,
    pub deleted: Vec<(K, V)>,
}

impl<K, V> Default for TableDiff<K, V> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<K, V> TableDiff<K, V> {
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn diff<K, V>(old: &BTreeMap<K, V>, new: &BTreeMap<K, V>) -> TableDiff<K, V>
where
    K: Ord + Clone,
    V: PartialEq + Clone,
{
    let mut result = TableDiff::default();
    for (key, value) in new {
        match old.get(key) {
            None => result.added.push((key.clone(), value.clone())),
            Some(previous) if previous != value => result.updated.push((key.clone(), value.clone())),
            Some(_) => {}
        }
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            result.deleted.push((key.clone(), value.clone()));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn table(entries: &[(u32, &str)]) -> BTreeMap<u32, String> {
        entries.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    fn keys(list: &[(u32, String)]) -> BTreeSet<u32> {
        list.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_diff_partitions_keys() {
        let old = table(&[(1, "a"), (2, "b"), (3, "c")]);
        let new = table(&[(2, "b"), (3, "C"), (4, "d")]);
        let d = diff(&old, &new);

        assert_eq!(keys(&d.added), BTreeSet::from([4]));
        assert_eq!(keys(&d.updated), BTreeSet::from([3]));
        assert_eq!(keys(&d.deleted), BTreeSet::from([1]));
        assert_eq!(d.updated[0].1, "C");
        assert_eq!(d.deleted[0].1, "a");
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_diff_law_over_many_pairs() {
        let states: Vec<BTreeMap<u32, String>> = vec![
            table(&[]),
            table(&[(1, "a")]),
            table(&[(1, "b"), (2, "x")]),
            table(&[(2, "x"), (3, "y"), (4, "z")]),
            table(&[(1, "a"), (4, "w")]),
        ];
        for old in &states {
            for new in &states {
                let d = diff(old, new);
                let old_keys: BTreeSet<u32> = old.keys().copied().collect();
                let new_keys: BTreeSet<u32> = new.keys().copied().collect();
                let changed: BTreeSet<u32> = old_keys
                    .intersection(&new_keys)
                    .filter(|k| old[*k] != new[*k])
                    .copied()
                    .collect();

                assert_eq!(keys(&d.added), &new_keys - &old_keys);
                assert_eq!(keys(&d.deleted), &old_keys - &new_keys);
                assert_eq!(keys(&d.updated), changed);
                assert_eq!(d.len(), d.added.len() + d.deleted.len() + changed.len());
            }
        }
    }

    #[test]
    fn test_identical_tables_have_no_diff() {
        let t = table(&[(1, "a"), (2, "b")]);
        assert!(diff(&t, &t).is_empty());
    }
}
