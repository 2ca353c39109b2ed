//! In-memory ordered key-value backend
//!
//! Keys map either to a counter or to a sorted collection of unique member
//! strings, each carrying a score. Members are ordered by (score, member)
//! and can also be ranged lexicographically.

use super::Storage;
use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// f64 with a total order, for use as a sort key
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl Score {
    /// Folds -0.0 into 0.0 so both land on the same key.
    fn new(value: f64) -> Self {
        Score(if value == 0.0 { 0.0 } else { value })
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    by_score: BTreeSet<(Score, String)>,
    by_member: BTreeSet<String>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: &str) -> bool {
        let score = Score::new(score).0;
        let added = match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.by_score.remove(&(Score(old), member.to_string()));
                false
            }
            None => {
                self.by_member.insert(member.to_string());
                true
            }
        };
        self.by_score.insert((Score(score), member.to_string()));
        added
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.by_score.remove(&(Score(score), member.to_string()));
                self.by_member.remove(member);
                true
            }
            None => false,
        }
    }

    fn in_range(&self, min: f64, max: f64) -> impl Iterator<Item = &(Score, String)> {
        self.by_score
            .range((Score::new(min), String::new())..)
            .take_while(move |(score, _)| *score <= Score::new(max))
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug)]
enum Entry {
    Counter(i64),
    Sorted(SortedSet),
}

/// Ordered key-value store held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Entry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sorted(&self, key: &str) -> Result<Option<&SortedSet>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Sorted(set)) => Ok(Some(set)),
            Some(Entry::Counter(_)) => Err(wrong_type(key)),
        }
    }

    fn sorted_mut(&mut self, key: &str) -> Result<Option<&mut SortedSet>> {
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry::Sorted(set)) => Ok(Some(set)),
            Some(Entry::Counter(_)) => Err(wrong_type(key)),
        }
    }

    /// Drop a sorted collection once its last member is gone.
    fn prune(&mut self, key: &str) {
        if let Some(Entry::Sorted(set)) = self.entries.get(key) {
            if set.is_empty() {
                self.entries.remove(key);
            }
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::storage(key, "operation against a key holding the wrong kind of value")
}

impl Storage for MemoryStorage {
    fn increment(&mut self, key: &str) -> Result<i64> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert(Entry::Counter(0));
        match entry {
            Entry::Counter(n) => {
                *n = n
                    .checked_add(1)
                    .ok_or_else(|| Error::storage(key, "counter overflow"))?;
                Ok(*n)
            }
            Entry::Sorted(_) => Err(wrong_type(key)),
        }
    }

    fn add(&mut self, key: &str, score: f64, member: &str) -> Result<bool> {
        if score.is_nan() {
            return Err(Error::storage(key, "score is not a number"));
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Sorted(SortedSet::default()));
        match entry {
            Entry::Sorted(set) => Ok(set.insert(score, member)),
            Entry::Counter(_) => Err(wrong_type(key)),
        }
    }

    fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let Some(set) = self.sorted(key)? else {
            return Ok(Vec::new());
        };
        let members = set.in_range(min, max).map(|(_, member)| member.clone());
        Ok(match limit {
            Some(n) => members.take(n).collect(),
            None => members.collect(),
        })
    }

    fn range_by_prefix(&self, key: &str, prefix: &str) -> Result<Vec<String>> {
        let Some(set) = self.sorted(key)? else {
            return Ok(Vec::new());
        };
        Ok(set
            .by_member
            .range(prefix.to_string()..)
            .take_while(|member| member.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn remove_by_score(&mut self, key: &str, min: f64, max: f64) -> Result<usize> {
        let Some(set) = self.sorted_mut(key)? else {
            return Ok(0);
        };
        let doomed: Vec<String> = set
            .in_range(min, max)
            .map(|(_, member)| member.clone())
            .collect();
        for member in &doomed {
            set.remove(member);
        }
        self.prune(key);
        Ok(doomed.len())
    }

    fn remove_member(&mut self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.sorted_mut(key)? {
            Some(set) => set.remove(member),
            None => false,
        };
        self.prune(key);
        Ok(removed)
    }

    fn delete(&mut self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn scan(
        &self,
        pattern: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<(Option<String>, Vec<String>)> {
        let pattern: Vec<char> = pattern.chars().collect();
        let mut keys = Vec::new();
        let mut last = None;
        let mut examined = 0;

        let range: Box<dyn Iterator<Item = &String>> = match cursor {
            Some(after) => Box::new(
                self.entries
                    .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .map(|(k, _)| k),
            ),
            None => Box::new(self.entries.keys()),
        };

        let mut remaining = range.peekable();
        while let Some(key) = remaining.next() {
            let text: Vec<char> = key.chars().collect();
            if wildcard_match(&pattern, &text, '*', '?') {
                keys.push(key.clone());
            }
            examined += 1;
            last = Some(key.clone());
            if examined >= count.max(1) {
                break;
            }
        }

        let next = if remaining.peek().is_some() { last } else { None };
        Ok((next, keys))
    }
}

/// Match `text` against a pattern where `many` stands for any run of
/// characters and `one` for exactly one.
pub(crate) fn wildcard_match(pattern: &[char], text: &[char], many: char, one: char) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == many {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == one || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == many)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment() {
        let mut store = MemoryStorage::new();
        assert_eq!(store.increment("seq:t").unwrap(), 1);
        assert_eq!(store.increment("seq:t").unwrap(), 2);
        store.add("table:t", 1.0, "a").unwrap();
        assert!(store.increment("table:t").is_err());
    }

    #[test]
    fn test_sorted_ranges() {
        let mut store = MemoryStorage::new();
        store.add("z", 3.0, "c").unwrap();
        store.add("z", 1.0, "a").unwrap();
        store.add("z", 2.0, "b").unwrap();
        assert!(!store.add("z", 2.5, "b").unwrap());

        assert_eq!(store.range_by_score("z", 1.0, 2.5, None).unwrap(), vec!["a", "b"]);
        assert_eq!(store.range_by_score("z", f64::NEG_INFINITY, f64::INFINITY, Some(1)).unwrap(), vec!["a"]);
        assert_eq!(store.remove_by_score("z", 2.5, 2.5).unwrap(), 1);
        assert_eq!(store.range_by_score("z", 0.0, 10.0, None).unwrap(), vec!["a", "c"]);
        assert!(store.range_by_score("missing", 0.0, 1.0, None).unwrap().is_empty());
    }

    #[test]
    fn test_prefix_range() {
        let mut store = MemoryStorage::new();
        store.add("i", 2.0, "Sfoo:2").unwrap();
        store.add("i", 1.0, "Sfoo:1").unwrap();
        store.add("i", 3.0, "Sfoobar:3").unwrap();
        store.add("i", 4.0, "T:4").unwrap();
        assert_eq!(store.range_by_prefix("i", "Sfoo:").unwrap(), vec!["Sfoo:1", "Sfoo:2"]);
    }

    #[test]
    fn test_empty_collection_is_removed() {
        let mut store = MemoryStorage::new();
        store.add("z", 1.0, "a").unwrap();
        assert!(store.remove_member("z", "a").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_with_cursor() {
        let mut store = MemoryStorage::new();
        for name in ["table:a", "table:b", "seq:a", "table:~1~1"] {
            store.add(name, 1.0, "x").unwrap();
        }

        let mut cursor = None;
        let mut found = Vec::new();
        loop {
            let (next, keys) = store.scan("table:*", cursor.as_deref(), 1).unwrap();
            found.extend(keys);
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(found, vec!["table:a", "table:b", "table:~1~1"]);

        let (_, keys) = store.scan("table:~*", None, 100).unwrap();
        assert_eq!(keys, vec!["table:~1~1"]);
    }

    #[test]
    fn test_wildcard_match() {
        let m = |p: &str, t: &str| {
            let p: Vec<char> = p.chars().collect();
            let t: Vec<char> = t.chars().collect();
            wildcard_match(&p, &t, '%', '_')
        };
        assert!(m("a%", "abc"));
        assert!(m("%c", "abc"));
        assert!(m("a_c", "abc"));
        assert!(m("%b%", "abc"));
        assert!(!m("a_", "abc"));
        assert!(m("%", ""));

        // Wildcard characters in the text are ordinary characters
        assert!(m("%a", "%ba"));
        assert!(m("%%", "%"));
        assert!(m("a%", "a%"));
        assert!(!m("%a", "%b"));
    }

    #[test]
    fn test_scan_glob_with_star_in_key() {
        let mut store = MemoryStorage::new();
        store.increment("seq:*x").unwrap();
        store.increment("seq:y").unwrap();
        let (_, keys) = store.scan("seq:*x", None, 100).unwrap();
        assert_eq!(keys, vec!["seq:*x"]);
        let (_, keys) = store.scan("*x", None, 100).unwrap();
        assert_eq!(keys, vec!["seq:*x"]);
    }
}
