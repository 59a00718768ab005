//! Sorted domain lists with wildcard and TTL support.
//!
//! A [`DomainList`] answers "does this host match?" for `REQMOD`/`RESPMOD`
//! routing. Entries are stored character-reversed and sorted so that a
//! wildcard like `.example.com` covers a contiguous run of the sorted
//! vector, bracketed by two sentinel entries. Membership is a binary
//! search plus a short backward walk, with no per-lookup allocation
//! beyond reversing the probe.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::IcapResult;

/// Sorts immediately before any reversed domain sharing the stem.
const WILDCARD_START: char = '\0';
/// Sorts immediately after any reversed domain sharing the stem.
const WILDCARD_END: char = '\u{ff}';

fn reverse(s: &str) -> String {
    s.chars().rev().collect()
}

/// A mutable, sorted set of domains and wildcard domains.
///
/// Plain entries (`example.com`) match exactly. Wildcard entries
/// (`.example.com`) match the domain itself and every subdomain.
/// Entries added with a TTL evaporate lazily: an expired entry fails
/// its next lookup and is removed at that point.
#[derive(Debug, Default, Clone)]
pub struct DomainList {
    /// Reversed entries, kept sorted.
    patterns: Vec<String>,
    /// Expiry instants keyed by reversed entry (sentinel entries included).
    expiry: HashMap<String, Instant>,
}

impl DomainList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from newline-separated domains in a file.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> IcapResult<Self> {
        let text = fs::read_to_string(path)?;
        let mut list = Self::new();
        let domains: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        list.add_many(&domains, None);
        Ok(list)
    }

    /// Add a single domain or wildcard.
    pub fn add(&mut self, domain: &str) {
        self.add_many(&[domain], None);
    }

    /// Add a single domain or wildcard that expires after `ttl`.
    pub fn add_ttl(&mut self, domain: &str, ttl: Duration) {
        self.add_many(&[domain], Some(ttl));
    }

    /// Add a batch of domains, sorting once at the end.
    ///
    /// A leading dot marks a wildcard: `.example.com` inserts the exact
    /// entry plus the two bracket sentinels that delimit its subdomain
    /// range in the sorted order.
    pub fn add_many<S: AsRef<str>>(&mut self, domains: &[S], ttl: Option<Duration>) {
        let deadline = ttl.map(|t| Instant::now() + t);
        for domain in domains {
            let domain = domain.as_ref();
            let mut entries: Vec<String> = Vec::with_capacity(3);
            if let Some(bare) = domain.strip_prefix('.') {
                // The stem keeps the dot so `.example.com` cannot match
                // hosts like `notexample.com`.
                let stem = reverse(domain);
                entries.push(reverse(bare));
                entries.push(format!("{stem}{WILDCARD_START}"));
                entries.push(format!("{stem}{WILDCARD_END}"));
            } else {
                entries.push(reverse(domain));
            }
            for entry in entries {
                if let Some(deadline) = deadline {
                    self.expiry.insert(entry.clone(), deadline);
                } else {
                    self.expiry.remove(&entry);
                }
                if self.patterns.binary_search(&entry).is_err() {
                    self.patterns.push(entry);
                }
            }
        }
        self.patterns.sort_unstable();
        debug!(entries = self.patterns.len(), "domain list updated");
    }

    /// Remove a domain (and, for wildcards, its bracket sentinels).
    pub fn remove(&mut self, domain: &str) {
        let mut entries: Vec<String> = Vec::with_capacity(3);
        if let Some(bare) = domain.strip_prefix('.') {
            let stem = reverse(domain);
            entries.push(reverse(bare));
            entries.push(format!("{stem}{WILDCARD_START}"));
            entries.push(format!("{stem}{WILDCARD_END}"));
        } else {
            entries.push(reverse(domain));
        }
        for entry in entries {
            if let Ok(idx) = self.patterns.binary_search(&entry) {
                self.patterns.remove(idx);
            }
            self.expiry.remove(&entry);
        }
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
        self.expiry.clear();
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Test membership. Takes `&mut self` because expired entries are
    /// evicted on the lookup that discovers them.
    pub fn contains(&mut self, domain: &str) -> bool {
        let reversed = reverse(domain);
        let hit = match self.patterns.binary_search(&reversed) {
            Ok(_) => Some(reversed.clone()),
            Err(insert_at) => {
                // Walk backward looking for a bracket sentinel whose stem
                // prefixes the probe. Exact entries nested inside a
                // wildcard range are skipped, not treated as a stop.
                let mut found = None;
                for idx in (0..insert_at).rev() {
                    let entry = &self.patterns[idx];
                    let Some(last) = entry.chars().last() else {
                        continue;
                    };
                    if last != WILDCARD_START && last != WILDCARD_END {
                        continue;
                    }
                    let stem = &entry[..entry.len() - last.len_utf8()];
                    if reversed.starts_with(stem) {
                        found = Some(entry.clone());
                        break;
                    }
                }
                found
            }
        };
        let Some(entry) = hit else { return false };
        match self.expiry.get(&entry) {
            Some(deadline) if *deadline < Instant::now() => {
                self.evict(&entry);
                false
            }
            _ => true,
        }
    }

    /// Drop an expired entry. For sentinels, the whole wildcard family
    /// (exact, START, END) goes.
    fn evict(&mut self, entry: &str) {
        let family: Vec<String> = match entry.chars().last() {
            Some(last @ (WILDCARD_START | WILDCARD_END)) => {
                let stem = &entry[..entry.len() - last.len_utf8()];
                // stem is reverse(".domain"); reverse("domain") drops the
                // trailing dot.
                let exact = stem.strip_suffix('.').unwrap_or(stem);
                vec![
                    exact.to_string(),
                    format!("{stem}{WILDCARD_START}"),
                    format!("{stem}{WILDCARD_END}"),
                ]
            }
            _ => vec![entry.to_string()],
        };
        for member in family {
            if let Ok(idx) = self.patterns.binary_search(&member) {
                self.patterns.remove(idx);
            }
            self.expiry.remove(&member);
        }
        debug!(entry = %reverse(entry), "expired domain evicted");
    }

    /// The list in insertion form: wildcards come back with their
    /// leading dot, sentinel bookkeeping entries are folded away.
    pub fn to_array(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in &self.patterns {
            match entry.chars().last() {
                Some(WILDCARD_START) => {
                    let stem = &entry[..entry.len() - WILDCARD_START.len_utf8()];
                    out.push(reverse(stem));
                }
                Some(WILDCARD_END) => {}
                _ => {
                    // An exact entry shadowed by its own wildcard is
                    // already reported by the START sentinel.
                    let shadow = format!(".{}", reverse(entry));
                    let sentinel = format!("{}{WILDCARD_START}", reverse(&shadow));
                    if self.patterns.binary_search(&sentinel).is_err() {
                        out.push(reverse(entry));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn exact_match() {
        let mut list = DomainList::new();
        list.add("example.com");
        assert!(list.contains("example.com"));
        assert!(!list.contains("www.example.com"));
        assert!(!list.contains("example.org"));
    }

    #[rstest]
    #[case("example.com", true)]
    #[case("www.example.com", true)]
    #[case("a.b.c.example.com", true)]
    #[case("xexample.com", false)]
    #[case("notexample.com", false)]
    #[case("example.com.evil.net", false)]
    fn wildcard_match(#[case] host: &str, #[case] expected: bool) {
        let mut list = DomainList::new();
        list.add(".example.com");
        assert_eq!(list.contains(host), expected, "host {host}");
    }

    #[test]
    fn wildcard_does_not_leak_to_neighbors() {
        let mut list = DomainList::new();
        list.add(".example.com");
        list.add("example.net");
        list.add("aexample.com");
        assert!(list.contains("example.net"));
        assert!(list.contains("aexample.com"));
        assert!(list.contains("deep.example.com"));
        assert!(!list.contains("bexample.com"));
    }

    #[test]
    fn exact_entry_inside_wildcard_range_does_not_block_matching() {
        let mut list = DomainList::new();
        list.add(".example.com");
        list.add("www.example.com");
        // "zz" sorts after "www" inside the bracket range.
        assert!(list.contains("zz.example.com"));
        assert!(list.contains("www.example.com"));
    }

    #[test]
    fn remove_wildcard_removes_family() {
        let mut list = DomainList::new();
        list.add(".example.com");
        assert!(list.contains("www.example.com"));
        list.remove(".example.com");
        assert!(!list.contains("www.example.com"));
        assert!(!list.contains("example.com"));
        assert!(list.is_empty());
    }

    #[test]
    fn ttl_entry_expires() {
        let mut list = DomainList::new();
        list.add_ttl("ephemeral.test", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!list.contains("ephemeral.test"));
        assert!(list.is_empty());
    }

    #[test]
    fn ttl_entry_valid_before_deadline() {
        let mut list = DomainList::new();
        list.add_ttl("fresh.test", Duration::from_secs(600));
        assert!(list.contains("fresh.test"));
    }

    #[test]
    fn expired_wildcard_evicts_whole_family() {
        let mut list = DomainList::new();
        list.add_ttl(".gone.test", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!list.contains("sub.gone.test"));
        assert!(!list.contains("gone.test"));
        assert!(list.is_empty());
    }

    #[test]
    fn to_array_round_trips_insertion_form() {
        let mut list = DomainList::new();
        list.add_many(&[".example.com", "plain.org"], None);
        let mut arr = list.to_array();
        arr.sort();
        assert_eq!(arr, vec![".example.com".to_string(), "plain.org".to_string()]);
    }

    #[test]
    fn add_many_sorts_once_and_dedups() {
        let mut list = DomainList::new();
        list.add_many(&["b.com", "a.com", "b.com"], None);
        assert_eq!(list.len(), 2);
        assert!(list.contains("a.com"));
        assert!(list.contains("b.com"));
    }
}
