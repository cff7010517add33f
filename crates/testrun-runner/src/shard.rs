//! Deterministic file ordering and shard selection.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use testrun_core::{Shard, TestFile};

/// Comparator used to order files before sharding.
#[derive(Clone)]
pub struct FileOrder(Arc<dyn Fn(&TestFile, &TestFile) -> Ordering + Send + Sync>);

impl FileOrder {
    pub fn new(compare: impl Fn(&TestFile, &TestFile) -> Ordering + Send + Sync + 'static) -> Self {
        Self(Arc::new(compare))
    }

    pub fn compare(&self, a: &TestFile, b: &TestFile) -> Ordering {
        (self.0)(a, b)
    }
}

impl Default for FileOrder {
    fn default() -> Self {
        Self::new(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()))
    }
}

impl fmt::Debug for FileOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileOrder(..)")
    }
}

/// Case-insensitive comparison that orders digit runs by numeric value,
/// so `file2` sorts before `file10`.
///
/// Strings that compare equal that way fall back to plain byte order, which
/// keeps the order total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ordering = compare_numbers(&take_digits(&mut left), &take_digits(&mut right));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                let ordering = l.to_lowercase().cmp(r.to_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}

fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Sort `files` and keep the contiguous block belonging to `shard`.
///
/// With `n` files and `total` shards every shard gets `n / total` files and
/// the first `n % total` shards one more.
pub fn select_shard(mut files: Vec<TestFile>, shard: Shard, order: &FileOrder) -> Vec<TestFile> {
    files.sort_by(|a, b| order.compare(a, b));

    let n = files.len();
    let size = n / shard.total;
    let remainder = n % shard.total;
    let start = shard.index * size + shard.index.min(remainder);
    let len = size + usize::from(shard.index < remainder);

    files.into_iter().skip(start).take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<TestFile> {
        names
            .iter()
            .map(|name| TestFile::new(format!("/repo/{name}")).unwrap())
            .collect()
    }

    fn names(files: &[TestFile]) -> Vec<String> {
        files
            .iter()
            .map(|file| file.path().file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("file2", "file10"), Ordering::Less);
        assert_eq!(natural_cmp("File1", "file1"), Ordering::Less);
        assert_eq!(natural_cmp("a007", "a7"), Ordering::Less);
        assert_eq!(natural_cmp("b", "A"), Ordering::Greater);
        assert_eq!(natural_cmp("abc", "abc"), Ordering::Equal);
        assert_eq!(natural_cmp("ab", "abc"), Ordering::Less);
    }

    #[test]
    fn test_select_shard_spreads_remainder() {
        let all = files(&["t1", "t2", "t3", "t4", "t5", "t6", "t7"]);
        let order = FileOrder::default();

        let shards: Vec<Vec<String>> = (0..3)
            .map(|index| names(&select_shard(all.clone(), Shard::new(index, 3).unwrap(), &order)))
            .collect();

        assert_eq!(shards[0], vec!["t1", "t2", "t3"]);
        assert_eq!(shards[1], vec!["t4", "t5"]);
        assert_eq!(shards[2], vec!["t6", "t7"]);
    }

    #[test]
    fn test_shards_cover_every_file_once() {
        let all = files(&["z10", "z9", "a", "B", "c2", "c10"]);
        let order = FileOrder::default();
        let mut covered = Vec::new();
        for index in 0..4 {
            covered.extend(select_shard(all.clone(), Shard::new(index, 4).unwrap(), &order));
        }
        assert_eq!(names(&covered), vec!["a", "B", "c2", "c10", "z9", "z10"]);
    }

    #[test]
    fn test_more_shards_than_files() {
        let all = files(&["one"]);
        let order = FileOrder::default();
        assert_eq!(select_shard(all.clone(), Shard::new(0, 3).unwrap(), &order).len(), 1);
        assert!(select_shard(all, Shard::new(2, 3).unwrap(), &order).is_empty());
    }

    #[test]
    fn test_custom_order() {
        let all = files(&["a", "b", "c"]);
        let reverse = FileOrder::new(|a, b| b.cmp(a));
        let selected = select_shard(all, Shard::new(0, 2).unwrap(), &reverse);
        assert_eq!(names(&selected), vec!["c", "b"]);
    }
}
