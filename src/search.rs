//! Substring search with a bad-character skip table (Boyer-Moore-Horspool).

#[derive(Debug, Clone)]
pub struct Finder {
    needle: Vec<u8>,
    skip: [usize; 256],
}

impl Finder {
    pub fn new(needle: &[u8]) -> Self {
        let len = needle.len();
        let mut skip = [len.max(1); 256];
        if len > 0 {
            for (i, &b) in needle[..len - 1].iter().enumerate() {
                skip[b as usize] = len - 1 - i;
            }
        }
        Self {
            needle: needle.to_vec(),
            skip,
        }
    }

    pub fn needle(&self) -> &[u8] {
        &self.needle
    }

    /// First occurrence at or after `from`.
    pub fn find_from(&self, haystack: &[u8], from: usize) -> Option<usize> {
        let n = self.needle.len();
        if n == 0 || from > haystack.len() || haystack.len() - from < n {
            return None;
        }
        let last = n - 1;
        let mut pos = from;
        while pos + n <= haystack.len() {
            let tail = haystack[pos + last];
            if tail == self.needle[last] && haystack[pos..pos + last] == self.needle[..last] {
                return Some(pos);
            }
            pos += self.skip[tail as usize];
        }
        None
    }

    /// First occurrence at or after `from` whose position is a multiple of `unit`.
    pub fn find_aligned(&self, haystack: &[u8], from: usize, unit: usize) -> Option<usize> {
        let mut from = from;
        loop {
            let pos = self.find_from(haystack, from)?;
            if unit <= 1 || pos % unit == 0 {
                return Some(pos);
            }
            from = pos + 1;
        }
    }

    /// Non-overlapping occurrences scanned left to right.
    pub fn count(&self, haystack: &[u8], unit: usize) -> usize {
        let mut count = 0;
        let mut from = 0;
        while let Some(pos) = self.find_aligned(haystack, from, unit) {
            count += 1;
            from = pos + self.needle.len();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_all_positions_like_naive_search() {
        let hay = b"abcabcabd ${NAME} x${NAME}${NAME";
        for needle in [&b"abd"[..], b"${NAME}", b"c", b"zz", b"${NAME"] {
            let finder = Finder::new(needle);
            let naive = hay.windows(needle.len()).position(|w| w == needle);
            assert_eq!(finder.find_from(hay, 0), naive, "needle {needle:?}");
        }
    }

    #[test]
    fn count_is_non_overlapping() {
        let finder = Finder::new(b"aa");
        assert_eq!(finder.count(b"aaaaa", 1), 2);
    }

    #[test]
    fn aligned_search_skips_odd_offsets() {
        let hay = [0x00, 0x41, 0x00, 0x41, 0x00];
        let finder = Finder::new(&[0x41, 0x00]);
        assert_eq!(finder.find_from(&hay, 0), Some(1));
        assert_eq!(finder.find_aligned(&hay, 0, 2), None);
        assert_eq!(finder.find_aligned(&hay, 0, 1), Some(1));
    }

    #[test]
    fn empty_needle_never_matches() {
        assert_eq!(Finder::new(b"").find_from(b"abc", 0), None);
    }
}
