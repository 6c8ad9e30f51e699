//! Body read modes and the incremental marker scanner behind them.

/// How much of a 2xx response body to read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Read the whole body.
    #[default]
    Full,
    /// Read nothing; status, headers and final URL only.
    HeadersOnly,
    /// Stream until each marker has been seen, in order. A marker is only
    /// searched for after the end of the previous one.
    UntilMarkers(Vec<Vec<u8>>),
    /// Stream until any of `markers` has been seen `times` times in total.
    UntilCount { markers: Vec<Vec<u8>>, times: usize },
}

impl ReadMode {
    pub fn until_markers<I, M>(markers: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<[u8]>,
    {
        ReadMode::UntilMarkers(markers.into_iter().map(|m| m.as_ref().to_vec()).collect())
    }

    pub fn until_count<I, M>(markers: I, times: usize) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<[u8]>,
    {
        ReadMode::UntilCount {
            markers: markers.into_iter().map(|m| m.as_ref().to_vec()).collect(),
            times,
        }
    }
}

/// Byte substring search.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Byte substring search from the end.
pub fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Tracks progress through a growing buffer for the streaming read modes.
///
/// Feed it the whole accumulated buffer after each chunk; it remembers where
/// it got to so bytes are not rescanned (beyond a marker-length overlap
/// needed to catch markers split across chunks).
#[derive(Debug)]
pub(crate) struct StopScanner {
    markers: Vec<Vec<u8>>,
    /// Sequential mode: index of the next marker. Count mode: unused.
    next: usize,
    /// Count mode: matches seen so far and the target.
    seen: usize,
    times: Option<usize>,
    /// Offset before which no match can start.
    from: usize,
}

impl StopScanner {
    /// `None` for modes that don't stream.
    pub(crate) fn for_mode(mode: &ReadMode) -> Option<Self> {
        match mode {
            ReadMode::Full | ReadMode::HeadersOnly => None,
            ReadMode::UntilMarkers(markers) => Some(Self {
                markers: markers.clone(),
                next: 0,
                seen: 0,
                times: None,
                from: 0,
            }),
            ReadMode::UntilCount { markers, times } => Some(Self {
                markers: markers.clone(),
                next: 0,
                seen: 0,
                times: Some(*times),
                from: 0,
            }),
        }
    }

    fn longest(&self) -> usize {
        self.markers.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Returns `true` once the stop condition is met for `buf`.
    pub(crate) fn satisfied(&mut self, buf: &[u8]) -> bool {
        match self.times {
            None => self.scan_sequential(buf),
            Some(times) => self.scan_count(buf, times),
        }
    }

    fn scan_sequential(&mut self, buf: &[u8]) -> bool {
        while let Some(marker) = self.markers.get(self.next) {
            match find(&buf[self.from..], marker) {
                Some(at) => {
                    self.from += at + marker.len();
                    self.next += 1;
                }
                None => {
                    let keep = marker.len().saturating_sub(1);
                    self.from = self.from.max(buf.len().saturating_sub(keep));
                    return false;
                }
            }
        }
        true
    }

    fn scan_count(&mut self, buf: &[u8], times: usize) -> bool {
        if times == 0 || self.markers.is_empty() {
            return times == 0;
        }
        loop {
            let earliest = self
                .markers
                .iter()
                .filter_map(|m| find(&buf[self.from..], m).map(|at| (at, m.len())))
                .min_by_key(|(at, _)| *at);
            match earliest {
                Some((at, len)) => {
                    self.from += at + len;
                    self.seen += 1;
                    if self.seen >= times {
                        return true;
                    }
                }
                None => break,
            }
        }
        let keep = self.longest().saturating_sub(1);
        self.from = self.from.max(buf.len().saturating_sub(keep));
        false
    }
}
