use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

/// Running byte count of one scope's resources.
///
/// Every tracked name remembers the size it was last tracked with. Tracking a
/// name that is already tracked replaces its previous size instead of adding
/// on top of it, so overwriting the same logical object never drifts the total.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    total: usize,
    tracked: HashMap<String, usize>,
}

impl MemoryLedger {
    /// Accounts `bytes` for `name`. Returns the new total.
    pub fn track(&mut self, name: impl Into<String>, bytes: usize) -> usize {
        let name = name.into();
        if let Some(previous) = self.tracked.insert(name, bytes) {
            self.total = self.total.saturating_sub(previous);
        }
        self.total += bytes;
        self.total
    }

    /// Removes `bytes` and forgets `name`. Returns the new total.
    pub fn untrack(&mut self, name: &str, bytes: usize) -> usize {
        self.tracked.remove(name);
        self.total = self.total.saturating_sub(bytes);
        self.total
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn is_tracked(&self, name: &str) -> bool {
        self.tracked.contains_key(name)
    }

    /// Size `name` was last tracked with.
    #[inline]
    pub fn tracked_size(&self, name: &str) -> Option<usize> {
        self.tracked.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.total = 0;
        self.tracked.clear();
    }

    /// Prints the ledger's entries in a human-readable format.
    pub fn print_pretty(&self) -> String {
        self.tracked
            .iter()
            .sorted_by(|x, y| x.0.cmp(y.0))
            .map(|(name, &bytes)| format!("{name}\t: {}", format_bytes(bytes as i128)))
            .chain(std::iter::once(format!(
                "total\t: {}",
                format_bytes(self.total as i128)
            )))
            .join("\n")
    }
}

impl std::fmt::Display for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.print_pretty())
    }
}

const UNITS: [&str; 6] = ["bytes", "KB", "MB", "GB", "TB", "PB"];

/// Renders a byte count in the largest decimal unit that keeps the value at least 1.
pub fn format_bytes(bytes: i128) -> String {
    if bytes <= 0 {
        return "0 bytes".into();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    // compare at the printed precision so 999.999 KB reads as 1 MB
    while (value * 100.0).round() >= 100_000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{bytes} bytes");
    }
    let text = format!("{value:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{text} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::{MemoryLedger, format_bytes};

    #[test]
    fn test_track() {
        let mut ledger = MemoryLedger::default();
        assert_eq!(ledger.track("positions", 4000), 4000);
        assert_eq!(ledger.track("velocities", 1000), 5000);
        assert!(ledger.is_tracked("positions"));

        // overwriting replaces the previous size
        assert_eq!(ledger.track("positions", 4000), 5000);
        assert_eq!(ledger.track("positions", 2000), 3000);
        assert_eq!(ledger.tracked_size("positions"), Some(2000));

        assert_eq!(ledger.untrack("velocities", 1000), 2000);
        assert!(!ledger.is_tracked("velocities"));
        assert_eq!(ledger.untrack("positions", 2000), 0);
    }

    #[test]
    fn test_repeated_overwrite() {
        let mut ledger = MemoryLedger::default();
        for _ in 0..100 {
            ledger.track("time", 4);
        }
        assert_eq!(ledger.total(), 4);
    }

    #[test]
    fn test_untrack_saturates() {
        let mut ledger = MemoryLedger::default();
        ledger.track("a", 10);
        assert_eq!(ledger.untrack("a", 20), 0);
        ledger.clear();
        assert_eq!(ledger.total(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(-5), "0 bytes");
        assert_eq!(format_bytes(999), "999 bytes");
        assert_eq!(format_bytes(1000), "1 KB");
        assert_eq!(format_bytes(1536), "1.54 KB");
        assert_eq!(format_bytes(999_994), "999.99 KB");
        assert_eq!(format_bytes(999_999), "1 MB");
        assert_eq!(format_bytes(999_999_999), "1 GB");
        assert_eq!(format_bytes(2_500_000), "2.5 MB");
        assert_eq!(format_bytes(4_000_000_000), "4 GB");
        assert_eq!(format_bytes(1_230_000_000_000), "1.23 TB");
        assert_eq!(format_bytes(7_000_000_000_000_000), "7 PB");
        assert_eq!(format_bytes(7_000_000_000_000_000_000), "7000 PB");
    }
}
