//! Reducers applied to per-node fan-out results.

/// Mesh-wide total of per-node counts.
pub fn sum<I: IntoIterator<Item = u64>>(sizes: I) -> u64 {
    sizes.into_iter().sum()
}

/// Unordered concatenation of per-node lists. No deduplication.
pub fn concat<T, I: IntoIterator<Item = Vec<T>>>(lists: I) -> Vec<T> {
    let mut merged = Vec::new();
    for mut list in lists {
        merged.append(&mut list);
    }
    merged
}

/// True if any node reported true.
pub fn any<I: IntoIterator<Item = bool>>(flags: I) -> bool {
    flags.into_iter().any(|flag| flag)
}
