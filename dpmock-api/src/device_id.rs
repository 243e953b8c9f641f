//! Device ID serial generation.

use crate::types::DeviceIdFormat;

/// Expand a [`DeviceIdFormat`] into its ordered list of device IDs.
///
/// Prefixes are visited in lexicographic order, so the output (and anything
/// rendered from it) is stable across runs. Each prefix contributes `count`
/// IDs of the form `prefix + delimiter + ordinal`, with ordinals starting at
/// `ordinal_start`. Negative counts contribute nothing.
pub fn build_device_ids(format: &DeviceIdFormat) -> Vec<String> {
    let total: usize = format
        .prefix
        .values()
        .map(|&count| usize::try_from(count).unwrap_or(0))
        .sum();
    let mut ids = Vec::with_capacity(total);

    for (prefix, &count) in &format.prefix {
        for i in 0..count.max(0) {
            let ordinal = i64::from(format.ordinal_start) + i64::from(i);
            ids.push(format!("{}{}{}", prefix, format.delimiter, ordinal));
        }
    }

    ids
}
