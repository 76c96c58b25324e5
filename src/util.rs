/// Split a vec into owned chunks of at most `size` elements, preserving order.
pub fn chunk_vec<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    assert!(size > 0, "chunk size must be positive");
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Parse a journey duration into whole minutes, rounding up.
///
/// Accepts either the provider's `"<n>s"` literal (e.g. `"1500s"`) or a bare
/// integer number of seconds. Anything else is rejected.
pub fn parse_duration_mins(raw: &str) -> anyhow::Result<i64> {
    let trimmed = raw.trim();
    let secs_str = trimmed.strip_suffix('s').unwrap_or(trimmed);
    let secs: i64 = secs_str
        .parse()
        .map_err(|_| anyhow::anyhow!("unparseable duration: {raw:?}"))?;
    if secs < 0 {
        anyhow::bail!("negative duration: {raw:?}");
    }
    Ok((secs + 59) / 60)
}
