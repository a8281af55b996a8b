use super::client::MetaHolder;

/// Picks the holder with the oldest touch timestamp. Ties go to the lowest index.
pub(crate) fn select_eviction_victim(holders: &[MetaHolder]) -> Option<usize> {
    let mut victim: Option<(usize, u64)> = None;
    for (index, holder) in holders.iter().enumerate() {
        match victim {
            Some((_, oldest)) if holder.touched_ns >= oldest => {}
            _ => victim = Some((index, holder.touched_ns)),
        }
    }
    victim.map(|(index, _)| index)
}
