//! Batch read planning
//!
//! Both readers answer `get_many` the same way: sort the requested entries
//! by data offset, greedily merge neighbors whose gap fits the budget, and
//! issue one read per merged group. The planning is pure and shared here;
//! only the byte transport differs between the readers.

/// One requested internal entry, tagged with its position in the caller's
/// name list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchItem {
    pub input_pos: usize,
    pub offset: u64,
    pub length: u64,
}

impl BatchItem {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Greedily merge offset-sorted entries into read groups.
///
/// Two consecutive entries land in the same group when the byte gap between
/// them is at most `max_gap`. Ties on offset keep the caller's order (the
/// sort is stable).
pub(crate) fn plan_groups(mut items: Vec<BatchItem>, max_gap: u64) -> Vec<Vec<BatchItem>> {
    if items.is_empty() {
        return Vec::new();
    }
    items.sort_by_key(|item| item.offset);

    let mut groups = Vec::new();
    let mut current = vec![items[0]];
    let mut current_end = items[0].end();

    for item in items.into_iter().skip(1) {
        let gap = item.offset.saturating_sub(current_end);
        if gap <= max_gap {
            current_end = current_end.max(item.end());
            current.push(item);
        } else {
            groups.push(std::mem::replace(&mut current, vec![item]));
            current_end = item.end();
        }
    }
    groups.push(current);
    groups
}

/// The byte span covered by one group.
pub(crate) fn group_span(group: &[BatchItem]) -> (u64, u64) {
    let start = group.first().map(|i| i.offset).unwrap_or(0);
    let end = group.iter().map(BatchItem::end).max().unwrap_or(start);
    (start, end)
}
