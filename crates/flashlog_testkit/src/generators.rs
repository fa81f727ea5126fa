//! Property-based test generators using proptest.
//!
//! Record data is always a whole number of items, and consume amounts are
//! item-aligned, matching what producers and the host can actually do.

use flashlog_core::ItemType;
use proptest::prelude::*;

/// Strategy for item types accepted by both buffered and unbuffered
/// sessions.
pub fn item_type_strategy() -> impl Strategy<Value = ItemType> {
    prop_oneof![
        prop::sample::select(vec![1u16, 2, 4]).prop_map(ItemType::unsigned),
        prop::sample::select(vec![1u16, 2, 4]).prop_map(ItemType::signed),
        (1u16..=256).prop_map(ItemType::byte_array),
    ]
}

/// Strategy for one `log` call's worth of records: 1 to `max_items` items.
pub fn records_strategy(item: ItemType, max_items: usize) -> impl Strategy<Value = Vec<u8>> {
    let size = usize::from(item.size);
    (1..=max_items.max(1))
        .prop_flat_map(move |items| prop::collection::vec(any::<u8>(), items * size))
}

/// One step against a single session log.
#[derive(Debug, Clone)]
pub enum LogOp {
    /// Append records.
    Write(Vec<u8>),
    /// Retire this many items, clipped to what is unread.
    Consume(usize),
    /// `consume(0)`.
    Resync,
}

/// Strategy for a sequence of log operations on `item`-typed records.
pub fn log_ops_strategy(item: ItemType, len: usize) -> impl Strategy<Value = Vec<LogOp>> {
    let max_items = (400 / usize::from(item.size)).max(1);
    let op = prop_oneof![
        4 => records_strategy(item, max_items).prop_map(LogOp::Write),
        2 => (0..=max_items).prop_map(LogOp::Consume),
        1 => Just(LogOp::Resync),
    ];
    prop::collection::vec(op, 1..=len)
}

/// Strategy for an item type together with an operation sequence for it.
pub fn session_script_strategy(len: usize) -> impl Strategy<Value = (ItemType, Vec<LogOp>)> {
    item_type_strategy().prop_flat_map(move |item| (Just(item), log_ops_strategy(item, len)))
}
