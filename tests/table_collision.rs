mod common;

use common::{some, values, TIMEOUT};
use segment_table::{
    Config, Error, IndexingMode, KeyHasher, MemorySegmentContainer, TableEntry, TableExtension,
    TableKey,
};
use std::sync::Arc;
use test_log::test;

/// Every key lands in the same bucket
fn colliding_tables(mode: IndexingMode, max_chain: usize) -> segment_table::Result<TableExtension> {
    let hasher = KeyHasher::custom(|_| vec![7; 32])?;

    Ok(
        Config::new(Arc::new(MemorySegmentContainer::new(0)))
            .hasher(hasher)
            .indexing_mode(mode)
            .max_bucket_chain_length(max_chain)
            .open(),
    )
}

#[test]
fn table_collision_keeps_keys_apart() -> segment_table::Result<()> {
    let tables = colliding_tables(IndexingMode::Inline, 1_000)?;
    tables.create_segment("s", TIMEOUT)?;

    tables.put("s", &[TableEntry::new("first", "1")], TIMEOUT)?;
    tables.put("s", &[TableEntry::new("second", "2")], TIMEOUT)?;

    assert_eq!(
        values(&tables, "s", &["first", "second", "third"])?,
        [some("1"), some("2"), None]
    );

    // Removing one key leaves the other one alone
    tables.remove("s", &[TableKey::new("second")], TIMEOUT)?;
    assert_eq!(
        values(&tables, "s", &["first", "second"])?,
        [some("1"), None]
    );

    tables.put("s", &[TableEntry::new("first", "1b")], TIMEOUT)?;
    assert_eq!(
        values(&tables, "s", &["first", "second"])?,
        [some("1b"), None]
    );

    Ok(())
}

#[test]
fn table_collision_same_length_keys() -> segment_table::Result<()> {
    let tables = colliding_tables(IndexingMode::Inline, 1_000)?;
    tables.create_segment("s", TIMEOUT)?;

    let entries = (0..50)
        .map(|idx| TableEntry::new(format!("k{idx:03}"), format!("v{idx}")))
        .collect::<Vec<_>>();
    tables.put("s", &entries, TIMEOUT)?;

    let keys = (0..50).map(|idx| format!("k{idx:03}")).collect::<Vec<_>>();
    let found = tables.get("s", &keys, TIMEOUT)?;

    for (idx, entry) in found.into_iter().enumerate() {
        let entry = entry.expect("should exist");
        assert_eq!(entry.key.key, format!("k{idx:03}").as_bytes());
        assert_eq!(entry.value, format!("v{idx}").as_bytes());
    }

    Ok(())
}

#[test]
fn table_collision_deferred() -> segment_table::Result<()> {
    let tables = colliding_tables(IndexingMode::Deferred, 1_000)?;
    tables.create_segment("s", TIMEOUT)?;

    let indexer = common::TestIndexer::new(&tables, "s")?;

    tables.put("s", &[TableEntry::new("a", "1")], TIMEOUT)?;
    indexer.run()?;
    tables.put("s", &[TableEntry::new("b", "2")], TIMEOUT)?;

    // "b" is only known in memory, its backpointer leads to persisted "a"
    assert_eq!(values(&tables, "s", &["a", "b"])?, [some("1"), some("2")]);

    indexer.run()?;
    assert_eq!(values(&tables, "s", &["a", "b"])?, [some("1"), some("2")]);

    Ok(())
}

#[test]
fn table_long_chain_terminates() -> segment_table::Result<()> {
    const N: usize = 2_000;

    let tables = colliding_tables(IndexingMode::Inline, N)?;
    tables.create_segment("s", TIMEOUT)?;

    for idx in 0..N {
        tables.put("s", &[TableEntry::new("same", format!("{idx}"))], TIMEOUT)?;
    }
    assert_eq!(
        values(&tables, "s", &["same"])?,
        [some(&format!("{}", N - 1))]
    );

    // Walks the whole chain
    assert_eq!(values(&tables, "s", &["other"])?, [None]);

    Ok(())
}

#[test]
fn table_chain_longer_than_allowed() -> segment_table::Result<()> {
    let tables = colliding_tables(IndexingMode::Inline, 3)?;
    tables.create_segment("s", TIMEOUT)?;

    for key in ["a", "b", "c", "d", "e"] {
        tables.put("s", &[TableEntry::new(key, key)], TIMEOUT)?;
    }

    assert_eq!(values(&tables, "s", &["e", "b"])?, [some("e"), some("b")]);

    assert!(matches!(
        tables.get("s", &["a"], TIMEOUT),
        Err(Error::CorruptedBucket { .. })
    ));

    Ok(())
}

#[test]
fn table_custom_hasher_too_short() {
    assert!(matches!(
        KeyHasher::custom(|_| vec![0; 15]),
        Err(Error::HashLength {
            expected: 16,
            got: 15
        })
    ));
}
