use anyhow::Result;
use tempfile::tempdir;

use leafdb::{DbFile, FieldType, Payload, Value};

const KEY: [FieldType; 1] = [FieldType::Int];
const VAL: [FieldType; 1] = [FieldType::Str(32)];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn key(v: i32) -> Payload {
    Payload::from_values(&KEY, &[Value::Int(v)]).unwrap()
}

fn val(v: i32) -> Payload {
    Payload::from_values(&VAL, &[Value::Str(format!("row-{v}"))]).unwrap()
}

/// Full engine workload on deliberately tiny pages: insert a thousand rows,
/// scan, delete a large slice, and scan the complement, reopening the file
/// along the way.
#[test]
fn test_insert_delete_scan_workload() -> Result<()> {
    init_logging();
    let dir = tempdir()?;
    let path = dir.path().join("workload.db");

    {
        let db = DbFile::create_with(&path, 7, 64)?;
        let table = db.schema()?.create_table("rows", &KEY, &VAL)?;
        for v in 0..=1000 {
            table.insert(&key(v), &val(v))?;
        }
        assert_eq!(table.len()?, 1001);
        db.close()?;
    }

    let db = DbFile::open(&path)?;
    let table = db.schema()?.table("rows")?.unwrap();

    let scanned: Vec<i32> = table
        .iter()?
        .map(|entry| entry.unwrap().0.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(scanned, (0..=1000).collect::<Vec<_>>());

    let doomed = |v: i32| [2, 3, 5, 7, 11, 13, 17, 19, 23].iter().any(|d| v % d == 0);
    for v in 0..=1000 {
        if doomed(v) {
            table.delete(&key(v))?;
        }
    }

    let expected: Vec<i32> = (0..=1000).filter(|v| !doomed(*v)).collect();
    let scanned: Vec<i32> = table
        .iter()?
        .map(|entry| entry.unwrap().0.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(scanned, expected);
    assert_eq!(table.len()? as usize, expected.len());

    for v in 0..=1000 {
        assert_eq!(table.get(&key(v))?.is_some(), !doomed(v));
    }
    Ok(())
}

/// A rolled-back transaction leaves the primary file byte for byte as it
/// was, no matter how much work happened inside it.
#[test]
fn test_rollback_leaves_file_untouched() -> Result<()> {
    init_logging();
    let dir = tempdir()?;
    let path = dir.path().join("rollback.db");

    let db = DbFile::create_with(&path, 7, 64)?;
    let table = db.schema()?.create_table("rows", &KEY, &VAL)?;
    for v in 0..50 {
        table.insert(&key(v), &val(v))?;
    }
    db.sync()?;
    let before = std::fs::read(&path)?;

    {
        let txn = db.begin_transaction()?;
        let table = db.schema()?.table("rows")?.unwrap();
        for v in 50..200 {
            table.insert(&key(v), &val(v))?;
        }
        for v in 0..25 {
            table.delete(&key(v))?;
        }
        db.schema()?.create_table("scratch", &KEY, &VAL)?;
        txn.rollback()?;
    }

    db.sync()?;
    assert_eq!(std::fs::read(&path)?, before);

    let table = db.schema()?.table("rows")?.unwrap();
    assert_eq!(table.len()?, 50);
    assert!(db.schema()?.table("scratch")?.is_none());
    Ok(())
}

/// Committed work survives closing and reopening the file.
#[test]
fn test_commit_is_durable_across_reopen() -> Result<()> {
    init_logging();
    let dir = tempdir()?;
    let path = dir.path().join("commit.db");

    {
        let db = DbFile::create(&path)?;
        db.schema()?.create_table("rows", &KEY, &VAL)?;

        let txn = db.begin_transaction()?;
        let table = db.schema()?.table("rows")?.unwrap();
        for v in 0..300 {
            table.insert(&key(v), &val(v))?;
        }
        txn.commit()?;
        db.close()?;
    }

    let db = DbFile::open(&path)?;
    let table = db.schema()?.table("rows")?.unwrap();
    assert_eq!(table.len()?, 300);
    for v in 0..300 {
        assert_eq!(
            table.get(&key(v))?.unwrap().get(0)?,
            Value::Str(format!("row-{v}"))
        );
    }
    Ok(())
}

/// Transactions compose with everything else: a commit in the middle of a
/// workload, then more untransacted writes, then a reopen.
#[test]
fn test_mixed_transacted_and_plain_writes() -> Result<()> {
    init_logging();
    let dir = tempdir()?;
    let path = dir.path().join("mixed.db");

    {
        let db = DbFile::create(&path)?;
        let table = db.schema()?.create_table("rows", &KEY, &VAL)?;
        table.insert(&key(1), &val(1))?;

        let txn = db.begin_transaction()?;
        db.schema()?.table("rows")?.unwrap().insert(&key(2), &val(2))?;
        txn.commit()?;

        db.schema()?.table("rows")?.unwrap().insert(&key(3), &val(3))?;
        db.close()?;
    }

    let db = DbFile::open(&path)?;
    let table = db.schema()?.table("rows")?.unwrap();
    let scanned: Vec<i32> = table
        .iter()?
        .map(|entry| entry.unwrap().0.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(scanned, vec![1, 2, 3]);
    Ok(())
}
