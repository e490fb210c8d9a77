//! Snapshot isolation and page reuse across concurrent transactions.

use pagestore::{Environment, EnvironmentOptions, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn open(dir: &Path) -> Result<Environment> {
    Environment::open(EnvironmentOptions::new(dir).manual_flushing(true))
}

fn fill(env: &Environment, tree: &str, round: u32, count: u32) -> Result<()> {
    let mut tx = env.write_transaction()?;
    if !tx.contains_tree(tree)? {
        tx.create_tree(tree)?;
    }
    for i in 0..count {
        let value = format!("round-{}-value-{}", round, i);
        tx.add(tree, format!("{:06}", i).as_bytes(), value.as_bytes())?;
    }
    tx.commit()
}

#[test]
fn test_reader_does_not_see_uncommitted_or_later_writes() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = open(dir.path())?;
    fill(&env, "t", 0, 10)?;

    let before = env.read_transaction()?;

    let mut writer = env.write_transaction()?;
    writer.add("t", b"000001", b"changed")?;
    writer.add("t", b"new-key", b"x")?;
    assert_eq!(
        before.read("t", b"000001")?,
        Some(b"round-0-value-1".to_vec())
    );
    writer.commit()?;

    assert_eq!(
        before.read("t", b"000001")?,
        Some(b"round-0-value-1".to_vec())
    );
    assert_eq!(before.read("t", b"new-key")?, None);

    let after = env.read_transaction()?;
    assert_eq!(after.read("t", b"000001")?, Some(b"changed".to_vec()));
    assert_eq!(after.read("t", b"new-key")?, Some(b"x".to_vec()));
    assert!(after.id() > before.id());
    Ok(())
}

#[test]
fn test_abandoned_write_leaves_no_trace() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = open(dir.path())?;
    fill(&env, "t", 0, 10)?;

    {
        let mut writer = env.write_transaction()?;
        writer.add("t", b"000001", b"discarded")?;
        writer.create_tree("never")?;
    }

    let tx = env.read_transaction()?;
    assert_eq!(tx.read("t", b"000001")?, Some(b"round-0-value-1".to_vec()));
    assert!(!tx.contains_tree("never")?);

    // The write lock was released by the drop.
    fill(&env, "t", 1, 10)?;
    Ok(())
}

#[test]
fn test_pages_freed_after_a_reader_started_are_not_reused() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = open(dir.path())?;
    fill(&env, "t", 0, 500)?;

    let reader = env.read_transaction()?;

    // Every round rewrites every leaf; with the reader open none of the
    // pages it can reach may be handed out again.
    for round in 1..6 {
        fill(&env, "t", round, 500)?;
        env.force_log_flush_to_data_file()?;
    }
    assert!(env.stats()?.free_pages > 0);

    for i in (0..500).step_by(37) {
        assert_eq!(
            reader.read("t", format!("{:06}", i).as_bytes())?,
            Some(format!("round-0-value-{}", i).into_bytes())
        );
    }
    drop(reader);

    // With the reader gone the next writer takes the whole backlog.
    let used_before = env.stats()?.used_pages;
    fill(&env, "t", 6, 500)?;
    assert!(env.stats()?.used_pages <= used_before);
    Ok(())
}

#[test]
fn test_churn_stops_growing_the_file() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = open(dir.path())?;

    for round in 0..20 {
        fill(&env, "churn", round, 300)?;
    }
    let warmed_up = env.stats()?.used_pages;

    for round in 20..80 {
        fill(&env, "churn", round, 300)?;
        if round % 10 == 0 {
            env.force_log_flush_to_data_file()?;
        }
    }
    let later = env.stats()?.used_pages;
    assert!(
        later <= warmed_up + 8,
        "file kept growing: {} -> {} pages",
        warmed_up,
        later
    );
    Ok(())
}

#[test]
fn test_readers_run_alongside_a_writer_thread() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Arc::new(Environment::open(EnvironmentOptions::new(dir.path()))?);
    fill(&env, "t", 0, 200)?;

    let writer = {
        let env = Arc::clone(&env);
        thread::spawn(move || -> Result<()> {
            for round in 1..30 {
                fill(&env, "t", round, 200)?;
            }
            Ok(())
        })
    };

    for _ in 0..50 {
        let tx = env.read_transaction()?;
        let first = tx.read("t", b"000000")?.unwrap_or_default();
        let last = tx.read("t", b"000199")?.unwrap_or_default();
        let round_of = |value: &[u8]| {
            String::from_utf8_lossy(value)
                .split('-')
                .nth(1)
                .map(str::to_string)
        };
        // A snapshot never mixes two commits.
        assert_eq!(round_of(&first), round_of(&last));
    }

    writer.join().unwrap()?;
    Ok(())
}
