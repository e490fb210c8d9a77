//! Reopen, crash recovery, durability modes and disk-full handling.

use pagestore::{
    Environment, EnvironmentOptions, Result, StorageError, TransactionsMode,
    TransactionsModeResult,
};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

fn options(dir: &Path) -> EnvironmentOptions {
    EnvironmentOptions::new(dir).manual_flushing(true)
}

fn put(env: &Environment, tree: &str, key: &str, value: &str) -> Result<()> {
    let mut tx = env.write_transaction()?;
    if !tx.contains_tree(tree)? {
        tx.create_tree(tree)?;
    }
    tx.add(tree, key.as_bytes(), value.as_bytes())?;
    tx.commit()
}

fn get(env: &Environment, tree: &str, key: &str) -> Result<Option<String>> {
    let tx = env.read_transaction()?;
    Ok(tx
        .read(tree, key.as_bytes())?
        .map(|v| String::from_utf8_lossy(&v).into_owned()))
}

fn journal_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.join("journal"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

/// Leave the environment without any shutdown work, as a crash would
fn crash(env: Environment) {
    std::mem::forget(env);
}

#[test]
fn test_clean_reopen_keeps_everything() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    put(&env, "a", "k1", "v1")?;
    put(&env, "b", "k2", "v2")?;
    let db_id = env.db_id();
    env.close()?;

    let env = Environment::open(options(dir.path()))?;
    assert_eq!(env.db_id(), db_id);
    assert_eq!(get(&env, "a", "k1")?, Some("v1".to_string()));
    assert_eq!(get(&env, "b", "k2")?, Some("v2".to_string()));
    assert!(!env.recovery_report().data_lost);
    Ok(())
}

#[test]
fn test_crash_after_journal_write_replays_commits() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    put(&env, "t", "one", "1")?;
    put(&env, "t", "two", "2")?;
    crash(env);

    let env = Environment::open(options(dir.path()))?;
    let report = env.recovery_report().clone();
    assert_eq!(report.replayed_transactions, vec![2, 3]);
    assert!(!report.data_lost);
    assert_eq!(get(&env, "t", "one")?, Some("1".to_string()));
    assert_eq!(get(&env, "t", "two")?, Some("2".to_string()));
    Ok(())
}

#[test]
fn test_crash_before_header_write_recovers_from_journal() -> Result<()> {
    let dir = tempdir().unwrap();
    // Lazy commits leave the header to the applicator.
    let env = Environment::open(options(dir.path()).transactions_mode(TransactionsMode::Lazy))?;
    put(&env, "t", "k", "v")?;
    crash(env);

    let env = Environment::open(options(dir.path()))?;
    assert_eq!(env.recovery_report().replayed_transactions, vec![2]);
    assert_eq!(get(&env, "t", "k")?, Some("v".to_string()));
    Ok(())
}

#[test]
fn test_torn_journal_tail_loses_only_the_torn_commit() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    put(&env, "t", "first", "kept")?;
    put(&env, "t", "second", "torn")?;
    crash(env);

    let files = journal_files(dir.path());
    let last = files.last().unwrap();
    let len = fs::metadata(last)?.len();
    OpenOptions::new().write(true).open(last)?.set_len(len - 100)?;

    let env = Environment::open(options(dir.path()))?;
    let report = env.recovery_report();
    assert!(report.data_lost);
    assert_eq!(report.replayed_transactions, vec![2]);
    assert_eq!(get(&env, "t", "first")?, Some("kept".to_string()));
    assert_eq!(get(&env, "t", "second")?, None);

    // The environment keeps working past the lost commit.
    put(&env, "t", "third", "after")?;
    assert_eq!(get(&env, "t", "third")?, Some("after".to_string()));
    Ok(())
}

#[test]
fn test_recovery_is_idempotent() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    put(&env, "t", "k", "v")?;
    crash(env);

    let env = Environment::open(options(dir.path()))?;
    crash(env);
    let env = Environment::open(options(dir.path()))?;
    assert!(env.recovery_report().replayed_transactions.is_empty());
    assert_eq!(get(&env, "t", "k")?, Some("v".to_string()));
    Ok(())
}

#[test]
fn test_applied_journal_files_are_recycled() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()).max_journal_file_size(16 * 1024))?;
    for i in 0..20 {
        put(&env, "t", &format!("k{}", i), &"x".repeat(200))?;
    }
    assert!(env.stats()?.journal_files > 1);

    env.flush_log_to_data_file()?;
    assert_eq!(env.stats()?.unflushed_pages, 0);
    env.truncate_journal()?;
    assert_eq!(env.stats()?.journal_files, 1);

    env.close()?;
    let env = Environment::open(options(dir.path()))?;
    assert!(env.recovery_report().replayed_transactions.is_empty());
    assert_eq!(get(&env, "t", "k19")?, Some("x".repeat(200)));
    Ok(())
}

#[test]
fn test_background_flusher_applies_commits() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(
        EnvironmentOptions::new(dir.path())
            .idle_flush_timeout(Duration::from_millis(10))
            .max_unflushed_pages_before_flush(1),
    )?;
    put(&env, "t", "k", "v")?;

    let mut waited = Duration::ZERO;
    while env.stats()?.unflushed_pages > 0 && waited < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(env.stats()?.unflushed_pages, 0);
    Ok(())
}

#[test]
fn test_lazy_mode_is_durable_after_close() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    assert_eq!(
        env.set_transaction_mode(TransactionsMode::Lazy, None)?,
        TransactionsModeResult::SetModeSuccessfully
    );
    for i in 0..50 {
        put(&env, "lazy", &format!("{:03}", i), "v")?;
    }
    env.close()?;

    let env = Environment::open(options(dir.path()))?;
    assert_eq!(get(&env, "lazy", "049")?, Some("v".to_string()));
    Ok(())
}

#[test]
fn test_danger_mode_truncates_journal_on_switch() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    put(&env, "t", "safe", "1")?;

    env.set_transaction_mode(TransactionsMode::Danger, None)?;
    assert_eq!(env.stats()?.unflushed_pages, 0);
    put(&env, "t", "danger", "2")?;

    env.set_transaction_mode(TransactionsMode::Safe, None)?;
    assert_eq!(env.stats()?.unflushed_pages, 0);
    assert_eq!(env.stats()?.journal_files, 1);
    env.close()?;

    let env = Environment::open(options(dir.path()))?;
    assert_eq!(get(&env, "t", "danger")?, Some("2".to_string()));
    Ok(())
}

#[test]
fn test_disk_full_pauses_flushing_until_space_returns() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()).max_storage_size(Some(16 * 4096)))?;

    let mut tx = env.write_transaction()?;
    tx.create_tree("big")?;
    for i in 0..40 {
        tx.add("big", format!("{:04}", i).as_bytes(), &[i as u8; 2000])?;
    }
    tx.commit()?;

    let err = env.force_log_flush_to_data_file().unwrap_err();
    assert!(err.is_disk_full());
    assert!(env.is_out_of_disk_space());

    // Committed data stays readable from the journal meanwhile.
    let tx = env.read_transaction()?;
    assert_eq!(tx.read("big", b"0039")?, Some(vec![39u8; 2000]));
    drop(tx);

    env.set_max_storage_size(None);
    assert!(!env.is_out_of_disk_space());
    env.force_log_flush_to_data_file()?;
    assert_eq!(env.stats()?.unflushed_pages, 0);
    assert!(env.stats()?.allocated_data_file_bytes > 16 * 4096);
    Ok(())
}

#[test]
fn test_metadata_validation_on_open() -> Result<()> {
    let dir = tempdir().unwrap();
    Environment::open(options(dir.path()).schema_version(7))?.close()?;

    match Environment::open(options(dir.path()).schema_version(8)) {
        Err(StorageError::Unrecoverable(msg)) => assert!(msg.contains("schema version")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("schema mismatch was accepted"),
    }

    let env = Environment::open(options(dir.path()).schema_version(7))?;
    let mut tx = env.write_transaction()?;
    tx.delete_tree("$metadata")?;
    tx.commit()?;
    env.close()?;

    assert!(matches!(
        Environment::open(options(dir.path())),
        Err(StorageError::Unrecoverable(_))
    ));
    Ok(())
}

#[test]
fn test_stats_and_report_describe_the_file() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()))?;
    put(&env, "t", "k", "v")?;

    let stats = env.stats()?;
    assert_eq!(stats.last_committed_transaction, 2);
    assert_eq!(stats.next_write_transaction, 3);
    assert!(stats.used_pages <= stats.allocated_pages);
    assert_eq!(
        stats.allocated_data_file_bytes,
        stats.allocated_pages * pagestore::PAGE_SIZE as u64
    );

    let tx = env.read_transaction()?;
    let report = env.generate_report(&tx)?;
    let names: Vec<&str> = report.trees.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["$root", "$free-space", "$metadata", "t"]);
    assert_eq!(report.trees[3].state.entries, 1);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["trees"][3]["name"], "t");
    assert_eq!(json["trees"][3]["entries"], 1);
    Ok(())
}

#[test]
fn test_background_flush_failure_is_reported_once() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(
        EnvironmentOptions::new(dir.path())
            .idle_flush_timeout(Duration::from_secs(60))
            .max_unflushed_pages_before_flush(1),
    )?;

    // Appends still reach the open journal file, but the flusher cannot
    // start the next one once it has applied this commit.
    fs::remove_dir_all(dir.path().join("journal"))?;
    put(&env, "t", "k", "v")?;

    let mut waited = Duration::ZERO;
    let reported = loop {
        match env.read_transaction() {
            Err(StorageError::Unrecoverable(msg)) => break msg,
            Err(other) => panic!("unexpected error: {}", other),
            Ok(tx) => drop(tx),
        }
        assert!(waited < Duration::from_secs(10), "flush failure never surfaced");
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    };
    assert!(reported.contains("background flush failed"));

    // Reported once, then the environment carries on.
    let tx = env.write_transaction()?;
    drop(tx);
    assert_eq!(get(&env, "t", "k")?, Some("v".to_string()));
    Ok(())
}

#[test]
fn test_failed_journal_write_poisons_the_environment() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(options(dir.path()).max_journal_file_size(16 * 1024))?;
    put(&env, "t", "small", "v")?;

    // The next commit does not fit in the current file and has nowhere to
    // rotate to.
    fs::remove_dir_all(dir.path().join("journal"))?;
    let mut tx = env.write_transaction()?;
    tx.add("t", b"big", &[1u8; 20_000])?;
    assert!(matches!(tx.commit(), Err(StorageError::Unrecoverable(_))));

    for _ in 0..2 {
        assert!(matches!(
            env.write_transaction(),
            Err(StorageError::Unrecoverable(_))
        ));
        assert!(matches!(
            env.read_transaction(),
            Err(StorageError::Unrecoverable(_))
        ));
    }
    Ok(())
}
