//! Command line access to a pagestore environment.
//!
//! Usage:
//!   pagestore-cli <env_dir> put <tree> <key> <value>
//!   pagestore-cli <env_dir> get <tree> <key>
//!   pagestore-cli <env_dir> delete <tree> <key>
//!   pagestore-cli <env_dir> scan <tree> [start]
//!   pagestore-cli <env_dir> trees
//!   pagestore-cli <env_dir> drop-tree <tree>
//!   pagestore-cli <env_dir> stats
//!   pagestore-cli <env_dir> report
//!   pagestore-cli <env_dir> flush
//!   pagestore-cli <env_dir> bulk_insert <tree> <count>
//!
//! Set `PAGESTORE_OPTIONS` to a JSON options file to override defaults, and
//! `RUST_LOG` to control logging.

use pagestore::{Environment, EnvironmentOptions, Result, Slice, StorageError};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::process::exit;
use std::time::Instant;
use tracing_subscriber::{fmt, EnvFilter};

fn usage() -> ! {
    eprintln!("Usage: pagestore-cli <env_dir> <command> [args...]");
    eprintln!("Commands:");
    eprintln!("  put <tree> <key> <value>    - Insert or update a key, creating the tree");
    eprintln!("  get <tree> <key>            - Get the value of a key");
    eprintln!("  delete <tree> <key>         - Delete a key");
    eprintln!("  scan <tree> [start]         - List entries from start (or the beginning)");
    eprintln!("  trees                       - List tree names");
    eprintln!("  drop-tree <tree>            - Delete a tree and all its entries");
    eprintln!("  stats                       - Show environment statistics as JSON");
    eprintln!("  report                      - Show the per-tree storage report as JSON");
    eprintln!("  flush                       - Apply the journal to the data file");
    eprintln!("  bulk_insert <tree> <count>  - Insert count test records");
    exit(1);
}

fn arg(args: &[String], index: usize) -> &str {
    match args.get(index) {
        Some(value) => value,
        None => usage(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::invalid_operation(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn load_options(path: PathBuf) -> Result<EnvironmentOptions> {
    let mut options = match env::var_os("PAGESTORE_OPTIONS") {
        Some(file) => EnvironmentOptions::from_json_file(PathBuf::from(file).as_path())?,
        None => EnvironmentOptions::default(),
    };
    options.path = path;
    Ok(options)
}

fn run(env: &Environment, command: &str, args: &[String]) -> Result<()> {
    match command {
        "put" => {
            let (tree, key, value) = (arg(args, 3), arg(args, 4), arg(args, 5));
            let mut tx = env.write_transaction()?;
            if !tx.contains_tree(tree)? {
                tx.create_tree(tree)?;
            }
            tx.add(tree, key.as_bytes(), value.as_bytes())?;
            tx.commit()?;
            println!("OK");
        }

        "get" => {
            let (tree, key) = (arg(args, 3), arg(args, 4));
            let tx = env.read_transaction()?;
            match tx.read(tree, key.as_bytes())? {
                Some(value) => match String::from_utf8(value) {
                    Ok(s) => println!("{}", s),
                    Err(_) => println!("<binary data>"),
                },
                None => println!("NOT_FOUND"),
            }
        }

        "delete" => {
            let (tree, key) = (arg(args, 3), arg(args, 4));
            let mut tx = env.write_transaction()?;
            let deleted = tx.delete(tree, key.as_bytes())?;
            tx.commit()?;
            println!("{}", if deleted { "DELETED" } else { "NOT_FOUND" });
        }

        "scan" => {
            let tree = arg(args, 3);
            let tx = env.read_transaction()?;
            let mut it = tx.iterate(tree)?;
            match args.get(4) {
                Some(start) => it.seek(Slice::Key(start.as_bytes()))?,
                None => it.seek(Slice::BeforeAllKeys)?,
            };
            let entries = it.entries().collect::<Result<Vec<_>>>()?;
            println!("COUNT: {}", entries.len());
            for (key, value) in entries {
                println!(
                    "{} -> {}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }

        "trees" => {
            let tx = env.read_transaction()?;
            for name in tx.tree_names()? {
                println!("{}", name);
            }
        }

        "drop-tree" => {
            let tree = arg(args, 3);
            let mut tx = env.write_transaction()?;
            tx.delete_tree(tree)?;
            tx.commit()?;
            println!("OK");
        }

        "stats" => print_json(&env.stats()?)?,

        "report" => {
            let tx = env.read_transaction()?;
            print_json(&env.generate_report(&tx)?)?;
        }

        "flush" => {
            env.force_log_flush_to_data_file()?;
            println!("OK");
        }

        "bulk_insert" => {
            let tree = arg(args, 3);
            let count: usize = match arg(args, 4).parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("ERROR: Invalid count");
                    exit(1);
                }
            };

            let start = Instant::now();
            let mut tx = env.write_transaction()?;
            if !tx.contains_tree(tree)? {
                tx.create_tree(tree)?;
            }
            for i in 0..count {
                let key = format!("key_{:08}", i);
                let value = format!("value_{}", i);
                tx.add(tree, key.as_bytes(), value.as_bytes())?;
            }
            tx.commit()?;
            let elapsed = start.elapsed();

            println!("INSERTED: {}", count);
            println!("TIME_MS: {}", elapsed.as_millis());
            println!("OPS_PER_SEC: {:.0}", count as f64 / elapsed.as_secs_f64());
        }

        _ => {
            eprintln!("Unknown command: {}", command);
            usage();
        }
    }
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let options = match load_options(PathBuf::from(&args[1])) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            exit(1);
        }
    };
    let env = match Environment::open(options) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("ERROR: Failed to open environment: {}", e);
            exit(1);
        }
    };

    let result = run(&env, &args[2], &args);
    let closed = env.close();
    if let Err(e) = result {
        eprintln!("ERROR: {}", e);
        exit(1);
    }
    if let Err(e) = closed {
        eprintln!("ERROR: Failed to close environment: {}", e);
        exit(1);
    }
}
