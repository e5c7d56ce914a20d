use std::process;

use rand::seq::SliceRandom;

use pagedb::btree::{BPlusTree, INTERNAL_MAX_KEYS, LEAF_MAX_ENTRIES, TreeResult};
use pagedb::storage::{BufferManager, DiskManager};

const DB_FILE: &str = "test.db";
const NUM_KEYS: i32 = 10_000;

fn main() {
    let _ = std::fs::remove_file(DB_FILE);

    let result = run();

    let _ = std::fs::remove_file(DB_FILE);

    if let Err(e) = result {
        eprintln!("Test run failed: {}", e);
        process::exit(1);
    }

    println!("\n*** B+ tree test completed successfully! ***");
}

fn open_tree() -> TreeResult<BPlusTree> {
    let disk = DiskManager::open(DB_FILE)?;
    BPlusTree::new(BufferManager::new(disk))
}

fn value_for(key: i32) -> String {
    format!("value_{}", key)
}

fn run() -> TreeResult<()> {
    println!("=== B+ Tree Persistence & Range Scan Test ===");
    println!("LEAF_MAX_ENTRIES: {}", LEAF_MAX_ENTRIES);
    println!("INTERNAL_MAX_KEYS: {}", INTERNAL_MAX_KEYS);

    // Random insertion order stresses the split paths
    let mut keys: Vec<i32> = (0..NUM_KEYS).collect();
    keys.shuffle(&mut rand::rng());

    build_phase(&keys)?;
    persistence_phase(&keys)?;
    deletion_phase()?;

    Ok(())
}

fn build_phase(keys: &[i32]) -> TreeResult<()> {
    println!("\n=== Phase 1: Building Tree with {} keys ===", NUM_KEYS);

    let mut tree = open_tree()?;

    for &key in keys {
        tree.insert(key, &value_for(key))?;
    }
    println!("  ✓ Inserted {} keys in random order", NUM_KEYS);

    let mut found = 0;
    for &key in keys {
        if tree.search(key)? == Some(value_for(key)) {
            found += 1;
        }
    }
    println!("  ✓ Verified {}/{} keys in memory", found, NUM_KEYS);

    if tree.search(-1)?.is_none() {
        println!("  ✓ Non-existent key (-1) correctly returned None");
    }
    if tree.search(999_999)?.is_none() {
        println!("  ✓ Non-existent key (999999) correctly returned None");
    }

    // Dropping the tree flushes everything to disk
    drop(tree);
    println!("  ✓ Phase 1 complete - Tree released from memory");
    Ok(())
}

fn persistence_phase(keys: &[i32]) -> TreeResult<()> {
    println!("\n=== Phase 2: Persistence Verification ===");

    let mut tree = open_tree()?;
    println!("  ✓ Tree recovered root page id from the meta page");

    let mut found = 0;
    for &key in keys {
        if tree.search(key)? == Some(value_for(key)) {
            found += 1;
        }
    }
    println!("  ✓ Verified {}/{} keys recovered from disk", found, NUM_KEYS);

    println!("\n=== Phase 3: Range Scan - Leaf Chain Verification ===");

    let results = tree.scan(100, 200)?;
    println!("  Scan(100, 200) returned {} results", results.len());

    let all_in_range = results.iter().all(|(key, _)| (100..=200).contains(key));
    let is_sorted = results.windows(2).all(|w| w[0].0 < w[1].0);
    println!(
        "  ✓ All results in range [100, 200]: {}",
        if all_in_range { "YES" } else { "NO" }
    );
    println!("  ✓ Results are sorted: {}", if is_sorted { "YES" } else { "NO" });

    let results = tree.scan(0, NUM_KEYS - 1)?;
    println!(
        "  Scan(0, {}): Found {} keys (expected {})",
        NUM_KEYS - 1,
        results.len(),
        NUM_KEYS
    );

    let results = tree.scan(1000, 2000)?;
    println!("  Scan(1000, 2000): Found {} keys (expected 1001)", results.len());

    let results = tree.scan(250, 250)?;
    println!("  Scan(250, 250): Found {} keys (expected 1)", results.len());

    let results = tree.scan(0, 99)?;
    println!("  Scan(0, 99): Found {} keys (expected 100)", results.len());

    let results = tree.scan(400, 499)?;
    println!("  Scan(400, 499): Found {} keys (expected 100)", results.len());

    println!("\n  ✓ Phases 2-3 complete - All persistence verified");
    Ok(())
}

fn deletion_phase() -> TreeResult<()> {
    println!("\n=== Phase 4: Lazy Deletion Test ===");

    // Fresh file for the deletion walkthrough
    let _ = std::fs::remove_file(DB_FILE);
    let mut tree = open_tree()?;

    println!("  Inserting keys 1-10...");
    for key in 1..=10 {
        tree.insert(key, &value_for(key))?;
    }

    let removed = tree.remove(5)?;
    println!(
        "  Removed key 5: {}",
        if removed { "Success" } else { "Failed" }
    );

    if tree.search(5)?.is_none() {
        println!("  ✓ Search(5) correctly returns None after deletion");
    }
    if tree.search(4)? == Some(value_for(4)) {
        println!("  ✓ Search(4) still finds its value");
    }
    if tree.search(6)? == Some(value_for(6)) {
        println!("  ✓ Search(6) still finds its value");
    }

    let results = tree.scan(1, 10)?;
    println!(
        "  Scan(1, 10) returned {} results (expected 9, key 5 deleted)",
        results.len()
    );
    if results.iter().all(|(key, _)| *key != 5) {
        println!("  ✓ Deleted key 5 not included in scan results");
    }

    if !tree.remove(999)? {
        println!("  ✓ Remove(999) correctly returns false for a missing key");
    }

    Ok(())
}
