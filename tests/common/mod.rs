#![allow(dead_code)]

use std::sync::Once;

use stoneforge::Workspace;
use tempfile::TempDir;

pub mod fixtures;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        stoneforge::logging::init_test_logging();
    });
}

pub fn test_db() -> Workspace {
    init_test_logging();
    Workspace::open_memory().expect("Failed to create test workspace")
}

pub fn test_db_with_dir() -> (Workspace, TempDir) {
    init_test_logging();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("stoneforge.db");
    let workspace = Workspace::open(&db_path).expect("Failed to create test workspace");
    (workspace, dir)
}
