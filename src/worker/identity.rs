//! Stable worker identity.
//!
//! The node id is a UUID generated on first run and persisted as a plain
//! text file in the work dir, so the node keeps its identity across restarts
//! and re-registers under the same id.

use std::fs;
use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::error::Result;

const NODE_ID_FILE: &str = "node_id";

pub fn load_or_create(work_dir: &Path) -> Result<String> {
    fs::create_dir_all(work_dir)?;
    let path = work_dir.join(NODE_ID_FILE);

    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if Uuid::parse_str(trimmed).is_ok() {
            return Ok(trimmed.to_string());
        }
    }

    let id = Uuid::new_v4().to_string();
    fs::write(&path, &id)?;
    info!(node_id = %id, "generated new node identity");
    Ok(id)
}
