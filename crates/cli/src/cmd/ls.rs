//! List one directory

use crate::util;
use anyhow::{Context, Result};
use dirwatch_core::{list, path, DirEntry, ListOptions};
use owo_colors::OwoColorize;
use std::ops::ControlFlow;
use std::path::Path;

pub async fn run(dir: &Path, all: bool, no_follow: bool) -> Result<()> {
    let root = util::path_bytes(dir);
    let options = ListOptions {
        follow_symlink: !no_follow,
        include_dots: all,
    };

    let mut entries: Vec<DirEntry> = Vec::new();
    list(&root, options, |entry| {
        entries.push(entry.clone());
        ControlFlow::Continue(())
    })
    .with_context(|| format!("Failed to list {}", dir.display()))?;

    entries.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in &entries {
        println!(
            "{} {:>12} {}",
            entry.kind.symbol(),
            entry.inode.to_string().dimmed(),
            util::styled_name(&entry.name, entry.kind)
        );
    }
    println!(
        "\n{} {} in {}",
        entries.len().to_string().bold(),
        if entries.len() == 1 { "entry" } else { "entries" },
        path::display(&root).cyan()
    );

    Ok(())
}
