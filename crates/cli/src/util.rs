//! Shared utilities for CLI commands

use dirwatch_core::{path, FileKind};
use owo_colors::OwoColorize;
use std::path::Path;

/// Native bytes of a command-line path
pub fn path_bytes(path: &Path) -> Vec<u8> {
    path::from_path(path).to_vec()
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Entry name colored by kind
pub fn styled_name(name: &[u8], kind: FileKind) -> String {
    let name = path::display(name);
    match kind {
        FileKind::Dir => name.blue().bold().to_string(),
        FileKind::Link => name.cyan().to_string(),
        _ => name.into_owned(),
    }
}
