//! Sum the sizes under a path

use crate::util;
use anyhow::{Context, Result};
use dirwatch_core::{CancelToken, Traversal, TreeSize, TreeWalker};
use owo_colors::OwoColorize;
use std::ops::ControlFlow;
use std::path::Path;
use tracing::info;

pub async fn run(root: &Path, dereference: bool, limit: Option<u64>) -> Result<()> {
    let root_bytes = util::path_bytes(root);
    let cancel = CancelToken::new();

    let walker = TreeWalker::new()
        .follow_root_symlink(dereference)
        .cancel_token(cancel.clone());

    let mut walk = tokio::task::spawn_blocking(move || {
        let mut total = TreeSize::default();
        let outcome = walker.walk(&root_bytes, |sample| {
            total.add(sample);
            match limit {
                Some(limit) if total.objects >= limit => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        });
        outcome.map(|traversal| (traversal, total))
    });

    let result = tokio::select! {
        result = &mut walk => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling walk");
            cancel.cancel();
            walk.await
        }
    };
    let (traversal, total) = result
        .context("Walk task failed")?
        .with_context(|| format!("Failed to walk {}", root.display()))?;

    println!("{}", root.display().to_string().bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Objects:       {}", total.objects.to_string().cyan());
    println!(
        "Logical size:  {} {}",
        util::format_size(total.logical_size).green(),
        format!("({} bytes)", total.logical_size).dimmed()
    );
    println!(
        "Allocated:     {} {}",
        util::format_size(total.allocated_bytes).green(),
        format!("({} bytes)", total.allocated_bytes).dimmed()
    );
    if traversal == Traversal::Stopped {
        println!("{}", "Stopped early at the object limit".yellow());
    }

    Ok(())
}
