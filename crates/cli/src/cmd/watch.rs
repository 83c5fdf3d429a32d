//! Print changes to a directory until interrupted

use crate::config::Config;
use crate::util;
use anyhow::{Context, Result};
use dirwatch_core::{path, Error};
use owo_colors::OwoColorize;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info};
use watcher::{Observation, ObserveOptions, ObservedKind, Observer};

enum Notice {
    Change(ObservedKind, Option<Vec<u8>>),
    Incomplete(String),
}

/// Forwards notifications from the reader thread to the async loop
struct Forwarder {
    tx: UnboundedSender<Notice>,
}

impl Observer for Forwarder {
    fn on_event(&self, kind: ObservedKind, child: Option<&[u8]>) {
        let _ = self.tx.send(Notice::Change(kind, child.map(<[u8]>::to_vec)));
    }

    fn on_incomplete_observation(&self, cause: &Error) {
        let _ = self.tx.send(Notice::Incomplete(cause.to_string()));
    }
}

pub async fn run(dir: &Path, no_follow: bool, config: &Config) -> Result<()> {
    let root = util::path_bytes(dir);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = ObserveOptions {
        follow_symlink: !no_follow,
        watch_limit: config.watcher.watch_limit,
        nonblocking: config.watcher.nonblocking,
        buffer_size: config.watcher.buffer_size,
    };

    let mut children = 0usize;
    let mut observation = Observation::start(&root, options, Arc::new(Forwarder { tx }), |_| {
        children += 1;
        ControlFlow::Continue(())
    })
    .with_context(|| format!("Failed to watch {}", dir.display()))?;

    println!(
        "{} {} {}",
        "Watching".bold(),
        dir.display().to_string().cyan(),
        format!(
            "({} entries, {} subdirectories)",
            children,
            observation.watched_children()
        )
        .dimmed()
    );
    if observation.is_closed() {
        let reason = observation.close_reason().unwrap_or_default();
        println!("{} {}", "Not watching for changes:".yellow(), reason);
        return Ok(());
    }
    println!("{}", "Press Ctrl-C to stop".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            notice = rx.recv() => match notice {
                Some(Notice::Change(kind, child)) => {
                    print_change(kind, child.as_deref(), &root);
                    if kind == ObservedKind::Delete && child.is_none() {
                        break;
                    }
                }
                Some(Notice::Incomplete(cause)) => {
                    println!("{} {}", "Some changes will not be reported:".yellow(), cause);
                }
                None => break,
            }
        }
    }

    let reason = observation.close_reason();
    tokio::task::spawn_blocking(move || observation.close())
        .await
        .context("Close task failed")?
        .or_else(|e| if e.is_benign() { Ok(()) } else { Err(e) })
        .context("Failed to stop watching")?;
    if let Some(reason) = reason {
        debug!("Observation ended: {}", reason);
    }

    Ok(())
}

fn print_change(kind: ObservedKind, child: Option<&[u8]>, root: &[u8]) {
    let label = match kind {
        ObservedKind::Create => "create".green().to_string(),
        ObservedKind::Delete => "delete".red().to_string(),
        ObservedKind::Modify => "modify".yellow().to_string(),
    };
    match child {
        Some(name) => println!("{:>8} {}", label, path::display(name)),
        None => println!("{:>8} {}", label, path::display(root).bold()),
    }
}
