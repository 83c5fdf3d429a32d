//! Show the effective configuration

use crate::config::{self, Config};
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(config: &Config, show_path: bool, example: bool) -> Result<()> {
    if example {
        println!("{}", config::example_config());
        return Ok(());
    }

    let location = config::config_file_path();
    if show_path {
        match location {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not determine config file path"),
        }
        return Ok(());
    }

    println!("{}", "Configuration".bold());
    match &location {
        Some(path) if path.exists() => {
            println!("{}: {}\n", "Location".dimmed(), path.display().dimmed())
        }
        Some(path) => println!(
            "{}: {} {}\n",
            "Location".dimmed(),
            path.display().dimmed(),
            "(not present, using defaults)".dimmed()
        ),
        None => println!("{}\n", "Using defaults".dimmed()),
    }

    println!("{}", "[watcher]".yellow());
    println!("  {} = {}", "buffer_size".cyan(), config.watcher.buffer_size);
    println!("  {} = {}", "nonblocking".cyan(), config.watcher.nonblocking);
    match config.watcher.watch_limit {
        Some(limit) => println!("  {} = {}", "watch_limit".cyan(), limit),
        None => println!("  {} = {}", "watch_limit".cyan(), "(kernel limit)".dimmed()),
    }

    println!("\n{}", "[walk]".yellow());
    println!(
        "  {} = {}",
        "follow_root_symlink".cyan(),
        config.walk.follow_root_symlink
    );

    println!("\n{}", "[logging]".yellow());
    match &config.logging.log_file {
        Some(path) => println!("  {} = {}", "log_file".cyan(), path.display()),
        None => println!("  {} = {}", "log_file".cyan(), "(stderr only)".dimmed()),
    }

    Ok(())
}
