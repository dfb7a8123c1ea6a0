//! # unik CLI
//!
//! Builds bootable unikernel images and inspects the filesystems inside them.

use anyhow::Result;
use clap::{Parser, Subcommand};
use unik_config::logging::{init_logging, LogLevel};

mod config;
mod inspect;
mod mkfs;

/// unik - unikernel image builder
#[derive(Parser)]
#[command(name = "unik")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a program and its files
    Mkfs(mkfs::MkfsArgs),

    /// List a directory of an image filesystem
    Ls(inspect::LsArgs),

    /// Write a file of an image filesystem to stdout
    Cat(inspect::CatArgs),

    /// Copy files out of an image filesystem
    Cp(inspect::CpArgs),

    /// Show the environment variables stored in an image
    Env(inspect::EnvArgs),

    /// Show filesystem UUID, label and boot attributes
    Info(inspect::InfoArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: config::ConfigCommands,
    },
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let level = {
        let config = unik_config::config();
        LogLevel::parse(&config.log.level).unwrap_or(LogLevel::Warn)
    };
    init_logging(level);

    let cli = Cli::parse();
    match cli.command {
        Commands::Mkfs(args) => mkfs::run(args),
        Commands::Ls(args) => inspect::ls(args),
        Commands::Cat(args) => inspect::cat(args),
        Commands::Cp(args) => inspect::cp(args),
        Commands::Env(args) => inspect::env(args),
        Commands::Info(args) => inspect::info(args),
        Commands::Config { command } => config::run(command),
    }
}
