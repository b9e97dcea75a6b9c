use clap::Parser;
use std::path::PathBuf;

use crate::version::JavaVersion;

#[derive(Debug, Clone, Parser)]
#[command(name = "class-downgrader")]
#[command(about = "Rewrite Java class files so they load on an older JVM")]
pub struct Cli {
    /// Jar, directory or single .class file to downgrade.
    #[arg(short = 'i', long, value_name = "PATH")]
    pub input: PathBuf,

    /// Where to write the result; takes the same shape as the input.
    #[arg(short = 'o', long, value_name = "PATH")]
    pub output: PathBuf,

    /// Target Java version, e.g. 8, 1.8 or java11.
    #[arg(short = 'v', long = "version", value_name = "VER")]
    pub target: JavaVersion,

    #[arg(short = 't', long, value_name = "N")]
    pub threads: Option<usize>,

    /// Write a JSON report of every entry to FILE.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Exit successfully even if some classes failed.
    #[arg(long)]
    pub keep_going: bool,
}
