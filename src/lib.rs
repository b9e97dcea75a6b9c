//! # class-downgrader
//!
//! Rewrites compiled Java class files so they load on an older JVM.
//!
//! ## Architecture
//!
//! - **reader / writer**: exact binary parse and serialise of class files
//! - **constant_pool / classfile / attributes**: the structural model
//! - **code / stackmap / builder**: instruction streams with symbolic labels
//! - **feature**: detectors reporting constructs newer than the target
//! - **passes**: rewrite passes lowering each construct, and their ordering
//! - **pipeline**: per-class orchestration with bounded re-analysis
//! - **batch**: parallel processing of many classes with rayon
//! - **archive / report / cli / config**: the command-line surface

pub mod api;
pub mod archive;
pub mod attributes;
pub mod batch;
pub mod builder;
pub mod classfile;
pub mod cli;
pub mod code;
pub mod config;
pub mod constant_pool;
pub mod descriptor;
pub mod error;
pub mod feature;
pub mod passes;
pub mod pipeline;
pub mod reader;
pub mod report;
pub mod stackmap;
pub mod version;
pub mod writer;

pub use error::{ClassFormatError, DowngradeError, ErrorKind};
pub use pipeline::{Downgraded, Downgrader};
pub use version::{JavaVersion, TargetPolicy};
