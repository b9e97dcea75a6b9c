//! Error types for class file parsing and downgrading.
//!
//! `ClassFormatError` covers everything that makes an input unreadable.
//! `DowngradeError` is the per-class failure surfaced by the pipeline; it is
//! always local to one class file and never aborts a batch.

use serde::Serialize;
use thiserror::Error;

use crate::code::EncodeError;
use crate::constant_pool::PoolOverflow;
use crate::feature::Location;
use crate::version::JavaVersion;

/// The input is not a well-formed class file.
///
/// Truncated reads are reported as `Truncated`, which is how an I/O level
/// corruption of the buffer shows up to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFormatError {
    #[error("unexpected end of input at offset {offset:#x} (needed {needed} more bytes)")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic number {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { index: u16, tag: u8 },

    #[error("constant pool index {index} out of range (pool count {count})")]
    ConstantIndexOutOfRange { index: u16, count: u16 },

    #[error("constant pool entry {index} is {found}, expected {expected}")]
    ConstantTypeMismatch {
        index: u16,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid modified UTF-8 in constant pool entry {index}")]
    InvalidUtf8 { index: u16 },

    #[error("{count} trailing bytes after end of class file")]
    TrailingBytes { count: usize },

    #[error("unknown opcode {opcode:#04x} at code offset {offset}")]
    UnknownOpcode { offset: u32, opcode: u8 },

    #[error("code offset {offset} is not an instruction boundary")]
    InvalidCodeOffset { offset: u32 },

    #[error("malformed {name} attribute: {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("invalid descriptor {descriptor:?}")]
    InvalidDescriptor { descriptor: String },
}

impl ClassFormatError {
    pub(crate) fn attribute(name: &str, reason: impl Into<String>) -> Self {
        ClassFormatError::InvalidAttribute {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Coarse classification of a per-class failure, used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedClass,
    UnsupportedConstruct,
    NonConvergingRewrite,
}

/// Why a single class file could not be downgraded.
#[derive(Debug, Clone, Error)]
pub enum DowngradeError {
    #[error("malformed class file{}: {source}", display_name(.class_name))]
    Malformed {
        class_name: Option<String>,
        #[source]
        source: ClassFormatError,
    },

    #[error(
        "{construct} at {location}{} cannot be expressed for {}",
        display_name(.class_name),
        display_target(.target)
    )]
    Unsupported {
        class_name: Option<String>,
        construct: String,
        location: Location,
        target: Option<JavaVersion>,
    },

    #[error("rewriting {class_name} did not converge after {rounds} rounds (still violating: {remaining})")]
    NonConverging {
        class_name: String,
        rounds: usize,
        remaining: String,
    },
}

fn display_target(target: &Option<JavaVersion>) -> String {
    match target {
        Some(version) => version.to_string(),
        None => "the target version".to_string(),
    }
}

fn display_name(class_name: &Option<String>) -> String {
    match class_name {
        Some(name) => format!(" in {name}"),
        None => String::new(),
    }
}

impl DowngradeError {
    pub fn unsupported(construct: impl Into<String>, location: Location) -> Self {
        DowngradeError::Unsupported {
            class_name: None,
            construct: construct.into(),
            location,
            target: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DowngradeError::Malformed { .. } => ErrorKind::MalformedClass,
            DowngradeError::Unsupported { .. } => ErrorKind::UnsupportedConstruct,
            DowngradeError::NonConverging { .. } => ErrorKind::NonConvergingRewrite,
        }
    }

    pub fn class_name(&self) -> Option<&str> {
        match self {
            DowngradeError::Malformed { class_name, .. }
            | DowngradeError::Unsupported { class_name, .. } => class_name.as_deref(),
            DowngradeError::NonConverging { class_name, .. } => Some(class_name),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            DowngradeError::Unsupported { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Fills in the class name and target if the error was raised without them.
    pub(crate) fn in_context(mut self, name: &str, version: JavaVersion) -> Self {
        match &mut self {
            DowngradeError::Malformed { class_name, .. } => {
                class_name.get_or_insert_with(|| name.to_string());
            }
            DowngradeError::Unsupported {
                class_name, target, ..
            } => {
                class_name.get_or_insert_with(|| name.to_string());
                target.get_or_insert(version);
            }
            DowngradeError::NonConverging { .. } => {}
        }
        self
    }
}

impl From<ClassFormatError> for DowngradeError {
    fn from(source: ClassFormatError) -> Self {
        DowngradeError::Malformed {
            class_name: None,
            source,
        }
    }
}

impl From<PoolOverflow> for DowngradeError {
    fn from(err: PoolOverflow) -> Self {
        DowngradeError::unsupported(err.to_string(), Location::Class)
    }
}

impl From<EncodeError> for DowngradeError {
    fn from(err: EncodeError) -> Self {
        DowngradeError::unsupported(format!("rewritten code ({err})"), Location::Class)
    }
}
