//! Drives one class file from raw bytes to downgraded bytes.
//!
//! Each call owns its [`ClassFile`] from parse to serialise; the
//! [`Downgrader`] itself only holds the immutable policy and pass registry,
//! so one instance can be shared by every worker of a batch.

use serde::Serialize;

use crate::classfile::ClassFile;
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, detect, detect_all};
use crate::passes::{PassRegistry, RewritePlan};
use crate::reader::{parse, peek_class_name};
use crate::version::{JavaVersion, TargetPolicy};
use crate::writer::serialize;

/// Planning rounds before a class is declared non-converging.
pub const MAX_REWRITE_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsed,
    Analyzed,
    Planned,
    Rewriting,
    Serialized,
    Failed,
}

/// What happened to one class file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Passes that made at least one edit, in application order.
    pub applied_passes: Vec<&'static str>,
    /// Violations found before rewriting.
    pub findings: Vec<FeatureFinding>,
    pub rounds: usize,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone)]
pub struct Downgraded {
    pub bytes: Vec<u8>,
    pub class_name: String,
    /// Version stamped on the output.
    pub version: JavaVersion,
    pub diagnostic: Diagnostic,
    /// False when the input already satisfied the target and was passed through.
    pub changed: bool,
}

#[derive(Debug)]
pub struct Downgrader {
    policy: TargetPolicy,
    registry: PassRegistry,
}

impl Downgrader {
    pub fn new(policy: TargetPolicy) -> Self {
        Self::with_registry(policy, PassRegistry::standard())
    }

    pub fn with_registry(policy: TargetPolicy, registry: PassRegistry) -> Self {
        Self { policy, registry }
    }

    pub fn policy(&self) -> &TargetPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &PassRegistry {
        &self.registry
    }

    pub fn downgrade(&self, bytes: &[u8]) -> Result<Downgraded, DowngradeError> {
        let target = self.policy.target();
        let mut class = match parse(bytes) {
            Ok(class) => class,
            Err(err) => {
                let err = DowngradeError::from(err);
                return Err(match peek_class_name(bytes) {
                    Some(name) => err.in_context(&name, target),
                    None => err,
                });
            }
        };
        let name = class.name().map_err(DowngradeError::from)?;

        let mut diagnostic = Diagnostic {
            stages: vec![Stage::Parsed],
            ..Diagnostic::default()
        };
        match self.run(&mut class, &mut diagnostic) {
            Ok(Some(version)) => {
                diagnostic.stages.push(Stage::Serialized);
                Ok(Downgraded {
                    bytes: serialize(&class),
                    class_name: name,
                    version,
                    diagnostic,
                    changed: true,
                })
            }
            Ok(None) => {
                diagnostic.stages.push(Stage::Serialized);
                Ok(Downgraded {
                    bytes: bytes.to_vec(),
                    version: JavaVersion::from_major(class.major_version).unwrap_or(target),
                    class_name: name,
                    diagnostic,
                    changed: false,
                })
            }
            Err(err) => {
                diagnostic.stages.push(Stage::Failed);
                tracing::debug!(class = %name, stages = ?diagnostic.stages, "downgrade failed");
                Err(err.in_context(&name, target))
            }
        }
    }

    /// Rewrites `class` in place. `None` means the input was already legal
    /// and should be passed through untouched.
    fn run(&self, class: &mut ClassFile, diagnostic: &mut Diagnostic) -> Result<Option<JavaVersion>, DowngradeError> {
        let target = self.policy.target();
        if class.major_version <= target.major() {
            diagnostic.stages.push(Stage::Analyzed);
            return Ok(None);
        }

        let mut findings = detect_all(class, &self.policy)?;
        diagnostic.stages.push(Stage::Analyzed);
        diagnostic.findings = findings.clone();

        let mut round = 0;
        while !findings.is_empty() {
            if round == MAX_REWRITE_ROUNDS {
                return Err(non_converging(class, round, &findings));
            }
            round += 1;
            let plan = RewritePlan::build(&self.registry, &findings)?;
            diagnostic.stages.push(Stage::Planned);
            diagnostic.stages.push(Stage::Rewriting);

            for &step in plan.steps() {
                let pass = self.registry.get(step);
                let consumed = detect(class, &self.policy, pass.consumes())?;
                if consumed.is_empty() {
                    continue;
                }
                let edits = pass.apply(class, &consumed, &self.policy)?;
                tracing::debug!(pass = pass.name(), findings = consumed.len(), edits, round, "applied pass");
                if edits > 0 && !diagnostic.applied_passes.contains(&pass.name()) {
                    diagnostic.applied_passes.push(pass.name());
                }
                if !pass.introduces().is_empty() {
                    let introduced = detect(class, &self.policy, pass.introduces())?;
                    if !introduced.is_empty() {
                        tracing::debug!(pass = pass.name(), count = introduced.len(), "replanning after new violations");
                        break;
                    }
                }
            }
            findings = detect_all(class, &self.policy)?;
        }
        diagnostic.rounds = round;

        let stamped = stamp_version(class, target);
        Ok(Some(stamped))
    }
}

/// Lowers the class to `target` (never raises it) and clears the minor
/// version, which only Java 1.1 era and preview classes use.
fn stamp_version(class: &mut ClassFile, target: JavaVersion) -> JavaVersion {
    let major = class.major_version.min(target.major());
    class.major_version = major;
    class.minor_version = 0;
    JavaVersion::from_major(major).unwrap_or(target)
}

fn non_converging(class: &ClassFile, rounds: usize, findings: &[FeatureFinding]) -> DowngradeError {
    let mut kinds: Vec<FeatureKind> = findings.iter().map(|f| f.kind).collect();
    kinds.sort();
    kinds.dedup();
    let remaining = kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ");
    DowngradeError::NonConverging {
        class_name: class.name().unwrap_or_default(),
        rounds,
        remaining,
    }
}
