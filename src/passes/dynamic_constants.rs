use std::collections::{HashMap, HashSet};

use crate::attributes::bootstrap_methods;
use crate::classfile::ClassFile;
use crate::code::{Insn, op};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::FieldType;
use crate::error::DowngradeError;
use crate::feature::{CONSTANT_BOOTSTRAPS, CallSite, FeatureFinding, FeatureKind, Location, resolve_call_site, scan_methods};
use crate::version::TargetPolicy;

use super::{RewritePass, rewrite_instructions};

/// Folds `CONSTANT_Dynamic` entries from `ConstantBootstraps` into plain
/// instructions at every `ldc` that loads them.
///
/// The pool entry itself is overwritten with an unused `Integer` so no
/// index in the class shifts.
pub struct LowerDynamicConstants;

impl RewritePass for LowerDynamicConstants {
    fn name(&self) -> &'static str {
        "lower-dynamic-constants"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::DynamicConstant]
    }

    // Pattern switches may carry dynamic constants as labels; the call
    // sites must be gone before the entries can be.
    fn runs_after(&self) -> &'static [&'static str] {
        &["lower-pattern-switch", "lower-object-methods"]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let constants: Vec<u16> = findings
            .iter()
            .filter_map(|f| match f.location {
                Location::Constant { index } => Some(index),
                _ => None,
            })
            .collect();
        if constants.is_empty() {
            return Ok(0);
        }

        let bootstraps = bootstrap_methods(class)?;
        let methods = scan_methods(class)?;

        let mut live = HashSet::new();
        for method in &methods {
            for (_, insn) in &method.insns {
                if let Insn::InvokeDynamic { index } = insn {
                    live.insert(class.constant_pool.dynamic(*index)?.bootstrap_index);
                }
            }
        }

        let mut lowered = HashMap::new();
        for &index in &constants {
            let location = Location::Constant { index };
            let site = resolve_call_site(&class.constant_pool, &bootstraps, index)?;
            let in_use = live
                .iter()
                .any(|&b| bootstraps.get(b as usize).is_some_and(|bsm| bsm.arguments.contains(&index)));
            if in_use {
                return Err(DowngradeError::unsupported(
                    format!("dynamic constant {} used as a bootstrap argument", site.name),
                    location,
                ));
            }
            let replacement = lower(&mut class.constant_pool, &site, location)?;
            lowered.insert(index, replacement);
        }

        let mut edits = 0;
        for method in &methods {
            let mut replacements = HashMap::new();
            for (offset, insn) in &method.insns {
                let (index, wide) = match insn {
                    Insn::Ldc { index, .. } => (*index, false),
                    Insn::Ldc2 { index } => (*index, true),
                    _ => continue,
                };
                let Some(replacement) = lowered.get(&index) else {
                    continue;
                };
                if wide != replacement.wide {
                    return Err(DowngradeError::unsupported(
                        "dynamic constant loaded with the wrong width",
                        method.at(*offset),
                    ));
                }
                replacements.insert(*offset, vec![replacement.insn.clone()]);
            }
            edits += rewrite_instructions(class, method.index, replacements)?;
        }

        for index in lowered.into_keys() {
            class.constant_pool.replace(index, Constant::Integer(0))?;
            edits += 1;
        }
        tracing::debug!(edits, "lowered dynamic constants");
        Ok(edits)
    }
}

struct Lowered {
    insn: Insn,
    /// Whether the value takes two stack slots.
    wide: bool,
}

fn lower(pool: &mut ConstantPool, site: &CallSite, location: Location) -> Result<Lowered, DowngradeError> {
    let unsupported = || {
        DowngradeError::unsupported(
            format!("dynamic constant {} bootstrapped by {}", site.name, site.bootstrap_display()),
            location.clone(),
        )
    };
    if site.bootstrap.member.owner != CONSTANT_BOOTSTRAPS {
        return Err(unsupported());
    }
    let ty = FieldType::parse(&site.descriptor)?;

    let insn = match site.bootstrap.member.name.as_str() {
        "nullConstant" if ty.is_reference() => Insn::Simple(op::ACONST_NULL),
        "primitiveClass" => {
            let primitive = FieldType::primitive_from_name(&site.name).ok_or_else(unsupported)?;
            let wrapper = primitive.wrapper_class().ok_or_else(unsupported)?;
            Insn::Member {
                opcode: op::GETSTATIC,
                index: pool.field_ref_index(wrapper, "TYPE", "Ljava/lang/Class;")?,
            }
        }
        "getStaticFinal" => {
            let owner = match site.arguments.first() {
                Some(&declaring) => pool.class_name(declaring)?.into_owned(),
                None => match &ty {
                    FieldType::Object(name) => name.clone(),
                    other => other.wrapper_class().ok_or_else(unsupported)?.to_string(),
                },
            };
            Insn::Member {
                opcode: op::GETSTATIC,
                index: pool.field_ref_index(&owner, &site.name, &site.descriptor)?,
            }
        }
        "enumConstant" => {
            let FieldType::Object(owner) = &ty else {
                return Err(unsupported());
            };
            Insn::Member {
                opcode: op::GETSTATIC,
                index: pool.field_ref_index(owner, &site.name, &site.descriptor)?,
            }
        }
        _ => return Err(unsupported()),
    };
    Ok(Lowered {
        insn,
        wide: ty.slots() == 2,
    })
}
