//! Rewrite passes and the order they run in.
//!
//! A pass consumes findings of some [`FeatureKind`]s and lowers them into
//! constructs the target accepts. Passes may emit constructs another pass
//! consumes, which is what `runs_after` and `introduces` describe.

mod api_calls;
mod dynamic_constants;
mod interface_methods;
mod nestmates;
mod object_methods;
mod pattern_switch;
mod records;
mod sealed;
mod string_concat;
mod versioned_attributes;

pub use api_calls::ReplaceApiCalls;
pub use dynamic_constants::LowerDynamicConstants;
pub use interface_methods::LowerPrivateInterfaceMethods;
pub use nestmates::LowerNestMates;
pub use object_methods::LowerObjectMethods;
pub use pattern_switch::LowerPatternSwitch;
pub use records::LowerRecords;
pub use sealed::StripSealed;
pub use string_concat::LowerStringConcat;
pub use versioned_attributes::StripVersionedAttributes;

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::builder::{CodeBuilder, add_method, replace_code};
use crate::classfile::{ClassFile, access};
use crate::code::{CodeBody, Insn, op, scan};
use crate::descriptor::MethodDescriptor;
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, Location};
use crate::version::TargetPolicy;

pub trait RewritePass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Kinds this pass removes.
    fn consumes(&self) -> &'static [FeatureKind];

    /// Kinds this pass may emit while lowering.
    fn introduces(&self) -> &'static [FeatureKind] {
        &[]
    }

    /// Names of passes that must run first.
    fn runs_after(&self) -> &'static [&'static str] {
        &[]
    }

    /// Lowers `findings` (all of kinds in `consumes`) and returns how many
    /// edits were made. Running again on the result must make no edits.
    fn apply(
        &self,
        class: &mut ClassFile,
        findings: &[FeatureFinding],
        policy: &TargetPolicy,
    ) -> Result<usize, DowngradeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("pass {0} is registered twice")]
    Duplicate(&'static str),
    #[error("pass {pass} runs after unknown pass {after}")]
    UnknownDependency {
        pass: &'static str,
        after: &'static str,
    },
    #[error("passes {0:?} depend on each other")]
    Cycle(Vec<&'static str>),
}

/// Passes in execution order.
pub struct PassRegistry {
    passes: Vec<Box<dyn RewritePass>>,
}

impl std::fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.passes.iter().map(|p| p.name())).finish()
    }
}

impl PassRegistry {
    /// The built-in passes.
    pub fn standard() -> Self {
        let passes: Vec<Box<dyn RewritePass>> = vec![
            Box::new(LowerPatternSwitch),
            Box::new(LowerRecords),
            Box::new(LowerObjectMethods),
            Box::new(LowerStringConcat),
            Box::new(LowerDynamicConstants),
            Box::new(ReplaceApiCalls),
            Box::new(LowerNestMates),
            Box::new(LowerPrivateInterfaceMethods),
            Box::new(StripSealed),
            Box::new(StripVersionedAttributes),
        ];
        Self { passes }
    }

    /// Orders `passes` topologically by `runs_after`, keeping registration
    /// order between independent passes.
    pub fn with_passes(passes: Vec<Box<dyn RewritePass>>) -> Result<Self, RegistryError> {
        let mut index_of: HashMap<&'static str, usize> = HashMap::new();
        for (i, pass) in passes.iter().enumerate() {
            if index_of.insert(pass.name(), i).is_some() {
                return Err(RegistryError::Duplicate(pass.name()));
            }
        }

        let mut indegree = vec![0usize; passes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); passes.len()];
        for (i, pass) in passes.iter().enumerate() {
            for after in pass.runs_after() {
                let &j = index_of.get(after).ok_or(RegistryError::UnknownDependency {
                    pass: pass.name(),
                    after,
                })?;
                dependents[j].push(i);
                indegree[i] += 1;
            }
        }

        let mut order = Vec::with_capacity(passes.len());
        let mut done = vec![false; passes.len()];
        while order.len() < passes.len() {
            let Some(next) = (0..passes.len()).find(|&i| !done[i] && indegree[i] == 0) else {
                let stuck = (0..passes.len())
                    .filter(|&i| !done[i])
                    .map(|i| passes[i].name())
                    .collect();
                return Err(RegistryError::Cycle(stuck));
            };
            done[next] = true;
            order.push(next);
            for &d in &dependents[next] {
                indegree[d] -= 1;
            }
        }

        let mut slots: Vec<Option<Box<dyn RewritePass>>> = passes.into_iter().map(Some).collect();
        let passes = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Self { passes })
    }

    pub fn passes(&self) -> impl Iterator<Item = &dyn RewritePass> {
        self.passes.iter().map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    fn consumer_of(&self, kind: FeatureKind) -> Option<usize> {
        self.passes.iter().position(|p| p.consumes().contains(&kind))
    }

    pub(crate) fn get(&self, index: usize) -> &dyn RewritePass {
        self.passes[index].as_ref()
    }
}

impl Default for PassRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// The passes one class file needs, in registry order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    steps: Vec<usize>,
}

impl RewritePlan {
    /// Fails with `Unsupported` on the first finding no pass can lower.
    pub fn build(registry: &PassRegistry, findings: &[FeatureFinding]) -> Result<Self, DowngradeError> {
        let mut steps = Vec::new();
        for finding in findings {
            let Some(index) = registry.consumer_of(finding.kind) else {
                return Err(DowngradeError::unsupported(finding.construct.clone(), finding.location.clone()));
            };
            if !steps.contains(&index) {
                steps.push(index);
            }
        }
        steps.sort_unstable();
        Ok(Self { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    pub fn pass_names(&self, registry: &PassRegistry) -> Vec<&'static str> {
        self.steps.iter().map(|&i| registry.get(i).name()).collect()
    }
}

/// Prefix of every synthesised member name.
pub const HELPER_PREFIX: &str = "downgrader$";

pub(crate) const HELPER_ACCESS: u16 = access::PRIVATE | access::STATIC | access::SYNTHETIC;

/// A stable suffix derived from the content a helper encodes, so identical
/// call sites share a helper and re-running a pass finds it again.
pub(crate) fn content_suffix(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..4])
}

/// Returns an `invokestatic` to the helper `name`/`descriptor` on `class`,
/// emitting its body with `build` unless the helper already exists.
pub(crate) fn ensure_helper(
    class: &mut ClassFile,
    name: &str,
    descriptor: &str,
    build: impl FnOnce(&mut CodeBuilder<'_>) -> Result<(), DowngradeError>,
) -> Result<Insn, DowngradeError> {
    if class.find_method(name, descriptor).is_none() {
        let desc = MethodDescriptor::parse(descriptor)?;
        let mut builder = CodeBuilder::new(&mut class.constant_pool, desc.param_slots());
        build(&mut builder)?;
        let body = builder.finish()?;
        add_method(class, HELPER_ACCESS, name, descriptor, &body)?;
        tracing::debug!(helper = name, descriptor, "synthesised helper");
    }
    let owner = class.name()?;
    let interface = class.is_interface();
    let index = class
        .constant_pool
        .method_ref_index(&owner, name, descriptor, interface)?;
    Ok(Insn::Member {
        opcode: op::INVOKESTATIC,
        index,
    })
}

/// Replaces instructions of one method, keyed by their original offset.
pub(crate) fn rewrite_instructions(
    class: &mut ClassFile,
    method_index: usize,
    mut replacements: HashMap<u32, Vec<Insn>>,
) -> Result<usize, DowngradeError> {
    if replacements.is_empty() {
        return Ok(0);
    }
    let method = &class.methods[method_index];
    let Some(code_index) = method.code_attribute_index(&class.constant_pool) else {
        return Ok(0);
    };
    let mut body = CodeBody::decode(&method.attributes[code_index].info, &class.constant_pool)?;
    let offsets = body.original_offsets();

    let mut edits = 0;
    let mut insns = Vec::with_capacity(body.insns.len());
    for (insn, offset) in body.insns.drain(..).zip(offsets) {
        let is_label = matches!(insn, Insn::Label(_));
        match replacements.remove(&offset) {
            Some(replacement) if !is_label => {
                insns.extend(replacement);
                edits += 1;
            }
            Some(replacement) => {
                replacements.insert(offset, replacement);
                insns.push(insn);
            }
            None => insns.push(insn),
        }
    }
    body.insns = insns;

    if let Err(err) = body.encode() {
        return Err(DowngradeError::unsupported(
            format!("rewritten code ({err})"),
            method_location(class, method_index)?,
        ));
    }
    replace_code(class, method_index, &body)?;
    Ok(edits)
}

/// Groups instruction-level findings by the index of the method they sit
/// in, in method order.
pub(crate) fn sites_by_method(class: &ClassFile, findings: &[FeatureFinding]) -> Vec<(usize, Vec<u32>)> {
    let mut grouped: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
    for finding in findings {
        let Location::Instruction {
            method,
            descriptor,
            offset,
        } = &finding.location
        else {
            continue;
        };
        if let Some(index) = class.find_method(method, descriptor) {
            grouped.entry(index).or_default().push(*offset);
        }
    }
    grouped.into_iter().collect()
}

/// The instructions of one method that start at `offsets`.
pub(crate) fn instructions_at(
    class: &ClassFile,
    method_index: usize,
    offsets: &[u32],
) -> Result<Vec<(u32, Insn)>, DowngradeError> {
    let method = &class.methods[method_index];
    let Some(code_index) = method.code_attribute_index(&class.constant_pool) else {
        return Ok(Vec::new());
    };
    Ok(scan(&method.attributes[code_index].info)?
        .into_iter()
        .filter(|(offset, _)| offsets.contains(offset))
        .collect())
}

/// Location of a whole method, for errors raised while editing it.
pub(crate) fn method_location(class: &ClassFile, method_index: usize) -> Result<Location, DowngradeError> {
    let method = &class.methods[method_index];
    let (name, descriptor) = class.member_name(method.name_index, method.descriptor_index)?;
    Ok(Location::Method { name, descriptor })
}
