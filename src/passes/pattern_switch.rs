use std::collections::HashMap;

use crate::attributes::bootstrap_methods;
use crate::builder::CodeBuilder;
use crate::classfile::ClassFile;
use crate::code::{Insn, Label, op};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::MethodDescriptor;
use crate::error::DowngradeError;
use crate::feature::{CallSite, FeatureFinding, FeatureKind, Location, SWITCH_BOOTSTRAPS, resolve_call_site};
use crate::stackmap::FrameKind;
use crate::version::TargetPolicy;

use super::{RewritePass, content_suffix, ensure_helper, instructions_at, rewrite_instructions, sites_by_method};

/// Replaces `SwitchBootstraps.typeSwitch` and `enumSwitch` call sites with
/// a static helper that tests the labels in order.
///
/// The helper keeps the call-site contract: `(selector, restart) -> index`,
/// `-1` for a null selector and the label count when nothing matches.
pub struct LowerPatternSwitch;

impl RewritePass for LowerPatternSwitch {
    fn name(&self) -> &'static str {
        "lower-pattern-switch"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::PatternSwitch]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let bootstraps = bootstrap_methods(class)?;
        let mut edits = 0;
        for (method_index, offsets) in sites_by_method(class, findings) {
            let mut replacements = HashMap::new();
            for (offset, insn) in instructions_at(class, method_index, &offsets)? {
                let Insn::InvokeDynamic { index } = insn else {
                    continue;
                };
                let site = resolve_call_site(&class.constant_pool, &bootstraps, index)?;
                if site.bootstrap.member.owner != SWITCH_BOOTSTRAPS {
                    continue;
                }
                let location = Location::Instruction {
                    method: class.constant_pool.utf8(class.methods[method_index].name_index)?.into_owned(),
                    descriptor: class.constant_pool.utf8(class.methods[method_index].descriptor_index)?.into_owned(),
                    offset,
                };
                let switch = Switch::from_site(&class.constant_pool, &site, location)?;
                let name = format!("{}{}${}", super::HELPER_PREFIX, site.bootstrap.member.name, switch.suffix());
                let call = ensure_helper(class, &name, &site.descriptor, |b| switch.emit(b))?;
                replacements.insert(offset, vec![call]);
            }
            edits += rewrite_instructions(class, method_index, replacements)?;
        }
        Ok(edits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CaseLabel {
    /// Matches instances of the class.
    Type(String),
    /// Matches an equal string, or an enum constant of that name.
    Text(String),
    /// Matches a boxed number or character with this value.
    Int(i32),
}

struct Switch {
    enum_switch: bool,
    labels: Vec<CaseLabel>,
}

impl Switch {
    fn from_site(pool: &ConstantPool, site: &CallSite, location: Location) -> Result<Self, DowngradeError> {
        let unsupported = |what: String| DowngradeError::unsupported(what, location.clone());
        let enum_switch = match site.bootstrap.member.name.as_str() {
            "typeSwitch" => false,
            "enumSwitch" => true,
            other => return Err(unsupported(format!("switch bootstrap {other}"))),
        };
        let desc = MethodDescriptor::parse(&site.descriptor)?;
        if !desc.params.first().is_some_and(|p| p.is_reference()) {
            return Err(unsupported(format!("switch on a primitive selector {}", site.descriptor)));
        }

        let mut labels = Vec::with_capacity(site.arguments.len());
        for &arg in &site.arguments {
            let label = match pool.get(arg)? {
                Constant::Class { .. } => CaseLabel::Type(pool.class_name(arg)?.into_owned()),
                Constant::String { .. } => CaseLabel::Text(pool.string(arg)?.into_owned()),
                Constant::Integer(value) if !enum_switch => CaseLabel::Int(*value),
                other => {
                    return Err(unsupported(format!("{} switch label", other.kind_name())));
                }
            };
            labels.push(label);
        }
        Ok(Self { enum_switch, labels })
    }

    fn suffix(&self) -> String {
        let parts: Vec<String> = self
            .labels
            .iter()
            .map(|label| match label {
                CaseLabel::Type(name) => format!("T{name}"),
                CaseLabel::Text(text) => format!("S{text}"),
                CaseLabel::Int(value) => format!("I{value}"),
            })
            .collect();
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        content_suffix(&parts)
    }

    /// Selector in local 0, restart index in local 1. Every branch target
    /// sees the entry frame, so all frames are `Same`.
    fn emit(&self, b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
        let start = b.new_label();
        b.aload(0).jump(op::IFNONNULL, start);
        b.simple(op::ICONST_M1).simple(op::IRETURN);
        b.place_frame(start, FrameKind::Same);

        for (i, label) in self.labels.iter().enumerate() {
            let i = i as i32;
            let next = b.new_label();
            b.iload(1).iconst(i)?.jump(op::IF_ICMPGT, next);
            match label {
                CaseLabel::Type(class) => {
                    b.aload(0).type_insn(op::INSTANCEOF, class)?.jump(op::IFEQ, next);
                }
                CaseLabel::Text(text) if self.enum_switch => {
                    b.aload(0).invoke_virtual("java/lang/Enum", "name", "()Ljava/lang/String;")?;
                    b.ldc_string(text)?;
                    b.invoke_virtual("java/lang/String", "equals", "(Ljava/lang/Object;)Z")?
                        .jump(op::IFEQ, next);
                }
                CaseLabel::Text(text) => {
                    b.ldc_string(text)?.aload(0);
                    b.invoke_virtual("java/lang/String", "equals", "(Ljava/lang/Object;)Z")?
                        .jump(op::IFEQ, next);
                }
                CaseLabel::Int(value) => {
                    let not_number = b.new_label();
                    Self::unbox_compare(b, "java/lang/Number", "intValue", "()I", *value, not_number, next)?;
                    b.iconst(i)?.simple(op::IRETURN);
                    b.place_frame(not_number, FrameKind::Same);
                    Self::unbox_compare(b, "java/lang/Character", "charValue", "()C", *value, next, next)?;
                }
            }
            b.iconst(i)?.simple(op::IRETURN);
            b.place_frame(next, FrameKind::Same);
        }
        b.iconst(self.labels.len() as i32)?.simple(op::IRETURN);
        Ok(())
    }

    /// Falls through when the selector is a `boxed` instance holding `value`; jumps to
    /// `not_box` for other types and to `mismatch` for other values.
    fn unbox_compare(
        b: &mut CodeBuilder<'_>,
        boxed: &str,
        getter: &str,
        getter_desc: &str,
        value: i32,
        not_box: Label,
        mismatch: Label,
    ) -> Result<(), DowngradeError> {
        b.aload(0).type_insn(op::INSTANCEOF, boxed)?.jump(op::IFEQ, not_box);
        b.aload(0).type_insn(op::CHECKCAST, boxed)?;
        b.invoke_virtual(boxed, getter, getter_desc)?;
        b.iconst(value)?.jump(op::IF_ICMPNE, mismatch);
        Ok(())
    }
}
