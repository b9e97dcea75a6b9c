use std::collections::HashMap;

use crate::attributes::{bootstrap_methods, inner_name};
use crate::builder::{CodeBuilder, replace_code};
use crate::classfile::ClassFile;
use crate::code::{Insn, op};
use crate::constant_pool::ref_kind;
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::error::{ClassFormatError, DowngradeError};
use crate::feature::{CallSite, FeatureFinding, FeatureKind, Location, OBJECT_METHODS, resolve_call_site};
use crate::stackmap::FrameKind;
use crate::version::TargetPolicy;

use super::string_concat::append_descriptor;
use super::{RewritePass, content_suffix, ensure_helper, instructions_at, rewrite_instructions, sites_by_method};

/// Lowers `ObjectMethods.bootstrap` call sites, which records use for
/// `equals`, `hashCode` and `toString`.
///
/// A method that only forwards its arguments to the call site gets its
/// body regenerated in place. Any other site calls a static helper with
/// the call-site descriptor.
pub struct LowerObjectMethods;

impl RewritePass for LowerObjectMethods {
    fn name(&self) -> &'static str {
        "lower-object-methods"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::ObjectMethodsCallSite]
    }

    fn runs_after(&self) -> &'static [&'static str] {
        &["lower-records"]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let bootstraps = bootstrap_methods(class)?;
        let mut edits = 0;
        for (method_index, offsets) in sites_by_method(class, findings) {
            let mut replacements = HashMap::new();
            let method = &class.methods[method_index];
            let (method_name, method_desc) = class.member_name(method.name_index, method.descriptor_index)?;
            let is_static = method.is_static();
            let location = |offset: u32| Location::Instruction {
                method: method_name.clone(),
                descriptor: method_desc.clone(),
                offset,
            };
            let insns = instructions_at(class, method_index, &offsets)?;
            let total = crate::feature::scan_methods(class)?
                .into_iter()
                .find(|m| m.index == method_index)
                .map_or(0, |m| m.insns.len());

            for (offset, insn) in insns {
                let Insn::InvokeDynamic { index } = insn else {
                    continue;
                };
                let site = resolve_call_site(&class.constant_pool, &bootstraps, index)?;
                if !site.is(OBJECT_METHODS, "bootstrap") {
                    continue;
                }
                let plan = ObjectMethod::from_site(class, &site, location(offset))?;
                let desc = MethodDescriptor::parse(&site.descriptor)?;

                let forwards = !is_static
                    && method_name == site.name
                    && forwarder_descriptor(&desc) == method_desc
                    && total == desc.params.len() + 2;
                if forwards {
                    let mut b = CodeBuilder::new(&mut class.constant_pool, desc.param_slots());
                    plan.emit(&mut b)?;
                    let body = b.finish()?;
                    replace_code(class, method_index, &body)?;
                    tracing::debug!(method = %method_name, "regenerated record method body");
                    edits += 1;
                    continue;
                }

                let name = format!("{}{}${}", super::HELPER_PREFIX, site.name, plan.suffix());
                let call = ensure_helper(class, &name, &site.descriptor, |b| plan.emit(b))?;
                replacements.insert(offset, vec![call]);
            }
            edits += rewrite_instructions(class, method_index, replacements)?;
        }
        Ok(edits)
    }
}

/// The instance method a call site with this descriptor stands in for:
/// the receiver parameter is dropped.
fn forwarder_descriptor(desc: &MethodDescriptor) -> String {
    MethodDescriptor::new(desc.params.iter().skip(1).cloned().collect(), desc.ret.clone()).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Generated {
    Equals,
    HashCode,
    ToString,
}

#[derive(Debug, Clone)]
struct Component {
    label: String,
    owner: String,
    field: String,
    ty: FieldType,
}

impl Component {
    fn load(&self, b: &mut CodeBuilder<'_>, local: u16) -> Result<(), DowngradeError> {
        b.aload(local).field(op::GETFIELD, &self.owner, &self.field, &self.ty.to_string())?;
        Ok(())
    }
}

struct ObjectMethod {
    kind: Generated,
    record: String,
    simple_name: String,
    components: Vec<Component>,
}

impl ObjectMethod {
    fn from_site(class: &ClassFile, site: &CallSite, location: Location) -> Result<Self, DowngradeError> {
        let pool = &class.constant_pool;
        let unsupported = |what: &str| DowngradeError::unsupported(format!("{what} in {} call site", site.name), location.clone());

        let kind = match site.name.as_str() {
            "equals" => Generated::Equals,
            "hashCode" => Generated::HashCode,
            "toString" => Generated::ToString,
            _ => return Err(unsupported("unknown object method")),
        };
        let [record, names, getters @ ..] = site.arguments.as_slice() else {
            return Err(unsupported("missing bootstrap arguments"));
        };
        let record = pool.class_name(*record)?.into_owned();
        let names = pool.string(*names)?;
        let labels: Vec<&str> = if names.is_empty() { Vec::new() } else { names.split(';').collect() };
        if labels.len() != getters.len() {
            return Err(unsupported("component names not matching getters"));
        }

        let mut components = Vec::with_capacity(getters.len());
        for (label, &getter) in labels.iter().zip(getters) {
            let handle = pool.method_handle(getter)?;
            if handle.reference_kind != ref_kind::GET_FIELD {
                return Err(unsupported("non-field getter"));
            }
            components.push(Component {
                label: label.to_string(),
                owner: handle.member.owner,
                field: handle.member.name,
                ty: FieldType::parse(&handle.member.descriptor)?,
            });
        }
        Ok(Self {
            kind,
            simple_name: simple_name(class, &record)?,
            record,
            components,
        })
    }

    fn suffix(&self) -> String {
        let mut parts = vec![self.record.clone()];
        for c in &self.components {
            parts.push(format!("{}={}.{}:{}", c.label, c.owner, c.field, c.ty));
        }
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        content_suffix(&parts)
    }

    /// Emits the body with the receiver in local 0 and, for `equals`, the
    /// other object in local 1.
    fn emit(&self, b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
        match self.kind {
            Generated::Equals => self.emit_equals(b),
            Generated::HashCode => self.emit_hash_code(b),
            Generated::ToString => self.emit_to_string(b),
        }
    }

    fn emit_equals(&self, b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
        let not_same = b.new_label();
        let same_type = b.new_label();

        b.aload(0).aload(1).jump(op::IF_ACMPNE, not_same);
        b.simple(op::ICONST_1).simple(op::IRETURN);

        b.place_frame(not_same, FrameKind::Same);
        b.aload(1).type_insn(op::INSTANCEOF, &self.record)?.jump(op::IFNE, same_type);
        b.simple(op::ICONST_0).simple(op::IRETURN);

        b.place_frame(same_type, FrameKind::Same);
        if self.components.is_empty() {
            b.simple(op::ICONST_1).simple(op::IRETURN);
            return Ok(());
        }

        let record_type = FieldType::object(&self.record);
        let other = b.new_local(&record_type);
        b.aload(1).type_insn(op::CHECKCAST, &self.record)?.store(&record_type, other);

        let differ = b.new_label();
        for component in &self.components {
            component.load(b, 0)?;
            component.load(b, other)?;
            match component.ty {
                FieldType::Long => {
                    b.simple(op::LCMP).jump(op::IFNE, differ);
                }
                FieldType::Float => {
                    b.invoke_static("java/lang/Float", "compare", "(FF)I", false)?
                        .jump(op::IFNE, differ);
                }
                FieldType::Double => {
                    b.invoke_static("java/lang/Double", "compare", "(DD)I", false)?
                        .jump(op::IFNE, differ);
                }
                ref ty if ty.is_reference() => {
                    b.invoke_static("java/util/Objects", "equals", "(Ljava/lang/Object;Ljava/lang/Object;)Z", false)?
                        .jump(op::IFEQ, differ);
                }
                _ => {
                    b.jump(op::IF_ICMPNE, differ);
                }
            }
        }
        b.simple(op::ICONST_1).simple(op::IRETURN);

        let verification = b.object_type(&self.record)?;
        b.place_frame(differ, FrameKind::Append(vec![verification]));
        b.simple(op::ICONST_0).simple(op::IRETURN);
        Ok(())
    }

    fn emit_hash_code(&self, b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
        b.simple(op::ICONST_0);
        for component in &self.components {
            b.iconst(31)?.simple(op::IMUL);
            component.load(b, 0)?;
            let (owner, descriptor) = match &component.ty {
                FieldType::Boolean => ("java/lang/Boolean", "(Z)I"),
                FieldType::Byte => ("java/lang/Byte", "(B)I"),
                FieldType::Char => ("java/lang/Character", "(C)I"),
                FieldType::Short => ("java/lang/Short", "(S)I"),
                FieldType::Int => ("java/lang/Integer", "(I)I"),
                FieldType::Long => ("java/lang/Long", "(J)I"),
                FieldType::Float => ("java/lang/Float", "(F)I"),
                FieldType::Double => ("java/lang/Double", "(D)I"),
                FieldType::Object(_) | FieldType::Array(_) => ("java/util/Objects", "(Ljava/lang/Object;)I"),
            };
            b.invoke_static(owner, "hashCode", descriptor, false)?.simple(op::IADD);
        }
        b.simple(op::IRETURN);
        Ok(())
    }

    fn emit_to_string(&self, b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
        const BUILDER: &str = "java/lang/StringBuilder";
        const APPEND_STRING: &str = "(Ljava/lang/String;)Ljava/lang/StringBuilder;";

        b.type_insn(op::NEW, BUILDER)?.simple(op::DUP);
        b.ldc_string(&format!("{}[", self.simple_name))?;
        b.invoke_special(BUILDER, "<init>", "(Ljava/lang/String;)V")?;
        for (i, component) in self.components.iter().enumerate() {
            let separator = if i == 0 { "" } else { ", " };
            b.ldc_string(&format!("{separator}{}=", component.label))?;
            b.invoke_virtual(BUILDER, "append", APPEND_STRING)?;
            component.load(b, 0)?;
            b.invoke_virtual(BUILDER, "append", append_descriptor(&component.ty))?;
        }
        b.ldc_string("]")?.invoke_virtual(BUILDER, "append", APPEND_STRING)?;
        b.invoke_virtual(BUILDER, "toString", "()Ljava/lang/String;")?;
        b.simple(op::ARETURN);
        Ok(())
    }
}

/// `Class.getSimpleName`: the `InnerClasses` inner name for nested classes,
/// otherwise everything after the package. A `$` in a top-level name stays.
fn simple_name(class: &ClassFile, internal: &str) -> Result<String, ClassFormatError> {
    if let Some(inner) = inner_name(class, internal)? {
        return Ok(inner.unwrap_or_default());
    }
    Ok(internal.rsplit('/').next().unwrap_or(internal).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{BOOTSTRAP_METHODS, BootstrapMethod, encode_bootstrap_methods};
    use crate::builder::add_method;
    use crate::classfile::{FieldInfo, access};
    use crate::code::CodeBody;
    use crate::constant_pool::Constant;
    use crate::feature::detect;
    use crate::version::JavaVersion;

    const BOOTSTRAP_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/TypeDescriptor;Ljava/lang/Class;Ljava/lang/String;[Ljava/lang/invoke/MethodHandle;)Ljava/lang/Object;";

    /// `record Pair(int a, String b)` with forwarding object methods.
    fn pair() -> ClassFile {
        let mut class = ClassFile::new(JavaVersion::JAVA_16, access::PUBLIC | access::FINAL, "a/Pair", Some("java/lang/Object")).unwrap();
        let pool = &mut class.constant_pool;
        for (name, desc) in [("a", "I"), ("b", "Ljava/lang/String;")] {
            let name_index = pool.utf8_index(name).unwrap();
            let descriptor_index = pool.utf8_index(desc).unwrap();
            class.fields.push(FieldInfo {
                access_flags: access::PRIVATE | access::FINAL,
                name_index,
                descriptor_index,
                attributes: Vec::new(),
            });
        }

        let bootstrap = pool.method_ref_index(OBJECT_METHODS, "bootstrap", BOOTSTRAP_DESC, false).unwrap();
        let bootstrap = pool.method_handle_index(ref_kind::INVOKE_STATIC, bootstrap).unwrap();
        let record = pool.class_index("a/Pair").unwrap();
        let names = pool.string_index("a;b").unwrap();
        let get_a = pool.field_ref_index("a/Pair", "a", "I").unwrap();
        let get_a = pool.method_handle_index(ref_kind::GET_FIELD, get_a).unwrap();
        let get_b = pool.field_ref_index("a/Pair", "b", "Ljava/lang/String;").unwrap();
        let get_b = pool.method_handle_index(ref_kind::GET_FIELD, get_b).unwrap();
        class
            .set_attribute(
                BOOTSTRAP_METHODS,
                encode_bootstrap_methods(&[BootstrapMethod {
                    method_ref: bootstrap,
                    arguments: vec![record, names, get_a, get_b],
                }]),
            )
            .unwrap();

        for (name, site_desc, desc, ret) in [
            ("equals", "(La/Pair;Ljava/lang/Object;)Z", "(Ljava/lang/Object;)Z", op::IRETURN),
            ("hashCode", "(La/Pair;)I", "()I", op::IRETURN),
            ("toString", "(La/Pair;)Ljava/lang/String;", "()Ljava/lang/String;", op::ARETURN),
        ] {
            let nat = class.constant_pool.name_and_type_index(name, site_desc).unwrap();
            let indy = class
                .constant_pool
                .intern(Constant::InvokeDynamic {
                    bootstrap_method_attr_index: 0,
                    name_and_type_index: nat,
                })
                .unwrap();
            let params = MethodDescriptor::parse(site_desc).unwrap().params.len() as u16;
            let mut b = CodeBuilder::new(&mut class.constant_pool, params);
            for slot in 0..params {
                b.aload(slot);
            }
            b.insn(Insn::InvokeDynamic { index: indy }).simple(ret);
            let body = b.finish().unwrap();
            add_method(&mut class, access::PUBLIC | access::FINAL, name, desc, &body).unwrap();
        }
        class
    }

    fn body_of(class: &ClassFile, name: &str, desc: &str) -> CodeBody {
        let method = &class.methods[class.find_method(name, desc).unwrap()];
        let code = method.code_attribute_index(&class.constant_pool).unwrap();
        CodeBody::decode(&method.attributes[code].info, &class.constant_pool).unwrap()
    }

    #[test]
    fn forwarders_are_regenerated_in_place() {
        let mut class = pair();
        let policy = TargetPolicy::new(JavaVersion::JAVA_11).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::ObjectMethodsCallSite]).unwrap();
        assert_eq!(findings.len(), 3);

        assert_eq!(LowerObjectMethods.apply(&mut class, &findings, &policy).unwrap(), 3);
        assert_eq!(class.methods.len(), 3);
        assert!(detect(&class, &policy, &[FeatureKind::ObjectMethodsCallSite]).unwrap().is_empty());

        let equals = body_of(&class, "equals", "(Ljava/lang/Object;)Z");
        assert_eq!(equals.stack_map().map(<[_]>::len), Some(3));
        assert_eq!(equals.max_locals, 3);
        let strings: Vec<String> = body_of(&class, "toString", "()Ljava/lang/String;")
            .insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Ldc { index, .. } => class.constant_pool.string(*index).ok().map(|s| s.into_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(strings, vec!["Pair[", "a=", ", b=", "]"]);
    }

    #[test]
    fn other_call_sites_use_a_helper() {
        let mut class = pair();
        // Rename hashCode so it no longer forwards.
        let method = class.find_method("hashCode", "()I").unwrap();
        class.methods[method].name_index = class.constant_pool.utf8_index("hash").unwrap();

        let policy = TargetPolicy::new(JavaVersion::JAVA_11).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::ObjectMethodsCallSite]).unwrap();
        LowerObjectMethods.apply(&mut class, &findings, &policy).unwrap();

        assert_eq!(class.methods.len(), 4);
        let helper = &class.methods[3];
        assert!(class.constant_pool.utf8(helper.name_index).unwrap().starts_with("downgrader$hashCode$"));
        assert_eq!(class.constant_pool.utf8(helper.descriptor_index).unwrap(), "(La/Pair;)I");
    }

    #[test]
    fn simple_name_follows_inner_classes() {
        let mut class = ClassFile::new(JavaVersion::JAVA_16, access::FINAL, "a/My$Rec", Some("java/lang/Record")).unwrap();
        assert_eq!(simple_name(&class, "a/My$Rec").unwrap(), "My$Rec");
        assert_eq!(simple_name(&class, "Point").unwrap(), "Point");

        let pool = &mut class.constant_pool;
        let nested = pool.class_index("a/b/Outer$Point").unwrap();
        let outer = pool.class_index("a/b/Outer").unwrap();
        let name = pool.utf8_index("Point").unwrap();
        let info = [nested, outer, name, access::STATIC]
            .iter()
            .fold(vec![0, 1], |mut info, v| {
                info.extend_from_slice(&v.to_be_bytes());
                info
            });
        class.set_attribute("InnerClasses", info).unwrap();
        assert_eq!(simple_name(&class, "a/b/Outer$Point").unwrap(), "Point");
        assert_eq!(simple_name(&class, "a/My$Rec").unwrap(), "My$Rec");
    }
}
