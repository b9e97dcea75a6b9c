use crate::attributes::{RECORD, record_components};
use crate::builder::{CodeBuilder, add_method};
use crate::classfile::{ClassFile, access};
use crate::code::op;
use crate::constant_pool::Constant;
use crate::descriptor::{FieldType, rename_class_in_descriptor};
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, Location, RECORD_CLASS, names_record};
use crate::version::TargetPolicy;

use super::RewritePass;

const OBJECT_CLASS: &str = "java/lang/Object";

/// Turns a record into a plain final class and retargets every other use of
/// `java/lang/Record` in the class file to `java/lang/Object`.
///
/// Class constants naming `java/lang/Record` are repointed, which also
/// retargets the super constructor call. Descriptors and signatures get a
/// rewritten Utf8 entry of their own; string literals are never touched.
/// For record classes, accessors missing from the class file are
/// synthesised from the component list before the `Record` attribute is
/// dropped.
pub struct LowerRecords;

impl RewritePass for LowerRecords {
    fn name(&self) -> &'static str {
        "lower-records"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::Record]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        if findings.is_empty() {
            return Ok(0);
        }
        let is_record = class.super_name()?.as_deref() == Some(RECORD_CLASS) || class.has_attribute(RECORD);
        let mut changes = retarget_record_class(class)?;
        if !is_record {
            return Ok(changes);
        }

        if class.access_flags & access::FINAL == 0 {
            class.access_flags |= access::FINAL;
            changes += 1;
        }

        if let Some(components) = record_components(class)? {
            let this = class.name()?;
            for component in components {
                let (name, descriptor) = class.member_name(component.name_index, component.descriptor_index)?;
                let accessor = format!("(){descriptor}");
                if class.find_method(&name, &accessor).is_some() {
                    continue;
                }
                if class.find_field(&name, &descriptor).is_none() {
                    return Err(DowngradeError::unsupported(
                        format!("record component {name} without a backing field"),
                        Location::Attribute { name: RECORD.to_string() },
                    ));
                }
                let ty = FieldType::parse(&descriptor)?;
                let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
                b.aload(0).field(op::GETFIELD, &this, &name, &descriptor)?;
                b.simple(ty.return_opcode());
                let body = b.finish()?;
                add_method(class, access::PUBLIC, &name, &accessor, &body)?;
                tracing::debug!(component = %name, "synthesised record accessor");
                changes += 1;
            }
            changes += class.remove_attribute(RECORD);
        }
        Ok(changes)
    }
}

/// Repoints `Class` constants and descriptor slots that mention
/// `java/lang/Record`.
fn retarget_record_class(class: &mut ClassFile) -> Result<usize, DowngradeError> {
    let pool = &class.constant_pool;
    let mut classes = Vec::new();
    for (index, constant) in pool.iter() {
        if let Constant::Class { name_index } = constant {
            let name = pool.utf8(*name_index)?;
            if names_record(&name) {
                let renamed = if name == RECORD_CLASS {
                    OBJECT_CLASS.to_string()
                } else {
                    name.replace(&format!("L{RECORD_CLASS};"), &format!("L{OBJECT_CLASS};"))
                };
                classes.push((index, renamed));
            }
        }
    }
    let mut descriptors = Vec::new();
    for (slot, utf8) in class.descriptor_slots()? {
        if let Some(renamed) = rename_class_in_descriptor(&pool.utf8(utf8)?, RECORD_CLASS, OBJECT_CLASS) {
            descriptors.push((slot, renamed));
        }
    }

    let changes = classes.len() + descriptors.len();
    for (index, renamed) in classes {
        let name_index = class.constant_pool.utf8_index(&renamed)?;
        class.constant_pool.replace(index, Constant::Class { name_index })?;
    }
    for (slot, renamed) in descriptors {
        let utf8 = class.constant_pool.utf8_index(&renamed)?;
        class.set_descriptor(slot, utf8)?;
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{RecordComponent, encode_record_components};
    use crate::classfile::FieldInfo;
    use crate::code::Insn;
    use crate::feature::detect;
    use crate::reader::parse;
    use crate::version::JavaVersion;
    use crate::writer::serialize;

    fn point() -> ClassFile {
        let mut class = ClassFile::new(JavaVersion::JAVA_16, access::PUBLIC | access::SUPER, "a/Point", Some(RECORD_CLASS)).unwrap();
        let pool = &mut class.constant_pool;
        let x = pool.utf8_index("x").unwrap();
        let int = pool.utf8_index("I").unwrap();
        class.fields.push(FieldInfo {
            access_flags: access::PRIVATE | access::FINAL,
            name_index: x,
            descriptor_index: int,
            attributes: Vec::new(),
        });

        let mut b = CodeBuilder::new(&mut class.constant_pool, 2);
        b.aload(0).invoke_special(RECORD_CLASS, "<init>", "()V").unwrap();
        b.aload(0).iload(1).field(op::PUTFIELD, "a/Point", "x", "I").unwrap();
        b.simple(op::RETURN);
        let body = b.finish().unwrap();
        add_method(&mut class, access::PUBLIC, "<init>", "(I)V", &body).unwrap();

        let record = encode_record_components(&[RecordComponent {
            name_index: x,
            descriptor_index: int,
            attributes: Vec::new(),
        }]);
        class.set_attribute(RECORD, record).unwrap();
        class
    }

    #[test]
    fn record_becomes_final_object_subclass_with_accessors() {
        let mut class = point();
        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::Record]).unwrap();
        assert_eq!(findings.len(), 2);

        assert!(LowerRecords.apply(&mut class, &findings, &policy).unwrap() > 0);
        assert_eq!(class.super_name().unwrap().as_deref(), Some(OBJECT_CLASS));
        assert_ne!(class.access_flags & access::FINAL, 0);
        assert!(class.find_method("x", "()I").is_some());
        assert!(!class.has_attribute(RECORD));
        assert!(detect(&class, &policy, &[FeatureKind::Record]).unwrap().is_empty());

        let reparsed = parse(&serialize(&class)).unwrap();
        assert_eq!(reparsed, class);
    }

    #[test]
    fn existing_accessors_are_kept() {
        let mut class = point();
        let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
        b.iconst(7).unwrap().simple(op::IRETURN);
        let body = b.finish().unwrap();
        add_method(&mut class, access::PUBLIC, "x", "()I", &body).unwrap();
        let before = class.methods.len();

        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::Record]).unwrap();
        LowerRecords.apply(&mut class, &findings, &policy).unwrap();
        assert_eq!(class.methods.len(), before);
    }

    #[test]
    fn descriptors_mentioning_record_are_rewritten() {
        let mut class = point();
        let nat = class
            .constant_pool
            .name_and_type_index("same", "(Ljava/lang/Record;)Z")
            .unwrap();
        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::Record]).unwrap();
        LowerRecords.apply(&mut class, &findings, &policy).unwrap();
        assert_eq!(class.constant_pool.name_and_type(nat).unwrap().1, "(Ljava/lang/Object;)Z");
    }

    #[test]
    fn string_literals_naming_record_are_kept() {
        let mut class = point();
        let literal = class.constant_pool.string_index("Ljava/lang/Record;").unwrap();
        let mut b = CodeBuilder::new(&mut class.constant_pool, 0);
        b.insn(Insn::Ldc { index: literal, wide: false }).simple(op::ARETURN);
        let body = b.finish().unwrap();
        add_method(&mut class, access::PUBLIC | access::STATIC, "tag", "()Ljava/lang/String;", &body).unwrap();
        let field = class.constant_pool.utf8_index("Ljava/lang/Record;").unwrap();
        let name = class.constant_pool.utf8_index("other").unwrap();
        class.fields.push(FieldInfo {
            access_flags: access::PRIVATE,
            name_index: name,
            descriptor_index: field,
            attributes: Vec::new(),
        });

        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::Record]).unwrap();
        LowerRecords.apply(&mut class, &findings, &policy).unwrap();

        assert_eq!(class.constant_pool.string(literal).unwrap(), "Ljava/lang/Record;");
        assert!(class.find_field("other", "Ljava/lang/Object;").is_some());
        assert!(detect(&class, &policy, &[FeatureKind::Record]).unwrap().is_empty());
    }

    #[test]
    fn plain_class_using_record_is_retargeted_without_becoming_final() {
        let mut class = ClassFile::new(JavaVersion::JAVA_16, access::PUBLIC | access::SUPER, "demo/User", Some(OBJECT_CLASS)).unwrap();
        let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
        b.aload(0).type_insn(op::INSTANCEOF, RECORD_CLASS).unwrap();
        b.simple(op::IRETURN);
        let body = b.finish().unwrap();
        add_method(&mut class, access::PUBLIC | access::STATIC, "check", "(Ljava/lang/Object;)Z", &body).unwrap();

        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::Record]).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(LowerRecords.apply(&mut class, &findings, &policy).unwrap(), 1);
        assert_eq!(class.access_flags & access::FINAL, 0);

        let still_named = class
            .constant_pool
            .iter()
            .any(|(_, c)| matches!(c, Constant::Class { name_index } if class.constant_pool.utf8_eq(*name_index, RECORD_CLASS)));
        assert!(!still_named);
    }
}
