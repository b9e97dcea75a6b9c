use crate::attributes::{NEST_HOST, NEST_MEMBERS};
use crate::classfile::{ClassFile, access, with_visibility};
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind};
use crate::version::TargetPolicy;

use super::RewritePass;

/// Drops nest attributes and widens private members so nest mates keep
/// access to each other without them.
///
/// Private members become package-private; interface members must be
/// public or private, so those become public.
pub struct LowerNestMates;

impl RewritePass for LowerNestMates {
    fn name(&self) -> &'static str {
        "lower-nestmates"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::NestMates]
    }

    // Helpers synthesised earlier are private and must not be widened by a
    // pass that ran before them.
    fn runs_after(&self) -> &'static [&'static str] {
        &["lower-pattern-switch", "lower-object-methods", "lower-string-concat", "replace-api-calls"]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        if findings.is_empty() {
            return Ok(0);
        }
        let mut changes = class.remove_attribute(NEST_HOST) + class.remove_attribute(NEST_MEMBERS);

        let widened = if class.is_interface() { access::PUBLIC } else { 0 };
        let pool = &class.constant_pool;
        for method in &mut class.methods {
            if method.access_flags & access::PRIVATE == 0 {
                continue;
            }
            // Instance initialisers and our own helpers are only called
            // from inside this class.
            if pool.utf8_eq(method.name_index, "<init>") || is_helper(pool.utf8(method.name_index).ok().as_deref()) {
                continue;
            }
            method.access_flags = with_visibility(method.access_flags, widened);
            changes += 1;
        }
        for field in &mut class.fields {
            if field.access_flags & access::PRIVATE != 0 {
                field.access_flags = with_visibility(field.access_flags, widened);
                changes += 1;
            }
        }
        tracing::debug!(changes, "widened nest-private members");
        Ok(changes)
    }
}

fn is_helper(name: Option<&str>) -> bool {
    name.is_some_and(|n| n.starts_with(super::HELPER_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{FieldInfo, MethodInfo};
    use crate::feature::detect;
    use crate::version::JavaVersion;

    fn nest_host_class() -> ClassFile {
        let mut class = ClassFile::new(JavaVersion::JAVA_11, access::PUBLIC, "a/Outer", Some("java/lang/Object")).unwrap();
        let inner = class.constant_pool.class_index("a/Outer$Inner").unwrap();
        let mut info = vec![0, 1];
        info.extend_from_slice(&inner.to_be_bytes());
        class.set_attribute(NEST_MEMBERS, info).unwrap();

        let pool = &mut class.constant_pool;
        let secret = pool.utf8_index("secret").unwrap();
        let int = pool.utf8_index("I").unwrap();
        let run = pool.utf8_index("run").unwrap();
        let void = pool.utf8_index("()V").unwrap();
        class.fields.push(FieldInfo {
            access_flags: access::PRIVATE | access::FINAL,
            name_index: secret,
            descriptor_index: int,
            attributes: Vec::new(),
        });
        class.methods.push(MethodInfo {
            access_flags: access::PRIVATE | access::STATIC,
            name_index: run,
            descriptor_index: void,
            attributes: Vec::new(),
        });
        class
    }

    #[test]
    fn private_members_become_package_private() {
        let mut class = nest_host_class();
        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::NestMates]).unwrap();
        assert_eq!(findings.len(), 1);

        assert_eq!(LowerNestMates.apply(&mut class, &findings, &policy).unwrap(), 3);
        assert!(!class.has_attribute(NEST_MEMBERS));
        assert_eq!(class.fields[0].access_flags, access::FINAL);
        assert_eq!(class.methods[0].access_flags, access::STATIC);
        assert!(detect(&class, &policy, &[FeatureKind::NestMates]).unwrap().is_empty());
    }
}
