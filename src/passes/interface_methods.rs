use crate::classfile::{ClassFile, access, with_visibility};
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, Location};
use crate::version::TargetPolicy;

use super::RewritePass;

/// Makes private instance methods of interfaces public.
///
/// Callers inside the interface reach them with `invokeinterface` or
/// `invokespecial`, both of which still resolve once the method is public.
pub struct LowerPrivateInterfaceMethods;

impl RewritePass for LowerPrivateInterfaceMethods {
    fn name(&self) -> &'static str {
        "lower-private-interface-methods"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::PrivateInterfaceMethod]
    }

    fn runs_after(&self) -> &'static [&'static str] {
        &["lower-nestmates"]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let mut changes = 0;
        for finding in findings {
            let Location::Method { name, descriptor } = &finding.location else {
                continue;
            };
            let Some(index) = class.find_method(name, descriptor) else {
                continue;
            };
            let method = &mut class.methods[index];
            if method.access_flags & access::PRIVATE != 0 {
                method.access_flags = with_visibility(method.access_flags, access::PUBLIC);
                changes += 1;
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{CodeBuilder, add_method};
    use crate::code::op;
    use crate::feature::detect;
    use crate::version::JavaVersion;

    #[test]
    fn private_default_helpers_become_public() {
        let mut class = ClassFile::new(
            JavaVersion::JAVA_9,
            access::PUBLIC | access::INTERFACE | access::ABSTRACT,
            "a/Greeter",
            Some("java/lang/Object"),
        )
        .unwrap();
        let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
        b.simple(op::RETURN);
        let body = b.finish().unwrap();
        add_method(&mut class, access::PRIVATE, "log", "()V", &body).unwrap();
        add_method(&mut class, access::PRIVATE | access::STATIC, "util", "()V", &body).unwrap();

        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::PrivateInterfaceMethod]).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(LowerPrivateInterfaceMethods.apply(&mut class, &findings, &policy).unwrap(), 1);
        assert_eq!(class.methods[0].access_flags, access::PUBLIC);
        assert_eq!(class.methods[1].access_flags, access::PRIVATE | access::STATIC);
        assert_eq!(LowerPrivateInterfaceMethods.apply(&mut class, &findings, &policy).unwrap(), 0);
    }
}
