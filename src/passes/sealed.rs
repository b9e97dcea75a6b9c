use crate::attributes::PERMITTED_SUBCLASSES;
use crate::classfile::ClassFile;
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind};
use crate::version::TargetPolicy;

use super::RewritePass;

/// Drops `PermittedSubclasses`. Older runtimes have no notion of a sealed
/// hierarchy, so the class simply becomes open.
pub struct StripSealed;

impl RewritePass for StripSealed {
    fn name(&self) -> &'static str {
        "strip-sealed"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::SealedClass]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        if findings.is_empty() {
            return Ok(0);
        }
        Ok(class.remove_attribute(PERMITTED_SUBCLASSES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::access;
    use crate::feature::detect_all;
    use crate::version::JavaVersion;

    #[test]
    fn removes_permitted_subclasses_once() {
        let mut class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC | access::ABSTRACT, "a/Shape", Some("java/lang/Object")).unwrap();
        let circle = class.constant_pool.class_index("a/Circle").unwrap();
        let mut info = vec![0, 1];
        info.extend_from_slice(&circle.to_be_bytes());
        class.set_attribute(PERMITTED_SUBCLASSES, info).unwrap();

        let policy = TargetPolicy::new(JavaVersion::JAVA_11).unwrap();
        let findings: Vec<_> = detect_all(&class, &policy)
            .unwrap()
            .into_iter()
            .filter(|f| f.kind == FeatureKind::SealedClass)
            .collect();
        assert_eq!(StripSealed.apply(&mut class, &findings, &policy).unwrap(), 1);
        assert!(!class.has_attribute(PERMITTED_SUBCLASSES));
        assert_eq!(StripSealed.apply(&mut class, &findings, &policy).unwrap(), 0);
    }
}
