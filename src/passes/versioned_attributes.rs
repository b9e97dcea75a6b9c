use std::collections::BTreeSet;

use crate::attributes::is_module_attribute;
use crate::classfile::ClassFile;
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, Location};
use crate::version::TargetPolicy;

use super::RewritePass;

/// Removes class attributes the target does not know and that carry no
/// runtime meaning once the constructs they describe are lowered.
pub struct StripVersionedAttributes;

impl RewritePass for StripVersionedAttributes {
    fn name(&self) -> &'static str {
        "strip-versioned-attributes"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::VersionedAttribute]
    }

    fn runs_after(&self) -> &'static [&'static str] {
        &["lower-records", "lower-nestmates", "strip-sealed"]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let names: BTreeSet<&str> = findings
            .iter()
            .filter_map(|f| match &f.location {
                Location::Attribute { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();

        let mut removed = 0;
        for name in names {
            if is_module_attribute(name) {
                return Err(DowngradeError::unsupported(
                    format!("{name} attribute"),
                    Location::Attribute { name: name.to_string() },
                ));
            }
            removed += class.remove_attribute(name);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::access;
    use crate::error::ErrorKind;
    use crate::feature::detect;
    use crate::version::JavaVersion;

    fn findings(class: &ClassFile, policy: &TargetPolicy) -> Vec<FeatureFinding> {
        detect(class, policy, &[FeatureKind::VersionedAttribute]).unwrap()
    }

    #[test]
    fn strips_only_attributes_newer_than_target() {
        let mut class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC, "a/B", Some("java/lang/Object")).unwrap();
        class.set_attribute("NestMembers", vec![0, 0]).unwrap();
        class.set_attribute("PermittedSubclasses", vec![0, 0]).unwrap();

        let policy = TargetPolicy::new(JavaVersion::JAVA_11).unwrap();
        let found = findings(&class, &policy);
        assert_eq!(found.len(), 1);
        assert_eq!(StripVersionedAttributes.apply(&mut class, &found, &policy).unwrap(), 1);
        assert!(class.has_attribute("NestMembers"));
        assert!(!class.has_attribute("PermittedSubclasses"));
    }

    #[test]
    fn module_attributes_are_unsupported() {
        let mut class = ClassFile::new(JavaVersion::JAVA_11, access::MODULE, "module-info", None).unwrap();
        class.set_attribute("ModulePackages", vec![0, 0]).unwrap();
        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let found = findings(&class, &policy);
        let err = StripVersionedAttributes.apply(&mut class, &found, &policy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConstruct);
    }
}
