//! Typed views over the raw attributes the passes need to read.

use crate::classfile::{Attribute, ClassFile};
use crate::constant_pool::ConstantPool;
use crate::error::ClassFormatError;
use crate::reader::{Cursor, read_attributes};
use crate::writer::{PutBytes, write_attributes};

pub const BOOTSTRAP_METHODS: &str = "BootstrapMethods";
pub const RECORD: &str = "Record";
pub const NEST_HOST: &str = "NestHost";
pub const NEST_MEMBERS: &str = "NestMembers";
pub const PERMITTED_SUBCLASSES: &str = "PermittedSubclasses";
pub const INNER_CLASSES: &str = "InnerClasses";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMethod {
    /// MethodHandle constant index.
    pub method_ref: u16,
    pub arguments: Vec<u16>,
}

pub fn bootstrap_methods(class: &ClassFile) -> Result<Vec<BootstrapMethod>, ClassFormatError> {
    let Some(attr) = class.attribute(BOOTSTRAP_METHODS) else {
        return Ok(Vec::new());
    };
    let mut cur = Cursor::new(&attr.info);
    let count = cur.u16()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let method_ref = cur.u16()?;
        let argc = cur.u16()?;
        let arguments = (0..argc).map(|_| cur.u16()).collect::<Result<Vec<_>, _>>()?;
        methods.push(BootstrapMethod {
            method_ref,
            arguments,
        });
    }
    if cur.remaining() > 0 {
        return Err(ClassFormatError::attribute(BOOTSTRAP_METHODS, "trailing bytes"));
    }
    Ok(methods)
}

pub fn encode_bootstrap_methods(methods: &[BootstrapMethod]) -> Vec<u8> {
    let mut info = Vec::new();
    info.put_u16(methods.len() as u16);
    for method in methods {
        info.put_u16(method.method_ref);
        info.put_u16(method.arguments.len() as u16);
        for &arg in &method.arguments {
            info.put_u16(arg);
        }
    }
    info
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordComponent {
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

pub fn record_components(class: &ClassFile) -> Result<Option<Vec<RecordComponent>>, ClassFormatError> {
    let Some(attr) = class.attribute(RECORD) else {
        return Ok(None);
    };
    let mut cur = Cursor::new(&attr.info);
    let count = cur.u16()?;
    let mut components = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = cur.u16()?;
        let descriptor_index = cur.u16()?;
        class.constant_pool.utf8_bytes(name_index)?;
        class.constant_pool.utf8_bytes(descriptor_index)?;
        let attributes = read_attributes(&mut cur, &class.constant_pool)?;
        components.push(RecordComponent {
            name_index,
            descriptor_index,
            attributes,
        });
    }
    if cur.remaining() > 0 {
        return Err(ClassFormatError::attribute(RECORD, "trailing bytes"));
    }
    Ok(Some(components))
}

pub fn encode_record_components(components: &[RecordComponent]) -> Vec<u8> {
    let mut info = Vec::new();
    info.put_u16(components.len() as u16);
    for component in components {
        info.put_u16(component.name_index);
        info.put_u16(component.descriptor_index);
        write_attributes(&mut info, &component.attributes);
    }
    info
}

/// `NestMembers` and `PermittedSubclasses` are both a list of class indices.
pub fn class_list(pool: &ConstantPool, attr: &Attribute, name: &str) -> Result<Vec<String>, ClassFormatError> {
    let mut cur = Cursor::new(&attr.info);
    let count = cur.u16()?;
    let mut classes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        classes.push(pool.class_name(cur.u16()?)?.into_owned());
    }
    if cur.remaining() > 0 {
        return Err(ClassFormatError::attribute(name, "trailing bytes"));
    }
    Ok(classes)
}

pub fn nest_host(class: &ClassFile) -> Result<Option<String>, ClassFormatError> {
    let Some(attr) = class.attribute(NEST_HOST) else {
        return Ok(None);
    };
    let mut cur = Cursor::new(&attr.info);
    let index = cur.u16()?;
    Ok(Some(class.constant_pool.class_name(index)?.into_owned()))
}

/// The `inner_name` the `InnerClasses` attribute records for `class_name`.
///
/// `Some(None)` marks an anonymous class; `None` means the class is not
/// listed, which makes it top level as far as reflection is concerned.
pub fn inner_name(class: &ClassFile, class_name: &str) -> Result<Option<Option<String>>, ClassFormatError> {
    let Some(attr) = class.attribute(INNER_CLASSES) else {
        return Ok(None);
    };
    let pool = &class.constant_pool;
    let mut cur = Cursor::new(&attr.info);
    let count = cur.u16()?;
    for _ in 0..count {
        let inner = cur.u16()?;
        let _outer = cur.u16()?;
        let name_index = cur.u16()?;
        let _flags = cur.u16()?;
        if pool.class_name(inner)? != class_name {
            continue;
        }
        return Ok(Some(match name_index {
            0 => None,
            index => Some(pool.utf8(index)?.into_owned()),
        }));
    }
    Ok(None)
}

/// The minimum class file major version at which the JVM recognises an
/// attribute, for attributes newer than Java 8.
pub fn introduced_in(name: &str) -> Option<u16> {
    Some(match name {
        "Module" | "ModulePackages" | "ModuleMainClass" => 53,
        NEST_HOST | NEST_MEMBERS => 55,
        RECORD => 60,
        PERMITTED_SUBCLASSES => 61,
        _ => return None,
    })
}

pub fn is_module_attribute(name: &str) -> bool {
    name.starts_with("Module")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::access;
    use crate::version::JavaVersion;

    #[test]
    fn bootstrap_methods_round_trip() {
        let mut class = ClassFile::new(JavaVersion::JAVA_11, access::PUBLIC, "a/B", Some("java/lang/Object")).unwrap();
        assert!(bootstrap_methods(&class).unwrap().is_empty());
        let methods = vec![
            BootstrapMethod {
                method_ref: 9,
                arguments: vec![1, 2],
            },
            BootstrapMethod {
                method_ref: 10,
                arguments: Vec::new(),
            },
        ];
        class.set_attribute(BOOTSTRAP_METHODS, encode_bootstrap_methods(&methods)).unwrap();
        assert_eq!(bootstrap_methods(&class).unwrap(), methods);
    }

    #[test]
    fn permitted_subclasses_resolve_names() {
        let mut class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC, "a/Shape", Some("java/lang/Object")).unwrap();
        let circle = class.constant_pool.class_index("a/Circle").unwrap();
        let mut info = Vec::new();
        info.put_u16(1);
        info.put_u16(circle);
        class.set_attribute(PERMITTED_SUBCLASSES, info).unwrap();
        let attr = class.attribute(PERMITTED_SUBCLASSES).unwrap();
        assert_eq!(
            class_list(&class.constant_pool, attr, PERMITTED_SUBCLASSES).unwrap(),
            vec!["a/Circle".to_string()]
        );
    }

    #[test]
    fn inner_names_come_from_inner_classes() {
        let mut class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC, "a/Outer$Point", Some("java/lang/Object")).unwrap();
        assert_eq!(inner_name(&class, "a/Outer$Point").unwrap(), None);

        let pool = &mut class.constant_pool;
        let point = pool.class_index("a/Outer$Point").unwrap();
        let outer = pool.class_index("a/Outer").unwrap();
        let name = pool.utf8_index("Point").unwrap();
        let anon = pool.class_index("a/Outer$1").unwrap();
        let mut info = Vec::new();
        info.put_u16(2);
        for (inner, outer, name) in [(point, outer, name), (anon, 0, 0)] {
            info.put_u16(inner);
            info.put_u16(outer);
            info.put_u16(name);
            info.put_u16(0);
        }
        class.set_attribute(INNER_CLASSES, info).unwrap();

        assert_eq!(inner_name(&class, "a/Outer$Point").unwrap(), Some(Some("Point".to_string())));
        assert_eq!(inner_name(&class, "a/Outer$1").unwrap(), Some(None));
        assert_eq!(inner_name(&class, "a/Other").unwrap(), None);
    }

    #[test]
    fn attribute_versions() {
        assert_eq!(introduced_in("Record"), Some(60));
        assert_eq!(introduced_in("ModuleMainClass"), Some(53));
        assert_eq!(introduced_in("Signature"), None);
    }
}
