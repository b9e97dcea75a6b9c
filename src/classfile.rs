//! Structural model of a class file.
//!
//! Attributes stay as raw bytes until something needs to look inside them;
//! see [`crate::attributes`] for the typed views.

use crate::constant_pool::{Constant, ConstantPool, PoolOverflow};
use crate::error::ClassFormatError;
use crate::version::JavaVersion;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const VOLATILE: u16 = 0x0040;
    pub const BRIDGE: u16 = 0x0040;
    pub const VARARGS: u16 = 0x0080;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
    pub const ANNOTATION: u16 = 0x2000;
    pub const ENUM: u16 = 0x4000;
    pub const MODULE: u16 = 0x8000;

    /// Mask of the three visibility bits.
    pub const VISIBILITY: u16 = PUBLIC | PRIVATE | PROTECTED;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// An empty public class extending `super_name`.
    pub fn new(
        version: JavaVersion,
        access_flags: u16,
        name: &str,
        super_name: Option<&str>,
    ) -> Result<Self, PoolOverflow> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.class_index(name)?;
        let super_class = match super_name {
            Some(super_name) => constant_pool.class_index(super_name)?,
            None => 0,
        };
        Ok(Self {
            minor_version: 0,
            major_version: version.major(),
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn version(&self) -> Option<JavaVersion> {
        JavaVersion::from_major(self.major_version)
    }

    pub fn name(&self) -> Result<String, ClassFormatError> {
        Ok(self.constant_pool.class_name(self.this_class)?.into_owned())
    }

    pub fn super_name(&self) -> Result<Option<String>, ClassFormatError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        Ok(Some(self.constant_pool.class_name(self.super_class)?.into_owned()))
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        find_attribute(&self.constant_pool, &self.attributes, name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// Removes every class-level attribute with this name; returns how many.
    pub fn remove_attribute(&mut self, name: &str) -> usize {
        let before = self.attributes.len();
        let pool = &self.constant_pool;
        self.attributes
            .retain(|attr| !pool.utf8_eq(attr.name_index, name));
        before - self.attributes.len()
    }

    /// Replaces the first attribute with this name, or appends one.
    pub fn set_attribute(&mut self, name: &str, info: Vec<u8>) -> Result<(), PoolOverflow> {
        let name_index = self.constant_pool.utf8_index(name)?;
        match self.attributes.iter_mut().find(|a| a.name_index == name_index) {
            Some(existing) => existing.info = info,
            None => self.attributes.push(Attribute { name_index, info }),
        }
        Ok(())
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|m| {
            self.constant_pool.utf8_eq(m.name_index, name)
                && self.constant_pool.utf8_eq(m.descriptor_index, descriptor)
        })
    }

    pub fn find_field(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.fields.iter().position(|f| {
            self.constant_pool.utf8_eq(f.name_index, name)
                && self.constant_pool.utf8_eq(f.descriptor_index, descriptor)
        })
    }

    pub fn member_name(&self, name_index: u16, descriptor_index: u16) -> Result<(String, String), ClassFormatError> {
        Ok((
            self.constant_pool.utf8(name_index)?.into_owned(),
            self.constant_pool.utf8(descriptor_index)?.into_owned(),
        ))
    }
}

/// Somewhere a Utf8 index is read as a descriptor or generic signature.
///
/// String constants are never descriptor slots, so retargeting a type
/// through these leaves literals alone even when they share a Utf8 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSlot {
    Field(usize),
    Method(usize),
    NameAndType(u16),
    MethodType(u16),
    ClassSignature(usize),
    FieldSignature { field: usize, attribute: usize },
    MethodSignature { method: usize, attribute: usize },
}

pub const SIGNATURE: &str = "Signature";

impl ClassFile {
    /// Every descriptor slot with the Utf8 index it currently holds.
    pub fn descriptor_slots(&self) -> Result<Vec<(DescriptorSlot, u16)>, ClassFormatError> {
        let pool = &self.constant_pool;
        let mut slots = Vec::new();
        for (index, constant) in pool.iter() {
            match constant {
                Constant::NameAndType { descriptor_index, .. } => {
                    slots.push((DescriptorSlot::NameAndType(index), *descriptor_index));
                }
                Constant::MethodType { descriptor_index } => {
                    slots.push((DescriptorSlot::MethodType(index), *descriptor_index));
                }
                _ => {}
            }
        }
        for (i, field) in self.fields.iter().enumerate() {
            slots.push((DescriptorSlot::Field(i), field.descriptor_index));
            for (a, attr) in signatures(pool, &field.attributes) {
                slots.push((DescriptorSlot::FieldSignature { field: i, attribute: a }, signature_index(attr)?));
            }
        }
        for (i, method) in self.methods.iter().enumerate() {
            slots.push((DescriptorSlot::Method(i), method.descriptor_index));
            for (a, attr) in signatures(pool, &method.attributes) {
                slots.push((DescriptorSlot::MethodSignature { method: i, attribute: a }, signature_index(attr)?));
            }
        }
        for (a, attr) in signatures(pool, &self.attributes) {
            slots.push((DescriptorSlot::ClassSignature(a), signature_index(attr)?));
        }
        Ok(slots)
    }

    /// Points `slot` at another Utf8 entry.
    pub fn set_descriptor(&mut self, slot: DescriptorSlot, utf8: u16) -> Result<(), ClassFormatError> {
        let missing = || ClassFormatError::attribute(SIGNATURE, "descriptor slot out of range");
        let signature = utf8.to_be_bytes().to_vec();
        match slot {
            DescriptorSlot::Field(i) => self.fields.get_mut(i).ok_or_else(missing)?.descriptor_index = utf8,
            DescriptorSlot::Method(i) => self.methods.get_mut(i).ok_or_else(missing)?.descriptor_index = utf8,
            DescriptorSlot::NameAndType(index) => {
                let Constant::NameAndType { name_index, .. } = *self.constant_pool.get(index)? else {
                    return Err(missing());
                };
                self.constant_pool.replace(
                    index,
                    Constant::NameAndType {
                        name_index,
                        descriptor_index: utf8,
                    },
                )?;
            }
            DescriptorSlot::MethodType(index) => {
                self.constant_pool
                    .replace(index, Constant::MethodType { descriptor_index: utf8 })?;
            }
            DescriptorSlot::ClassSignature(a) => self.attributes.get_mut(a).ok_or_else(missing)?.info = signature,
            DescriptorSlot::FieldSignature { field, attribute } => {
                let field = self.fields.get_mut(field).ok_or_else(missing)?;
                field.attributes.get_mut(attribute).ok_or_else(missing)?.info = signature;
            }
            DescriptorSlot::MethodSignature { method, attribute } => {
                let method = self.methods.get_mut(method).ok_or_else(missing)?;
                method.attributes.get_mut(attribute).ok_or_else(missing)?.info = signature;
            }
        }
        Ok(())
    }
}

fn signatures<'a>(pool: &'a ConstantPool, attributes: &'a [Attribute]) -> impl Iterator<Item = (usize, &'a Attribute)> + 'a {
    attributes
        .iter()
        .enumerate()
        .filter(|(_, a)| pool.utf8_eq(a.name_index, SIGNATURE))
}

fn signature_index(attr: &Attribute) -> Result<u16, ClassFormatError> {
    match attr.info.as_slice() {
        &[hi, lo] => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(ClassFormatError::attribute(SIGNATURE, "expected a two byte index")),
    }
}

impl MethodInfo {
    pub fn attribute<'a>(&'a self, pool: &ConstantPool, name: &str) -> Option<&'a Attribute> {
        find_attribute(pool, &self.attributes, name)
    }

    pub fn code_attribute_index(&self, pool: &ConstantPool) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| pool.utf8_eq(a.name_index, "Code"))
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }
}

pub(crate) fn find_attribute<'a>(
    pool: &ConstantPool,
    attributes: &'a [Attribute],
    name: &str,
) -> Option<&'a Attribute> {
    attributes.iter().find(|a| pool.utf8_eq(a.name_index, name))
}

/// Sets the visibility bits of `flags` to exactly `visibility`.
pub fn with_visibility(flags: u16, visibility: u16) -> u16 {
    (flags & !access::VISIBILITY) | visibility
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_class_interns_names() {
        let class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC, "a/B", Some("java/lang/Object")).unwrap();
        assert_eq!(class.name().unwrap(), "a/B");
        assert_eq!(class.super_name().unwrap().as_deref(), Some("java/lang/Object"));
        assert_eq!(class.version(), Some(JavaVersion::JAVA_17));
    }

    #[test]
    fn attributes_can_be_set_and_removed_by_name() {
        let mut class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC, "a/B", Some("java/lang/Object")).unwrap();
        class.set_attribute("NestHost", vec![0, 1]).unwrap();
        class.set_attribute("NestHost", vec![0, 2]).unwrap();
        assert_eq!(class.attributes.len(), 1);
        assert_eq!(class.attribute("NestHost").unwrap().info, vec![0, 2]);
        assert_eq!(class.remove_attribute("NestHost"), 1);
        assert!(!class.has_attribute("NestHost"));
    }

    #[test]
    fn descriptor_slots_skip_string_constants() {
        let mut class = ClassFile::new(JavaVersion::JAVA_17, access::PUBLIC, "a/B", Some("java/lang/Object")).unwrap();
        let pool = &mut class.constant_pool;
        let literal = pool.string_index("(I)V").unwrap();
        let nat = pool.name_and_type_index("m", "(I)V").unwrap();
        let shared = pool.utf8_index("(I)V").unwrap();
        let name = pool.utf8_index("m").unwrap();
        class.methods.push(MethodInfo {
            access_flags: access::PUBLIC,
            name_index: name,
            descriptor_index: shared,
            attributes: Vec::new(),
        });

        let slots = class.descriptor_slots().unwrap();
        assert_eq!(
            slots,
            vec![(DescriptorSlot::NameAndType(nat), shared), (DescriptorSlot::Method(0), shared)]
        );

        let other = class.constant_pool.utf8_index("(J)V").unwrap();
        for (slot, _) in slots {
            class.set_descriptor(slot, other).unwrap();
        }
        assert_eq!(class.constant_pool.string(literal).unwrap(), "(I)V");
        assert_eq!(class.constant_pool.name_and_type(nat).unwrap().1, "(J)V");
        assert_eq!(class.methods[0].descriptor_index, other);
    }

    #[test]
    fn visibility_is_replaced_not_merged() {
        let flags = access::PRIVATE | access::STATIC | access::FINAL;
        assert_eq!(with_visibility(flags, access::PUBLIC), access::PUBLIC | access::STATIC | access::FINAL);
        assert_eq!(with_visibility(flags, 0), access::STATIC | access::FINAL);
    }
}
