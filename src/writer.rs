//! Class file serialisation. The exact inverse of [`crate::reader::parse`].

use crate::classfile::{Attribute, ClassFile, MAGIC};
use crate::constant_pool::{Constant, ConstantPool, MAX_UTF8_LEN};

/// Big-endian writes onto a byte vector.
pub(crate) trait PutBytes {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
}

impl PutBytes for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }
}

pub fn serialize(class: &ClassFile) -> Vec<u8> {
    let mut out = Vec::with_capacity(4096);
    out.put_u32(MAGIC);
    out.put_u16(class.minor_version);
    out.put_u16(class.major_version);
    write_constant_pool(&mut out, &class.constant_pool);
    out.put_u16(class.access_flags);
    out.put_u16(class.this_class);
    out.put_u16(class.super_class);

    out.put_u16(class.interfaces.len() as u16);
    for &interface in &class.interfaces {
        out.put_u16(interface);
    }

    out.put_u16(class.fields.len() as u16);
    for field in &class.fields {
        out.put_u16(field.access_flags);
        out.put_u16(field.name_index);
        out.put_u16(field.descriptor_index);
        write_attributes(&mut out, &field.attributes);
    }

    out.put_u16(class.methods.len() as u16);
    for method in &class.methods {
        out.put_u16(method.access_flags);
        out.put_u16(method.name_index);
        out.put_u16(method.descriptor_index);
        write_attributes(&mut out, &method.attributes);
    }

    write_attributes(&mut out, &class.attributes);
    out
}

fn write_constant_pool(out: &mut Vec<u8>, pool: &ConstantPool) {
    out.put_u16(pool.count());
    for (_, constant) in pool.iter() {
        out.put_u8(constant.tag());
        match constant {
            Constant::Unusable => {}
            Constant::Utf8(bytes) => {
                // Bounded by the reader and by `ConstantPool::push`.
                debug_assert!(bytes.len() <= MAX_UTF8_LEN);
                out.put_u16(bytes.len() as u16);
                out.extend_from_slice(bytes);
            }
            Constant::Integer(v) => out.put_u32(*v as u32),
            Constant::Float(bits) => out.put_u32(*bits),
            Constant::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            Constant::Double(bits) => out.extend_from_slice(&bits.to_be_bytes()),
            Constant::Class { name_index }
            | Constant::Module { name_index }
            | Constant::Package { name_index } => out.put_u16(*name_index),
            Constant::String { string_index } => out.put_u16(*string_index),
            Constant::MethodType { descriptor_index } => out.put_u16(*descriptor_index),
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                out.put_u16(*class_index);
                out.put_u16(*name_and_type_index);
            }
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => {
                out.put_u16(*name_index);
                out.put_u16(*descriptor_index);
            }
            Constant::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                out.put_u8(*reference_kind);
                out.put_u16(*reference_index);
            }
            Constant::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            }
            | Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                out.put_u16(*bootstrap_method_attr_index);
                out.put_u16(*name_and_type_index);
            }
        }
    }
}

pub(crate) fn write_attributes(out: &mut Vec<u8>, attributes: &[Attribute]) {
    out.put_u16(attributes.len() as u16);
    for attribute in attributes {
        out.put_u16(attribute.name_index);
        out.put_u32(attribute.info.len() as u32);
        out.extend_from_slice(&attribute.info);
    }
}
