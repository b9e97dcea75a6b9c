//! Class file parsing.
//!
//! Every read is bounds checked; a short buffer surfaces as
//! [`ClassFormatError::Truncated`] instead of a panic.

use crate::classfile::{Attribute, ClassFile, FieldInfo, MAGIC, MethodInfo};
use crate::constant_pool::{Constant, ConstantPool, tag};
use crate::error::ClassFormatError;
use crate::version::{MAX_MAJOR_VERSION, MIN_MAJOR_VERSION};

/// Big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFormatError> {
        if self.remaining() < len {
            return Err(ClassFormatError::Truncated {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), ClassFormatError> {
        self.bytes(len).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ClassFormatError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn i8(&mut self) -> Result<i8, ClassFormatError> {
        Ok(self.u8()? as i8)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ClassFormatError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, ClassFormatError> {
        Ok(self.u16()? as i16)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ClassFormatError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ClassFormatError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ClassFormatError> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok((hi << 32) | lo)
    }
}

pub fn parse(bytes: &[u8]) -> Result<ClassFile, ClassFormatError> {
    let mut cur = Cursor::new(bytes);

    let magic = cur.u32()?;
    if magic != MAGIC {
        return Err(ClassFormatError::BadMagic { found: magic });
    }
    let minor_version = cur.u16()?;
    let major_version = cur.u16()?;
    if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
        return Err(ClassFormatError::UnsupportedVersion {
            major: major_version,
            minor: minor_version,
        });
    }

    let constant_pool = read_constant_pool(&mut cur)?;
    constant_pool.validate()?;

    let access_flags = cur.u16()?;
    let this_class = cur.u16()?;
    constant_pool.expect_tag(this_class, tag::CLASS, "Class")?;
    let super_class = cur.u16()?;
    if super_class != 0 {
        constant_pool.expect_tag(super_class, tag::CLASS, "Class")?;
    }

    let interfaces_count = cur.u16()?;
    let mut interfaces = Vec::with_capacity(interfaces_count as usize);
    for _ in 0..interfaces_count {
        let index = cur.u16()?;
        constant_pool.expect_tag(index, tag::CLASS, "Class")?;
        interfaces.push(index);
    }

    let fields_count = cur.u16()?;
    let mut fields = Vec::with_capacity(fields_count as usize);
    for _ in 0..fields_count {
        let (access_flags, name_index, descriptor_index, attributes) =
            read_member(&mut cur, &constant_pool)?;
        fields.push(FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    let methods_count = cur.u16()?;
    let mut methods = Vec::with_capacity(methods_count as usize);
    for _ in 0..methods_count {
        let (access_flags, name_index, descriptor_index, attributes) =
            read_member(&mut cur, &constant_pool)?;
        methods.push(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    let attributes = read_attributes(&mut cur, &constant_pool)?;

    if cur.remaining() > 0 {
        return Err(ClassFormatError::TrailingBytes {
            count: cur.remaining(),
        });
    }

    Ok(ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

/// Best-effort lookup of the class name for error reporting on inputs that
/// fail to parse further along.
pub fn peek_class_name(bytes: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(bytes);
    if cur.u32().ok()? != MAGIC {
        return None;
    }
    cur.skip(4).ok()?;
    let pool = read_constant_pool(&mut cur).ok()?;
    cur.skip(2).ok()?;
    let this_class = cur.u16().ok()?;
    pool.class_name(this_class).ok().map(|n| n.into_owned())
}

fn read_constant_pool(cur: &mut Cursor<'_>) -> Result<ConstantPool, ClassFormatError> {
    let count = cur.u16()?;
    let mut entries = Vec::with_capacity(count as usize);
    entries.push(Constant::Unusable);

    let mut index: u16 = 1;
    while index < count {
        let tag = cur.u8()?;
        let constant = match tag {
            tag::UTF8 => {
                let len = cur.u16()? as usize;
                Constant::Utf8(cur.bytes(len)?.to_vec())
            }
            tag::INTEGER => Constant::Integer(cur.i32()?),
            tag::FLOAT => Constant::Float(cur.u32()?),
            tag::LONG => Constant::Long(cur.u64()? as i64),
            tag::DOUBLE => Constant::Double(cur.u64()?),
            tag::CLASS => Constant::Class {
                name_index: cur.u16()?,
            },
            tag::STRING => Constant::String {
                string_index: cur.u16()?,
            },
            tag::FIELDREF => Constant::Fieldref {
                class_index: cur.u16()?,
                name_and_type_index: cur.u16()?,
            },
            tag::METHODREF => Constant::Methodref {
                class_index: cur.u16()?,
                name_and_type_index: cur.u16()?,
            },
            tag::INTERFACE_METHODREF => Constant::InterfaceMethodref {
                class_index: cur.u16()?,
                name_and_type_index: cur.u16()?,
            },
            tag::NAME_AND_TYPE => Constant::NameAndType {
                name_index: cur.u16()?,
                descriptor_index: cur.u16()?,
            },
            tag::METHOD_HANDLE => Constant::MethodHandle {
                reference_kind: cur.u8()?,
                reference_index: cur.u16()?,
            },
            tag::METHOD_TYPE => Constant::MethodType {
                descriptor_index: cur.u16()?,
            },
            tag::DYNAMIC => Constant::Dynamic {
                bootstrap_method_attr_index: cur.u16()?,
                name_and_type_index: cur.u16()?,
            },
            tag::INVOKE_DYNAMIC => Constant::InvokeDynamic {
                bootstrap_method_attr_index: cur.u16()?,
                name_and_type_index: cur.u16()?,
            },
            tag::MODULE => Constant::Module {
                name_index: cur.u16()?,
            },
            tag::PACKAGE => Constant::Package {
                name_index: cur.u16()?,
            },
            other => return Err(ClassFormatError::UnknownConstantTag { index, tag: other }),
        };

        let wide = constant.is_wide();
        entries.push(constant);
        index += 1;
        if wide {
            if index >= count {
                return Err(ClassFormatError::ConstantIndexOutOfRange { index, count });
            }
            entries.push(Constant::Unusable);
            index += 1;
        }
    }

    Ok(ConstantPool::from_entries(entries))
}

fn read_member(
    cur: &mut Cursor<'_>,
    pool: &ConstantPool,
) -> Result<(u16, u16, u16, Vec<Attribute>), ClassFormatError> {
    let access_flags = cur.u16()?;
    let name_index = cur.u16()?;
    pool.utf8_bytes(name_index)?;
    let descriptor_index = cur.u16()?;
    pool.utf8_bytes(descriptor_index)?;
    let attributes = read_attributes(cur, pool)?;
    Ok((access_flags, name_index, descriptor_index, attributes))
}

pub(crate) fn read_attributes(
    cur: &mut Cursor<'_>,
    pool: &ConstantPool,
) -> Result<Vec<Attribute>, ClassFormatError> {
    let count = cur.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = cur.u16()?;
        pool.utf8_bytes(name_index)?;
        let len = cur.u32()? as usize;
        let info = cur.bytes(len)?.to_vec();
        attributes.push(Attribute { name_index, info });
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(major: u16) -> Vec<u8> {
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&major.to_be_bytes());
        bytes
    }

    #[test]
    fn rejects_bad_magic() {
        let err = parse(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 52]).unwrap_err();
        assert_eq!(err, ClassFormatError::BadMagic { found: 0xDEAD_BEEF });
    }

    #[test]
    fn rejects_unknown_major() {
        let err = parse(&header(99)).unwrap_err();
        assert_eq!(err, ClassFormatError::UnsupportedVersion { major: 99, minor: 0 });
    }

    #[test]
    fn truncated_pool_is_reported_not_panicked() {
        let mut bytes = header(61);
        bytes.extend_from_slice(&5u16.to_be_bytes());
        bytes.push(tag::UTF8);
        bytes.extend_from_slice(&40u16.to_be_bytes());
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            parse(&bytes),
            Err(ClassFormatError::Truncated { needed: 35, .. })
        ));
    }

    #[test]
    fn unknown_tag_is_reported_with_index() {
        let mut bytes = header(61);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.push(tag::INTEGER);
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.push(2);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            ClassFormatError::UnknownConstantTag { index: 2, tag: 2 }
        );
    }

    #[test]
    fn cursor_reads_big_endian() {
        let mut cur = Cursor::new(&[0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(cur.u16().unwrap(), 0x1234);
        assert_eq!(cur.i32().unwrap(), -2);
        assert_eq!(cur.remaining(), 0);
        assert!(cur.u8().is_err());
    }
}
