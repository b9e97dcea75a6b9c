//! The constant pool: a 1-based table of tagged entries.
//!
//! Utf8 entries keep their raw modified UTF-8 bytes so an untouched pool
//! serialises back byte for byte. Everything outside the pool refers to
//! entries by `u16` index only.

use std::borrow::Cow;
use thiserror::Error;

use crate::error::ClassFormatError;

pub mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

/// Method handle reference kinds (JVMS §5.4.3.5).
pub mod ref_kind {
    pub const GET_FIELD: u8 = 1;
    pub const GET_STATIC: u8 = 2;
    pub const PUT_FIELD: u8 = 3;
    pub const PUT_STATIC: u8 = 4;
    pub const INVOKE_VIRTUAL: u8 = 5;
    pub const INVOKE_STATIC: u8 = 6;
    pub const INVOKE_SPECIAL: u8 = 7;
    pub const NEW_INVOKE_SPECIAL: u8 = 8;
    pub const INVOKE_INTERFACE: u8 = 9;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Slot 0 and the slot after every Long/Double.
    Unusable,
    Utf8(Vec<u8>),
    Integer(i32),
    /// Raw IEEE bits, so NaN payloads survive and equality is exact.
    Float(u32),
    Long(i64),
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

impl Constant {
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Unusable => 0,
            Constant::Utf8(_) => tag::UTF8,
            Constant::Integer(_) => tag::INTEGER,
            Constant::Float(_) => tag::FLOAT,
            Constant::Long(_) => tag::LONG,
            Constant::Double(_) => tag::DOUBLE,
            Constant::Class { .. } => tag::CLASS,
            Constant::String { .. } => tag::STRING,
            Constant::Fieldref { .. } => tag::FIELDREF,
            Constant::Methodref { .. } => tag::METHODREF,
            Constant::InterfaceMethodref { .. } => tag::INTERFACE_METHODREF,
            Constant::NameAndType { .. } => tag::NAME_AND_TYPE,
            Constant::MethodHandle { .. } => tag::METHOD_HANDLE,
            Constant::MethodType { .. } => tag::METHOD_TYPE,
            Constant::Dynamic { .. } => tag::DYNAMIC,
            Constant::InvokeDynamic { .. } => tag::INVOKE_DYNAMIC,
            Constant::Module { .. } => tag::MODULE,
            Constant::Package { .. } => tag::PACKAGE,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Constant::Unusable => "unusable slot",
            Constant::Utf8(_) => "Utf8",
            Constant::Integer(_) => "Integer",
            Constant::Float(_) => "Float",
            Constant::Long(_) => "Long",
            Constant::Double(_) => "Double",
            Constant::Class { .. } => "Class",
            Constant::String { .. } => "String",
            Constant::Fieldref { .. } => "Fieldref",
            Constant::Methodref { .. } => "Methodref",
            Constant::InterfaceMethodref { .. } => "InterfaceMethodref",
            Constant::NameAndType { .. } => "NameAndType",
            Constant::MethodHandle { .. } => "MethodHandle",
            Constant::MethodType { .. } => "MethodType",
            Constant::Dynamic { .. } => "Dynamic",
            Constant::InvokeDynamic { .. } => "InvokeDynamic",
            Constant::Module { .. } => "Module",
            Constant::Package { .. } => "Package",
        }
    }

    /// Long and Double take two pool slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// An addition the class file format has no room for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolOverflow {
    #[error("constant pool would exceed 65535 entries")]
    Entries,
    #[error("Utf8 constant of {0} bytes exceeds the 65535 byte limit")]
    Utf8Length(usize),
}

/// Longest Utf8 payload a class file can encode.
pub const MAX_UTF8_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// A resolved Fieldref/Methodref/InterfaceMethodref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub kind: MemberKind,
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// A resolved MethodHandle constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHandleRef {
    pub reference_kind: u8,
    pub member: MemberRef,
}

/// A resolved Dynamic/InvokeDynamic constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRef {
    pub bootstrap_index: u16,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    /// Entries as read from a class file, including slot 0 and the slots
    /// shadowed by wide constants.
    pub(crate) fn from_entries(entries: Vec<Constant>) -> Self {
        Self { entries }
    }

    /// The `constant_pool_count` value written to the class file.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }

    /// Usable entries with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c, Constant::Unusable))
            .map(|(i, c)| (i as u16, c))
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFormatError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(ClassFormatError::ConstantIndexOutOfRange {
                index,
                count: self.count(),
            }),
            Some(c) => Ok(c),
        }
    }

    /// Overwrites an existing slot. The replacement must have the same width.
    pub(crate) fn replace(&mut self, index: u16, constant: Constant) -> Result<(), ClassFormatError> {
        let width_matches = self.get(index)?.is_wide() == constant.is_wide();
        if !width_matches {
            return Err(ClassFormatError::ConstantTypeMismatch {
                index,
                expected: "constant of equal width",
                found: constant.kind_name(),
            });
        }
        self.entries[index as usize] = constant;
        Ok(())
    }

    fn mismatch(&self, index: u16, expected: &'static str) -> ClassFormatError {
        ClassFormatError::ConstantTypeMismatch {
            index,
            expected,
            found: self
                .entries
                .get(index as usize)
                .map(Constant::kind_name)
                .unwrap_or("missing"),
        }
    }

    /// A Utf8 entry as UTF-16 code units, exactly as the JVM sees it.
    pub fn utf8_units(&self, index: u16) -> Result<Vec<u16>, ClassFormatError> {
        let bytes = self.utf8_bytes(index)?;
        mutf8::decode_units(bytes).ok_or(ClassFormatError::InvalidUtf8 { index })
    }

    pub fn utf8_bytes(&self, index: u16) -> Result<&[u8], ClassFormatError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(bytes),
            _ => Err(self.mismatch(index, "Utf8")),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<Cow<'_, str>, ClassFormatError> {
        let bytes = self.utf8_bytes(index)?;
        mutf8::decode(bytes).ok_or(ClassFormatError::InvalidUtf8 { index })
    }

    /// Compares a Utf8 entry against an ASCII/UTF-8 string without decoding.
    pub fn utf8_eq(&self, index: u16, expected: &str) -> bool {
        match self.entries.get(index as usize) {
            Some(Constant::Utf8(bytes)) => mutf8::decode(bytes).is_some_and(|s| s == expected),
            _ => false,
        }
    }

    pub fn class_name(&self, index: u16) -> Result<Cow<'_, str>, ClassFormatError> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(self.mismatch(index, "Class")),
        }
    }

    pub fn string(&self, index: u16) -> Result<Cow<'_, str>, ClassFormatError> {
        match self.get(index)? {
            Constant::String { string_index } => self.utf8(*string_index),
            _ => Err(self.mismatch(index, "String")),
        }
    }

    /// The value of a String constant without lossy conversion; unpaired
    /// surrogates survive.
    pub fn string_units(&self, index: u16) -> Result<Vec<u16>, ClassFormatError> {
        match self.get(index)? {
            Constant::String { string_index } => self.utf8_units(*string_index),
            _ => Err(self.mismatch(index, "String")),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(String, String), ClassFormatError> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((
                self.utf8(*name_index)?.into_owned(),
                self.utf8(*descriptor_index)?.into_owned(),
            )),
            _ => Err(self.mismatch(index, "NameAndType")),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef, ClassFormatError> {
        let (kind, class_index, nat_index) = match self.get(index)? {
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            } => (MemberKind::Field, *class_index, *name_and_type_index),
            Constant::Methodref {
                class_index,
                name_and_type_index,
            } => (MemberKind::Method, *class_index, *name_and_type_index),
            Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (MemberKind::InterfaceMethod, *class_index, *name_and_type_index),
            _ => return Err(self.mismatch(index, "member reference")),
        };
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok(MemberRef {
            kind,
            owner: self.class_name(class_index)?.into_owned(),
            name,
            descriptor,
        })
    }

    pub fn method_handle(&self, index: u16) -> Result<MethodHandleRef, ClassFormatError> {
        match self.get(index)? {
            Constant::MethodHandle {
                reference_kind,
                reference_index,
            } => Ok(MethodHandleRef {
                reference_kind: *reference_kind,
                member: self.member_ref(*reference_index)?,
            }),
            _ => Err(self.mismatch(index, "MethodHandle")),
        }
    }

    pub fn dynamic(&self, index: u16) -> Result<DynamicRef, ClassFormatError> {
        match self.get(index)? {
            Constant::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            }
            | Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(DynamicRef {
                    bootstrap_index: *bootstrap_method_attr_index,
                    name,
                    descriptor,
                })
            }
            _ => Err(self.mismatch(index, "Dynamic or InvokeDynamic")),
        }
    }

    /// Checks every cross reference inside the pool for range and tag.
    pub fn validate(&self) -> Result<(), ClassFormatError> {
        for (index, constant) in self.iter() {
            match constant {
                Constant::Utf8(bytes) => {
                    if mutf8::decode(bytes).is_none() {
                        return Err(ClassFormatError::InvalidUtf8 { index });
                    }
                }
                Constant::Class { name_index }
                | Constant::String {
                    string_index: name_index,
                }
                | Constant::MethodType {
                    descriptor_index: name_index,
                }
                | Constant::Module { name_index }
                | Constant::Package { name_index } => {
                    self.utf8_bytes(*name_index)?;
                }
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
                    self.expect_tag(*class_index, tag::CLASS, "Class")?;
                    self.expect_tag(*name_and_type_index, tag::NAME_AND_TYPE, "NameAndType")?;
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    self.utf8_bytes(*name_index)?;
                    self.utf8_bytes(*descriptor_index)?;
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    let target = self.get(*reference_index)?;
                    let ok = match *reference_kind {
                        ref_kind::GET_FIELD..=ref_kind::PUT_STATIC => {
                            matches!(target, Constant::Fieldref { .. })
                        }
                        ref_kind::INVOKE_VIRTUAL | ref_kind::NEW_INVOKE_SPECIAL => {
                            matches!(target, Constant::Methodref { .. })
                        }
                        ref_kind::INVOKE_STATIC | ref_kind::INVOKE_SPECIAL => matches!(
                            target,
                            Constant::Methodref { .. } | Constant::InterfaceMethodref { .. }
                        ),
                        ref_kind::INVOKE_INTERFACE => {
                            matches!(target, Constant::InterfaceMethodref { .. })
                        }
                        _ => false,
                    };
                    if !ok {
                        return Err(self.mismatch(*reference_index, "method handle target"));
                    }
                }
                Constant::Dynamic {
                    name_and_type_index,
                    ..
                }
                | Constant::InvokeDynamic {
                    name_and_type_index,
                    ..
                } => {
                    self.expect_tag(*name_and_type_index, tag::NAME_AND_TYPE, "NameAndType")?;
                }
                Constant::Integer(_)
                | Constant::Float(_)
                | Constant::Long(_)
                | Constant::Double(_)
                | Constant::Unusable => {}
            }
        }
        Ok(())
    }

    pub fn expect_tag(&self, index: u16, tag: u8, expected: &'static str) -> Result<(), ClassFormatError> {
        if self.get(index)?.tag() == tag {
            Ok(())
        } else {
            Err(self.mismatch(index, expected))
        }
    }

    /// Appends an entry without looking for duplicates.
    pub fn push(&mut self, constant: Constant) -> Result<u16, PoolOverflow> {
        let index = self.entries.len();
        let needed = if constant.is_wide() { 2 } else { 1 };
        if index + needed > u16::MAX as usize {
            return Err(PoolOverflow::Entries);
        }
        if let Constant::Utf8(bytes) = &constant
            && bytes.len() > MAX_UTF8_LEN
        {
            return Err(PoolOverflow::Utf8Length(bytes.len()));
        }
        let wide = constant.is_wide();
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index as u16)
    }

    /// Returns the index of an equal entry, appending one if none exists.
    pub fn intern(&mut self, constant: Constant) -> Result<u16, PoolOverflow> {
        if let Some(index) = self.entries.iter().position(|c| *c == constant) {
            if index != 0 {
                return Ok(index as u16);
            }
        }
        self.push(constant)
    }

    pub fn utf8_index(&mut self, value: &str) -> Result<u16, PoolOverflow> {
        self.intern(Constant::Utf8(mutf8::encode(value)))
    }

    pub fn class_index(&mut self, name: &str) -> Result<u16, PoolOverflow> {
        let name_index = self.utf8_index(name)?;
        self.intern(Constant::Class { name_index })
    }

    pub fn string_index(&mut self, value: &str) -> Result<u16, PoolOverflow> {
        let string_index = self.utf8_index(value)?;
        self.intern(Constant::String { string_index })
    }

    /// Like [`string_index`](Self::string_index) for a Java string held as
    /// UTF-16 code units.
    pub fn string_index_units(&mut self, units: &[u16]) -> Result<u16, PoolOverflow> {
        let string_index = self.intern(Constant::Utf8(mutf8::encode_units(units)))?;
        self.intern(Constant::String { string_index })
    }

    pub fn integer_index(&mut self, value: i32) -> Result<u16, PoolOverflow> {
        self.intern(Constant::Integer(value))
    }

    pub fn name_and_type_index(&mut self, name: &str, descriptor: &str) -> Result<u16, PoolOverflow> {
        let name_index = self.utf8_index(name)?;
        let descriptor_index = self.utf8_index(descriptor)?;
        self.intern(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn field_ref_index(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, PoolOverflow> {
        let class_index = self.class_index(owner)?;
        let name_and_type_index = self.name_and_type_index(name, descriptor)?;
        self.intern(Constant::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn method_ref_index(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16, PoolOverflow> {
        let class_index = self.class_index(owner)?;
        let name_and_type_index = self.name_and_type_index(name, descriptor)?;
        if interface {
            self.intern(Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            })
        } else {
            self.intern(Constant::Methodref {
                class_index,
                name_and_type_index,
            })
        }
    }

    pub fn method_handle_index(&mut self, reference_kind: u8, reference_index: u16) -> Result<u16, PoolOverflow> {
        self.intern(Constant::MethodHandle {
            reference_kind,
            reference_index,
        })
    }
}

/// The JVM's "modified UTF-8": NUL is two bytes and supplementary
/// characters are encoded as surrogate pairs of three bytes each.
pub mod mutf8 {
    use std::borrow::Cow;

    pub fn encode(value: &str) -> Vec<u8> {
        let units: Vec<u16> = value.encode_utf16().collect();
        encode_units(&units)
    }

    /// Encodes arbitrary UTF-16, including unpaired surrogates.
    pub fn encode_units(units: &[u16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(units.len());
        for &unit in units {
            match unit {
                0x0001..=0x007F => out.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
        out
    }

    /// Returns `None` for structurally invalid input. Unpaired surrogates
    /// decode to U+FFFD; use [`decode_units`] where they must survive.
    pub fn decode(bytes: &[u8]) -> Option<Cow<'_, str>> {
        if bytes.iter().all(|b| (0x01..=0x7F).contains(b)) {
            return std::str::from_utf8(bytes).ok().map(Cow::Borrowed);
        }
        let units = decode_units(bytes)?;
        Some(Cow::Owned(
            char::decode_utf16(units)
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        ))
    }

    pub fn decode_units(bytes: &[u8]) -> Option<Vec<u16>> {
        let mut units = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let a = bytes[i] as u16;
            match a {
                0x01..=0x7F => {
                    units.push(a);
                    i += 1;
                }
                0xC0..=0xDF => {
                    let b = continuation(bytes.get(i + 1)?)?;
                    units.push(((a & 0x1F) << 6) | b);
                    i += 2;
                }
                0xE0..=0xEF => {
                    let b = continuation(bytes.get(i + 1)?)?;
                    let c = continuation(bytes.get(i + 2)?)?;
                    units.push(((a & 0x0F) << 12) | (b << 6) | c);
                    i += 3;
                }
                _ => return None,
            }
        }
        Some(units)
    }

    fn continuation(byte: &u8) -> Option<u16> {
        (byte & 0xC0 == 0x80).then_some((byte & 0x3F) as u16)
    }
}
