//! Field and method descriptors.

use std::fmt;

use crate::code::op;
use crate::error::ClassFormatError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn parse(descriptor: &str) -> Result<Self, ClassFormatError> {
        let (ty, rest) = parse_field(descriptor).ok_or_else(|| invalid(descriptor))?;
        if !rest.is_empty() {
            return Err(invalid(descriptor));
        }
        Ok(ty)
    }

    pub fn object(name: &str) -> Self {
        FieldType::Object(name.to_string())
    }

    /// Local variable / operand stack slots taken by a value of this type.
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    /// Computational type as seen by the verifier: sub-int types are ints.
    pub fn is_int_like(&self) -> bool {
        matches!(
            self,
            FieldType::Byte | FieldType::Char | FieldType::Short | FieldType::Boolean | FieldType::Int
        )
    }

    pub fn load_opcode(&self) -> u8 {
        match self {
            FieldType::Long => op::LLOAD,
            FieldType::Float => op::FLOAD,
            FieldType::Double => op::DLOAD,
            FieldType::Object(_) | FieldType::Array(_) => op::ALOAD,
            _ => op::ILOAD,
        }
    }

    pub fn store_opcode(&self) -> u8 {
        match self {
            FieldType::Long => op::LSTORE,
            FieldType::Float => op::FSTORE,
            FieldType::Double => op::DSTORE,
            FieldType::Object(_) | FieldType::Array(_) => op::ASTORE,
            _ => op::ISTORE,
        }
    }

    pub fn return_opcode(&self) -> u8 {
        match self {
            FieldType::Long => op::LRETURN,
            FieldType::Float => op::FRETURN,
            FieldType::Double => op::DRETURN,
            FieldType::Object(_) | FieldType::Array(_) => op::ARETURN,
            _ => op::IRETURN,
        }
    }

    /// Name usable in a `Class` constant: internal name or array descriptor.
    pub fn class_constant_name(&self) -> Option<String> {
        match self {
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(self.to_string()),
            _ => None,
        }
    }

    /// Boxed wrapper class for primitive types.
    pub fn wrapper_class(&self) -> Option<&'static str> {
        Some(match self {
            FieldType::Byte => "java/lang/Byte",
            FieldType::Char => "java/lang/Character",
            FieldType::Double => "java/lang/Double",
            FieldType::Float => "java/lang/Float",
            FieldType::Int => "java/lang/Integer",
            FieldType::Long => "java/lang/Long",
            FieldType::Short => "java/lang/Short",
            FieldType::Boolean => "java/lang/Boolean",
            FieldType::Object(_) | FieldType::Array(_) => return None,
        })
    }

    /// Resolves a primitive from its descriptor character or its keyword.
    pub fn primitive_from_name(name: &str) -> Option<Self> {
        Some(match name {
            "B" | "byte" => FieldType::Byte,
            "C" | "char" => FieldType::Char,
            "D" | "double" => FieldType::Double,
            "F" | "float" => FieldType::Float,
            "I" | "int" => FieldType::Int,
            "J" | "long" => FieldType::Long,
            "S" | "short" => FieldType::Short,
            "Z" | "boolean" => FieldType::Boolean,
            _ => return None,
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => f.write_str("B"),
            FieldType::Char => f.write_str("C"),
            FieldType::Double => f.write_str("D"),
            FieldType::Float => f.write_str("F"),
            FieldType::Int => f.write_str("I"),
            FieldType::Long => f.write_str("J"),
            FieldType::Short => f.write_str("S"),
            FieldType::Boolean => f.write_str("Z"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(component) => write!(f, "[{component}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `void`.
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self, ClassFormatError> {
        let mut rest = descriptor
            .strip_prefix('(')
            .ok_or_else(|| invalid(descriptor))?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            let (ty, tail) = parse_field(rest).ok_or_else(|| invalid(descriptor))?;
            params.push(ty);
            rest = tail;
        }
        let rest = &rest[1..];
        let ret = if rest == "V" {
            None
        } else {
            Some(FieldType::parse(rest).map_err(|_| invalid(descriptor))?)
        };
        Ok(Self { params, ret })
    }

    pub fn new(params: Vec<FieldType>, ret: Option<FieldType>) -> Self {
        Self { params, ret }
    }

    /// Slots taken by the arguments, excluding any receiver.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }

    pub fn return_slots(&self) -> u16 {
        self.ret.as_ref().map_or(0, FieldType::slots)
    }

    pub fn return_opcode(&self) -> u8 {
        self.ret.as_ref().map_or(op::RETURN, FieldType::return_opcode)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for param in &self.params {
            write!(f, "{param}")?;
        }
        f.write_str(")")?;
        match &self.ret {
            Some(ret) => write!(f, "{ret}"),
            None => f.write_str("V"),
        }
    }
}

fn parse_field(input: &str) -> Option<(FieldType, &str)> {
    let first = input.chars().next()?;
    let rest = &input[first.len_utf8()..];
    let ty = match first {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            return Some((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]));
        }
        '[' => {
            let (component, tail) = parse_field(rest)?;
            return Some((FieldType::Array(Box::new(component)), tail));
        }
        _ => return None,
    };
    Some((ty, rest))
}

fn invalid(descriptor: &str) -> ClassFormatError {
    ClassFormatError::InvalidDescriptor {
        descriptor: descriptor.to_string(),
    }
}

/// Replaces every `L<from>;` occurrence in a descriptor or signature.
pub fn rename_class_in_descriptor(descriptor: &str, from: &str, to: &str) -> Option<String> {
    let needle = format!("L{from};");
    descriptor
        .contains(&needle)
        .then(|| descriptor.replace(&needle, &format!("L{to};")))
}
