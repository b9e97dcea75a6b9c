//! Method bodies as instruction lists with symbolic labels.
//!
//! Every byte offset that something refers to (branch and switch targets,
//! exception ranges, line numbers, local variable ranges, stack map frames)
//! becomes a [`Label`] on decode and is resolved back to an offset only when
//! the body is encoded. Instructions can therefore be replaced by ones of a
//! different length without any manual renumbering.

use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

use crate::classfile::Attribute;
use crate::constant_pool::ConstantPool;
use crate::error::ClassFormatError;
use crate::reader::{Cursor, read_attributes};
use crate::stackmap::{self, Frame};
use crate::writer::PutBytes;

/// Opcode values.
pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_3: u8 = 0x06;
    pub const ICONST_5: u8 = 0x08;
    pub const LCONST_0: u8 = 0x09;
    pub const DCONST_1: u8 = 0x0f;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ALOAD_0: u8 = 0x2a;
    pub const IALOAD: u8 = 0x2e;
    pub const AALOAD: u8 = 0x32;
    pub const BALOAD: u8 = 0x33;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3a;
    pub const ISTORE_0: u8 = 0x3b;
    pub const AASTORE: u8 = 0x53;
    pub const BASTORE: u8 = 0x54;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5a;
    pub const DUP2: u8 = 0x5c;
    pub const SWAP: u8 = 0x5f;
    pub const IADD: u8 = 0x60;
    pub const LADD: u8 = 0x61;
    pub const ISUB: u8 = 0x64;
    pub const IMUL: u8 = 0x68;
    pub const IXOR: u8 = 0x82;
    pub const IINC: u8 = 0x84;
    pub const I2L: u8 = 0x85;
    pub const LCMP: u8 = 0x94;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9a;
    pub const IFLT: u8 = 0x9b;
    pub const IFGE: u8 = 0x9c;
    pub const IFGT: u8 = 0x9d;
    pub const IFLE: u8 = 0x9e;
    pub const IF_ICMPEQ: u8 = 0x9f;
    pub const IF_ICMPNE: u8 = 0xa0;
    pub const IF_ICMPLT: u8 = 0xa1;
    pub const IF_ICMPGE: u8 = 0xa2;
    pub const IF_ICMPGT: u8 = 0xa3;
    pub const IF_ICMPLE: u8 = 0xa4;
    pub const IF_ACMPEQ: u8 = 0xa5;
    pub const IF_ACMPNE: u8 = 0xa6;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const NEWARRAY: u8 = 0xbc;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
    pub const CHECKCAST: u8 = 0xc0;
    pub const INSTANCEOF: u8 = 0xc1;
    pub const MONITORENTER: u8 = 0xc2;
    pub const MONITOREXIT: u8 = 0xc3;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;

    /// `newarray` operand for `byte[]`.
    pub const T_BYTE: u8 = 8;
    /// `newarray` operand for `char[]`.
    pub const T_CHAR: u8 = 5;
}

/// A symbolic code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Marks a position; encodes to nothing.
    Label(Label),
    /// Any instruction without operands.
    Simple(u8),
    /// `bipush` / `sipush`.
    Push { opcode: u8, value: i16 },
    /// `ldc` / `ldc_w`.
    Ldc { index: u16, wide: bool },
    Ldc2 { index: u16 },
    /// Loads, stores and `ret`. `wide` keeps an explicit `wide` prefix.
    Local { opcode: u8, index: u16, wide: bool },
    Iinc { index: u16, delta: i16, wide: bool },
    /// Field access and non-interface invokes.
    Member { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    /// `new`, `anewarray`, `checkcast`, `instanceof`.
    Type { opcode: u8, index: u16 },
    NewArray { atype: u8 },
    MultiNewArray { index: u16, dimensions: u8 },
    Jump { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

impl Insn {
    /// Whether control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        match self {
            Insn::Simple(opcode) => matches!(
                *opcode,
                op::IRETURN..=op::RETURN | op::ATHROW
            ),
            Insn::Jump { opcode, .. } => matches!(*opcode, op::GOTO | op::GOTO_W),
            Insn::Local { opcode, .. } => *opcode == op::RET,
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => true,
            _ => false,
        }
    }

    /// Explicit branch targets.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, l)| *l))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Class constant index, 0 for `finally`.
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start: Label,
    pub line: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: Label,
    pub end: Label,
    pub name_index: u16,
    /// Descriptor for `LocalVariableTable`, signature for `LocalVariableTypeTable`.
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttr {
    LineNumbers {
        name_index: u16,
        entries: Vec<LineNumber>,
    },
    LocalVariables {
        name_index: u16,
        entries: Vec<LocalVariable>,
    },
    StackMap {
        name_index: u16,
        frames: Vec<Frame>,
    },
    Other(Attribute),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("conditional branch at offset {offset} cannot reach its target")]
    BranchOutOfRange { offset: u32 },
    #[error("method code is {len} bytes, above the 65535 byte limit")]
    CodeTooLarge { len: usize },
    #[error("label {0:?} is never placed")]
    UnresolvedLabel(Label),
    #[error("stack map frames out of order at offset {offset}")]
    FrameOrder { offset: u32 },
}

/// A decoded `Code` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: Vec<Insn>,
    pub handlers: Vec<ExceptionHandler>,
    pub attributes: Vec<CodeAttr>,
    next_label: u32,
}

/// Attributes whose contents hold raw code offsets we do not rewrite.
const OFFSET_BOUND_ATTRIBUTES: [&str; 2] = [
    "RuntimeVisibleTypeAnnotations",
    "RuntimeInvisibleTypeAnnotations",
];

impl CodeBody {
    pub fn new(max_stack: u16, max_locals: u16) -> Self {
        Self {
            max_stack,
            max_locals,
            insns: Vec::new(),
            handlers: Vec::new(),
            attributes: Vec::new(),
            next_label: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn stack_map(&self) -> Option<&[Frame]> {
        self.attributes.iter().find_map(|attr| match attr {
            CodeAttr::StackMap { frames, .. } => Some(frames.as_slice()),
            _ => None,
        })
    }

    /// Decodes the info bytes of a `Code` attribute.
    ///
    /// Type annotation attributes are dropped because their offsets are not
    /// tracked.
    pub fn decode(info: &[u8], pool: &ConstantPool) -> Result<Self, ClassFormatError> {
        let mut cur = Cursor::new(info);
        let max_stack = cur.u16()?;
        let max_locals = cur.u16()?;
        let code_len = cur.u32()?;
        let code = cur.bytes(code_len as usize)?;
        let decoded = decode_instructions(code)?;

        let boundaries: HashSet<u32> = decoded
            .iter()
            .map(|(offset, _)| *offset)
            .chain(std::iter::once(code_len))
            .collect();
        let mut referenced = BTreeSet::new();
        let mut reference = |offset: u32| -> Result<Label, ClassFormatError> {
            if !boundaries.contains(&offset) {
                return Err(ClassFormatError::InvalidCodeOffset { offset });
            }
            referenced.insert(offset);
            Ok(Label(offset))
        };

        for (_, insn) in &decoded {
            for target in insn.targets() {
                reference(target.0)?;
            }
        }

        let handler_count = cur.u16()?;
        let mut handlers = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            let start = reference(cur.u16()? as u32)?;
            let end = reference(cur.u16()? as u32)?;
            let handler = reference(cur.u16()? as u32)?;
            let catch_type = cur.u16()?;
            handlers.push(ExceptionHandler {
                start,
                end,
                handler,
                catch_type,
            });
        }

        let mut attributes = Vec::new();
        for attr in read_attributes(&mut cur, pool)? {
            let name = pool.utf8(attr.name_index)?;
            match name.as_ref() {
                "LineNumberTable" => {
                    let mut c = Cursor::new(&attr.info);
                    let n = c.u16()?;
                    let mut entries = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        let start = reference(c.u16()? as u32)?;
                        entries.push(LineNumber {
                            start,
                            line: c.u16()?,
                        });
                    }
                    attributes.push(CodeAttr::LineNumbers {
                        name_index: attr.name_index,
                        entries,
                    });
                }
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    let mut c = Cursor::new(&attr.info);
                    let n = c.u16()?;
                    let mut entries = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        let start_pc = c.u16()? as u32;
                        let length = c.u16()? as u32;
                        entries.push(LocalVariable {
                            start: reference(start_pc)?,
                            end: reference(start_pc + length)?,
                            name_index: c.u16()?,
                            descriptor_index: c.u16()?,
                            index: c.u16()?,
                        });
                    }
                    attributes.push(CodeAttr::LocalVariables {
                        name_index: attr.name_index,
                        entries,
                    });
                }
                "StackMapTable" => {
                    let frames = stackmap::decode(&attr.info)?;
                    for frame in &frames {
                        reference(frame.at.0)?;
                        for label in frame.referenced_labels() {
                            reference(label.0)?;
                        }
                    }
                    attributes.push(CodeAttr::StackMap {
                        name_index: attr.name_index,
                        frames,
                    });
                }
                other if OFFSET_BOUND_ATTRIBUTES.contains(&other) => {
                    tracing::debug!(attribute = other, "dropping offset-bound code attribute");
                }
                _ => attributes.push(CodeAttr::Other(attr)),
            }
        }

        if cur.remaining() > 0 {
            return Err(ClassFormatError::attribute("Code", "trailing bytes"));
        }

        let mut insns = Vec::with_capacity(decoded.len() + referenced.len());
        for (offset, insn) in decoded {
            if referenced.contains(&offset) {
                insns.push(Insn::Label(Label(offset)));
            }
            insns.push(insn);
        }
        if referenced.contains(&code_len) {
            insns.push(Insn::Label(Label(code_len)));
        }

        Ok(Self {
            max_stack,
            max_locals,
            insns,
            handlers,
            attributes,
            next_label: code_len + 1,
        })
    }

    /// Byte offset of each entry in `insns` under the layout the body was
    /// decoded with. Only meaningful before any instruction is replaced.
    pub fn original_offsets(&self) -> Vec<u32> {
        let mut pos = 0;
        self.insns
            .iter()
            .map(|insn| {
                let offset = pos;
                pos += insn_size(insn, pos, false);
                offset
            })
            .collect()
    }

    /// Encodes back into `Code` attribute info bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let (code, positions) = assemble(&self.insns)?;
        let resolve = |label: Label| positions.get(&label).copied().ok_or(EncodeError::UnresolvedLabel(label));

        let mut out = Vec::with_capacity(code.len() + 64);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(code.len() as u32);
        out.extend_from_slice(&code);

        out.put_u16(self.handlers.len() as u16);
        for handler in &self.handlers {
            out.put_u16(resolve(handler.start)? as u16);
            out.put_u16(resolve(handler.end)? as u16);
            out.put_u16(resolve(handler.handler)? as u16);
            out.put_u16(handler.catch_type);
        }

        out.put_u16(self.attributes.len() as u16);
        for attr in &self.attributes {
            let (name_index, info) = match attr {
                CodeAttr::LineNumbers {
                    name_index,
                    entries,
                } => {
                    let mut info = Vec::with_capacity(2 + entries.len() * 4);
                    info.put_u16(entries.len() as u16);
                    for entry in entries {
                        info.put_u16(resolve(entry.start)? as u16);
                        info.put_u16(entry.line);
                    }
                    (*name_index, info)
                }
                CodeAttr::LocalVariables {
                    name_index,
                    entries,
                } => {
                    let mut info = Vec::with_capacity(2 + entries.len() * 10);
                    info.put_u16(entries.len() as u16);
                    for entry in entries {
                        let start = resolve(entry.start)?;
                        let end = resolve(entry.end)?;
                        info.put_u16(start as u16);
                        info.put_u16(end.saturating_sub(start) as u16);
                        info.put_u16(entry.name_index);
                        info.put_u16(entry.descriptor_index);
                        info.put_u16(entry.index);
                    }
                    (*name_index, info)
                }
                CodeAttr::StackMap { name_index, frames } => {
                    (*name_index, stackmap::encode(frames, &positions)?)
                }
                CodeAttr::Other(attr) => (attr.name_index, attr.info.clone()),
            };
            out.put_u16(name_index);
            out.put_u32(info.len() as u32);
            out.extend_from_slice(&info);
        }
        Ok(out)
    }
}

/// Reads just the instructions of a `Code` attribute, paired with their
/// byte offsets. Used by detectors that never edit.
pub fn scan(info: &[u8]) -> Result<Vec<(u32, Insn)>, ClassFormatError> {
    let mut cur = Cursor::new(info);
    cur.skip(4)?;
    let code_len = cur.u32()?;
    decode_instructions(cur.bytes(code_len as usize)?)
}

fn decode_instructions(code: &[u8]) -> Result<Vec<(u32, Insn)>, ClassFormatError> {
    let mut cur = Cursor::new(code);
    let mut out = Vec::new();

    while cur.remaining() > 0 {
        let offset = cur.position() as u32;
        let opcode = cur.u8()?;
        let branch = |delta: i64| -> Result<Label, ClassFormatError> {
            u32::try_from(offset as i64 + delta)
                .map(Label)
                .map_err(|_| ClassFormatError::InvalidCodeOffset { offset })
        };
        let insn = match opcode {
            0x00..=0x0f
            | 0x1a..=0x35
            | 0x3b..=0x83
            | 0x85..=0x98
            | 0xac..=0xb1
            | 0xbe
            | 0xbf
            | 0xc2
            | 0xc3 => Insn::Simple(opcode),
            op::BIPUSH => Insn::Push {
                opcode,
                value: cur.i8()? as i16,
            },
            op::SIPUSH => Insn::Push {
                opcode,
                value: cur.i16()?,
            },
            op::LDC => Insn::Ldc {
                index: cur.u8()? as u16,
                wide: false,
            },
            op::LDC_W => Insn::Ldc {
                index: cur.u16()?,
                wide: true,
            },
            op::LDC2_W => Insn::Ldc2 { index: cur.u16()? },
            op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => Insn::Local {
                opcode,
                index: cur.u8()? as u16,
                wide: false,
            },
            op::IINC => Insn::Iinc {
                index: cur.u8()? as u16,
                delta: cur.i8()? as i16,
                wide: false,
            },
            op::IFEQ..=op::JSR | op::IFNULL | op::IFNONNULL => Insn::Jump {
                opcode,
                target: branch(cur.i16()? as i64)?,
            },
            op::GOTO_W | op::JSR_W => Insn::Jump {
                opcode,
                target: branch(cur.i32()? as i64)?,
            },
            op::TABLESWITCH => {
                cur.skip(padding(offset))?;
                let default = branch(cur.i32()? as i64)?;
                let low = cur.i32()?;
                let high = cur.i32()?;
                if high < low {
                    return Err(ClassFormatError::InvalidCodeOffset { offset });
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count * 4 > cur.remaining() {
                    return Err(ClassFormatError::Truncated {
                        offset: cur.position(),
                        needed: count * 4 - cur.remaining(),
                    });
                }
                let targets = (0..count)
                    .map(|_| branch(cur.i32()? as i64))
                    .collect::<Result<Vec<_>, _>>()?;
                Insn::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                }
            }
            op::LOOKUPSWITCH => {
                cur.skip(padding(offset))?;
                let default = branch(cur.i32()? as i64)?;
                let npairs = cur.i32()?;
                let npairs = usize::try_from(npairs)
                    .map_err(|_| ClassFormatError::InvalidCodeOffset { offset })?;
                if npairs.saturating_mul(8) > cur.remaining() {
                    return Err(ClassFormatError::Truncated {
                        offset: cur.position(),
                        needed: npairs.saturating_mul(8) - cur.remaining(),
                    });
                }
                let pairs = (0..npairs)
                    .map(|_| Ok((cur.i32()?, branch(cur.i32()? as i64)?)))
                    .collect::<Result<Vec<_>, ClassFormatError>>()?;
                Insn::LookupSwitch { default, pairs }
            }
            op::GETSTATIC..=op::INVOKESTATIC => Insn::Member {
                opcode,
                index: cur.u16()?,
            },
            op::INVOKEINTERFACE => {
                let index = cur.u16()?;
                let count = cur.u8()?;
                cur.skip(1)?;
                Insn::InvokeInterface { index, count }
            }
            op::INVOKEDYNAMIC => {
                let index = cur.u16()?;
                cur.skip(2)?;
                Insn::InvokeDynamic { index }
            }
            op::NEW | op::ANEWARRAY | op::CHECKCAST | op::INSTANCEOF => Insn::Type {
                opcode,
                index: cur.u16()?,
            },
            op::NEWARRAY => Insn::NewArray { atype: cur.u8()? },
            op::MULTIANEWARRAY => Insn::MultiNewArray {
                index: cur.u16()?,
                dimensions: cur.u8()?,
            },
            op::WIDE => {
                let inner = cur.u8()?;
                match inner {
                    op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => Insn::Local {
                        opcode: inner,
                        index: cur.u16()?,
                        wide: true,
                    },
                    op::IINC => Insn::Iinc {
                        index: cur.u16()?,
                        delta: cur.i16()?,
                        wide: true,
                    },
                    _ => {
                        return Err(ClassFormatError::UnknownOpcode {
                            offset: offset + 1,
                            opcode: inner,
                        });
                    }
                }
            }
            _ => return Err(ClassFormatError::UnknownOpcode { offset, opcode }),
        };
        out.push((offset, insn));
    }
    Ok(out)
}

/// Bytes of alignment after a switch opcode at `offset`.
fn padding(offset: u32) -> usize {
    ((4 - (offset + 1) % 4) % 4) as usize
}

fn insn_size(insn: &Insn, offset: u32, widened: bool) -> u32 {
    match insn {
        Insn::Label(_) => 0,
        Insn::Simple(_) => 1,
        Insn::Push { opcode, .. } => {
            if *opcode == op::BIPUSH {
                2
            } else {
                3
            }
        }
        Insn::Ldc { index, wide } => {
            if *wide || *index > 0xff {
                3
            } else {
                2
            }
        }
        Insn::Ldc2 { .. } => 3,
        Insn::Local { index, wide, .. } => {
            if *wide || *index > 0xff {
                4
            } else {
                2
            }
        }
        Insn::Iinc { index, delta, wide } => {
            if iinc_is_wide(*index, *delta, *wide) {
                6
            } else {
                3
            }
        }
        Insn::Member { .. } | Insn::Type { .. } => 3,
        Insn::InvokeInterface { .. } | Insn::InvokeDynamic { .. } => 5,
        Insn::NewArray { .. } => 2,
        Insn::MultiNewArray { .. } => 4,
        Insn::Jump { opcode, .. } => {
            if widened || matches!(*opcode, op::GOTO_W | op::JSR_W) {
                5
            } else {
                3
            }
        }
        Insn::TableSwitch { targets, .. } => 1 + padding(offset) as u32 + 12 + 4 * targets.len() as u32,
        Insn::LookupSwitch { pairs, .. } => 1 + padding(offset) as u32 + 8 + 8 * pairs.len() as u32,
    }
}

fn iinc_is_wide(index: u16, delta: i16, wide: bool) -> bool {
    wide || index > 0xff || i8::try_from(delta).is_err()
}

/// Lays out the instructions, widening `goto`/`jsr` until every branch fits.
fn assemble(insns: &[Insn]) -> Result<(Vec<u8>, HashMap<Label, u32>), EncodeError> {
    let mut widened: HashSet<usize> = HashSet::new();

    let (offsets, positions, len) = loop {
        let mut offsets = Vec::with_capacity(insns.len());
        let mut positions = HashMap::new();
        let mut pos: u32 = 0;
        for (i, insn) in insns.iter().enumerate() {
            offsets.push(pos);
            if let Insn::Label(label) = insn {
                positions.insert(*label, pos);
            }
            pos += insn_size(insn, pos, widened.contains(&i));
        }
        if pos > u16::MAX as u32 {
            return Err(EncodeError::CodeTooLarge { len: pos as usize });
        }

        let mut changed = false;
        for (i, insn) in insns.iter().enumerate() {
            let Insn::Jump { opcode, target } = insn else {
                continue;
            };
            if widened.contains(&i) || matches!(*opcode, op::GOTO_W | op::JSR_W) {
                continue;
            }
            let target = *positions
                .get(target)
                .ok_or(EncodeError::UnresolvedLabel(*target))?;
            let delta = target as i64 - offsets[i] as i64;
            if i16::try_from(delta).is_err() {
                if matches!(*opcode, op::GOTO | op::JSR) {
                    widened.insert(i);
                    changed = true;
                } else {
                    return Err(EncodeError::BranchOutOfRange { offset: offsets[i] });
                }
            }
        }
        if !changed {
            break (offsets, positions, pos);
        }
    };

    let resolve = |label: &Label| positions.get(label).copied().ok_or(EncodeError::UnresolvedLabel(*label));
    let mut code = Vec::with_capacity(len as usize);
    for (i, insn) in insns.iter().enumerate() {
        let offset = offsets[i];
        let rel = |label: &Label| -> Result<i32, EncodeError> { Ok(resolve(label)? as i32 - offset as i32) };
        match insn {
            Insn::Label(_) => {}
            Insn::Simple(opcode) => code.put_u8(*opcode),
            Insn::Push { opcode, value } => {
                code.put_u8(*opcode);
                if *opcode == op::BIPUSH {
                    code.put_u8(*value as i8 as u8);
                } else {
                    code.put_u16(*value as u16);
                }
            }
            Insn::Ldc { index, wide } => {
                if *wide || *index > 0xff {
                    code.put_u8(op::LDC_W);
                    code.put_u16(*index);
                } else {
                    code.put_u8(op::LDC);
                    code.put_u8(*index as u8);
                }
            }
            Insn::Ldc2 { index } => {
                code.put_u8(op::LDC2_W);
                code.put_u16(*index);
            }
            Insn::Local {
                opcode,
                index,
                wide,
            } => {
                if *wide || *index > 0xff {
                    code.put_u8(op::WIDE);
                    code.put_u8(*opcode);
                    code.put_u16(*index);
                } else {
                    code.put_u8(*opcode);
                    code.put_u8(*index as u8);
                }
            }
            Insn::Iinc { index, delta, wide } => {
                if iinc_is_wide(*index, *delta, *wide) {
                    code.put_u8(op::WIDE);
                    code.put_u8(op::IINC);
                    code.put_u16(*index);
                    code.put_u16(*delta as u16);
                } else {
                    code.put_u8(op::IINC);
                    code.put_u8(*index as u8);
                    code.put_u8(*delta as i8 as u8);
                }
            }
            Insn::Member { opcode, index } | Insn::Type { opcode, index } => {
                code.put_u8(*opcode);
                code.put_u16(*index);
            }
            Insn::InvokeInterface { index, count } => {
                code.put_u8(op::INVOKEINTERFACE);
                code.put_u16(*index);
                code.put_u8(*count);
                code.put_u8(0);
            }
            Insn::InvokeDynamic { index } => {
                code.put_u8(op::INVOKEDYNAMIC);
                code.put_u16(*index);
                code.put_u16(0);
            }
            Insn::NewArray { atype } => {
                code.put_u8(op::NEWARRAY);
                code.put_u8(*atype);
            }
            Insn::MultiNewArray { index, dimensions } => {
                code.put_u8(op::MULTIANEWARRAY);
                code.put_u16(*index);
                code.put_u8(*dimensions);
            }
            Insn::Jump { opcode, target } => {
                let delta = rel(target)?;
                let long_form = match *opcode {
                    op::GOTO_W | op::JSR_W => Some(*opcode),
                    op::GOTO if widened.contains(&i) => Some(op::GOTO_W),
                    op::JSR if widened.contains(&i) => Some(op::JSR_W),
                    _ => None,
                };
                match long_form {
                    Some(opcode) => {
                        code.put_u8(opcode);
                        code.put_u32(delta as u32);
                    }
                    None => {
                        code.put_u8(*opcode);
                        code.put_u16(delta as i16 as u16);
                    }
                }
            }
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                code.put_u8(op::TABLESWITCH);
                code.extend(std::iter::repeat_n(0, padding(offset)));
                code.put_u32(rel(default)? as u32);
                code.put_u32(*low as u32);
                code.put_u32(*high as u32);
                for target in targets {
                    code.put_u32(rel(target)? as u32);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                code.put_u8(op::LOOKUPSWITCH);
                code.extend(std::iter::repeat_n(0, padding(offset)));
                code.put_u32(rel(default)? as u32);
                code.put_u32(pairs.len() as u32);
                for (key, target) in pairs {
                    code.put_u32(*key as u32);
                    code.put_u32(rel(target)? as u32);
                }
            }
        }
    }
    Ok((code, positions))
}
