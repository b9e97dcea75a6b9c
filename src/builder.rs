//! Emitting new method bodies.
//!
//! [`CodeBuilder`] interns constants as it goes and computes `max_stack`
//! with an abstract stack-depth walk when the body is finished. Callers
//! place stack map frames explicitly at every branch target.

use std::collections::HashMap;

use crate::classfile::{Attribute, ClassFile, MethodInfo};
use crate::code::{CodeAttr, CodeBody, ExceptionHandler, Insn, Label, op};
use crate::constant_pool::{ConstantPool, PoolOverflow};
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::error::{ClassFormatError, DowngradeError};
use crate::stackmap::{Frame, FrameKind, VerificationType};

pub struct CodeBuilder<'a> {
    pool: &'a mut ConstantPool,
    body: CodeBody,
    frames: Vec<Frame>,
}

impl<'a> CodeBuilder<'a> {
    /// Starts a body whose arguments (and receiver) occupy `arg_slots`.
    pub fn new(pool: &'a mut ConstantPool, arg_slots: u16) -> Self {
        Self {
            pool,
            body: CodeBody::new(0, arg_slots),
            frames: Vec::new(),
        }
    }

    pub fn pool(&mut self) -> &mut ConstantPool {
        self.pool
    }

    /// Reserves a fresh local variable slot (two for long/double).
    pub fn new_local(&mut self, ty: &FieldType) -> u16 {
        let index = self.body.max_locals;
        self.body.max_locals += ty.slots();
        index
    }

    pub fn new_label(&mut self) -> Label {
        self.body.new_label()
    }

    pub fn place(&mut self, label: Label) -> &mut Self {
        self.body.insns.push(Insn::Label(label));
        self
    }

    /// Places `label` and records the frame the verifier should assume there.
    pub fn place_frame(&mut self, label: Label, kind: FrameKind) -> &mut Self {
        self.place(label);
        self.frames.push(Frame::new(label, kind));
        self
    }

    pub fn insn(&mut self, insn: Insn) -> &mut Self {
        self.body.insns.push(insn);
        self
    }

    pub fn simple(&mut self, opcode: u8) -> &mut Self {
        self.insn(Insn::Simple(opcode))
    }

    pub fn jump(&mut self, opcode: u8, target: Label) -> &mut Self {
        self.insn(Insn::Jump { opcode, target })
    }

    pub fn iconst(&mut self, value: i32) -> Result<&mut Self, PoolOverflow> {
        let insn = match value {
            -1..=5 => Insn::Simple((op::ICONST_0 as i32 + value) as u8),
            v if i8::try_from(v).is_ok() => Insn::Push {
                opcode: op::BIPUSH,
                value: v as i16,
            },
            v if i16::try_from(v).is_ok() => Insn::Push {
                opcode: op::SIPUSH,
                value: v as i16,
            },
            v => Insn::Ldc {
                index: self.pool.integer_index(v)?,
                wide: false,
            },
        };
        Ok(self.insn(insn))
    }

    pub fn ldc_string(&mut self, value: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.string_index(value)?;
        Ok(self.insn(Insn::Ldc { index, wide: false }))
    }

    /// Loads a Java string given as UTF-16 code units.
    pub fn ldc_units(&mut self, units: &[u16]) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.string_index_units(units)?;
        Ok(self.insn(Insn::Ldc { index, wide: false }))
    }

    pub fn ldc_class(&mut self, name: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.class_index(name)?;
        Ok(self.insn(Insn::Ldc { index, wide: false }))
    }

    pub fn load(&mut self, ty: &FieldType, index: u16) -> &mut Self {
        self.local(ty.load_opcode(), op::ILOAD, op::ILOAD_0, index)
    }

    pub fn store(&mut self, ty: &FieldType, index: u16) -> &mut Self {
        self.local(ty.store_opcode(), op::ISTORE, op::ISTORE_0, index)
    }

    pub fn aload(&mut self, index: u16) -> &mut Self {
        self.local(op::ALOAD, op::ILOAD, op::ILOAD_0, index)
    }

    pub fn iload(&mut self, index: u16) -> &mut Self {
        self.local(op::ILOAD, op::ILOAD, op::ILOAD_0, index)
    }

    fn local(&mut self, opcode: u8, family: u8, compact_base: u8, index: u16) -> &mut Self {
        if index <= 3 {
            self.simple(compact_base + 4 * (opcode - family) + index as u8)
        } else {
            self.insn(Insn::Local {
                opcode,
                index,
                wide: false,
            })
        }
    }

    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        self.insn(Insn::Iinc {
            index,
            delta,
            wide: false,
        })
    }

    pub fn field(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.field_ref_index(owner, name, descriptor)?;
        Ok(self.insn(Insn::Member { opcode, index }))
    }

    pub fn invoke_static(&mut self, owner: &str, name: &str, descriptor: &str, interface: bool) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.method_ref_index(owner, name, descriptor, interface)?;
        Ok(self.insn(Insn::Member {
            opcode: op::INVOKESTATIC,
            index,
        }))
    }

    pub fn invoke_virtual(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.method_ref_index(owner, name, descriptor, false)?;
        Ok(self.insn(Insn::Member {
            opcode: op::INVOKEVIRTUAL,
            index,
        }))
    }

    pub fn invoke_special(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.method_ref_index(owner, name, descriptor, false)?;
        Ok(self.insn(Insn::Member {
            opcode: op::INVOKESPECIAL,
            index,
        }))
    }

    pub fn invoke_interface(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.method_ref_index(owner, name, descriptor, true)?;
        let count = 1 + MethodDescriptor::parse(descriptor)
            .map(|d| d.param_slots())
            .unwrap_or(0) as u8;
        Ok(self.insn(Insn::InvokeInterface { index, count }))
    }

    pub fn type_insn(&mut self, opcode: u8, class: &str) -> Result<&mut Self, PoolOverflow> {
        let index = self.pool.class_index(class)?;
        Ok(self.insn(Insn::Type { opcode, index }))
    }

    pub fn handler(&mut self, start: Label, end: Label, handler: Label, catch_type: Option<&str>) -> Result<&mut Self, PoolOverflow> {
        let catch_type = match catch_type {
            Some(name) => self.pool.class_index(name)?,
            None => 0,
        };
        self.body.handlers.push(ExceptionHandler {
            start,
            end,
            handler,
            catch_type,
        });
        Ok(self)
    }

    /// Verification type for a value of `ty` on the stack or in a local.
    pub fn verification_type(&mut self, ty: &FieldType) -> Result<VerificationType, PoolOverflow> {
        Ok(match ty {
            FieldType::Float => VerificationType::Float,
            FieldType::Long => VerificationType::Long,
            FieldType::Double => VerificationType::Double,
            FieldType::Object(_) | FieldType::Array(_) => {
                let name = ty.class_constant_name().unwrap_or_default();
                VerificationType::Object(self.pool.class_index(&name)?)
            }
            _ => VerificationType::Integer,
        })
    }

    pub fn object_type(&mut self, class: &str) -> Result<VerificationType, PoolOverflow> {
        Ok(VerificationType::Object(self.pool.class_index(class)?))
    }

    pub fn finish(mut self) -> Result<CodeBody, DowngradeError> {
        self.body.max_stack = compute_max_stack(&self.body.insns, &self.body.handlers, self.pool)?;
        if !self.frames.is_empty() {
            let name_index = self.pool.utf8_index("StackMapTable")?;
            self.body.attributes.push(CodeAttr::StackMap {
                name_index,
                frames: std::mem::take(&mut self.frames),
            });
        }
        Ok(self.body)
    }
}

/// Appends a method with the given body to `class`.
pub fn add_method(
    class: &mut ClassFile,
    access_flags: u16,
    name: &str,
    descriptor: &str,
    body: &CodeBody,
) -> Result<usize, DowngradeError> {
    let info = body.encode()?;
    let pool = &mut class.constant_pool;
    let name_index = pool.utf8_index(name)?;
    let descriptor_index = pool.utf8_index(descriptor)?;
    let code_index = pool.utf8_index("Code")?;
    class.methods.push(MethodInfo {
        access_flags,
        name_index,
        descriptor_index,
        attributes: vec![Attribute {
            name_index: code_index,
            info,
        }],
    });
    Ok(class.methods.len() - 1)
}

/// Replaces the `Code` attribute of an existing method, keeping its other
/// attributes.
pub fn replace_code(class: &mut ClassFile, method_index: usize, body: &CodeBody) -> Result<(), DowngradeError> {
    let info = body.encode()?;
    let code_name = class.constant_pool.utf8_index("Code")?;
    let method = &mut class.methods[method_index];
    match method.attributes.iter_mut().find(|a| a.name_index == code_name) {
        Some(attr) => attr.info = info,
        None => method.attributes.push(Attribute {
            name_index: code_name,
            info,
        }),
    }
    Ok(())
}

/// Deepest operand stack reached on any path through `insns`.
pub fn compute_max_stack(
    insns: &[Insn],
    handlers: &[ExceptionHandler],
    pool: &ConstantPool,
) -> Result<u16, ClassFormatError> {
    let label_at: HashMap<Label, usize> = insns
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| match insn {
            Insn::Label(label) => Some((*label, i)),
            _ => None,
        })
        .collect();
    let position = |label: &Label| {
        label_at
            .get(label)
            .copied()
            .ok_or(ClassFormatError::InvalidCodeOffset { offset: label.0 })
    };

    let mut visited = vec![false; insns.len()];
    let mut work = vec![(0usize, 0i32)];
    for handler in handlers {
        work.push((position(&handler.handler)?, 1));
    }

    let mut max = 0i32;
    while let Some((mut i, mut depth)) = work.pop() {
        while i < insns.len() && !visited[i] {
            visited[i] = true;
            let insn = &insns[i];
            let after = (depth + stack_delta(insn, pool)?).max(0);
            max = max.max(depth).max(after);
            for target in insn.targets() {
                work.push((position(&target)?, after));
            }
            if insn.is_terminal() {
                break;
            }
            i += 1;
            depth = after;
        }
    }
    Ok(max.clamp(0, u16::MAX as i32) as u16)
}

fn stack_delta(insn: &Insn, pool: &ConstantPool) -> Result<i32, ClassFormatError> {
    let slots = |descriptor: &str| -> Result<i32, ClassFormatError> {
        Ok(FieldType::parse(descriptor)?.slots() as i32)
    };
    let call = |descriptor: &str| -> Result<i32, ClassFormatError> {
        let desc = MethodDescriptor::parse(descriptor)?;
        Ok(desc.return_slots() as i32 - desc.param_slots() as i32)
    };

    Ok(match insn {
        Insn::Label(_) | Insn::Iinc { .. } | Insn::NewArray { .. } => 0,
        Insn::Simple(opcode) => simple_delta(*opcode),
        Insn::Push { .. } | Insn::Ldc { .. } => 1,
        Insn::Ldc2 { .. } => 2,
        Insn::Local { opcode, .. } => match *opcode {
            op::LLOAD | op::DLOAD => 2,
            op::LSTORE | op::DSTORE => -2,
            op::ISTORE | op::FSTORE | op::ASTORE => -1,
            op::RET => 0,
            _ => 1,
        },
        Insn::Member { opcode, index } => {
            let member = pool.member_ref(*index)?;
            match *opcode {
                op::GETSTATIC => slots(&member.descriptor)?,
                op::PUTSTATIC => -slots(&member.descriptor)?,
                op::GETFIELD => slots(&member.descriptor)? - 1,
                op::PUTFIELD => -slots(&member.descriptor)? - 1,
                op::INVOKESTATIC => call(&member.descriptor)?,
                _ => call(&member.descriptor)? - 1,
            }
        }
        Insn::InvokeInterface { index, .. } => call(&pool.member_ref(*index)?.descriptor)? - 1,
        Insn::InvokeDynamic { index } => call(&pool.dynamic(*index)?.descriptor)?,
        Insn::Type { opcode, .. } => i32::from(*opcode == op::NEW),
        Insn::MultiNewArray { dimensions, .. } => 1 - *dimensions as i32,
        Insn::Jump { opcode, .. } => match *opcode {
            op::IF_ICMPEQ..=op::IF_ACMPNE => -2,
            op::GOTO | op::GOTO_W => 0,
            op::JSR | op::JSR_W => 1,
            _ => -1,
        },
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => -1,
    })
}

fn simple_delta(opcode: u8) -> i32 {
    match opcode {
        0x01..=0x08 | 0x0b..=0x0d => 1,
        0x09 | 0x0a | 0x0e | 0x0f => 2,
        0x1a..=0x1d | 0x22..=0x25 | 0x2a..=0x2d => 1,
        0x1e..=0x21 | 0x26..=0x29 => 2,
        0x2f | 0x31 => 0,
        0x2e..=0x35 => -1,
        0x3b..=0x3e | 0x43..=0x46 | 0x4b..=0x4e => -1,
        0x3f..=0x42 | 0x47..=0x4a => -2,
        0x50 | 0x52 => -4,
        0x4f..=0x56 => -3,
        op::POP => -1,
        op::POP2 => -2,
        0x59..=0x5b => 1,
        0x5c..=0x5e => 2,
        0x60..=0x73 | 0x7e..=0x83 => {
            if (opcode & 1) == 0 {
                -1
            } else {
                -2
            }
        }
        0x78..=0x7d => -1,
        0x85 | 0x87 | 0x8c | 0x8d => 1,
        0x88 | 0x89 | 0x8e | 0x90 => -1,
        op::LCMP | 0x97 | 0x98 => -3,
        0x95 | 0x96 => -1,
        op::LRETURN | op::DRETURN => -2,
        op::IRETURN | op::FRETURN | op::ARETURN | op::ATHROW => -1,
        op::MONITORENTER | op::MONITOREXIT => -1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::access;
    use crate::reader::parse;
    use crate::version::JavaVersion;
    use crate::writer::serialize;

    #[test]
    fn max_stack_covers_wide_values_and_calls() {
        let mut pool = ConstantPool::new();
        let mut b = CodeBuilder::new(&mut pool, 2);
        b.load(&FieldType::Long, 0);
        b.simple(op::DUP2);
        b.invoke_static("java/lang/Long", "hashCode", "(J)I", false).unwrap();
        b.simple(op::POP);
        b.simple(op::POP2);
        b.simple(op::RETURN);
        let body = b.finish().unwrap();
        assert_eq!(body.max_stack, 4);
        assert_eq!(body.max_locals, 2);
        assert_eq!(body.insns[0], Insn::Simple(0x1e));
    }

    #[test]
    fn branches_and_frames_are_encoded() {
        let mut class = ClassFile::new(JavaVersion::JAVA_8, access::PUBLIC, "a/B", Some("java/lang/Object")).unwrap();
        let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
        let zero = b.new_label();
        b.iload(0).jump(op::IFEQ, zero);
        b.iconst(1000).unwrap().simple(op::IRETURN);
        b.place_frame(zero, FrameKind::Same);
        b.iconst(-1).unwrap().simple(op::IRETURN);
        let body = b.finish().unwrap();
        assert_eq!(body.max_stack, 1);
        assert_eq!(body.stack_map().map(<[Frame]>::len), Some(1));

        add_method(&mut class, access::PUBLIC | access::STATIC, "f", "(I)I", &body).unwrap();
        let reparsed = parse(&serialize(&class)).unwrap();
        let info = &reparsed.methods[0].attributes[0].info;
        let decoded = CodeBody::decode(info, &reparsed.constant_pool).unwrap();
        assert_eq!(decoded.stack_map().map(<[Frame]>::len), Some(1));
        assert!(decoded.insns.contains(&Insn::Push { opcode: op::SIPUSH, value: 1000 }));
    }
}
