//! StackMapTable frames with symbolic positions.
//!
//! Frames keep the compressed shape they were read with; only the offset
//! delta is recomputed on encode, switching between the short and the
//! extended form of a frame type as the delta requires.

use std::collections::HashMap;

use crate::code::{EncodeError, Label};
use crate::error::ClassFormatError;
use crate::reader::Cursor;
use crate::writer::PutBytes;

const NAME: &str = "StackMapTable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Class constant index.
    Object(u16),
    /// Position of the `new` instruction that created the value.
    Uninitialized(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1Stack(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub at: Label,
    pub kind: FrameKind,
}

impl Frame {
    pub fn new(at: Label, kind: FrameKind) -> Self {
        Self { at, kind }
    }

    /// Labels this frame refers to besides its own position.
    pub(crate) fn referenced_labels(&self) -> Vec<Label> {
        let types: Vec<&VerificationType> = match &self.kind {
            FrameKind::Same | FrameKind::Chop(_) => Vec::new(),
            FrameKind::SameLocals1Stack(ty) => vec![ty],
            FrameKind::Append(locals) => locals.iter().collect(),
            FrameKind::Full { locals, stack } => locals.iter().chain(stack).collect(),
        };
        types
            .into_iter()
            .filter_map(|ty| match ty {
                VerificationType::Uninitialized(label) => Some(*label),
                _ => None,
            })
            .collect()
    }
}

pub fn decode(info: &[u8]) -> Result<Vec<Frame>, ClassFormatError> {
    let mut cur = Cursor::new(info);
    let count = cur.u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = cur.u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u16, FrameKind::Same),
            64..=127 => (
                (frame_type - 64) as u16,
                FrameKind::SameLocals1Stack(read_type(&mut cur)?),
            ),
            128..=246 => {
                return Err(ClassFormatError::attribute(
                    NAME,
                    format!("reserved frame type {frame_type}"),
                ));
            }
            247 => {
                let delta = cur.u16()?;
                (delta, FrameKind::SameLocals1Stack(read_type(&mut cur)?))
            }
            248..=250 => (cur.u16()?, FrameKind::Chop(251 - frame_type)),
            251 => (cur.u16()?, FrameKind::Same),
            252..=254 => {
                let delta = cur.u16()?;
                let locals = (0..frame_type - 251)
                    .map(|_| read_type(&mut cur))
                    .collect::<Result<Vec<_>, _>>()?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = cur.u16()?;
                let locals_count = cur.u16()?;
                let locals = (0..locals_count)
                    .map(|_| read_type(&mut cur))
                    .collect::<Result<Vec<_>, _>>()?;
                let stack_count = cur.u16()?;
                let stack = (0..stack_count)
                    .map(|_| read_type(&mut cur))
                    .collect::<Result<Vec<_>, _>>()?;
                (delta, FrameKind::Full { locals, stack })
            }
        };
        let offset = match previous {
            None => delta as u32,
            Some(prev) => prev + delta as u32 + 1,
        };
        previous = Some(offset);
        frames.push(Frame::new(Label(offset), kind));
    }

    if cur.remaining() > 0 {
        return Err(ClassFormatError::attribute(NAME, "trailing bytes"));
    }
    Ok(frames)
}

fn read_type(cur: &mut Cursor<'_>) -> Result<VerificationType, ClassFormatError> {
    Ok(match cur.u8()? {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(cur.u16()?),
        8 => VerificationType::Uninitialized(Label(cur.u16()? as u32)),
        other => {
            return Err(ClassFormatError::attribute(
                NAME,
                format!("unknown verification type tag {other}"),
            ));
        }
    })
}

pub fn encode(frames: &[Frame], positions: &HashMap<Label, u32>) -> Result<Vec<u8>, EncodeError> {
    let resolve = |label: Label| positions.get(&label).copied().ok_or(EncodeError::UnresolvedLabel(label));

    let mut out = Vec::new();
    out.put_u16(frames.len() as u16);
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = resolve(frame.at)?;
        let delta = match previous {
            None => offset,
            Some(prev) if offset > prev => offset - prev - 1,
            Some(_) => return Err(EncodeError::FrameOrder { offset }),
        };
        previous = Some(offset);
        let delta = u16::try_from(delta).map_err(|_| EncodeError::CodeTooLarge { len: offset as usize })?;

        match &frame.kind {
            FrameKind::Same if delta <= 63 => out.put_u8(delta as u8),
            FrameKind::Same => {
                out.put_u8(251);
                out.put_u16(delta);
            }
            FrameKind::SameLocals1Stack(ty) => {
                if delta <= 63 {
                    out.put_u8(64 + delta as u8);
                } else {
                    out.put_u8(247);
                    out.put_u16(delta);
                }
                write_type(&mut out, ty, &resolve)?;
            }
            FrameKind::Chop(k) => {
                out.put_u8(251 - k);
                out.put_u16(delta);
            }
            FrameKind::Append(locals) => {
                out.put_u8(251 + locals.len() as u8);
                out.put_u16(delta);
                for ty in locals {
                    write_type(&mut out, ty, &resolve)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                out.put_u8(255);
                out.put_u16(delta);
                out.put_u16(locals.len() as u16);
                for ty in locals {
                    write_type(&mut out, ty, &resolve)?;
                }
                out.put_u16(stack.len() as u16);
                for ty in stack {
                    write_type(&mut out, ty, &resolve)?;
                }
            }
        }
    }
    Ok(out)
}

fn write_type(
    out: &mut Vec<u8>,
    ty: &VerificationType,
    resolve: &impl Fn(Label) -> Result<u32, EncodeError>,
) -> Result<(), EncodeError> {
    match ty {
        VerificationType::Top => out.put_u8(0),
        VerificationType::Integer => out.put_u8(1),
        VerificationType::Float => out.put_u8(2),
        VerificationType::Double => out.put_u8(3),
        VerificationType::Long => out.put_u8(4),
        VerificationType::Null => out.put_u8(5),
        VerificationType::UninitializedThis => out.put_u8(6),
        VerificationType::Object(index) => {
            out.put_u8(7);
            out.put_u16(*index);
        }
        VerificationType::Uninitialized(label) => {
            out.put_u8(8);
            out.put_u16(resolve(*label)? as u16);
        }
    }
    Ok(())
}
