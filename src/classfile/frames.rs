//! `StackMapTable` frames
//!
//! Frames are decoded with absolute offsets so they can be remapped after
//! instructions move, then re-encoded with fresh deltas. The frame *kind*
//! is preserved; only the short/extended encoding is re-chosen to fit the
//! new delta.

use super::bytes::{count_u16, ByteReader, ByteWriter};
use super::ClassFileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of a `Class` entry.
    Object(u16),
    /// Code offset of the `new` instruction that created the value.
    Uninitialized(u32),
}

impl VerificationType {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self, ClassFileError> {
        Ok(match r.u8()? {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(r.u16()?),
            8 => VerificationType::Uninitialized(r.u16()? as u32),
            tag => return Err(ClassFileError::UnknownVerificationType(tag)),
        })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), ClassFileError> {
        match self {
            VerificationType::Top => out.put_u8(0),
            VerificationType::Integer => out.put_u8(1),
            VerificationType::Float => out.put_u8(2),
            VerificationType::Double => out.put_u8(3),
            VerificationType::Long => out.put_u8(4),
            VerificationType::Null => out.put_u8(5),
            VerificationType::UninitializedThis => out.put_u8(6),
            VerificationType::Object(class) => {
                out.put_u8(7);
                out.put_u16(*class);
            }
            VerificationType::Uninitialized(offset) => {
                out.put_u8(8);
                out.put_u16(narrow(*offset)?);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    /// Drop the last 1 to 3 locals.
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapFrame {
    /// Absolute code offset the frame applies to.
    pub offset: u32,
    pub kind: FrameKind,
}

impl StackMapFrame {
    /// Apply `remap` to the frame offset and every `Uninitialized` offset.
    pub fn remap<F>(&mut self, remap: F) -> Result<(), ClassFileError>
    where
        F: Fn(u32) -> Result<u32, ClassFileError>,
    {
        self.offset = remap(self.offset)?;
        let types: Vec<&mut VerificationType> = match &mut self.kind {
            FrameKind::Same | FrameKind::Chop(_) => Vec::new(),
            FrameKind::SameLocals1StackItem(item) => vec![item],
            FrameKind::Append(locals) => locals.iter_mut().collect(),
            FrameKind::Full { locals, stack } => locals.iter_mut().chain(stack.iter_mut()).collect(),
        };
        for ty in types {
            if let VerificationType::Uninitialized(offset) = ty {
                *offset = remap(*offset)?;
            }
        }
        Ok(())
    }
}

fn narrow(value: u32) -> Result<u16, ClassFileError> {
    u16::try_from(value).map_err(|_| ClassFileError::CodeTooLarge(value as usize))
}

fn parse_types(r: &mut ByteReader<'_>, count: usize) -> Result<Vec<VerificationType>, ClassFileError> {
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        types.push(VerificationType::parse(r)?);
    }
    Ok(types)
}

fn write_types(out: &mut Vec<u8>, types: &[VerificationType]) -> Result<(), ClassFileError> {
    for ty in types {
        ty.write(out)?;
    }
    Ok(())
}

/// Decode the payload of a `StackMapTable` attribute.
pub fn parse_stack_map_table(info: &[u8]) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = r.u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u32, FrameKind::Same),
            64..=127 => (
                frame_type as u32 - 64,
                FrameKind::SameLocals1StackItem(VerificationType::parse(&mut r)?),
            ),
            247 => {
                let delta = r.u16()? as u32;
                (
                    delta,
                    FrameKind::SameLocals1StackItem(VerificationType::parse(&mut r)?),
                )
            }
            248..=250 => (r.u16()? as u32, FrameKind::Chop(251 - frame_type)),
            251 => (r.u16()? as u32, FrameKind::Same),
            252..=254 => {
                let delta = r.u16()? as u32;
                let locals = parse_types(&mut r, (frame_type - 251) as usize)?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = r.u16()? as u32;
                let local_count = r.u16()? as usize;
                let locals = parse_types(&mut r, local_count)?;
                let stack_count = r.u16()? as usize;
                let stack = parse_types(&mut r, stack_count)?;
                (delta, FrameKind::Full { locals, stack })
            }
            other => return Err(ClassFileError::UnknownFrameType(other)),
        };

        let offset = match previous {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        previous = Some(offset);
        frames.push(StackMapFrame { offset, kind });
    }

    r.finish()?;
    Ok(frames)
}

/// Encode frames (sorted by strictly increasing offset) as a
/// `StackMapTable` payload.
pub fn write_stack_map_table(frames: &[StackMapFrame]) -> Result<Vec<u8>, ClassFileError> {
    let mut out = Vec::new();
    out.put_u16(count_u16(frames.len(), "stack map frames")?);
    let mut previous: Option<u32> = None;

    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(prev) => frame
                .offset
                .checked_sub(prev + 1)
                .ok_or(ClassFileError::InvalidTarget {
                    at: prev,
                    target: frame.offset as i64,
                })?,
        };
        previous = Some(frame.offset);
        let delta16 = narrow(delta)?;

        match &frame.kind {
            FrameKind::Same if delta < 64 => out.put_u8(delta as u8),
            FrameKind::Same => {
                out.put_u8(251);
                out.put_u16(delta16);
            }
            FrameKind::SameLocals1StackItem(item) if delta < 64 => {
                out.put_u8(64 + delta as u8);
                item.write(&mut out)?;
            }
            FrameKind::SameLocals1StackItem(item) => {
                out.put_u8(247);
                out.put_u16(delta16);
                item.write(&mut out)?;
            }
            FrameKind::Chop(k) => {
                out.put_u8(251 - k);
                out.put_u16(delta16);
            }
            FrameKind::Append(locals) => {
                out.put_u8(251 + locals.len() as u8);
                out.put_u16(delta16);
                write_types(&mut out, locals)?;
            }
            FrameKind::Full { locals, stack } => {
                out.put_u8(255);
                out.put_u16(delta16);
                out.put_u16(count_u16(locals.len(), "frame locals")?);
                write_types(&mut out, locals)?;
                out.put_u16(count_u16(stack.len(), "frame stack")?);
                write_types(&mut out, stack)?;
            }
        }
    }

    Ok(out)
}
