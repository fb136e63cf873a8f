//! Probe insertion for a single method body
//!
//! ```text
//! original                      woven
//! ────────                      ─────
//!                               ldc_w key
//!                               invokestatic triggerStart
//! 0:  ...                  ┌──► ...                                  ┐
//!     ifeq L                │    ifeq L                               │
//!     ...                   │    ...                                  │ catch-all
//! L:  ireturn               │ L: ldc_w key                            │ range
//!                           │    invokestatic triggerEnd              │
//!                           │    ireturn                              ┘
//!                           └─ handler:
//!                                dup
//!                                ldc_w key
//!                                invokestatic triggerEndWithError
//!                                athrow
//! ```
//!
//! Labels that named a return now name the probe in front of it, so every
//! path into a return runs the exit probe exactly once.

use crate::classfile::bytes::{ByteReader, ByteWriter};
use crate::classfile::frames::{
    parse_stack_map_table, write_stack_map_table, FrameKind, StackMapFrame, VerificationType,
};
use crate::classfile::insn::{self, opcodes, Assembler, Instruction};
use crate::classfile::{AttributeInfo, ClassFileError, CodeAttribute, ConstantPool, ExceptionEntry};

use super::GateTarget;

/// Descriptor of `triggerStart` and `triggerEnd`.
pub const KEY_DESCRIPTOR: &str = "(Ljava/lang/String;)V";
/// Descriptor of `triggerEndWithError`.
pub const ERROR_DESCRIPTOR: &str = "(Ljava/lang/Throwable;Ljava/lang/String;)V";

/// Constant pool indexes shared by every method of one class.
#[derive(Debug, Clone, Copy)]
pub(super) struct ProbeRefs {
    start: u16,
    end: u16,
    end_with_error: u16,
    throwable: u16,
}

impl ProbeRefs {
    pub(super) fn register(pool: &mut ConstantPool, gate: &GateTarget) -> Result<Self, ClassFileError> {
        Ok(Self {
            start: pool.add_methodref(&gate.owner, &gate.start, KEY_DESCRIPTOR)?,
            end: pool.add_methodref(&gate.owner, &gate.end, KEY_DESCRIPTOR)?,
            end_with_error: pool.add_methodref(&gate.owner, &gate.end_with_error, ERROR_DESCRIPTOR)?,
            throwable: pool.add_class("java/lang/Throwable")?,
        })
    }
}

fn pc(offset: u32) -> Result<u16, ClassFileError> {
    u16::try_from(offset).map_err(|_| ClassFileError::CodeTooLarge(offset as usize))
}

/// Rewrite one `Code` attribute. `key` is the constant pool index of the
/// artifact key string.
pub(super) fn instrument(
    code: &CodeAttribute,
    pool: &mut ConstantPool,
    key: u16,
    refs: &ProbeRefs,
    stack_maps: bool,
) -> Result<CodeAttribute, ClassFileError> {
    let insns = insn::decode(&code.code)?;
    if insns.is_empty() {
        return Err(ClassFileError::EmptyCode);
    }
    let end_label = code.code.len() as u32;

    let mut asm = Assembler::new();
    asm.push(Instruction::ldc_w(key));
    asm.push(Instruction::invokestatic(refs.start));

    for (offset, insn) in insns {
        asm.bind(offset);
        if insn.is_return() {
            asm.push(Instruction::ldc_w(key));
            asm.push(Instruction::invokestatic(refs.end));
        }
        asm.push(insn);
    }

    asm.bind(end_label);
    let handler_index = asm.mark();
    asm.push(Instruction::op(opcodes::DUP));
    asm.push(Instruction::ldc_w(key));
    asm.push(Instruction::invokestatic(refs.end_with_error));
    asm.push(Instruction::op(opcodes::ATHROW));

    let assembled = asm.assemble()?;
    let handler_pc = assembled.offset_of(handler_index);
    let remap = |offset: u32| {
        assembled
            .label_offset(offset)
            .ok_or(ClassFileError::InvalidTarget {
                at: offset,
                target: offset as i64,
            })
    };

    let mut exception_table = Vec::with_capacity(code.exception_table.len() + 1);
    for entry in &code.exception_table {
        exception_table.push(ExceptionEntry {
            start_pc: pc(remap(entry.start_pc as u32)?)?,
            end_pc: pc(remap(entry.end_pc as u32)?)?,
            handler_pc: pc(remap(entry.handler_pc as u32)?)?,
            catch_type: entry.catch_type,
        });
    }
    // Last entry: lowest priority, so the method's own handlers still see
    // their exceptions first.
    exception_table.push(ExceptionEntry {
        start_pc: pc(remap(0)?)?,
        end_pc: pc(handler_pc)?,
        handler_pc: pc(handler_pc)?,
        catch_type: 0,
    });

    let handler_frame = StackMapFrame {
        offset: handler_pc,
        kind: FrameKind::Full {
            locals: Vec::new(),
            stack: vec![VerificationType::Object(refs.throwable)],
        },
    };

    let mut attributes = Vec::with_capacity(code.attributes.len() + 1);
    let mut has_frames = false;
    for attribute in &code.attributes {
        match attribute.name(pool)?.as_str() {
            "StackMapTable" => {
                has_frames = true;
                let mut frames = parse_stack_map_table(&attribute.info)?;
                for frame in &mut frames {
                    frame.remap(&remap)?;
                }
                frames.push(handler_frame.clone());
                attributes.push(AttributeInfo {
                    name_index: attribute.name_index,
                    info: write_stack_map_table(&frames)?,
                });
            }
            "LineNumberTable" => attributes.push(AttributeInfo {
                name_index: attribute.name_index,
                info: remap_line_numbers(&attribute.info, &remap)?,
            }),
            "LocalVariableTable" | "LocalVariableTypeTable" => attributes.push(AttributeInfo {
                name_index: attribute.name_index,
                info: remap_local_variables(&attribute.info, &remap)?,
            }),
            // Type annotation targets embed code offsets we do not track.
            "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {}
            _ => attributes.push(attribute.clone()),
        }
    }
    if stack_maps && !has_frames {
        attributes.push(AttributeInfo {
            name_index: pool.add_utf8("StackMapTable")?,
            info: write_stack_map_table(&[handler_frame])?,
        });
    }

    Ok(CodeAttribute {
        // +1 for the key pushed over a return value, 3 for the handler
        max_stack: code.max_stack.saturating_add(1).max(3),
        max_locals: code.max_locals,
        code: assembled.code,
        exception_table,
        attributes,
    })
}

fn remap_line_numbers<F>(info: &[u8], remap: F) -> Result<Vec<u8>, ClassFileError>
where
    F: Fn(u32) -> Result<u32, ClassFileError>,
{
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);
    for _ in 0..count {
        let start = r.u16()?;
        let line = r.u16()?;
        out.put_u16(pc(remap(start as u32)?)?);
        out.put_u16(line);
    }
    r.finish()?;
    Ok(out)
}

fn remap_local_variables<F>(info: &[u8], remap: F) -> Result<Vec<u8>, ClassFileError>
where
    F: Fn(u32) -> Result<u32, ClassFileError>,
{
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);
    for _ in 0..count {
        let start = r.u16()? as u32;
        let length = r.u16()? as u32;
        let name = r.u16()?;
        let descriptor = r.u16()?;
        let index = r.u16()?;

        let new_start = remap(start)?;
        let new_end = remap(start + length)?;
        out.put_u16(pc(new_start)?);
        out.put_u16(pc(new_end - new_start)?);
        out.put_u16(name);
        out.put_u16(descriptor);
        out.put_u16(index);
    }
    r.finish()?;
    Ok(out)
}
