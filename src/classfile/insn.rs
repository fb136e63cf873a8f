//! Bytecode instruction stream IR
//!
//! `decode` turns a method's code array into a list of [`Instruction`]s
//! whose branch targets are *labels* (the original byte offsets). New code
//! is built with an [`Assembler`]: push instructions, bind labels in front
//! of the instruction they name, then `assemble` lays everything out and
//! resolves every label to its new offset.
//!
//! Only branches and switches are position dependent. Everything else is
//! kept as an opaque `Simple` byte sequence, `wide` prefix included.

use std::collections::HashMap;

use super::bytes::{ByteReader, ByteWriter};
use super::code::MAX_CODE_LENGTH;
use super::ClassFileError;

pub mod opcodes {
    pub const IINC: u8 = 0x84;
    pub const LDC_W: u8 = 0x13;
    pub const DUP: u8 = 0x59;
    pub const IFEQ: u8 = 0x99;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const RETURN: u8 = 0xb1;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const NEW: u8 = 0xbb;
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

use opcodes::*;

/// One decoded instruction. Targets are labels, not relative offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Position independent instruction, opcode and operands verbatim.
    Simple(Vec<u8>),
    /// `if*`, `goto`, `jsr` with a 16-bit offset.
    Branch { opcode: u8, target: u32 },
    /// `goto_w`, `jsr_w` with a 32-bit offset.
    WideBranch { opcode: u8, target: u32 },
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

impl Instruction {
    /// `ldc_w #index`
    pub fn ldc_w(index: u16) -> Self {
        let [hi, lo] = index.to_be_bytes();
        Instruction::Simple(vec![LDC_W, hi, lo])
    }

    /// `invokestatic #index`
    pub fn invokestatic(index: u16) -> Self {
        let [hi, lo] = index.to_be_bytes();
        Instruction::Simple(vec![INVOKESTATIC, hi, lo])
    }

    pub fn op(opcode: u8) -> Self {
        Instruction::Simple(vec![opcode])
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Simple(bytes) => bytes[0],
            Instruction::Branch { opcode, .. } | Instruction::WideBranch { opcode, .. } => *opcode,
            Instruction::TableSwitch { .. } => TABLESWITCH,
            Instruction::LookupSwitch { .. } => LOOKUPSWITCH,
        }
    }

    /// `ireturn` through `return`.
    pub fn is_return(&self) -> bool {
        matches!(self, Instruction::Simple(bytes) if (IRETURN..=RETURN).contains(&bytes[0]))
    }

    /// Labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Instruction::Simple(_) => Vec::new(),
            Instruction::Branch { target, .. } | Instruction::WideBranch { target, .. } => {
                vec![*target]
            }
            Instruction::TableSwitch { default, targets, .. } => {
                std::iter::once(*default).chain(targets.iter().copied()).collect()
            }
            Instruction::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, t)| *t))
                .collect(),
        }
    }

    /// Encoded size when placed at `offset` (switch padding depends on it).
    pub fn encoded_len(&self, offset: u32) -> u32 {
        match self {
            Instruction::Simple(bytes) => bytes.len() as u32,
            Instruction::Branch { .. } => 3,
            Instruction::WideBranch { .. } => 5,
            Instruction::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
            }
            Instruction::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
            }
        }
    }

    fn encode<F>(&self, offset: u32, resolve: F, out: &mut Vec<u8>) -> Result<(), ClassFileError>
    where
        F: Fn(u32) -> Result<u32, ClassFileError>,
    {
        let relative = |label: u32| -> Result<i64, ClassFileError> {
            Ok(resolve(label)? as i64 - offset as i64)
        };
        let wide = |label: u32| -> Result<u32, ClassFileError> {
            let rel = relative(label)?;
            i32::try_from(rel)
                .map(|v| v as u32)
                .map_err(|_| ClassFileError::BranchOverflow {
                    from: offset,
                    to: (offset as i64 + rel) as u32,
                })
        };

        match self {
            Instruction::Simple(bytes) => out.extend_from_slice(bytes),
            Instruction::Branch { opcode, target } => {
                let rel = relative(*target)?;
                let rel = i16::try_from(rel).map_err(|_| ClassFileError::BranchOverflow {
                    from: offset,
                    to: (offset as i64 + rel) as u32,
                })?;
                out.put_u8(*opcode);
                out.put_u16(rel as u16);
            }
            Instruction::WideBranch { opcode, target } => {
                out.put_u8(*opcode);
                out.put_u32(wide(*target)?);
            }
            Instruction::TableSwitch {
                default,
                low,
                targets,
            } => {
                out.put_u8(TABLESWITCH);
                out.resize(out.len() + switch_padding(offset) as usize, 0);
                out.put_u32(wide(*default)?);
                out.put_u32(*low as u32);
                out.put_u32((*low as i64 + targets.len() as i64 - 1) as i32 as u32);
                for target in targets {
                    out.put_u32(wide(*target)?);
                }
            }
            Instruction::LookupSwitch { default, pairs } => {
                out.put_u8(LOOKUPSWITCH);
                out.resize(out.len() + switch_padding(offset) as usize, 0);
                out.put_u32(wide(*default)?);
                out.put_u32(pairs.len() as u32);
                for (key, target) in pairs {
                    out.put_u32(*key as u32);
                    out.put_u32(wide(*target)?);
                }
            }
        }
        Ok(())
    }
}

/// Zero bytes between a switch opcode and its 4-byte aligned operands.
fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

/// Operand byte count of a position independent opcode, `None` if the
/// opcode is a branch, a switch, `wide`, or not a JVM opcode at all.
fn simple_operand_len(opcode: u8) -> Option<usize> {
    let len = match opcode {
        0x00..=0x0f => 0,
        0x10 => 1,
        0x11 => 2,
        0x12 => 1,
        0x13 | 0x14 => 2,
        0x15..=0x19 => 1,
        0x1a..=0x35 => 0,
        0x36..=0x3a => 1,
        0x3b..=0x83 => 0,
        0x84 => 2,
        0x85..=0x98 => 0,
        0xa9 => 1,
        0xac..=0xb1 => 0,
        0xb2..=0xb8 => 2,
        0xb9 | 0xba => 4,
        0xbb => 2,
        0xbc => 1,
        0xbd => 2,
        0xbe | 0xbf => 0,
        0xc0 | 0xc1 => 2,
        0xc2 | 0xc3 => 0,
        0xc5 => 3,
        _ => return None,
    };
    Some(len)
}

fn absolute(at: u32, rel: i64) -> Result<u32, ClassFileError> {
    let target = at as i64 + rel;
    u32::try_from(target).map_err(|_| ClassFileError::InvalidTarget { at, target })
}

/// Decode a code array into `(offset, instruction)` pairs.
pub fn decode(code: &[u8]) -> Result<Vec<(u32, Instruction)>, ClassFileError> {
    let mut r = ByteReader::new(code);
    let mut out = Vec::new();

    while r.remaining() > 0 {
        let start = r.position();
        let at = start as u32;
        let opcode = r.u8()?;

        let insn = match opcode {
            IFEQ..=JSR | IFNULL | IFNONNULL => {
                let rel = r.i16()? as i64;
                Instruction::Branch {
                    opcode,
                    target: absolute(at, rel)?,
                }
            }
            GOTO_W | JSR_W => {
                let rel = r.i32()? as i64;
                Instruction::WideBranch {
                    opcode,
                    target: absolute(at, rel)?,
                }
            }
            TABLESWITCH => {
                r.skip(switch_padding(at) as usize)?;
                let default = absolute(at, r.i32()? as i64)?;
                let low = r.i32()?;
                let high = r.i32()?;
                if high < low {
                    return Err(ClassFileError::MalformedSwitch(at));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count * 4 > r.remaining() {
                    return Err(ClassFileError::MalformedSwitch(at));
                }
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(absolute(at, r.i32()? as i64)?);
                }
                Instruction::TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            LOOKUPSWITCH => {
                r.skip(switch_padding(at) as usize)?;
                let default = absolute(at, r.i32()? as i64)?;
                let count = r.i32()?;
                if count < 0 || count as usize * 8 > r.remaining() {
                    return Err(ClassFileError::MalformedSwitch(at));
                }
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = r.i32()?;
                    pairs.push((key, absolute(at, r.i32()? as i64)?));
                }
                Instruction::LookupSwitch { default, pairs }
            }
            WIDE => {
                let modified = r.u8()?;
                match modified {
                    IINC => r.skip(4)?,
                    0x15..=0x19 | 0x36..=0x3a | 0xa9 => r.skip(2)?,
                    _ => {
                        return Err(ClassFileError::UnknownOpcode {
                            opcode: modified,
                            offset: at + 1,
                        })
                    }
                }
                Instruction::Simple(code[start..r.position()].to_vec())
            }
            _ => {
                let len = simple_operand_len(opcode)
                    .ok_or(ClassFileError::UnknownOpcode { opcode, offset: at })?;
                r.skip(len)?;
                Instruction::Simple(code[start..r.position()].to_vec())
            }
        };
        out.push((at, insn));
    }

    Ok(out)
}

/// Builds a code array from instructions and labels.
#[derive(Debug, Default)]
pub struct Assembler {
    items: Vec<Instruction>,
    labels: HashMap<u32, usize>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `label` to the next instruction pushed (or to the end of the
    /// code if nothing follows).
    pub fn bind(&mut self, label: u32) {
        self.labels.insert(label, self.items.len());
    }

    pub fn push(&mut self, insn: Instruction) {
        self.items.push(insn);
    }

    /// Index the next pushed instruction will get.
    pub fn mark(&self) -> usize {
        self.items.len()
    }

    pub fn assemble(self) -> Result<Assembled, ClassFileError> {
        let mut offsets = Vec::with_capacity(self.items.len() + 1);
        let mut offset = 0u32;
        for insn in &self.items {
            offsets.push(offset);
            offset += insn.encoded_len(offset);
            if offset as usize > MAX_CODE_LENGTH {
                return Err(ClassFileError::CodeTooLarge(offset as usize));
            }
        }
        offsets.push(offset);

        let mut code = Vec::with_capacity(offset as usize);
        for (i, insn) in self.items.iter().enumerate() {
            let at = offsets[i];
            let resolve = |label: u32| {
                self.labels
                    .get(&label)
                    .map(|&index| offsets[index])
                    .ok_or(ClassFileError::InvalidTarget {
                        at,
                        target: label as i64,
                    })
            };
            insn.encode(at, resolve, &mut code)?;
        }

        Ok(Assembled {
            code,
            offsets,
            labels: self.labels,
        })
    }
}

/// Output of [`Assembler::assemble`].
#[derive(Debug)]
pub struct Assembled {
    pub code: Vec<u8>,
    offsets: Vec<u32>,
    labels: HashMap<u32, usize>,
}

impl Assembled {
    /// New offset of a bound label.
    pub fn label_offset(&self, label: u32) -> Option<u32> {
        self.labels.get(&label).map(|&index| self.offsets[index])
    }

    /// New offset of the instruction at `index` (or the code end).
    pub fn offset_of(&self, index: usize) -> u32 {
        self.offsets[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_branches_and_simple() {
        // 0: iload_0  1: ifeq +5  4: iconst_1  5: ireturn  6: iconst_0  7: ireturn
        let code = [0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
        let insns = decode(&code).unwrap();
        let offsets: Vec<u32> = insns.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 1, 4, 5, 6, 7]);
        assert_eq!(
            insns[1].1,
            Instruction::Branch {
                opcode: IFEQ,
                target: 6
            }
        );
        assert!(insns[3].1.is_return());
        assert!(!insns[0].1.is_return());
    }

    #[test]
    fn test_decode_wide_iinc() {
        let code = [0xc4, 0x84, 0x01, 0x00, 0x00, 0x05, 0xb1];
        let insns = decode(&code).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].1, Instruction::Simple(code[..6].to_vec()));
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            decode(&[0x00, 0xcb]),
            Err(ClassFileError::UnknownOpcode { opcode: 0xcb, offset: 1 })
        ));
    }

    #[test]
    fn test_tableswitch_padding_follows_position() {
        // iload_0 at 0, tableswitch at 1 (pad 2)
        let mut code = vec![0x1a, TABLESWITCH, 0, 0];
        code.put_u32(23); // default -> 24
        code.put_u32(0); // low
        code.put_u32(1); // high
        code.put_u32(23);
        code.put_u32(23);
        code.push(0xb1); // 24: return
        let insns = decode(&code).unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[2].0, 24);

        // Shift the switch by one byte: padding shrinks, targets stay put.
        let mut asm = Assembler::new();
        asm.push(Instruction::op(0x00));
        for (offset, insn) in insns {
            asm.bind(offset);
            asm.push(insn);
        }
        let out = asm.assemble().unwrap();
        // nop + iload_0 put the switch at 2, so its padding drops to 1 byte
        assert_eq!(out.label_offset(1), Some(2));
        assert_eq!(out.label_offset(24), Some(24));
        let redecoded = decode(&out.code).unwrap();
        assert_eq!(
            redecoded[2].1,
            Instruction::TableSwitch {
                default: 24,
                low: 0,
                targets: vec![24, 24]
            }
        );
    }

    #[test]
    fn test_assembler_resolves_labels_after_insertions() {
        // 0: goto 3   3: return
        let insns = decode(&[GOTO, 0x00, 0x03, 0xb1]).unwrap();
        let mut asm = Assembler::new();
        for (offset, insn) in insns {
            if insn.is_return() {
                asm.bind(offset);
                asm.push(Instruction::op(0x00));
                asm.push(insn);
            } else {
                asm.bind(offset);
                asm.push(insn);
            }
        }
        let out = asm.assemble().unwrap();
        // goto now lands on the inserted nop in front of the return
        assert_eq!(out.code, vec![GOTO, 0x00, 0x03, 0x00, 0xb1]);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = Assembler::new();
        asm.push(Instruction::Branch {
            opcode: GOTO,
            target: 42,
        });
        assert!(matches!(
            asm.assemble(),
            Err(ClassFileError::InvalidTarget { target: 42, .. })
        ));
    }
}
