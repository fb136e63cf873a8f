//! The `Code` attribute of a method.

use super::bytes::{count_u16, ByteReader, ByteWriter};
use super::{parse_attributes, write_attributes, AttributeInfo, ClassFileError};

/// Upper bound on `code_length` imposed by the JVM.
pub const MAX_CODE_LENGTH: usize = 65535;

/// One row of a method's exception table. `catch_type == 0` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = ByteReader::new(info);
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code_length = r.u32()? as usize;
        if code_length > MAX_CODE_LENGTH {
            return Err(ClassFileError::CodeTooLarge(code_length));
        }
        let code = r.take(code_length)?.to_vec();

        let entries = r.u16()?;
        let mut exception_table = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            exception_table.push(ExceptionEntry {
                start_pc: r.u16()?,
                end_pc: r.u16()?,
                handler_pc: r.u16()?,
                catch_type: r.u16()?,
            });
        }

        let attributes = parse_attributes(&mut r)?;
        r.finish()?;

        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        if self.code.len() > MAX_CODE_LENGTH {
            return Err(ClassFileError::CodeTooLarge(self.code.len()));
        }
        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(self.code.len() as u32);
        out.extend_from_slice(&self.code);
        out.put_u16(count_u16(self.exception_table.len(), "exception handlers")?);
        for entry in &self.exception_table {
            out.put_u16(entry.start_pc);
            out.put_u16(entry.end_pc);
            out.put_u16(entry.handler_pc);
            out.put_u16(entry.catch_type);
        }
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }
}
