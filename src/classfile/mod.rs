//! JVM class file codec
//!
//! Parses a class file into an owned intermediate representation and writes
//! it back out. Only the structures the weaver rewrites are modelled in
//! detail (the constant pool, method `Code` attributes, their instruction
//! streams and stack map frames); every other attribute is carried through
//! as opaque bytes.
//!
//! ```text
//! bytes ──► ClassFile::parse ──► ClassFile ──► (weaver edits) ──► to_bytes ──► bytes
//!                                   │
//!                                   ├── ConstantPool          (constant_pool)
//!                                   ├── MemberInfo[] methods
//!                                   │      └── "Code" ──► CodeAttribute (code)
//!                                   │              ├── Instruction[]     (insn)
//!                                   │              └── StackMapFrame[]   (frames)
//!                                   └── AttributeInfo[]       (opaque)
//! ```

pub mod bytes;
pub mod code;
pub mod constant_pool;
pub mod frames;
pub mod insn;

use thiserror::Error;

use bytes::{count_u16, ByteReader, ByteWriter};
pub use code::{CodeAttribute, ExceptionEntry};
pub use constant_pool::{Constant, ConstantPool};

/// `0xCAFEBABE`
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Oldest and newest major versions accepted (JDK 1.1 to JDK 25).
pub const MIN_MAJOR_VERSION: u16 = 45;
pub const MAX_MAJOR_VERSION: u16 = 69;

/// First major version that carries `StackMapTable` attributes.
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_MODULE: u16 = 0x8000;

/// Errors raised while decoding or re-encoding a class file.
#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },
    #[error("invalid constant pool index {0}")]
    BadConstantIndex(u16),
    #[error("constant pool entry {index} is not a {expected}")]
    WrongConstant { index: u16, expected: &'static str },
    #[error("constant pool entry {0} is not valid modified UTF-8")]
    InvalidUtf8(u16),
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("too many {what} ({count})")]
    TooMany { what: &'static str, count: usize },
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u32 },
    #[error("offset {target} referenced at {at} is not an instruction boundary")]
    InvalidTarget { at: u32, target: i64 },
    #[error("malformed switch at offset {0}")]
    MalformedSwitch(u32),
    #[error("branch from {from} to {to} does not fit its offset operand")]
    BranchOverflow { from: u32, to: u32 },
    #[error("method code is {0} bytes, limit is 65535")]
    CodeTooLarge(usize),
    #[error("method has an empty code array")]
    EmptyCode,
    #[error("unknown stack map frame type {0}")]
    UnknownFrameType(u8),
    #[error("unknown verification type tag {0}")]
    UnknownVerificationType(u8),
    #[error("{0} trailing bytes after structure")]
    TrailingBytes(usize),
}

/// An attribute kept as its name index and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl AttributeInfo {
    pub fn name(&self, pool: &ConstantPool) -> Result<String, ClassFileError> {
        pool.utf8(self.name_index)
    }
}

/// A field or method.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MemberInfo {
    pub fn name(&self, pool: &ConstantPool) -> Result<String, ClassFileError> {
        pool.utf8(self.name_index)
    }

    pub fn descriptor(&self, pool: &ConstantPool) -> Result<String, ClassFileError> {
        pool.utf8(self.descriptor_index)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.access_flags & flag != 0
    }

    /// Position of the first attribute with the given name.
    pub fn find_attribute(
        &self,
        pool: &ConstantPool,
        name: &str,
    ) -> Result<Option<usize>, ClassFileError> {
        for (i, attribute) in self.attributes.iter().enumerate() {
            if attribute.name(pool)? == name {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

/// A parsed class file.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = ByteReader::new(bytes);

        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;
        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(ClassFileError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        let constant_pool = ConstantPool::parse(&mut r)?;
        let access_flags = r.u16()?;
        let this_class = r.u16()?;
        let super_class = r.u16()?;

        let interface_count = r.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(r.u16()?);
        }

        let fields = parse_members(&mut r)?;
        let methods = parse_members(&mut r)?;
        let attributes = parse_attributes(&mut r)?;
        r.finish()?;

        Ok(Self {
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

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        let mut out = Vec::new();
        out.put_u32(MAGIC);
        out.put_u16(self.minor_version);
        out.put_u16(self.major_version);
        self.constant_pool.write(&mut out);
        out.put_u16(self.access_flags);
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(count_u16(self.interfaces.len(), "interfaces")?);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }
        write_members(&mut out, &self.fields)?;
        write_members(&mut out, &self.methods)?;
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }

    /// Internal name of this class (`a/b/C`).
    pub fn name(&self) -> Result<String, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn is_module(&self) -> bool {
        self.access_flags & ACC_MODULE != 0
    }

    /// Whether the verifier expects `StackMapTable` frames for this version.
    pub fn uses_stack_maps(&self) -> bool {
        self.major_version >= STACK_MAP_MAJOR_VERSION
    }
}

fn parse_members(r: &mut ByteReader<'_>) -> Result<Vec<MemberInfo>, ClassFileError> {
    let count = r.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(MemberInfo {
            access_flags: r.u16()?,
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: parse_attributes(r)?,
        });
    }
    Ok(members)
}

pub(crate) fn parse_attributes(r: &mut ByteReader<'_>) -> Result<Vec<AttributeInfo>, ClassFileError> {
    let count = r.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        attributes.push(AttributeInfo {
            name_index,
            info: r.take(len)?.to_vec(),
        });
    }
    Ok(attributes)
}

fn write_members(out: &mut Vec<u8>, members: &[MemberInfo]) -> Result<(), ClassFileError> {
    out.put_u16(count_u16(members.len(), "members")?);
    for member in members {
        out.put_u16(member.access_flags);
        out.put_u16(member.name_index);
        out.put_u16(member.descriptor_index);
        write_attributes(out, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(
    out: &mut Vec<u8>,
    attributes: &[AttributeInfo],
) -> Result<(), ClassFileError> {
    out.put_u16(count_u16(attributes.len(), "attributes")?);
    for attribute in attributes {
        out.put_u16(attribute.name_index);
        out.put_u32(attribute.info.len() as u32);
        out.extend_from_slice(&attribute.info);
    }
    Ok(())
}
