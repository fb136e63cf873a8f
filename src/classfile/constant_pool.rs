//! Constant pool model
//!
//! Entries are kept in their on-disk order so that every index already used
//! by the class stays valid. New entries are only ever appended, and lookups
//! reuse an existing entry when an identical one is present.
//!
//! `Utf8` entries hold the raw "modified UTF-8" bytes. They are decoded on
//! demand with [`decode_modified_utf8`] and new strings are encoded with
//! [`encode_modified_utf8`].

use super::bytes::{ByteReader, ByteWriter};
use super::ClassFileError;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// A single constant pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(i32),
    /// Raw IEEE-754 bits, kept as-is so NaN payloads survive.
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0, and the second slot taken by every `Long`/`Double`.
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// The constant pool of one class file.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    /// Empty pool (only the reserved slot 0).
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    pub fn parse(r: &mut ByteReader<'_>) -> Result<Self, ClassFileError> {
        let count = r.u16()? as usize;
        let mut entries = Vec::with_capacity(count.max(1));
        entries.push(Constant::Unusable);

        while entries.len() < count {
            let index = entries.len() as u16;
            let tag = r.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.take(len)?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(r.i32()?),
                TAG_FLOAT => Constant::Float(r.u32()?),
                TAG_LONG => {
                    let hi = r.u32()? as u64;
                    let lo = r.u32()? as u64;
                    Constant::Long(((hi << 32) | lo) as i64)
                }
                TAG_DOUBLE => {
                    let hi = r.u32()? as u64;
                    let lo = r.u32()? as u64;
                    Constant::Double((hi << 32) | lo)
                }
                TAG_CLASS => Constant::Class(r.u16()?),
                TAG_STRING => Constant::String(r.u16()?),
                TAG_FIELDREF => Constant::Fieldref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_METHODREF => Constant::Methodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name: r.u16()?,
                    descriptor: r.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    kind: r.u8()?,
                    reference: r.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType(r.u16()?),
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_MODULE => Constant::Module(r.u16()?),
                TAG_PACKAGE => Constant::Package(r.u16()?),
                tag => return Err(ClassFileError::UnknownConstantTag { tag, index }),
            };
            let wide = constant.is_wide();
            entries.push(constant);
            if wide {
                entries.push(Constant::Unusable);
            }
        }

        if entries.len() != count.max(1) {
            // A wide constant in the last slot overflows the declared count.
            return Err(ClassFileError::BadConstantIndex(count as u16));
        }

        Ok(Self { entries })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.entries.len() as u16);
        for constant in &self.entries[1..] {
            match constant {
                Constant::Utf8(bytes) => {
                    out.put_u8(TAG_UTF8);
                    out.put_u16(bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(v) => {
                    out.put_u8(TAG_INTEGER);
                    out.put_u32(*v as u32);
                }
                Constant::Float(bits) => {
                    out.put_u8(TAG_FLOAT);
                    out.put_u32(*bits);
                }
                Constant::Long(v) => {
                    out.put_u8(TAG_LONG);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Double(bits) => {
                    out.put_u8(TAG_DOUBLE);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Class(name) => {
                    out.put_u8(TAG_CLASS);
                    out.put_u16(*name);
                }
                Constant::String(utf8) => {
                    out.put_u8(TAG_STRING);
                    out.put_u16(*utf8);
                }
                Constant::Fieldref { class, name_and_type } => {
                    out.put_u8(TAG_FIELDREF);
                    out.put_u16(*class);
                    out.put_u16(*name_and_type);
                }
                Constant::Methodref { class, name_and_type } => {
                    out.put_u8(TAG_METHODREF);
                    out.put_u16(*class);
                    out.put_u16(*name_and_type);
                }
                Constant::InterfaceMethodref { class, name_and_type } => {
                    out.put_u8(TAG_INTERFACE_METHODREF);
                    out.put_u16(*class);
                    out.put_u16(*name_and_type);
                }
                Constant::NameAndType { name, descriptor } => {
                    out.put_u8(TAG_NAME_AND_TYPE);
                    out.put_u16(*name);
                    out.put_u16(*descriptor);
                }
                Constant::MethodHandle { kind, reference } => {
                    out.put_u8(TAG_METHOD_HANDLE);
                    out.put_u8(*kind);
                    out.put_u16(*reference);
                }
                Constant::MethodType(descriptor) => {
                    out.put_u8(TAG_METHOD_TYPE);
                    out.put_u16(*descriptor);
                }
                Constant::Dynamic { bootstrap, name_and_type } => {
                    out.put_u8(TAG_DYNAMIC);
                    out.put_u16(*bootstrap);
                    out.put_u16(*name_and_type);
                }
                Constant::InvokeDynamic { bootstrap, name_and_type } => {
                    out.put_u8(TAG_INVOKE_DYNAMIC);
                    out.put_u16(*bootstrap);
                    out.put_u16(*name_and_type);
                }
                Constant::Module(name) => {
                    out.put_u8(TAG_MODULE);
                    out.put_u16(*name);
                }
                Constant::Package(name) => {
                    out.put_u8(TAG_PACKAGE);
                    out.put_u16(*name);
                }
                Constant::Unusable => {}
            }
        }
    }

    /// Declared `constant_pool_count` (number of slots including slot 0).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFileError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(ClassFileError::BadConstantIndex(index)),
            Some(constant) => Ok(constant),
        }
    }

    /// Decoded contents of a `Utf8` entry.
    pub fn utf8(&self, index: u16) -> Result<String, ClassFileError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => {
                decode_modified_utf8(bytes).ok_or(ClassFileError::InvalidUtf8(index))
            }
            _ => Err(ClassFileError::WrongConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Internal name (`a/b/C`) referenced by a `Class` entry.
    pub fn class_name(&self, index: u16) -> Result<String, ClassFileError> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(ClassFileError::WrongConstant {
                index,
                expected: "Class",
            }),
        }
    }

    fn push(&mut self, constant: Constant) -> Result<u16, ClassFileError> {
        let slots = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.entries.push(constant);
        if slots == 2 {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    fn find_or_push(&mut self, constant: Constant) -> Result<u16, ClassFileError> {
        match self.entries.iter().position(|c| *c == constant) {
            Some(index) => Ok(index as u16),
            None => self.push(constant),
        }
    }

    pub fn add_utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let bytes = encode_modified_utf8(value);
        if bytes.len() > u16::MAX as usize {
            return Err(ClassFileError::TooMany {
                what: "utf8 bytes",
                count: bytes.len(),
            });
        }
        self.find_or_push(Constant::Utf8(bytes))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16, ClassFileError> {
        let name = self.add_utf8(internal_name)?;
        self.find_or_push(Constant::Class(name))
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let utf8 = self.add_utf8(value)?;
        self.find_or_push(Constant::String(utf8))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.find_or_push(Constant::NameAndType { name, descriptor })
    }

    pub fn add_methodref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.find_or_push(Constant::Methodref { class, name_and_type })
    }
}

/// Decode JVM "modified UTF-8" (CESU-8 with a two-byte NUL).
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i] as u16;
        if b0 & 0x80 == 0 {
            if b0 == 0 {
                return None;
            }
            units.push(b0);
            i += 1;
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = *bytes.get(i + 1)? as u16;
            if b1 & 0xC0 != 0x80 {
                return None;
            }
            units.push(((b0 & 0x1F) << 6) | (b1 & 0x3F));
            i += 2;
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = *bytes.get(i + 1)? as u16;
            let b2 = *bytes.get(i + 2)? as u16;
            if b1 & 0xC0 != 0x80 || b2 & 0xC0 != 0x80 {
                return None;
            }
            units.push(((b0 & 0x0F) << 12) | ((b1 & 0x3F) << 6) | (b2 & 0x3F));
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

/// Encode a string as JVM "modified UTF-8".
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
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
