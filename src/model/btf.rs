//! BPF Type Format blobs: the type and string sections a program load
//! points at when it carries function info.
//!
//! Layout, little endian: a 24-byte header, then the type section (each
//! type is a 12-byte common record plus kind-specific trailing data), then
//! the string section, which starts with an empty string.

use serde::{Deserialize, Serialize};

use crate::BtfError;

pub const MAGIC: u16 = 0xeb9f;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: u32 = 24;

const COMMON_LEN: usize = 12;

/// Kinds this crate builds and parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Int = 1,
    Ptr = 2,
    Struct = 4,
    Func = 12,
    FuncProto = 13,
}

impl Kind {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Int),
            2 => Some(Self::Ptr),
            4 => Some(Self::Struct),
            12 => Some(Self::Func),
            13 => Some(Self::FuncProto),
            _ => None,
        }
    }
}

/// Pack the `info` word: vlen in bits 0-15, kind in bits 24-28, kind_flag
/// in bit 31.
pub fn type_info(vlen: u16, kind: Kind, kind_flag: bool) -> u32 {
    u32::from(vlen) | (u32::from(kind as u8) << 24) | (u32::from(kind_flag) << 31)
}

/// Encoding word of an INT: signedness in bits 24-27, width in bits 0-7.
pub const INT_SIGNED: u32 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub name_off: u32,
    pub type_id: u32,
    /// Bit offset inside the struct.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name_off: u32,
    pub type_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeData {
    None,
    Int(u32),
    Members(Vec<Member>),
    Params(Vec<Param>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtfType {
    pub name_off: u32,
    pub info: u32,
    /// Byte size for INT and STRUCT, a type id for everything else.
    pub size_or_type: u32,
    pub data: TypeData,
}

impl BtfType {
    pub fn int(name_off: u32, bits: u32, signed: bool) -> Self {
        let sign = if signed { INT_SIGNED } else { 0 };
        Self {
            name_off,
            info: type_info(0, Kind::Int, false),
            size_or_type: bits.div_ceil(8),
            data: TypeData::Int(sign | bits),
        }
    }

    pub fn ptr(type_id: u32) -> Self {
        Self {
            name_off: 0,
            info: type_info(0, Kind::Ptr, false),
            size_or_type: type_id,
            data: TypeData::None,
        }
    }

    pub fn structure(name_off: u32, size: u32, members: Vec<Member>) -> Self {
        Self {
            name_off,
            info: type_info(members.len() as u16, Kind::Struct, false),
            size_or_type: size,
            data: TypeData::Members(members),
        }
    }

    pub fn func(name_off: u32, proto: u32) -> Self {
        Self {
            name_off,
            info: type_info(0, Kind::Func, false),
            size_or_type: proto,
            data: TypeData::None,
        }
    }

    /// `ret` is 0 for void.
    pub fn func_proto(ret: u32, params: Vec<Param>) -> Self {
        Self {
            name_off: 0,
            info: type_info(params.len() as u16, Kind::FuncProto, false),
            size_or_type: ret,
            data: TypeData::Params(params),
        }
    }

    pub fn kind(&self) -> Option<Kind> {
        Kind::from_number(((self.info >> 24) & 0x1f) as u8)
    }

    pub fn vlen(&self) -> u16 {
        (self.info & 0xffff) as u16
    }

    /// Type ids this type refers to.
    fn references(&self) -> Vec<u32> {
        let mut out = Vec::new();
        if matches!(self.kind(), Some(Kind::Ptr | Kind::Func | Kind::FuncProto)) {
            out.push(self.size_or_type);
        }
        match &self.data {
            TypeData::Members(members) => out.extend(members.iter().map(|m| m.type_id)),
            TypeData::Params(params) => out.extend(params.iter().map(|p| p.type_id)),
            TypeData::None | TypeData::Int(_) => {}
        }
        out
    }

    fn encoded_len(&self) -> usize {
        COMMON_LEN
            + match &self.data {
                TypeData::None => 0,
                TypeData::Int(_) => 4,
                TypeData::Members(m) => m.len() * 12,
                TypeData::Params(p) => p.len() * 8,
            }
    }
}

/// A function's entry in the program's `func_info` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncInfo {
    /// Word offset of the function's first instruction.
    pub insn_off: u32,
    /// A FUNC type in the accompanying BTF.
    pub type_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Btf {
    types: Vec<BtfType>,
    strings: Vec<u8>,
}

impl Default for Btf {
    fn default() -> Self {
        Self::new()
    }
}

impl Btf {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            strings: vec![0],
        }
    }

    /// Append `name` to the string section and return its offset.
    pub fn add_string(&mut self, name: &str) -> u32 {
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off
    }

    /// Append a type and return its id. Id 0 is void, so the first type is 1.
    pub fn add_type(&mut self, ty: BtfType) -> u32 {
        self.types.push(ty);
        self.types.len() as u32
    }

    pub fn types(&self) -> &[BtfType] {
        &self.types
    }

    pub fn get(&self, type_id: u32) -> Option<&BtfType> {
        let idx = usize::try_from(type_id).ok()?.checked_sub(1)?;
        self.types.get(idx)
    }

    pub fn string_at(&self, off: u32) -> Option<&str> {
        let tail = self.strings.get(off as usize..)?;
        let end = tail.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        let type_len: usize = self.types.iter().map(BtfType::encoded_len).sum();
        let mut out = Vec::with_capacity(HEADER_LEN as usize + type_len + self.strings.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.push(VERSION);
        out.push(0);
        for field in [HEADER_LEN, 0, type_len as u32, type_len as u32, self.strings.len() as u32] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for ty in &self.types {
            for field in [ty.name_off, ty.info, ty.size_or_type] {
                out.extend_from_slice(&field.to_le_bytes());
            }
            match &ty.data {
                TypeData::None => {}
                TypeData::Int(encoding) => out.extend_from_slice(&encoding.to_le_bytes()),
                TypeData::Members(members) => {
                    for m in members {
                        for field in [m.name_off, m.type_id, m.offset] {
                            out.extend_from_slice(&field.to_le_bytes());
                        }
                    }
                }
                TypeData::Params(params) => {
                    for p in params {
                        for field in [p.name_off, p.type_id] {
                            out.extend_from_slice(&field.to_le_bytes());
                        }
                    }
                }
            }
        }
        out.extend_from_slice(&self.strings);
        out
    }

    /// Parse and sanity-check a blob the way a loader would before
    /// accepting it.
    pub fn parse(blob: &[u8]) -> Result<Self, BtfError> {
        let mut header = Reader::new(blob);
        let magic = header.u16()?;
        if magic != MAGIC {
            return Err(BtfError::BadMagic(magic));
        }
        let version = header.u8()?;
        if version != VERSION {
            return Err(BtfError::UnsupportedVersion(version));
        }
        let _flags = header.u8()?;
        let hdr_len = header.u32()?;
        if hdr_len != HEADER_LEN {
            return Err(BtfError::BadHeaderLen(hdr_len));
        }
        let type_off = header.u32()? as usize;
        let type_len = header.u32()? as usize;
        let str_off = header.u32()? as usize;
        let str_len = header.u32()? as usize;

        let body = &blob[HEADER_LEN as usize..];
        let section = |off: usize, len: usize| {
            off.checked_add(len)
                .and_then(|end| body.get(off..end))
                .ok_or(BtfError::SectionOutOfBounds { off, len })
        };
        let type_section = section(type_off, type_len)?;
        let strings = section(str_off, str_len)?.to_vec();
        if strings.first() != Some(&0) || strings.last() != Some(&0) {
            return Err(BtfError::BadStringSection);
        }

        let mut types = Vec::new();
        let mut reader = Reader::new(type_section);
        while !reader.is_empty() {
            let name_off = reader.u32()?;
            let info = reader.u32()?;
            let size_or_type = reader.u32()?;
            let kind_bits = ((info >> 24) & 0x1f) as u8;
            let kind = Kind::from_number(kind_bits).ok_or(BtfError::UnknownKind(kind_bits))?;
            let vlen = (info & 0xffff) as usize;
            let data = match kind {
                Kind::Int => TypeData::Int(reader.u32()?),
                Kind::Ptr | Kind::Func => TypeData::None,
                Kind::Struct => {
                    let mut members = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        members.push(Member {
                            name_off: reader.u32()?,
                            type_id: reader.u32()?,
                            offset: reader.u32()?,
                        });
                    }
                    TypeData::Members(members)
                }
                Kind::FuncProto => {
                    let mut params = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        params.push(Param {
                            name_off: reader.u32()?,
                            type_id: reader.u32()?,
                        });
                    }
                    TypeData::Params(params)
                }
            };
            types.push(BtfType {
                name_off,
                info,
                size_or_type,
                data,
            });
        }

        let btf = Self { types, strings };
        btf.check_references()?;
        Ok(btf)
    }

    fn check_references(&self) -> Result<(), BtfError> {
        let count = self.types.len() as u32;
        for (idx, ty) in self.types.iter().enumerate() {
            let id = idx as u32 + 1;
            if ty.name_off as usize >= self.strings.len() {
                return Err(BtfError::BadNameOffset { id, off: ty.name_off });
            }
            if let Some(bad) = ty.references().into_iter().find(|r| *r > count) {
                return Err(BtfError::BadTypeId { id, referenced: bad });
            }
            if ty.kind() == Some(Kind::Func) {
                if ty.name_off == 0 {
                    return Err(BtfError::AnonymousFunc(id));
                }
                if self.get(ty.size_or_type).and_then(BtfType::kind) != Some(Kind::FuncProto) {
                    return Err(BtfError::FuncWithoutProto(id));
                }
            }
        }
        Ok(())
    }
}

/// Type ids of a two-function program: `void main(void)` followed by an
/// `int callback(int index, struct ctx *ctx)` handed to `bpf_loop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopCallbackTypes {
    pub btf: Btf,
    pub main: u32,
    pub callback: u32,
}

impl LoopCallbackTypes {
    pub fn new() -> Self {
        let mut btf = Btf::new();
        let name = btf.add_string("bpfuzz");
        let main_proto = btf.add_type(BtfType::func_proto(0, Vec::new()));
        let main = btf.add_type(BtfType::func(name, main_proto));
        let int = btf.add_type(BtfType::int(name, 32, true));
        let ctx = btf.add_type(BtfType::structure(
            name,
            4,
            vec![Member {
                name_off: name,
                type_id: int,
                offset: 0,
            }],
        ));
        let ctx_ptr = btf.add_type(BtfType::ptr(ctx));
        let callback_proto = btf.add_type(BtfType::func_proto(
            int,
            vec![
                Param { name_off: name, type_id: int },
                Param {
                    name_off: name,
                    type_id: ctx_ptr,
                },
            ],
        ));
        let callback = btf.add_type(BtfType::func(name, callback_proto));
        Self { btf, main, callback }
    }
}

impl Default for LoopCallbackTypes {
    fn default() -> Self {
        Self::new()
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn is_empty(&self) -> bool {
        self.at >= self.bytes.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], BtfError> {
        let chunk = self
            .bytes
            .get(self.at..self.at + N)
            .ok_or(BtfError::Truncated(self.at))?;
        self.at += N;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BtfError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, BtfError> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, BtfError> {
        self.take().map(u32::from_le_bytes)
    }
}
