//! One-instruction decoder: prefixes, opcode dispatch, ModR/M + SIB,
//! immediate bytes.
//!
//! The decoder consumes bytes from a window the caller fetched from guest
//! memory and produces a [`DecodedInsn`] referencing the static descriptor
//! tables. Group opcodes are resolved here (through the extension table) so
//! the caller always sees the final form descriptor.

use thiserror::Error;

use crate::insn::{ImmSpec, InsnDesc, InsnKind, MemRef, Rm, ONE_BYTE, TWO_BYTE};

/// Decode failure.
///
/// Unclassified or privileged opcodes are *not* decode failures; the decoder
/// reports their descriptor and the translator rejects them. Only structural
/// problems are reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The byte window ended before the instruction was complete.
    #[error("unexpected end of instruction bytes")]
    UnexpectedEof,
    /// A prefix the translator cannot honor (LOCK, segment overrides other
    /// than the emulated GS handling, address-size).
    #[error("unsupported prefix {0:#04x}")]
    UnsupportedPrefix(u8),
}

/// Raw immediate bytes of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Imm {
    bytes: [u8; 4],
    len: u8,
}

impl Imm {
    /// Number of immediate bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw bytes, in instruction order.
    pub fn raw(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Sign-extended relative displacement (for branch forms).
    pub fn rel(&self) -> i32 {
        match self.len {
            1 => self.bytes[0] as i8 as i32,
            2 => i16::from_le_bytes([self.bytes[0], self.bytes[1]]) as i32,
            4 => i32::from_le_bytes(self.bytes),
            _ => 0,
        }
    }

    /// The immediate as an unsigned 16-bit value (for `ret imm16`).
    pub fn as_u16(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn {
    /// Final opcode byte (the second byte for `0F`-escaped opcodes).
    pub opcode: u8,
    /// Whether the opcode came from the two-byte table.
    pub escape_0f: bool,
    /// `66` operand-size prefix seen.
    pub opsize_prefix: bool,
    /// `F2`/`F3` prefix byte, or 0.
    pub rep_prefix: u8,
    /// ModRM.reg field, when the form has a ModR/M byte.
    pub r: Option<u8>,
    /// Decoded r/m operand, when the form has a ModR/M byte.
    pub rm: Option<Rm>,
    /// Raw immediate bytes.
    pub imm: Imm,
    /// Total encoded length in bytes.
    pub len: u8,
    /// Resolved descriptor (extension groups already applied).
    pub desc: &'static InsnDesc,
}

impl DecodedInsn {
    /// Register-set mask of everything this instruction touches: implicit
    /// reads/writes plus the ModR/M register fields. Used to pick a scratch
    /// register that the instruction does not care about.
    pub fn used_regs(&self) -> u8 {
        let mut used = self.desc.read_regs | self.desc.write_regs;
        if let Some(r) = self.r {
            used |= crate::insn::reg::mask(r);
        }
        if let Some(rm) = &self.rm {
            used |= rm.reg_mask();
        }
        used
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let end = self.pos + 4;
        let s = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }
}

/// Decode one instruction from the start of `bytes`.
///
/// `bytes` should contain the next [`crate::MAX_INSN_LEN`] bytes of the
/// instruction stream when available; a shorter window may fail with
/// [`DecodeError::UnexpectedEof`].
pub fn decode_one(bytes: &[u8]) -> Result<DecodedInsn, DecodeError> {
    let mut cur = Cursor { bytes, pos: 0 };

    let mut opsize_prefix = false;
    let mut rep_prefix = 0u8;
    let opcode = loop {
        let b = cur.u8()?;
        match b {
            0x66 => opsize_prefix = true,
            0xF2 | 0xF3 => rep_prefix = b,
            // LOCK, segment overrides and the address-size prefix cannot be
            // honored under the flat emulated address space.
            0xF0 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0x67 => {
                return Err(DecodeError::UnsupportedPrefix(b));
            }
            _ => break b,
        }
    };

    let (opcode, escape_0f, mut desc) = if opcode == 0x0F {
        let op2 = cur.u8()?;
        (op2, true, &TWO_BYTE[op2 as usize])
    } else {
        (opcode, false, &ONE_BYTE[opcode as usize])
    };

    let (r, rm) = if desc.has_modrm {
        let (r, rm) = parse_modrm(&mut cur)?;
        (Some(r), Some(rm))
    } else {
        (None, None)
    };

    if let InsnKind::Extension(table) = desc.kind {
        // ModRM.reg selects the real descriptor. Groups always carry ModR/M.
        desc = &table[r.unwrap_or(0) as usize];
    }

    let imm_len = match desc.imm {
        ImmSpec::None => 0,
        ImmSpec::Fixed(n) => n as usize,
        ImmSpec::OperandSize => {
            if opsize_prefix {
                2
            } else {
                4
            }
        }
    };
    let mut imm = Imm::default();
    for i in 0..imm_len {
        imm.bytes[i] = cur.u8()?;
    }
    imm.len = imm_len as u8;

    Ok(DecodedInsn {
        opcode,
        escape_0f,
        opsize_prefix,
        rep_prefix,
        r,
        rm,
        imm,
        len: cur.pos as u8,
        desc,
    })
}

fn parse_modrm(cur: &mut Cursor<'_>) -> Result<(u8, Rm), DecodeError> {
    let modrm = cur.u8()?;
    let mut md = modrm >> 6;
    let r = (modrm >> 3) & 7;
    let modrm_rm = modrm & 7;

    if md == 3 {
        return Ok((r, Rm::Reg(modrm_rm)));
    }

    let base;
    let mut index = None;
    let mut scale = 0;
    if modrm_rm == 4 {
        // SIB byte follows.
        let sib = cur.u8()?;
        scale = sib >> 6;
        let sib_index = (sib >> 3) & 7;
        if sib_index != 4 {
            index = Some(sib_index);
        }
        let sib_base = sib & 7;
        if sib_base == 5 && md == 0 {
            // No base, disp32 follows regardless of mod.
            base = None;
            md = 2;
        } else {
            base = Some(sib_base);
        }
    } else if md == 0 && modrm_rm == 5 {
        // Bare disp32.
        let disp = cur.u32()? as i32;
        return Ok((
            r,
            Rm::Mem(MemRef {
                base: None,
                index: None,
                scale: 0,
                disp,
            }),
        ));
    } else {
        base = Some(modrm_rm);
    }

    let disp = match md {
        1 => cur.u8()? as i8 as i32,
        2 => cur.u32()? as i32,
        _ => 0,
    };

    Ok((
        r,
        Rm::Mem(MemRef {
            base,
            index,
            scale,
            disp,
        }),
    ))
}
