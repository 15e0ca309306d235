//! x86 (32-bit protected mode) instruction tables, decoder and emitter.
//!
//! This crate is the byte-level substrate of the binary translator:
//!
//! - [`insn`] holds the static descriptor tables. Every opcode is classified
//!   into a translation family (`Normal`, `CallDirect`, `Jcc`, ...) with the
//!   metadata the translator needs (`has_modrm`, immediate width, implicit
//!   register reads/writes).
//! - [`decode`] parses one instruction: legacy prefixes, optional `0F`
//!   escape, ModR/M + SIB + displacement, immediate bytes.
//! - [`emit`] regenerates instruction bytes into a code buffer, including
//!   ModR/M/SIB re-encoding from the decoded operand form. Re-encoding (as
//!   opposed to byte copying) is what allows the translator to rewrite an
//!   operand's base or displacement.
//!
//! Decoding is deterministic and allocation-free; the decoder does not judge
//! whether an instruction is translatable, it only reports the descriptor.
//! The translator decides fatality from the descriptor kind.

pub mod decode;
pub mod emit;
pub mod insn;

pub use decode::{decode_one, DecodeError, DecodedInsn, Imm};
pub use emit::Emitter;
pub use insn::{ImmSpec, InsnDesc, InsnKind, MemRef, Rm};

/// Largest window the decoder may consume for one instruction.
///
/// The architectural limit is 15 bytes; the subset this translator accepts
/// stays well under it.
pub const MAX_INSN_LEN: usize = 15;
