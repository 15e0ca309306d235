//! Per-instruction rewriting of one guest basic block.
//!
//! The block body is emitted into a scratch buffer addressed at the cache
//! slot it will occupy, then committed in one piece: no control flow can
//! observe a half-written block. Trampoline stubs are allocated directly in
//! the cache while the body is still being built; if a stub allocation would
//! collide with the pending block region the whole translation aborts as
//! cache-full and the caller flushes and retries.

use adelie_x86::insn::{reg, InsnKind, Rm};
use adelie_x86::{decode_one, DecodeError, DecodedInsn, Emitter, MAX_INSN_LEN};

use crate::cache::{BlockPool, CodeCache, BLOCK_MAXSIZE};
use crate::{DbtError, GuestBus, RuntimeStubs, TlsOffsets};

/// Why a translation attempt stopped without producing a block.
pub(crate) enum TranslateAbort {
    /// The cache has no room for the block or its stubs; flush and retry.
    CacheFull,
    /// Implementation limit hit; retrying cannot help.
    Fatal(DbtError),
}

impl From<DbtError> for TranslateAbort {
    fn from(e: DbtError) -> Self {
        TranslateAbort::Fatal(e)
    }
}

/// Resolve the jump target for a direct branch to `target_pc`: the already
/// translated block if there is one, otherwise a fresh resolver stub that
/// will patch the displacement at `patch_addr` when it first runs.
fn direct_trampoline(
    cache: &mut CodeCache,
    pool: &BlockPool,
    stubs: &RuntimeStubs,
    target_pc: u32,
    patch_addr: u32,
) -> Result<u32, TranslateAbort> {
    if let Some(start) = pool.find(target_pc) {
        return Ok(start);
    }
    cache
        .alloc_stub(stubs.find_direct_entry, target_pc, patch_addr)
        .ok_or(TranslateAbort::CacheFull)
}

/// Pick a register the instruction neither names nor implicitly touches, to
/// hold a temporary. ESP and EBP are never picked.
fn pick_scratch(ins: &DecodedInsn) -> Option<u8> {
    let used = ins.used_regs();
    [reg::EAX, reg::ECX, reg::EDX, reg::EBX, reg::ESI, reg::EDI]
        .into_iter()
        .find(|&r| used & reg::mask(r) == 0)
}

pub(crate) fn translate_block(
    cache: &mut CodeCache,
    pool: &BlockPool,
    stubs: &RuntimeStubs,
    tls: &TlsOffsets,
    bus: &dyn GuestBus,
    pc: u32,
) -> Result<u32, TranslateAbort> {
    let start_addr = cache.next_block_addr();
    let mut body = [0u8; BLOCK_MAXSIZE];
    let mut e = Emitter::new(&mut body, start_addr);

    let mut cur = pc;
    loop {
        let mut window = [0u8; MAX_INSN_LEN];
        let n = bus.fetch(cur, &mut window);
        let ins = decode_one(&window[..n]).map_err(|err| match err {
            DecodeError::UnexpectedEof => DbtError::Truncated { pc: cur },
            DecodeError::UnsupportedPrefix(byte) => DbtError::UnsupportedPrefix { pc: cur, byte },
        })?;
        let next_pc = cur.wrapping_add(ins.len as u32);

        let ends_block = match ins.desc.kind {
            InsnKind::Unknown | InsnKind::Invalid => {
                return Err(DbtError::InvalidOpcode {
                    pc: cur,
                    opcode: ins.opcode,
                    escape_0f: ins.escape_0f,
                }
                .into());
            }
            InsnKind::Privileged => {
                return Err(DbtError::PrivilegedOpcode {
                    pc: cur,
                    opcode: ins.opcode,
                    escape_0f: ins.escape_0f,
                }
                .into());
            }
            InsnKind::Unsupported | InsnKind::Extension(_) => {
                return Err(DbtError::UnsupportedOpcode {
                    pc: cur,
                    opcode: ins.opcode,
                    escape_0f: ins.escape_0f,
                }
                .into());
            }

            InsnKind::Normal => {
                if ins.opsize_prefix {
                    e.put_u8(0x66);
                }
                if ins.rep_prefix != 0 {
                    e.put_u8(ins.rep_prefix);
                }
                if ins.escape_0f {
                    e.put_u8(0x0F);
                }
                e.put_u8(ins.opcode);
                if let (Some(r), Some(rm)) = (ins.r, &ins.rm) {
                    e.put_modrm_rm(r, rm);
                }
                e.put_bytes(ins.imm.raw());
                false
            }

            InsnKind::CallDirect => {
                let dest = next_pc.wrapping_add(ins.imm.rel() as u32);
                e.put_push_imm32(next_pc);
                let patch_addr = e.addr().wrapping_add(1);
                let tramp = direct_trampoline(cache, pool, stubs, dest, patch_addr)?;
                e.put_jmp(tramp);
                true
            }

            InsnKind::CallIndirect => {
                e.put_push_imm32(next_pc);
                let mut rm = ins.rm.unwrap_or(Rm::Reg(0));
                if let Rm::Mem(m) = &mut rm {
                    // The return-address push just moved ESP under an
                    // ESP-relative operand.
                    if m.base == Some(reg::ESP) {
                        m.disp = m.disp.wrapping_add(4);
                    }
                }
                e.put_push_rm(&rm);
                e.put_jmp(stubs.find_indirect_entry);
                true
            }

            InsnKind::Ret => {
                // The return PC is already on top of the guest stack, right
                // where the indirect resolver expects it.
                e.put_jmp(stubs.find_indirect_entry);
                true
            }

            InsnKind::RetImm16 => {
                let n = ins.imm.as_u16() as i32;
                // Move the return PC to where ESP will point after the
                // argument bytes are dropped, then drop them.
                let rm = Rm::mem(reg::ESP, n - 4);
                e.put_pop_rm(&rm);
                e.put_lea(reg::ESP, &rm);
                e.put_jmp(stubs.find_indirect_entry);
                true
            }

            InsnKind::JmpDirect => {
                let dest = next_pc.wrapping_add(ins.imm.rel() as u32);
                let patch_addr = e.addr().wrapping_add(1);
                let tramp = direct_trampoline(cache, pool, stubs, dest, patch_addr)?;
                e.put_jmp(tramp);
                true
            }

            InsnKind::JmpIndirect => {
                if let Some(rm) = &ins.rm {
                    e.put_push_rm(rm);
                }
                e.put_jmp(stubs.find_indirect_entry);
                true
            }

            InsnKind::Jcc(cond) => {
                let taken = next_pc.wrapping_add(ins.imm.rel() as u32);
                let patch_taken = e.addr().wrapping_add(2);
                let tramp_taken = direct_trampoline(cache, pool, stubs, taken, patch_taken)?;
                e.put_jcc(cond, tramp_taken);
                let patch_ft = e.addr().wrapping_add(1);
                let tramp_ft = direct_trampoline(cache, pool, stubs, next_pc, patch_ft)?;
                e.put_jmp(tramp_ft);
                true
            }

            InsnKind::JccShort => {
                // LOOP/LOOPE/LOOPNE/JECXZ only exist in rel8 form. Keep the
                // opcode but point it two bytes ahead, over a rel8 jump that
                // reaches the fallthrough side:
                //   op $+2; jmp $+5; jmp taken; jmp fallthrough
                let taken = next_pc.wrapping_add(ins.imm.rel() as u32);
                e.put_u8(ins.opcode);
                e.put_u8(2);
                e.put_u8(0xEB);
                e.put_u8(5);
                let patch_taken = e.addr().wrapping_add(1);
                let tramp_taken = direct_trampoline(cache, pool, stubs, taken, patch_taken)?;
                e.put_jmp(tramp_taken);
                let patch_ft = e.addr().wrapping_add(1);
                let tramp_ft = direct_trampoline(cache, pool, stubs, next_pc, patch_ft)?;
                e.put_jmp(tramp_ft);
                true
            }

            InsnKind::Int => {
                let vector = ins.imm.raw().first().copied().unwrap_or(0);
                if vector != 0x80 {
                    return Err(DbtError::UnsupportedInt { pc: cur, vector }.into());
                }
                e.put_call(stubs.syscall_entry);
                false
            }

            InsnKind::MovFromSeg => {
                if ins.r != Some(5) {
                    return Err(DbtError::UnsupportedSegment {
                        pc: cur,
                        seg: ins.r.unwrap_or(0),
                    }
                    .into());
                }
                let t = pick_scratch(&ins).ok_or(DbtError::NoScratchRegister { pc: cur })?;
                let rm = ins.rm.unwrap_or(Rm::Reg(0));
                // Spill t, read the emulated GS selector out of TLS, store it
                // to the operand, restore t.
                e.put_fs_prefix();
                e.put_mov_rm_r32(&Rm::disp(tls.scratch), t);
                e.put_fs_prefix();
                e.put_mov_r_rm32(t, &Rm::disp(tls.gs));
                e.put_mov_rm_r32(&rm, t);
                e.put_fs_prefix();
                e.put_mov_r_rm32(t, &Rm::disp(tls.scratch));
                false
            }

            InsnKind::MovToSeg => {
                if ins.r != Some(5) {
                    return Err(DbtError::UnsupportedSegment {
                        pc: cur,
                        seg: ins.r.unwrap_or(0),
                    }
                    .into());
                }
                let t = pick_scratch(&ins).ok_or(DbtError::NoScratchRegister { pc: cur })?;
                let rm = ins.rm.unwrap_or(Rm::Reg(0));
                e.put_fs_prefix();
                e.put_mov_rm_r32(&Rm::disp(tls.scratch), t);
                e.put_mov_r_rm32(t, &rm);
                // Rarely executed, so correctness over speed: take flags and
                // the caller-saved registers across the helper call.
                e.put_pushfd();
                e.put_fs_prefix();
                e.put_mov_rm_r32(&Rm::disp(tls.gs), t);
                // selector >> 3 is the TLS slot; resolve it to the slot's
                // thread-base address via the runtime helper.
                e.put_shr_rm32(&Rm::Reg(t), 3);
                e.put_push_rm(&Rm::Reg(reg::EAX));
                e.put_push_rm(&Rm::Reg(reg::ECX));
                e.put_push_rm(&Rm::Reg(reg::EDX));
                e.put_push_rm(&Rm::Reg(t));
                e.put_call(stubs.tls_slot_to_offset_entry);
                e.put_fs_prefix();
                e.put_mov_r_rm32(t, &Rm::mem(reg::EAX, 0));
                e.put_fs_prefix();
                e.put_mov_rm_r32(&Rm::disp(tls.gs_addr), t);
                e.put_lea(reg::ESP, &Rm::mem(reg::ESP, 4));
                e.put_pop_rm(&Rm::Reg(reg::EDX));
                e.put_pop_rm(&Rm::Reg(reg::ECX));
                e.put_pop_rm(&Rm::Reg(reg::EAX));
                e.put_popfd();
                e.put_fs_prefix();
                e.put_mov_r_rm32(t, &Rm::disp(tls.scratch));
                false
            }
        };

        if e.truncated() {
            return Err(DbtError::BlockTooLarge { pc }.into());
        }
        cur = next_pc;
        if ends_block {
            break;
        }
    }

    let len = e.len();
    match cache.commit_block(&body[..len]) {
        Some(start) => {
            debug_assert_eq!(start, start_addr);
            Ok(start)
        }
        None => Err(TranslateAbort::CacheFull),
    }
}
