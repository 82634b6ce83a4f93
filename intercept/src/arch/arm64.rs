//! AArch64 entry relocation. Every instruction is four bytes; only the
//! PC-relative classes need rewriting, and x16 (IP0) carries absolute
//! addresses where a short form cannot reach.

use crate::code::writer::CodeWriter;
use crate::types::HookError;

/// `b imm26`: ±128 MiB.
pub const NEAR_RANGE: usize = 0x07FF_FFFC;
pub const NEAR_JMP_SIZE: usize = 4;
/// `ldr x16, #8; br x16; .quad target`.
pub const FAR_JMP_SIZE: usize = 16;

const LDR_X16_LITERAL_8: u32 = 0x5800_0050;
const BR_X16: u32 = 0xD61F_0200;
const BLR_X16: u32 = 0xD63F_0200;
const B_PLUS_12: u32 = 0x1400_0003;
const NOP: u32 = 0xD503_201F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Other,
    B,
    Bl,
    BCond,
    CbzCbnz,
    TbzTbnz,
    Adr,
    Adrp,
    /// LDR Xt/Wt/LDRSW literal: `load` is the register-offset form to emit.
    LdrLiteral { load: u32 },
    /// SIMD/FP literals and anything else position-dependent we do not rewrite.
    Unsupported,
    Ret,
}

fn classify(insn: u32) -> InsnKind {
    match insn & 0xFC00_0000 {
        0x1400_0000 => return InsnKind::B,
        0x9400_0000 => return InsnKind::Bl,
        _ => {}
    }
    if insn & 0xFFFF_FC1F == 0xD65F_0000 {
        return InsnKind::Ret;
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        return InsnKind::BCond;
    }
    match insn & 0x7E00_0000 {
        0x3400_0000 => return InsnKind::CbzCbnz,
        0x3600_0000 => return InsnKind::TbzTbnz,
        _ => {}
    }
    match insn & 0x9F00_0000 {
        0x1000_0000 => return InsnKind::Adr,
        0x9000_0000 => return InsnKind::Adrp,
        _ => {}
    }
    match insn & 0xFF00_0000 {
        // ldr xt, [x16]
        0x5800_0000 => InsnKind::LdrLiteral { load: 0xF940_0200 },
        // ldr wt, [x16]
        0x1800_0000 => InsnKind::LdrLiteral { load: 0xB940_0200 },
        // ldrsw xt, [x16]
        0x9800_0000 => InsnKind::LdrLiteral { load: 0xB980_0200 },
        0x1C00_0000 | 0x5C00_0000 | 0x9C00_0000 => InsnKind::Unsupported,
        _ => InsnKind::Other,
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn imm19_target(pc: u64, insn: u32) -> u64 {
    pc.wrapping_add((sign_extend((insn >> 5) & 0x7_FFFF, 19) << 2) as u64)
}

/// Load `value` into `rt` from an inline literal and continue after it.
unsafe fn put_load_literal(w: &mut CodeWriter, rt: u32, value: u64) {
    unsafe {
        w.put_u32_le(0x5800_0040 | rt); // ldr xt, #8
        w.put_u32_le(B_PLUS_12);
        w.put_u64_le(value);
    }
}

/// `ldr x16, #8; br x16; .quad target`.
///
/// # Safety
/// The writer must have room for 16 bytes.
pub unsafe fn put_jmp_far(w: &mut CodeWriter, target: u64) {
    unsafe {
        w.put_u32_le(LDR_X16_LITERAL_8);
        w.put_u32_le(BR_X16);
        w.put_u64_le(target);
    }
}

fn b_from(pc: u64, target: u64) -> Option<u32> {
    let delta = (target as i64).wrapping_sub(pc as i64);
    if delta % 4 != 0 || delta.unsigned_abs() > NEAR_RANGE as u64 {
        return None;
    }
    Some(0x1400_0000 | ((delta >> 2) as u32 & 0x03FF_FFFF))
}

pub fn near_reachable(pc: u64, target: u64) -> bool {
    b_from(pc, target).is_some()
}

/// Copy whole instructions from `code` (which executes at `pc`) into `w`
/// until at least `min_bytes` are covered. Returns the bytes consumed.
///
/// # Safety
/// The writer must have room for 24 bytes per relocated instruction.
pub unsafe fn relocate(
    code: &[u8],
    pc: u64,
    min_bytes: usize,
    w: &mut CodeWriter,
) -> Result<usize, HookError> {
    let failed = || HookError::RelocationFailed(pc as usize);
    let mut consumed = 0;

    while consumed < min_bytes {
        let raw = code.get(consumed..consumed + 4).ok_or_else(failed)?;
        let insn = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let src_pc = pc + consumed as u64;

        unsafe {
            match classify(insn) {
                InsnKind::Other => w.put_u32_le(insn),
                InsnKind::Ret | InsnKind::Unsupported => return Err(failed()),
                InsnKind::B => {
                    let target = src_pc.wrapping_add((sign_extend(insn & 0x03FF_FFFF, 26) << 2) as u64);
                    put_jmp_far(w, target);
                }
                InsnKind::Bl => {
                    let target = src_pc.wrapping_add((sign_extend(insn & 0x03FF_FFFF, 26) << 2) as u64);
                    put_load_literal(w, 16, target);
                    w.put_u32_le(BLR_X16);
                }
                InsnKind::BCond => {
                    // Inverted condition skips the 16-byte far jump.
                    w.put_u32_le((insn & 0xFF00_001F) ^ 1 | (5 << 5));
                    put_jmp_far(w, imm19_target(src_pc, insn));
                }
                InsnKind::CbzCbnz => {
                    w.put_u32_le((insn & 0xFF00_001F) ^ (1 << 24) | (5 << 5));
                    put_jmp_far(w, imm19_target(src_pc, insn));
                }
                InsnKind::TbzTbnz => {
                    let target =
                        src_pc.wrapping_add((sign_extend((insn >> 5) & 0x3FFF, 14) << 2) as u64);
                    w.put_u32_le((insn & 0xFFF8_001F) ^ (1 << 24) | (5 << 5));
                    put_jmp_far(w, target);
                }
                InsnKind::Adr => {
                    let imm = ((insn >> 5) & 0x7_FFFF) << 2 | (insn >> 29) & 3;
                    let value = src_pc.wrapping_add(sign_extend(imm, 21) as u64);
                    put_load_literal(w, insn & 0x1F, value);
                }
                InsnKind::Adrp => {
                    let imm = ((insn >> 5) & 0x7_FFFF) << 2 | (insn >> 29) & 3;
                    let value = (src_pc & !0xFFF).wrapping_add((sign_extend(imm, 21) << 12) as u64);
                    put_load_literal(w, insn & 0x1F, value);
                }
                InsnKind::LdrLiteral { load } => {
                    put_load_literal(w, 16, imm19_target(src_pc, insn));
                    w.put_u32_le(load | (insn & 0x1F));
                }
            }
        }
        consumed += 4;
    }
    Ok(consumed)
}

/// The bytes that send `pc` to `target`: a single `b` when it reaches,
/// otherwise the 16-byte far form. `len` is padded with NOPs.
pub fn entry_jump(pc: u64, target: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len.max(FAR_JMP_SIZE));
    match b_from(pc, target) {
        Some(b) => out.extend_from_slice(&b.to_le_bytes()),
        None => {
            out.extend_from_slice(&LDR_X16_LITERAL_8.to_le_bytes());
            out.extend_from_slice(&BR_X16.to_le_bytes());
            out.extend_from_slice(&target.to_le_bytes());
        }
    }
    while out.len() < len {
        out.extend_from_slice(&NOP.to_le_bytes());
    }
    out.truncate(len);
    out
}
