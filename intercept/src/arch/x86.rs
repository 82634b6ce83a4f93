//! x86 and x86_64 entry relocation.
//!
//! The decoder only needs instruction lengths and the handful of forms whose
//! meaning depends on where they execute. Anything it does not recognise
//! fails the relocation instead of guessing.

use crate::code::writer::CodeWriter;
use crate::types::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Legacy32,
    Long64,
}

#[cfg(target_arch = "x86_64")]
pub const HOST: Mode = Mode::Long64;
#[cfg(target_arch = "x86")]
pub const HOST: Mode = Mode::Legacy32;

/// `jmp rel32`.
pub const NEAR_JMP_SIZE: usize = 5;
/// `jmp [rip+0]; .quad target`.
pub const FAR_JMP_SIZE: usize = 14;

const NOP: u8 = 0x90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Normal,
    /// ModRM with mod=00 rm=101 in long mode; `disp_at` is the offset of the disp32.
    RipRelative { disp_at: usize },
    Jmp,
    Jcc(u8),
    Call,
    Ret,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Insn {
    len: usize,
    kind: InsnKind,
    /// Branch displacement relative to the next instruction.
    branch: i64,
}

fn one_byte_has_modrm(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC6..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn one_byte_imm_size(opcode: u8, modrm: u8, mode: Mode, opsize16: bool, rex_w: bool) -> usize {
    let imm_z = if opsize16 { 2 } else { 4 };
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C | 0xA8 => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D | 0xA9 => imm_z,
        0x68 | 0x69 | 0x81 | 0xC7 => imm_z,
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xC0 | 0xC1 | 0xC6 | 0xCD => 1,
        0xA0..=0xA3 => match mode {
            Mode::Long64 => 8,
            Mode::Legacy32 => 4,
        },
        0xB0..=0xB7 => 1,
        0xB8..=0xBF if rex_w => 8,
        0xB8..=0xBF => imm_z,
        0xC8 => 3,
        // TEST is the only F6/F7 form with an immediate.
        0xF6 if (modrm >> 3) & 7 <= 1 => 1,
        0xF7 if (modrm >> 3) & 7 <= 1 => imm_z,
        _ => 0,
    }
}

fn two_byte_has_modrm(opcode2: u8) -> bool {
    !matches!(
        opcode2,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0xA0..=0xA2 | 0xA8..=0xAA | 0xC8..=0xCF
    )
}

fn two_byte_imm_size(opcode2: u8) -> usize {
    match opcode2 {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

/// Length of a ModRM operand (ModRM, SIB and displacement) starting at
/// `pos`, and where its disp32 sits when it is RIP-relative.
fn modrm_operand(code: &[u8], pos: usize, mode: Mode) -> Option<(usize, Option<usize>)> {
    let modrm = *code.get(pos)?;
    let md = modrm >> 6;
    let rm = modrm & 7;
    if md == 3 {
        return Some((1, None));
    }
    if md == 0 && rm == 5 {
        let rip = (mode == Mode::Long64).then_some(pos + 1);
        return Some((5, rip));
    }
    let mut len = 1;
    if rm == 4 {
        let sib = *code.get(pos + 1)?;
        len += 1;
        if md == 0 && sib & 7 == 5 {
            len += 4;
        }
    }
    len += match md {
        1 => 1,
        2 => 4,
        _ => 0,
    };
    Some((len, None))
}

fn decode(code: &[u8], mode: Mode) -> Option<Insn> {
    let byte = |p: usize| code.get(p).copied();
    let i8_at = |p: usize| byte(p).map(|b| b as i8 as i64);
    let i32_at = |p: usize| -> Option<i64> {
        let raw = code.get(p..p + 4)?;
        Some(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64)
    };
    let plain = |len: usize, kind: InsnKind| (len <= code.len()).then_some(Insn { len, kind, branch: 0 });

    let mut pos = 0;
    let mut opsize16 = false;
    loop {
        match byte(pos)? {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => pos += 1,
            0x66 => {
                opsize16 = true;
                pos += 1;
            }
            // Address-size overrides change ModRM decoding.
            0x67 => return None,
            _ => break,
        }
    }

    let mut rex_w = false;
    if mode == Mode::Long64 && byte(pos)? & 0xF0 == 0x40 {
        rex_w = byte(pos)? & 0x08 != 0;
        pos += 1;
    }

    let opcode = byte(pos)?;
    pos += 1;

    match opcode {
        0xC3 | 0xCB => return plain(pos, InsnKind::Ret),
        0xC2 | 0xCA => return plain(pos + 2, InsnKind::Ret),
        0xCC | 0xF4 => return plain(pos, InsnKind::End),
        0xEB => {
            return Some(Insn { len: pos + 1, kind: InsnKind::Jmp, branch: i8_at(pos)? });
        }
        0xE9 => {
            return Some(Insn { len: pos + 4, kind: InsnKind::Jmp, branch: i32_at(pos)? });
        }
        0xE8 => {
            return Some(Insn { len: pos + 4, kind: InsnKind::Call, branch: i32_at(pos)? });
        }
        0x70..=0x7F => {
            return Some(Insn {
                len: pos + 1,
                kind: InsnKind::Jcc(opcode & 0x0F),
                branch: i8_at(pos)?,
            });
        }
        // LOOPcc/JCXZ have no long form; VEX, EVEX and far transfers are
        // not worth decoding in an entry sequence.
        0xE0..=0xE3 | 0xC4 | 0xC5 | 0x62 | 0x9A | 0xEA => return None,
        0x0F => return decode_two_byte(code, pos, mode),
        _ => {}
    }

    let mut rip = None;
    let mut modrm = 0;
    if one_byte_has_modrm(opcode) {
        modrm = byte(pos)?;
        let (len, disp_at) = modrm_operand(code, pos, mode)?;
        pos += len;
        rip = disp_at;
    }
    pos += one_byte_imm_size(opcode, modrm, mode, opsize16, rex_w);

    let kind = match rip {
        Some(disp_at) => InsnKind::RipRelative { disp_at },
        None => InsnKind::Normal,
    };
    (pos <= code.len()).then_some(Insn { len: pos, kind, branch: 0 })
}

fn decode_two_byte(code: &[u8], mut pos: usize, mode: Mode) -> Option<Insn> {
    let opcode2 = *code.get(pos)?;
    pos += 1;

    if opcode2 == 0x0B {
        return Some(Insn { len: pos, kind: InsnKind::End, branch: 0 });
    }
    if (0x80..=0x8F).contains(&opcode2) {
        let raw = code.get(pos..pos + 4)?;
        return Some(Insn {
            len: pos + 4,
            kind: InsnKind::Jcc(opcode2 & 0x0F),
            branch: i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
        });
    }

    let imm = match opcode2 {
        0x38 => {
            pos += 1;
            0
        }
        0x3A => {
            pos += 1;
            1
        }
        _ => two_byte_imm_size(opcode2),
    };

    let mut rip = None;
    if matches!(opcode2, 0x38 | 0x3A) || two_byte_has_modrm(opcode2) {
        let (len, disp_at) = modrm_operand(code, pos, mode)?;
        pos += len;
        rip = disp_at;
    }
    pos += imm;

    let kind = match rip {
        Some(disp_at) => InsnKind::RipRelative { disp_at },
        None => InsnKind::Normal,
    };
    (pos <= code.len()).then_some(Insn { len: pos, kind, branch: 0 })
}

/// ENDBR64 / ENDBR32.
pub fn is_endbr(code: &[u8]) -> bool {
    matches!(code, [0xF3, 0x0F, 0x1E, 0xFA | 0xFB, ..])
}

fn rel32_from(pc: u64, len: usize, target: u64) -> Option<i32> {
    let rel = (target as i64).wrapping_sub(pc as i64 + len as i64);
    i32::try_from(rel).ok()
}

/// Whether a `jmp rel32` at `pc` can reach `target`.
pub fn near_reachable(pc: u64, target: u64, mode: Mode) -> bool {
    mode == Mode::Legacy32 || rel32_from(pc, NEAR_JMP_SIZE, target).is_some()
}

/// `jmp rel32`. In legacy mode the displacement wraps, so it always reaches.
///
/// # Safety
/// The writer must have room for 5 bytes.
pub unsafe fn put_jmp_near(w: &mut CodeWriter, target: u64) {
    let rel = (target as i64).wrapping_sub(w.pc() as i64 + NEAR_JMP_SIZE as i64);
    unsafe {
        w.put_bytes(&[0xE9]);
        w.put_u32_le(rel as u32);
    }
}

/// `jmp [rip+0]` followed by the absolute target.
///
/// # Safety
/// The writer must have room for 14 bytes.
pub unsafe fn put_jmp_far(w: &mut CodeWriter, target: u64) {
    unsafe {
        w.put_bytes(&[0xFF, 0x25, 0, 0, 0, 0]);
        w.put_u64_le(target);
    }
}

/// The shortest jump from the writer's position to `target`.
///
/// # Safety
/// The writer must have room for 14 bytes.
pub unsafe fn put_jmp(w: &mut CodeWriter, target: u64, mode: Mode) {
    unsafe {
        if near_reachable(w.pc(), target, mode) {
            put_jmp_near(w, target);
        } else {
            put_jmp_far(w, target);
        }
    }
}

/// Copy whole instructions from `code` (which executes at `pc`) into `w`
/// until at least `min_bytes` are covered, rewriting position-dependent
/// forms. Returns the number of source bytes consumed.
///
/// # Safety
/// The writer must have room for the rewritten sequence; 64 bytes per
/// instruction is always enough.
pub unsafe fn relocate(
    code: &[u8],
    pc: u64,
    min_bytes: usize,
    w: &mut CodeWriter,
    mode: Mode,
) -> Result<usize, HookError> {
    let failed = || HookError::RelocationFailed(pc as usize);
    let mut consumed = 0;

    while consumed < min_bytes {
        let insn = decode(&code[consumed..], mode).ok_or_else(failed)?;
        let src_pc = pc + consumed as u64;
        let bytes = &code[consumed..consumed + insn.len];
        let target = (src_pc as i64 + insn.len as i64).wrapping_add(insn.branch) as u64;

        match insn.kind {
            // The function ends inside the bytes a jump would overwrite.
            InsnKind::Ret | InsnKind::End => return Err(failed()),
            InsnKind::Normal => unsafe { w.put_bytes(bytes) },
            InsnKind::RipRelative { disp_at } => {
                let raw = &bytes[disp_at..disp_at + 4];
                let disp = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64;
                let absolute = (src_pc as i64 + insn.len as i64 + disp) as u64;
                let moved = rel32_from(w.pc(), insn.len, absolute).ok_or_else(failed)?;
                let mut patched = bytes.to_vec();
                patched[disp_at..disp_at + 4].copy_from_slice(&moved.to_le_bytes());
                unsafe { w.put_bytes(&patched) };
            }
            InsnKind::Jmp => unsafe { put_jmp(w, target, mode) },
            InsnKind::Jcc(cc) => unsafe {
                // Inverted short branch over a jump to the original target.
                let skip = match mode {
                    Mode::Long64 => FAR_JMP_SIZE,
                    Mode::Legacy32 => NEAR_JMP_SIZE,
                };
                w.put_bytes(&[0x70 | (cc ^ 1), skip as u8]);
                match mode {
                    Mode::Long64 => put_jmp_far(w, target),
                    Mode::Legacy32 => put_jmp_near(w, target),
                }
            },
            InsnKind::Call => unsafe {
                let return_to = src_pc + insn.len as u64;
                match (mode, insn.branch) {
                    // `call $+5; pop reg` reads its own address: push the original one.
                    (Mode::Legacy32, 0) => {
                        w.put_bytes(&[0x68]);
                        w.put_u32_le(return_to as u32);
                    }
                    (Mode::Legacy32, _) => {
                        let rel = (target as i64).wrapping_sub(w.pc() as i64 + 5);
                        w.put_bytes(&[0xE8]);
                        w.put_u32_le(rel as u32);
                    }
                    // r11 is scratch under both 64-bit conventions.
                    (Mode::Long64, 0) => {
                        w.put_bytes(&[0x49, 0xBB]);
                        w.put_u64_le(return_to);
                        w.put_bytes(&[0x41, 0x53]);
                    }
                    (Mode::Long64, _) => {
                        w.put_bytes(&[0x49, 0xBB]);
                        w.put_u64_le(target);
                        w.put_bytes(&[0x41, 0xFF, 0xD3]);
                    }
                }
            },
        }
        consumed += insn.len;
    }
    Ok(consumed)
}

/// The bytes that send `pc` to `target`, padded with NOPs to `len`.
pub fn entry_jump(pc: u64, target: u64, len: usize, mode: Mode) -> Vec<u8> {
    let mut buf = vec![NOP; len.max(FAR_JMP_SIZE)];
    unsafe {
        let mut w = CodeWriter::at(buf.as_mut_ptr(), buf.len(), pc);
        if near_reachable(pc, target, mode) {
            put_jmp_near(&mut w, target);
        } else {
            put_jmp_far(&mut w, target);
        }
    }
    buf.truncate(len);
    buf
}
