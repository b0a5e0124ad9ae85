//! AArch64 instruction encoding and patching.
//!
//! Immediates are materialized by a `MOVZ` followed by up to three `MOVK`s
//! on the same register, each carrying 16 bits. Calls are `B`/`BL` with a
//! 26-bit word offset (±128MB); farther targets go through a trampoline
//! that loads the destination from a literal.

use super::codebuf::CodeBuffer;
use super::patch::{Arch, INSN_BYTES, PatchError, PatchKind, PatchSet};

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u8 {
        self as u8
    }
}

const MOVZ_X: u32 = 0xD2800000;
const MOVK_X: u32 = 0xF2800000;
const MOVE_WIDE_MASK: u32 = 0x1F800000;
const MOVE_WIDE: u32 = 0x12800000;
const OPC_MOVZ: u32 = 0b10;
const OPC_MOVK: u32 = 0b11;

const BRANCH_MASK: u32 = 0xFC000000;
const B: u32 = 0x14000000;
const BL: u32 = 0x94000000;
const BRANCH_RANGE: i64 = 1 << 27;

/// Words in a call trampoline: `ldr x16, #8; br x16; .quad dest`.
pub const TRAMPOLINE_WORDS: usize = 4;

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit(inst);
    }

    // ==================== Moves ====================

    /// MOVZ Xd, #imm16, LSL #(hw * 16)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1101 0010 1hhi iiii iiii iiii iiid dddd
        self.emit_raw(encode_move_wide(MOVZ_X, rd, imm16, hw));
    }

    /// MOVK Xd, #imm16, LSL #(hw * 16)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1111 0010 1hhi iiii iiii iiii iiid dddd
        self.emit_raw(encode_move_wide(MOVK_X, rd, imm16, hw));
    }

    /// Load a full 64-bit value: MOVZ then three MOVKs.
    pub fn mov_imm64(&mut self, rd: Reg, value: u64) {
        self.movz(rd, value as u16, 0);
        for hw in 1..4u8 {
            self.movk(rd, (value >> (16 * hw as u32)) as u16, hw);
        }
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        // 1010 1010 000m mmmm 0000 00nn nnnd dddd
        let inst = 0xAA000000
            | ((rm.code() as u32) << 16)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOV Xd, Xm (register to register)
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        // ORR Xd, XZR, Xm
        self.orr(rd, Reg::XZR, rm);
    }

    // ==================== Loads ====================

    /// LDR Xt, label (64-bit literal, `offset` bytes from this instruction)
    pub fn ldr_literal(&mut self, rt: Reg, offset: i32) {
        // 0101 1000 iiii iiii iiii iiii iiit tttt
        let inst = 0x58000000
            | (((offset / 4) as u32 & 0x7FFFF) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Branches ====================

    /// B label (unconditional branch)
    pub fn b(&mut self, offset: i32) {
        // 0001 01ii iiii iiii iiii iiii iiii iiii
        self.emit_raw(B | ((offset / 4) as u32 & 0x03FFFFFF));
    }

    /// BL label (branch and link)
    pub fn bl(&mut self, offset: i32) {
        // 1001 01ii iiii iiii iiii iiii iiii iiii
        self.emit_raw(BL | ((offset / 4) as u32 & 0x03FFFFFF));
    }

    /// BR Xn (branch to register)
    pub fn br(&mut self, rn: Reg) {
        // 1101 0110 0001 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD61F0000 | ((rn.code() as u32) << 5));
    }

    /// BLR Xn (branch and link to register)
    pub fn blr(&mut self, rn: Reg) {
        // 1101 0110 0011 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD63F0000 | ((rn.code() as u32) << 5));
    }
}

fn encode_move_wide(base: u32, rd: Reg, imm16: u16, hw: u8) -> u32 {
    base | (((hw & 0x3) as u32) << 21) | ((imm16 as u32) << 5) | (rd.code() as u32)
}

/// A decoded MOVZ/MOVK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveWide {
    pub keep: bool,
    pub hw: u32,
    pub imm16: u16,
    pub rd: u32,
}

/// Decode a MOVZ or MOVK (either width). Other instructions give `None`.
pub fn decode_move_wide(insn: u32) -> Option<MoveWide> {
    if insn & MOVE_WIDE_MASK != MOVE_WIDE {
        return None;
    }
    let keep = match (insn >> 29) & 0x3 {
        OPC_MOVZ => false,
        OPC_MOVK => true,
        _ => return None,
    };
    Some(MoveWide {
        keep,
        hw: (insn >> 21) & 0x3,
        imm16: ((insn >> 5) & 0xFFFF) as u16,
        rd: insn & 0x1F,
    })
}

fn with_imm16(insn: u32, imm16: u16) -> u32 {
    (insn & !(0xFFFF << 5)) | ((imm16 as u32) << 5)
}

/// The value loaded by a MOVZ/MOVK sequence.
pub fn move_wide_value(words: &[u32]) -> Option<u64> {
    words.iter().try_fold(0u64, |acc, &insn| {
        let mw = decode_move_wide(insn)?;
        Some(acc | ((mw.imm16 as u64) << (16 * mw.hw)))
    })
}

/// Byte offset of a B/BL.
pub fn branch_offset(insn: u32) -> i64 {
    // Sign-extend imm26 and scale by 4.
    (((insn << 6) as i32) >> 4) as i64
}

fn is_branch(insn: u32) -> bool {
    matches!(insn & BRANCH_MASK, B | BL)
}

fn branch_in_range(from: usize, to: usize) -> Option<i64> {
    let offset = (to as i64).wrapping_sub(from as i64);
    (offset % 4 == 0 && (-BRANCH_RANGE..BRANCH_RANGE).contains(&offset)).then_some(offset)
}

fn retarget_branch(insn: u32, offset: i64) -> u32 {
    (insn & BRANCH_MASK) | (((offset >> 2) as u32) & 0x03FFFFFF)
}

/// Encode a trampoline that jumps to `destination`.
pub fn encode_trampoline(destination: usize) -> Vec<u32> {
    let mut buf = CodeBuffer::with_capacity(TRAMPOLINE_WORDS);
    let mut asm = AArch64Assembler::new(&mut buf);
    asm.ldr_literal(Reg::X16, 8);
    asm.br(Reg::X16);
    buf.emit_u64(destination as u64);
    buf.into_words()
}

/// 64-bit ARM.
pub struct AArch64;

impl Arch for AArch64 {
    const NAME: &'static str = "aarch64";
    const STUB_WORDS: usize = 10;

    fn flush_icache_word(address: *const u32) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            // Clean to the point of unification, then invalidate the I-line.
            std::arch::asm!(
                "dc cvau, {0}",
                "dsb ish",
                "ic ivau, {0}",
                "dsb ish",
                "isb",
                in(reg) address,
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = address;
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn patch_immediate(
        patch: &mut PatchSet<'_, '_, Self>,
        address: usize,
        value: u64,
        _kind: PatchKind,
    ) -> Result<(), PatchError> {
        let first = patch.read(address)?;
        let head = match decode_move_wide(first) {
            Some(mw) if !mw.keep && mw.hw == 0 => mw,
            _ => return Err(PatchError::UnexpectedInstruction { address, word: first }),
        };

        let mut sites = vec![(address, first)];
        while sites.len() < 4 {
            let next = address + sites.len() * INSN_BYTES;
            if !patch.space().contains(next) {
                break;
            }
            let word = patch.read(next)?;
            match decode_move_wide(word) {
                Some(mw) if mw.keep && mw.rd == head.rd && mw.hw as usize == sites.len() => {
                    sites.push((next, word));
                }
                _ => break,
            }
        }

        let bits = 16 * sites.len() as u32;
        if bits < 64 && value >> bits != 0 {
            return Err(PatchError::ImmediateOutOfRange { value, bits });
        }
        for (i, &(site, word)) in sites.iter().enumerate() {
            patch.stage(site, with_imm16(word, (value >> (16 * i)) as u16))?;
        }
        Ok(())
    }

    fn patch_call(
        patch: &mut PatchSet<'_, '_, Self>,
        call_site: usize,
        destination: usize,
        trampoline: Option<usize>,
    ) -> Result<(), PatchError> {
        let insn = patch.read(call_site)?;
        if !is_branch(insn) {
            return Err(PatchError::UnexpectedInstruction {
                address: call_site,
                word: insn,
            });
        }

        if let Some(offset) = branch_in_range(call_site, destination) {
            return patch.stage(call_site, retarget_branch(insn, offset));
        }

        let out_of_range = PatchError::CallOutOfRange {
            call_site,
            destination,
        };
        let Some(trampoline) = trampoline else {
            return Err(out_of_range);
        };
        let offset = branch_in_range(call_site, trampoline).ok_or(out_of_range)?;
        for (i, word) in encode_trampoline(destination).into_iter().enumerate() {
            patch.stage(trampoline + i * INSN_BYTES, word)?;
        }
        patch.stage(call_site, retarget_branch(insn, offset))
    }

    fn encode_native_stub(
        _stub_address: usize,
        entry_point: usize,
        arity: u32,
        call_emulator: usize,
    ) -> Result<Vec<u32>, PatchError> {
        let arity = u16::try_from(arity).map_err(|_| PatchError::ImmediateOutOfRange {
            value: arity as u64,
            bits: 16,
        })?;

        let mut buf = CodeBuffer::with_capacity(Self::STUB_WORDS);
        let mut asm = AArch64Assembler::new(&mut buf);
        asm.mov_imm64(Reg::X16, entry_point as u64);
        // Return address into the interpreter.
        asm.mov(Reg::X17, Reg::Lr);
        asm.movz(Reg::X9, arity, 0);
        asm.ldr_literal(Reg::X10, 8);
        asm.blr(Reg::X10);
        buf.emit_u64(call_emulator as u64);
        Ok(buf.into_words())
    }
}
