//! SPARC instruction patching.
//!
//! Constants are loaded with a `sethi %hi(value), %rd` / `or %rd, %lo(value), %rd`
//! pair: `sethi` sets the upper 22 bits, `or` merges in the low 10.
//! Calls are `call disp30`, which reaches the whole 32-bit address space.

use super::codebuf::CodeBuffer;
use super::patch::{Arch, CodeSpace, INSN_BYTES, PatchError, PatchKind, PatchSet, patch_immediate};

/// SPARC V8 (32-bit addresses).
pub struct Sparc;

/// SPARC registers used by generated stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    G0 = 0,
    G1 = 1,
    O7 = 15,
    L6 = 22,
    L7 = 23,
}

impl Reg {
    pub fn code(self) -> u32 {
        self as u32
    }
}

const SETHI_IMM_MASK: u32 = 0x003F_FFFF;
const OR_IMM_MASK: u32 = 0x3FF;
const SIMM13_MAX: u32 = 0x0FFF;

/// Replace the 22-bit immediate of a `sethi`.
pub fn patch_sethi(insn: u32, imm22: u32) -> u32 {
    (insn & !SETHI_IMM_MASK) | (imm22 & SETHI_IMM_MASK)
}

/// Replace the immediate of an `or rs1, simm13, rd` with a 10-bit low part.
pub fn patch_ori(insn: u32, imm10: u32) -> u32 {
    (insn & 0xFFFF_E000) | (imm10 & OR_IMM_MASK)
}

/// The 22-bit immediate of a `sethi`.
pub fn sethi_imm(insn: u32) -> u32 {
    insn & SETHI_IMM_MASK
}

/// The low 10 bits of an `or` immediate.
pub fn ori_imm(insn: u32) -> u32 {
    insn & OR_IMM_MASK
}

fn is_sethi(insn: u32) -> bool {
    // op = 00, op2 = 100
    insn >> 30 == 0 && (insn >> 22) & 0x7 == 0b100
}

fn is_or_imm(insn: u32) -> bool {
    // op = 10, op3 = 000010, i = 1
    insn >> 30 == 0b10 && (insn >> 19) & 0x3F == 0b000010 && insn & (1 << 13) != 0
}

/// Rebind the `sethi`/`or` entry-point load of a fun to `entry`.
pub fn patch_fun_entry<'s, 'a>(
    space: &'s mut CodeSpace<'a>,
    address: usize,
    entry: u32,
) -> Result<PatchSet<'s, 'a, Sparc>, PatchError> {
    patch_immediate::<Sparc>(space, address, entry as u64, PatchKind::FunEntry)
}

/// `call disp30` from `from` to `to`.
pub fn encode_call(from: usize, to: usize) -> Result<u32, PatchError> {
    let rel = (to as i64).wrapping_sub(from as i64);
    if rel < i32::MIN as i64 || rel > i32::MAX as i64 || rel % 4 != 0 {
        return Err(PatchError::CallOutOfRange {
            call_site: from,
            destination: to,
        });
    }
    Ok((1 << 30) | (((rel as u32) >> 2) & 0x3FFF_FFFF))
}

/// Byte displacement of a `call`.
pub fn call_displacement(insn: u32) -> i32 {
    (insn << 2) as i32
}

/// SPARC assembler for the few instructions stubs need.
pub struct SparcAssembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> SparcAssembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// sethi %hi(imm), rd
    pub fn sethi(&mut self, rd: Reg, imm: u32) {
        self.buf
            .emit(0x0100_0000 | (rd.code() << 25) | ((imm >> 10) & SETHI_IMM_MASK));
    }

    /// or rs1, simm13, rd
    pub fn or_imm(&mut self, rd: Reg, rs1: Reg, simm13: u32) {
        self.buf.emit(
            0x8010_2000 | (rd.code() << 25) | (rs1.code() << 14) | (simm13 & 0x1FFF),
        );
    }

    /// or %g0, rs2, rd (mov rs2, rd)
    pub fn mov(&mut self, rd: Reg, rs2: Reg) {
        self.buf
            .emit(0x8010_0000 | (rd.code() << 25) | (Reg::G0.code() << 14) | rs2.code());
    }

    /// call, given the addresses of the call and its target
    pub fn call(&mut self, from: usize, to: usize) -> Result<(), PatchError> {
        self.buf.emit(encode_call(from, to)?);
        Ok(())
    }
}

impl Arch for Sparc {
    const NAME: &'static str = "sparc";
    const STUB_WORDS: usize = 5;

    fn flush_icache_word(address: *const u32) {
        #[cfg(target_arch = "sparc64")]
        {
            unsafe extern "C" {
                fn native_flush_icache_word(address: *const u32);
            }
            // SAFETY: flushes one word, provided by the runtime's assembly glue.
            unsafe { native_flush_icache_word(address) };
        }
        #[cfg(not(target_arch = "sparc64"))]
        {
            // Code for a foreign target is never executed here; only the
            // ordering of the writes matters.
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
        let value = u32::try_from(value)
            .map_err(|_| PatchError::ImmediateOutOfRange { value, bits: 32 })?;
        let lo_address = address + INSN_BYTES;
        let hi = patch.read(address)?;
        let lo = patch.read(lo_address)?;
        if !is_sethi(hi) {
            return Err(PatchError::UnexpectedInstruction { address, word: hi });
        }
        if !is_or_imm(lo) {
            return Err(PatchError::UnexpectedInstruction {
                address: lo_address,
                word: lo,
            });
        }
        patch.stage(address, patch_sethi(hi, value >> 10))?;
        patch.stage(lo_address, patch_ori(lo, value))
    }

    fn patch_call(
        patch: &mut PatchSet<'_, '_, Self>,
        call_site: usize,
        destination: usize,
        trampoline: Option<usize>,
    ) -> Result<(), PatchError> {
        if trampoline.is_some() {
            return Err(PatchError::TrampolineUnsupported);
        }
        patch.read(call_site)?;
        patch.stage(call_site, encode_call(call_site, destination)?)
    }

    fn encode_native_stub(
        stub_address: usize,
        entry_point: usize,
        arity: u32,
        call_emulator: usize,
    ) -> Result<Vec<u32>, PatchError> {
        let entry = u32::try_from(entry_point).map_err(|_| PatchError::ImmediateOutOfRange {
            value: entry_point as u64,
            bits: 32,
        })?;
        if arity > SIMM13_MAX {
            return Err(PatchError::ImmediateOutOfRange {
                value: arity as u64,
                bits: 12,
            });
        }

        let mut buf = CodeBuffer::with_capacity(Self::STUB_WORDS);
        let mut asm = SparcAssembler::new(&mut buf);
        asm.sethi(Reg::G1, entry);
        // The return address into the interpreter survives the call in %l6.
        asm.mov(Reg::L6, Reg::O7);
        asm.or_imm(Reg::G1, Reg::G1, entry & OR_IMM_MASK);
        asm.call(stub_address + 3 * INSN_BYTES, call_emulator)?;
        // Delay slot.
        asm.or_imm(Reg::L7, Reg::G0, arity);
        Ok(buf.into_words())
    }
}
