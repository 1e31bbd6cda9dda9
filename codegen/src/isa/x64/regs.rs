//! x86-64 registers, condition codes and ABI register sets.

use crate::isa::CallConv;

/// General purpose registers, in hardware encoding order.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// Hardware encoding, 0..15.
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }

    pub fn from_enc(enc: u8) -> Gpr {
        use Gpr::*;
        const TABLE: [Gpr; 16] =
            [Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi, R8, R9, R10, R11, R12, R13, R14, R15];
        TABLE[enc as usize]
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self as usize]
    }
}

/// SSE registers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }

    pub fn from_enc(enc: u8) -> Xmm {
        use Xmm::*;
        const TABLE: [Xmm; 16] = [
            Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7, Xmm8, Xmm9, Xmm10, Xmm11, Xmm12,
            Xmm13, Xmm14, Xmm15,
        ];
        TABLE[enc as usize]
    }
}

/// x86 condition codes, in `Jcc`/`setcc` encoding order.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Nb = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    #[inline]
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// The opposite condition. Encodings pair up, so this is a bit flip.
    pub fn invert(self) -> Cond {
        use Cond::*;
        const TABLE: [Cond; 16] = [O, No, B, Nb, E, Ne, Be, A, S, Ns, P, Np, L, Ge, Le, G];
        TABLE[(self as usize) ^ 1]
    }
}

/// Allocation order. The scratch registers come first so short-lived
/// values avoid dirtying callee-saved state.
pub const GPR_PRIORITY: [Gpr; 14] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::Rdi,
    Gpr::Rsi,
    Gpr::Rbx,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// System V integer argument registers.
pub const SYSV_PARAM_GPRS: [Gpr; 6] =
    [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Windows x64 integer argument registers.
pub const WIN64_PARAM_GPRS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];

const fn gpr_mask(regs: &[Gpr]) -> u16 {
    let mut mask = 0u16;
    let mut i = 0;
    while i < regs.len() {
        mask |= 1 << regs[i] as u16;
        i += 1;
    }
    mask
}

/// Callee-saved GPRs under System V: rbx, rbp, r12..r15.
pub const SYSV_CALLEE_SAVED: u16 =
    gpr_mask(&[Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15]);

/// Callee-saved GPRs under Windows x64: rbx, rbp, rdi, rsi, r12..r15.
pub const WIN64_CALLEE_SAVED: u16 = gpr_mask(&[
    Gpr::Rbx,
    Gpr::Rbp,
    Gpr::Rdi,
    Gpr::Rsi,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
]);

/// The callee-saved GPR mask of a calling convention.
pub fn callee_saved_gprs(cc: CallConv) -> u16 {
    match cc {
        CallConv::SystemV => SYSV_CALLEE_SAVED,
        CallConv::WindowsFastcall => WIN64_CALLEE_SAVED,
    }
}

/// The caller-saved GPR mask of a calling convention, excluding rsp/rbp.
pub fn caller_saved_gprs(cc: CallConv) -> u16 {
    !callee_saved_gprs(cc) & !(1 << Gpr::Rsp as u16) & !(1 << Gpr::Rbp as u16)
}

/// How many integer argument registers a convention provides.
pub fn param_gpr_count(cc: CallConv) -> usize {
    match cc {
        CallConv::SystemV => SYSV_PARAM_GPRS.len(),
        CallConv::WindowsFastcall => WIN64_PARAM_GPRS.len(),
    }
}

/// The integer argument register for position `i`.
pub fn param_gpr(cc: CallConv, i: usize) -> Gpr {
    match cc {
        CallConv::SystemV => SYSV_PARAM_GPRS[i],
        CallConv::WindowsFastcall => WIN64_PARAM_GPRS[i],
    }
}

/// How many XMM argument registers a convention provides.
pub fn param_xmm_count(cc: CallConv) -> usize {
    match cc {
        CallConv::SystemV => 8,
        CallConv::WindowsFastcall => 4,
    }
}

/// The first callee-saved XMM under a convention, or 16 when all are
/// caller-saved. Windows preserves xmm6..xmm15.
pub fn first_callee_saved_xmm(cc: CallConv) -> u8 {
    match cc {
        CallConv::SystemV => 16,
        CallConv::WindowsFastcall => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_inversion_flips_the_low_bit() {
        assert_eq!(Cond::E.invert(), Cond::Ne);
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::B.invert(), Cond::Nb);
        assert_eq!(Cond::A.invert(), Cond::Be);
        assert_eq!(Cond::A.invert().enc(), Cond::A.enc() ^ 1);
    }

    #[test]
    fn abi_masks() {
        assert!(SYSV_CALLEE_SAVED & (1 << Gpr::Rbx as u16) != 0);
        assert!(SYSV_CALLEE_SAVED & (1 << Gpr::Rdi as u16) == 0);
        assert!(WIN64_CALLEE_SAVED & (1 << Gpr::Rdi as u16) != 0);
        assert!(caller_saved_gprs(CallConv::SystemV) & (1 << Gpr::Rsp as u16) == 0);
    }
}
