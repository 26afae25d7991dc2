#![allow(non_upper_case_globals)]

use std::convert::TryFrom;
use std::fmt::{Display, Formatter, Result};

/// A debugger register number in the standard amd64 numbering. The inner
/// u32 is deliberately NOT pub; arbitrary values must go through TryFrom.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GdbRegister(u32);

pub const DREG_RAX: GdbRegister = GdbRegister(0);
pub const DREG_RBX: GdbRegister = GdbRegister(1);
pub const DREG_RCX: GdbRegister = GdbRegister(2);
pub const DREG_RDX: GdbRegister = GdbRegister(3);
pub const DREG_RSI: GdbRegister = GdbRegister(4);
pub const DREG_RDI: GdbRegister = GdbRegister(5);
pub const DREG_RBP: GdbRegister = GdbRegister(6);
pub const DREG_RSP: GdbRegister = GdbRegister(7);
pub const DREG_R8: GdbRegister = GdbRegister(8);
pub const DREG_R9: GdbRegister = GdbRegister(9);
pub const DREG_R10: GdbRegister = GdbRegister(10);
pub const DREG_R11: GdbRegister = GdbRegister(11);
pub const DREG_R12: GdbRegister = GdbRegister(12);
pub const DREG_R13: GdbRegister = GdbRegister(13);
pub const DREG_R14: GdbRegister = GdbRegister(14);
pub const DREG_R15: GdbRegister = GdbRegister(15);
pub const DREG_RIP: GdbRegister = GdbRegister(16);
pub const DREG_EFLAGS: GdbRegister = GdbRegister(17);
pub const DREG_CS: GdbRegister = GdbRegister(18);
pub const DREG_SS: GdbRegister = GdbRegister(19);
pub const DREG_DS: GdbRegister = GdbRegister(20);
pub const DREG_ES: GdbRegister = GdbRegister(21);
pub const DREG_FS: GdbRegister = GdbRegister(22);
pub const DREG_GS: GdbRegister = GdbRegister(23);
pub const DREG_FIRST_FXSAVE_REG: GdbRegister = GdbRegister(24);
pub const DREG_ST0: GdbRegister = GdbRegister(24);
pub const DREG_ST1: GdbRegister = GdbRegister(25);
pub const DREG_ST2: GdbRegister = GdbRegister(26);
pub const DREG_ST3: GdbRegister = GdbRegister(27);
pub const DREG_ST4: GdbRegister = GdbRegister(28);
pub const DREG_ST5: GdbRegister = GdbRegister(29);
pub const DREG_ST6: GdbRegister = GdbRegister(30);
pub const DREG_ST7: GdbRegister = GdbRegister(31);
pub const DREG_FCTRL: GdbRegister = GdbRegister(32);
pub const DREG_FSTAT: GdbRegister = GdbRegister(33);
pub const DREG_FTAG: GdbRegister = GdbRegister(34);
pub const DREG_FISEG: GdbRegister = GdbRegister(35);
pub const DREG_FIOFF: GdbRegister = GdbRegister(36);
pub const DREG_FOSEG: GdbRegister = GdbRegister(37);
pub const DREG_FOOFF: GdbRegister = GdbRegister(38);
pub const DREG_FOP: GdbRegister = GdbRegister(39);
pub const DREG_XMM0: GdbRegister = GdbRegister(40);
pub const DREG_XMM1: GdbRegister = GdbRegister(41);
pub const DREG_XMM2: GdbRegister = GdbRegister(42);
pub const DREG_XMM3: GdbRegister = GdbRegister(43);
pub const DREG_XMM4: GdbRegister = GdbRegister(44);
pub const DREG_XMM5: GdbRegister = GdbRegister(45);
pub const DREG_XMM6: GdbRegister = GdbRegister(46);
pub const DREG_XMM7: GdbRegister = GdbRegister(47);
pub const DREG_XMM8: GdbRegister = GdbRegister(48);
pub const DREG_XMM9: GdbRegister = GdbRegister(49);
pub const DREG_XMM10: GdbRegister = GdbRegister(50);
pub const DREG_XMM11: GdbRegister = GdbRegister(51);
pub const DREG_XMM12: GdbRegister = GdbRegister(52);
pub const DREG_XMM13: GdbRegister = GdbRegister(53);
pub const DREG_XMM14: GdbRegister = GdbRegister(54);
pub const DREG_XMM15: GdbRegister = GdbRegister(55);
pub const DREG_MXCSR: GdbRegister = GdbRegister(56);
pub const DREG_LAST_FXSAVE_REG: GdbRegister = GdbRegister(56);
pub const DREG_ORIG_RAX: GdbRegister = GdbRegister(57);
pub const DREG_FS_BASE: GdbRegister = GdbRegister(58);
pub const DREG_GS_BASE: GdbRegister = GdbRegister(59);

pub const DREG_NUM_REGS: u32 = 60;

/// Width of the largest register value we hand the debugger (xmm/st).
pub const MAX_REG_SIZE_BYTES: usize = 16;

impl GdbRegister {
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u32> for GdbRegister {
    type Error = ();

    fn try_from(regno: u32) -> std::result::Result<Self, Self::Error> {
        if regno < DREG_NUM_REGS {
            Ok(Self(regno))
        } else {
            Err(())
        }
    }
}

impl Display for GdbRegister {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_from_bounds() {
        assert_eq!(Ok(DREG_RAX), GdbRegister::try_from(0));
        assert_eq!(Ok(DREG_GS_BASE), GdbRegister::try_from(59));
        assert!(GdbRegister::try_from(60).is_err());
    }
}
