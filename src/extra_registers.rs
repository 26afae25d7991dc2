use crate::gdb_register::*;
use raw_cpuid::CpuId;

/// This is the byte offset at which the ST0-7 register data begins in an
/// xsave (or fxsave) block.
const ST_REGS_OFFSET: usize = 32;
/// NB: each STx register holds 10 bytes of actual data, but each occupies
/// 16 bytes of space within (f)xsave, presumably for alignment purposes.
const ST_REG_SPACE: usize = 16;
const ST_REG_BYTES: usize = 10;

/// Byte offset at which the XMM0-15 register data begins with (f)xsave.
const XMM_REGS_OFFSET: usize = 160;
const XMM_REG_SPACE: usize = 16;

const MXCSR_OFFSET: usize = 24;

/// The Intel documentation says that the following layout is only valid in
/// 32-bit mode, or when fxsave is executed in 64-bit mode without an
/// appropriate REX prefix. The kernel seems to only use fxsave with the
/// REX prefix, but GDB is happy with these offsets, so that's what we use.
/// Offsets paired with the number of defined bytes at each.
const FXSAVE_387_CTRL_OFFSETS: [(usize, usize); 8] = [
    (0, 2),  // DREG_FCTRL
    (2, 2),  // DREG_FSTAT
    (4, 2),  // DREG_FTAG
    (12, 4), // DREG_FISEG
    (8, 4),  // DREG_FIOFF
    (20, 4), // DREG_FOSEG
    (16, 4), // DREG_FOOFF
    (6, 2),  // DREG_FOP
];

/// The minimum size of the register file: a bare FXSAVE area with no
/// extended features.
pub const FXSAVE_AREA_SIZE: usize = 512;

/// Ask CPUID how large an XSAVE area this CPU writes. We use the largest
/// possible area all the time even when it might not be needed; simpler
/// that way.
pub fn xsave_area_size() -> usize {
    lazy_static! {
        static ref XSAVE_AREA_SIZE: usize = {
            let cpuid = CpuId::new();
            match cpuid.get_extended_state_info() {
                Some(info) => info.xsave_area_size_supported_features() as usize,
                None => FXSAVE_AREA_SIZE,
            }
        };
    }
    *XSAVE_AREA_SIZE
}

/// The XSAVE area of a tracee: opaque bytes in the CPU's native layout,
/// plus per-name access to the FXSAVE-resident registers the debugger asks
/// about.
#[derive(Clone)]
pub struct ExtraRegisters {
    data: Vec<u8>,
}

impl ExtraRegisters {
    pub fn new() -> ExtraRegisters {
        ExtraRegisters { data: Vec::new() }
    }

    pub fn empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Like Registers::read_register(): copy the named register's bytes into
    /// `buf` and return how many were written, or None if this register
    /// isn't in the (f)xsave area or no area has been captured.
    pub fn read_register(&self, buf: &mut [u8], regno: GdbRegister) -> Option<usize> {
        if self.empty() {
            return None;
        }

        let (offset, nbytes) = if DREG_ST0 <= regno && regno <= DREG_ST7 {
            let i = (regno.as_u32() - DREG_ST0.as_u32()) as usize;
            (ST_REGS_OFFSET + i * ST_REG_SPACE, ST_REG_BYTES)
        } else if DREG_FCTRL <= regno && regno <= DREG_FOP {
            let i = (regno.as_u32() - DREG_FCTRL.as_u32()) as usize;
            FXSAVE_387_CTRL_OFFSETS[i]
        } else if DREG_XMM0 <= regno && regno <= DREG_XMM15 {
            let i = (regno.as_u32() - DREG_XMM0.as_u32()) as usize;
            (XMM_REGS_OFFSET + i * XMM_REG_SPACE, XMM_REG_SPACE)
        } else if regno == DREG_MXCSR {
            (MXCSR_OFFSET, 4)
        } else {
            return None;
        };

        if offset + nbytes > self.data.len() {
            return None;
        }
        buf[0..nbytes].copy_from_slice(&self.data[offset..offset + nbytes]);
        Some(nbytes)
    }
}

impl Default for ExtraRegisters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_area() -> ExtraRegisters {
        let mut er = ExtraRegisters::new();
        let mut data = vec![0u8; FXSAVE_AREA_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i & 0xff) as u8;
        }
        er.set_data(data);
        er
    }

    #[test]
    fn empty_area_defines_nothing() {
        let er = ExtraRegisters::new();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!(None, er.read_register(&mut buf, DREG_XMM0));
    }

    #[test]
    fn xmm_offsets() {
        let er = filled_area();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let n = er.read_register(&mut buf, DREG_XMM2).unwrap();
        assert_eq!(16, n);
        // xmm2 starts at 160 + 2*16 = 192.
        assert_eq!(192u8, buf[0]);
    }

    #[test]
    fn st_regs_are_ten_bytes() {
        let er = filled_area();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!(Some(10), er.read_register(&mut buf, DREG_ST1));
        // st1 starts at 32 + 16.
        assert_eq!(48u8, buf[0]);
    }

    #[test]
    fn gp_registers_not_here() {
        let er = filled_area();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!(None, er.read_register(&mut buf, DREG_RAX));
    }

    #[test]
    fn discovered_size_is_at_least_fxsave() {
        assert!(xsave_area_size() >= FXSAVE_AREA_SIZE);
    }
}
