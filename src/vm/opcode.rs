//! The stable opcode byte map (§6). Declaration order is the wire order;
//! adding a variant must only ever append at the end.

use strum::{EnumCount, EnumIter};

use crate::error::RuntimeError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount)]
pub enum Opcode {
    Nop,
    Ret,
    Syscall,
    Hlt,
    LoadExternal,
    MovRegReg,
    MovRegImm,
    Ldr,
    Str,
    Sti,
    PushImm,
    PushReg,
    PushAddr,
    PopReg,
    PopAddr,
    AddRegRegReg,
    AddRegRegImm,
    SubRegRegReg,
    SubRegRegImm,
    MulRegRegReg,
    MulRegRegImm,
    DivRegRegReg,
    DivRegRegImm,
    AndRegRegReg,
    AndRegRegImm,
    OrRegRegReg,
    OrRegRegImm,
    XorRegRegReg,
    XorRegRegImm,
    ShlRegRegReg,
    ShlRegRegImm,
    ShrRegRegReg,
    ShrRegRegImm,
    CmpRegReg,
    CmpRegImm,
    JmpImm,
    JmpReg,
    JeqImm,
    JeqReg,
    JneImm,
    JneReg,
    JltImm,
    JltReg,
    JgtImm,
    JgtReg,
    JleImm,
    JleReg,
    JgeImm,
    JgeReg,
    CallImm,
    CallReg,
    CallEx,
    Inc,
    Dec,
    Neg,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Opcode, RuntimeError> {
        use Opcode::*;
        Ok(match byte {
            0 => Nop,
            1 => Ret,
            2 => Syscall,
            3 => Hlt,
            4 => LoadExternal,
            5 => MovRegReg,
            6 => MovRegImm,
            7 => Ldr,
            8 => Str,
            9 => Sti,
            10 => PushImm,
            11 => PushReg,
            12 => PushAddr,
            13 => PopReg,
            14 => PopAddr,
            15 => AddRegRegReg,
            16 => AddRegRegImm,
            17 => SubRegRegReg,
            18 => SubRegRegImm,
            19 => MulRegRegReg,
            20 => MulRegRegImm,
            21 => DivRegRegReg,
            22 => DivRegRegImm,
            23 => AndRegRegReg,
            24 => AndRegRegImm,
            25 => OrRegRegReg,
            26 => OrRegRegImm,
            27 => XorRegRegReg,
            28 => XorRegRegImm,
            29 => ShlRegRegReg,
            30 => ShlRegRegImm,
            31 => ShrRegRegReg,
            32 => ShrRegRegImm,
            33 => CmpRegReg,
            34 => CmpRegImm,
            35 => JmpImm,
            36 => JmpReg,
            37 => JeqImm,
            38 => JeqReg,
            39 => JneImm,
            40 => JneReg,
            41 => JltImm,
            42 => JltReg,
            43 => JgtImm,
            44 => JgtReg,
            45 => JleImm,
            46 => JleReg,
            47 => JgeImm,
            48 => JgeReg,
            49 => CallImm,
            50 => CallReg,
            51 => CallEx,
            52 => Inc,
            53 => Dec,
            54 => Neg,
            other => return Err(RuntimeError::InvalidOpcode(other)),
        })
    }

    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_round_trips_through_its_byte() {
        for byte in 0..Opcode::COUNT as u8 {
            let op = Opcode::from_byte(byte).unwrap();
            assert_eq!(op.as_byte(), byte);
        }
    }

    #[test]
    fn byte_past_the_last_opcode_is_invalid() {
        assert!(Opcode::from_byte(Opcode::COUNT as u8).is_err());
    }
}
