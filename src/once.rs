//! Access to the DSP core through the On-Chip Emulation (OnCE) port.  With ENABLE_ONCE in the
//! instruction register, every data register shift alternates between an 8-bit OnCE command and
//! a 16-bit data word.  The host moves data by feeding the core single instructions through the
//! OnCE instruction register, and gets values back through the OPGDBR gateway, which the core
//! writes as memory location X:$FFFF.
use core::fmt;

use crate::cable::Cable;
use crate::error::Result;
use crate::taps::Taps;

/// Memory location of the OPGDBR gateway register.
pub const GATEWAY: u16 = 0xffff;

pub const CMD_READ: u8 = 0x80;
pub const CMD_GO: u8 = 0x40;
pub const CMD_EXIT: u8 = 0x20;
pub const REG_MASK: u8 = 0x1f;
pub const REG_OPDBR: u8 = 0x04;
pub const REG_OPGDBR: u8 = 0x09;

const CMD_WIDTH: usize = 8;
const DATA_WIDTH: usize = 16;

/// The two address spaces of the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(rename_all = "lowercase"))]
pub enum Space {
    /// Data memory
    X,
    /// Program memory
    P,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Space::X => write!(f, "x"),
            Space::P => write!(f, "p"),
        }
    }
}

/// Core registers reachable by the instructions below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    Y0 = 4,
    Y1 = 5,
    Omr = 6,
    Sr = 7,
}

impl Reg {
    const ALL: [Reg; 8] = [
        Reg::R0,
        Reg::R1,
        Reg::R2,
        Reg::R3,
        Reg::Y0,
        Reg::Y1,
        Reg::Omr,
        Reg::Sr,
    ];

    fn from_code(code: u16) -> Option<Reg> {
        Reg::ALL.get(usize::from(code)).copied()
    }
}

/// Address registers usable as memory pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ptr {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
}

impl Ptr {
    pub fn reg(self) -> Reg {
        match self {
            Ptr::R0 => Reg::R0,
            Ptr::R1 => Reg::R1,
            Ptr::R2 => Reg::R2,
            Ptr::R3 => Reg::R3,
        }
    }

    fn from_code(code: u16) -> Ptr {
        match code & 3 {
            0 => Ptr::R0,
            1 => Ptr::R1,
            2 => Ptr::R2,
            _ => Ptr::R3,
        }
    }
}

/// Data registers that can be stored to memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataReg {
    Y0,
    Y1,
}

impl DataReg {
    pub fn reg(self) -> Reg {
        match self {
            DataReg::Y0 => Reg::Y0,
            DataReg::Y1 => Reg::Y1,
        }
    }
}

/// The core instructions the flash programmer needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    /// NOP
    Nop,
    /// MOVE #value,dst
    MoveImm { dst: Reg, value: u16 },
    /// MOVE src,dst
    MoveReg { dst: Reg, src: Reg },
    /// MOVE src,X:(ptr) or P:(ptr), optionally with post-increment
    Store {
        src: DataReg,
        space: Space,
        ptr: Ptr,
        post_inc: bool,
    },
    /// MOVE X:(ptr),Y0 or P:(ptr),Y0, optionally with post-increment
    Load { space: Space, ptr: Ptr, post_inc: bool },
    /// MOVE Y0,X:addr
    StoreAbs { addr: u16 },
    /// JMP #addr
    Jmp { addr: u16 },
}

const OP_NOP: u16 = 0xe700;
const OP_MOVE_IMM: u16 = 0x87d0;
const OP_MOVE_REG: u16 = 0x8100;
const OP_STORE: u16 = 0xd000;
const OP_LOAD: u16 = 0xf000;
const OP_STORE_ABS: u16 = 0xc154;
const OP_JMP: u16 = 0xe984;

const BIT_POST_INC: u16 = 1 << 8;
const BIT_P_SPACE: u16 = 1 << 7;
const BIT_Y1: u16 = 1 << 4;

impl Instr {
    /// The opcode word and, for two word instructions, the operand word.
    pub fn words(&self) -> (u16, Option<u16>) {
        let space_bit = |space: Space| if space == Space::P { BIT_P_SPACE } else { 0 };
        let inc_bit = |post_inc: bool| if post_inc { BIT_POST_INC } else { 0 };

        match *self {
            Instr::Nop => (OP_NOP, None),
            Instr::MoveImm { dst, value } => (OP_MOVE_IMM | dst as u16, Some(value)),
            Instr::MoveReg { dst, src } => (OP_MOVE_REG | (dst as u16) << 4 | src as u16, None),
            Instr::Store { src, space, ptr, post_inc } => {
                let y1 = if src == DataReg::Y1 { BIT_Y1 } else { 0 };
                (OP_STORE | inc_bit(post_inc) | space_bit(space) | y1 | ptr as u16, None)
            }
            Instr::Load { space, ptr, post_inc } => {
                (OP_LOAD | inc_bit(post_inc) | space_bit(space) | ptr as u16, None)
            }
            Instr::StoreAbs { addr } => (OP_STORE_ABS, Some(addr)),
            Instr::Jmp { addr } => (OP_JMP, Some(addr)),
        }
    }

    /// Whether the instruction carries an operand word.
    pub fn is_long(opcode: u16) -> bool {
        opcode & 0xfff8 == OP_MOVE_IMM || opcode == OP_STORE_ABS || opcode == OP_JMP
    }

    /// Inverse of `words`.
    pub fn decode(opcode: u16, operand: Option<u16>) -> Option<Instr> {
        let space = if opcode & BIT_P_SPACE != 0 { Space::P } else { Space::X };
        let post_inc = opcode & BIT_POST_INC != 0;

        match (opcode, operand) {
            (OP_NOP, None) => Some(Instr::Nop),
            (OP_STORE_ABS, Some(addr)) => Some(Instr::StoreAbs { addr }),
            (OP_JMP, Some(addr)) => Some(Instr::Jmp { addr }),
            (op, Some(value)) if op & 0xfff8 == OP_MOVE_IMM => Some(Instr::MoveImm {
                dst: Reg::from_code(op & 7)?,
                value,
            }),
            (op, None) if op & 0xff88 == OP_MOVE_REG => Some(Instr::MoveReg {
                dst: Reg::from_code(op >> 4 & 7)?,
                src: Reg::from_code(op & 7)?,
            }),
            (op, None) if op & 0xfe6c == OP_STORE => Some(Instr::Store {
                src: if op & BIT_Y1 != 0 { DataReg::Y1 } else { DataReg::Y0 },
                space,
                ptr: Ptr::from_code(op),
                post_inc,
            }),
            (op, None) if op & 0xfe7c == OP_LOAD => Some(Instr::Load {
                space,
                ptr: Ptr::from_code(op),
                post_inc,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inc = |post_inc: bool| if post_inc { "+" } else { "" };
        match self {
            Instr::Nop => write!(f, "NOP"),
            Instr::MoveImm { dst, value } => write!(f, "MOVE #${:04X},{:?}", value, dst),
            Instr::MoveReg { dst, src } => write!(f, "MOVE {:?},{:?}", src, dst),
            Instr::Store { src, space, ptr, post_inc } => {
                write!(f, "MOVE {:?},{}:({:?}){}", src, space, ptr, inc(*post_inc))
            }
            Instr::Load { space, ptr, post_inc } => {
                write!(f, "MOVE {}:({:?}){},Y0", space, ptr, inc(*post_inc))
            }
            Instr::StoreAbs { addr } => write!(f, "MOVE Y0,x:${:04X}", addr),
            Instr::Jmp { addr } => write!(f, "JMP #${:04X}", addr),
        }
    }
}

/// Drives the OnCE port of the DSP.  ENABLE_ONCE must already be in the instruction register.
///
/// None of these operations retry; a failed shift is returned to the caller as is.
pub struct Once<C> {
    pub taps: Taps<C>,
}

impl<C: Cable> Once<C> {
    pub fn new(taps: Taps<C>) -> Self {
        Self { taps }
    }

    fn command(&mut self, cmd: u8) -> Result<()> {
        self.taps.shift_dr(u32::from(cmd), CMD_WIDTH)?;
        Ok(())
    }

    fn write_data(&mut self, word: u16) -> Result<()> {
        self.taps.shift_dr(u32::from(word), DATA_WIDTH)?;
        Ok(())
    }

    fn feed(&mut self, instr: Instr, last_cmd: u8) -> Result<()> {
        let (opcode, operand) = instr.words();
        match operand {
            Some(operand) => {
                self.command(REG_OPDBR)?;
                self.write_data(opcode)?;
                self.command(last_cmd)?;
                self.write_data(operand)
            }
            None => {
                self.command(last_cmd)?;
                self.write_data(opcode)
            }
        }
    }

    /// Execute one instruction; the core stays in debug mode.
    pub fn execute(&mut self, instr: Instr) -> Result<()> {
        self.feed(instr, CMD_GO | REG_OPDBR)
    }

    /// Execute one instruction and let the core leave debug mode and run.
    pub fn execute_and_run(&mut self, instr: Instr) -> Result<()> {
        self.feed(instr, CMD_GO | CMD_EXIT | REG_OPDBR)
    }

    /// Read the OPGDBR gateway register.
    pub fn read_gateway(&mut self) -> Result<u16> {
        self.command(CMD_READ | REG_OPGDBR)?;
        Ok(self.taps.shift_dr(0, DATA_WIDTH)? as u16)
    }

    pub fn load_imm(&mut self, dst: Reg, value: u16) -> Result<()> {
        self.execute(Instr::MoveImm { dst, value })
    }

    pub fn move_reg(&mut self, dst: Reg, src: Reg) -> Result<()> {
        self.execute(Instr::MoveReg { dst, src })
    }

    /// Store `src` at the memory location `ptr` points to.
    pub fn store(&mut self, src: DataReg, space: Space, ptr: Ptr, post_inc: bool) -> Result<()> {
        self.execute(Instr::Store { src, space, ptr, post_inc })
    }

    /// Load Y0 from the memory location `ptr` points to.
    pub fn load(&mut self, space: Space, ptr: Ptr, post_inc: bool) -> Result<()> {
        self.execute(Instr::Load { space, ptr, post_inc })
    }

    /// Copy Y0 into the gateway register.
    pub fn publish_y0(&mut self) -> Result<()> {
        self.execute(Instr::StoreAbs { addr: GATEWAY })
    }

    pub fn nop(&mut self) -> Result<()> {
        self.execute(Instr::Nop)
    }

    pub fn jump(&mut self, addr: u16) -> Result<()> {
        self.execute(Instr::Jmp { addr })
    }

    /// Jump to `addr` and leave debug mode.
    pub fn jump_and_run(&mut self, addr: u16) -> Result<()> {
        self.execute_and_run(Instr::Jmp { addr })
    }

    /// Read Y0 through the gateway.
    pub fn read_y0(&mut self) -> Result<u16> {
        self.publish_y0()?;
        self.read_gateway()
    }

    /// Read any register through Y0 and the gateway.  Y0 is overwritten.
    pub fn read_reg(&mut self, reg: Reg) -> Result<u16> {
        if reg != Reg::Y0 {
            self.move_reg(Reg::Y0, reg)?;
        }
        self.read_y0()
    }

    /// Read the word `ptr` points to.  Y0 is overwritten.
    pub fn read_mem(&mut self, space: Space, ptr: Ptr, post_inc: bool) -> Result<u16> {
        self.load(space, ptr, post_inc)?;
        self.read_y0()
    }

    /// Write `value` where `ptr` points to, through Y0.
    pub fn write_mem(&mut self, space: Space, ptr: Ptr, value: u16, post_inc: bool) -> Result<()> {
        self.load_imm(Reg::Y0, value)?;
        self.store(DataReg::Y0, space, ptr, post_inc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::fake::FakeCable;
    use crate::statemachine::{JtagSM, JtagState};
    use crate::taps::{ChainPosition, ENABLE_ONCE};

    use pretty_assertions::assert_eq;

    fn all_instrs() -> alloc::vec::Vec<Instr> {
        let mut out = alloc::vec![Instr::Nop, Instr::StoreAbs { addr: GATEWAY }, Instr::Jmp { addr: 0x1234 }];
        for dst in Reg::ALL {
            out.push(Instr::MoveImm { dst, value: 0xbeef });
            for src in Reg::ALL {
                out.push(Instr::MoveReg { dst, src });
            }
        }
        for space in [Space::X, Space::P] {
            for ptr in [Ptr::R0, Ptr::R1, Ptr::R2, Ptr::R3] {
                for post_inc in [false, true] {
                    out.push(Instr::Load { space, ptr, post_inc });
                    for src in [DataReg::Y0, DataReg::Y1] {
                        out.push(Instr::Store { src, space, ptr, post_inc });
                    }
                }
            }
        }
        out
    }

    #[test]
    fn encodings_are_unambiguous() {
        let instrs = all_instrs();
        for instr in &instrs {
            let (opcode, operand) = instr.words();
            assert_eq!(Instr::is_long(opcode), operand.is_some(), "{}", instr);
            assert_eq!(Instr::decode(opcode, operand), Some(*instr));
        }
        assert_eq!(Instr::decode(0x0000, None), None);
        assert_eq!(Instr::decode(OP_JMP, None), None);
    }

    #[test]
    fn assembler_text() {
        let store = Instr::Store { src: DataReg::Y1, space: Space::P, ptr: Ptr::R0, post_inc: true };
        assert_eq!(alloc::format!("{}", store), "MOVE Y1,p:(R0)+");
        assert_eq!(alloc::format!("{}", Instr::MoveImm { dst: Reg::R2, value: 0x1380 }), "MOVE #$1380,R2");
    }

    fn debug_once() -> Once<FakeCable> {
        let mut sm = JtagSM::new(FakeCable::new());
        sm.mode_reset().unwrap();
        sm.change_mode(JtagState::SelectDR).unwrap();
        let mut taps = Taps::new(sm, ChainPosition::default());
        taps.sm.cable.force_debug();
        taps.shift_ir(ENABLE_ONCE).unwrap();
        Once::new(taps)
    }

    #[test]
    fn registers_through_gateway() {
        let mut once = debug_once();
        once.load_imm(Reg::R2, 0x1380).unwrap();
        assert_eq!(once.read_reg(Reg::R2).unwrap(), 0x1380);
        assert_eq!(once.taps.sm.cable.core_reg(Reg::R2), 0x1380);
        assert_eq!(once.taps.sm.cable.gateway_reads(), 1);
    }

    #[test]
    fn memory_through_pointer() {
        let mut once = debug_once();
        once.load_imm(Reg::R0, 0x0100).unwrap();
        once.write_mem(Space::X, Ptr::R0, 0xaaaa, true).unwrap();
        once.write_mem(Space::X, Ptr::R0, 0x5555, true).unwrap();
        assert_eq!(once.taps.sm.cable.memory(Space::X, 0x0100), 0xaaaa);
        assert_eq!(once.taps.sm.cable.memory(Space::X, 0x0101), 0x5555);
        assert_eq!(once.taps.sm.cable.core_reg(Reg::R0), 0x0102);

        once.load_imm(Reg::R1, 0x0100).unwrap();
        assert_eq!(once.read_mem(Space::X, Ptr::R1, true).unwrap(), 0xaaaa);
        assert_eq!(once.read_mem(Space::X, Ptr::R1, false).unwrap(), 0x5555);
        assert_eq!(once.taps.sm.cable.memory(Space::P, 0x0100), 0);
    }

    #[test]
    fn instruction_words_on_the_wire() {
        let mut once = debug_once();
        once.taps.sm.cable.reset_counters();
        once.load_imm(Reg::R0, 0x0100).unwrap();
        once.write_mem(Space::X, Ptr::R0, 0xaaaa, true).unwrap();
        once.read_reg(Reg::R0).unwrap();
        once.jump(0).unwrap();
        assert_eq!(
            once.taps.sm.cable.instruction_words(),
            &[
                0x87d0, 0x0100, // MOVE #$0100,R0
                0x87d4, 0xaaaa, // MOVE #$AAAA,Y0
                0xd100, // MOVE Y0,x:(R0)+
                0x8140, // MOVE R0,Y0
                0xc154, 0xffff, // MOVE Y0,x:$FFFF
                0xe984, 0x0000, // JMP #$0000
            ]
        );
        assert_eq!(Instr::Nop.words(), (0xe700, None));
        assert_eq!(
            Instr::Load { space: Space::P, ptr: Ptr::R3, post_inc: false }.words(),
            (0xf083, None)
        );
    }

    #[test]
    fn jump_and_run_leaves_debug() {
        let mut once = debug_once();
        once.jump_and_run(0).unwrap();
        assert!(once.taps.sm.cable.is_running());
        assert_eq!(once.taps.sm.cable.pc(), 0);
    }
}
