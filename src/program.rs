// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Canned Xtensa instruction sequences and debug data register traffic.
//!
//! An injected program moves values between host and core through DDR.
//! Which instructions touch DDR is decided by matching each opcode against
//! `DDR_PATTERNS`, independent of the address register used.

/// Special register number of DDR.
pub const SR_DDR: u32 = 0x68;

/// How an instruction uses the debug data register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DdrRole {
    /// Core reads DDR, so the host writes it before execution.
    Input,
    /// Core writes DDR, so the host reads it after execution.
    Output,
    /// Core swaps DDR with a register: host writes before and reads after.
    Exchange,
}

impl DdrRole {
    pub fn takes_input(&self) -> bool {
        matches!(self, DdrRole::Input | DdrRole::Exchange)
    }

    pub fn produces_output(&self) -> bool {
        matches!(self, DdrRole::Output | DdrRole::Exchange)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpcodePattern {
    pub mask: u32,
    pub value: u32,
    pub role: DdrRole,
    pub mnemonic: &'static str,
}

impl OpcodePattern {
    pub fn matches(&self, opcode: u32) -> bool {
        opcode & self.mask == self.value
    }
}

/// `rsr`/`wsr`/`xsr` with DDR as the special register, any address register.
pub static DDR_PATTERNS: [OpcodePattern; 3] = [
    OpcodePattern { mask: 0xFFFF0F, value: 0x036800, role: DdrRole::Input, mnemonic: "rsr" },
    OpcodePattern { mask: 0xFFFF0F, value: 0x136800, role: DdrRole::Output, mnemonic: "wsr" },
    OpcodePattern { mask: 0xFFFF0F, value: 0x616800, role: DdrRole::Exchange, mnemonic: "xsr" },
];

/// Find the DDR pattern `opcode` matches, if any.
pub fn classify(opcode: u32) -> Option<&'static OpcodePattern> {
    DDR_PATTERNS.iter().find(|p| p.matches(opcode))
}

/// Describe a DDR transfer instruction, such as `wsr a3, ddr`.
pub fn describe(opcode: u32) -> Option<String> {
    classify(opcode).map(|p| format!("{} a{}, ddr", p.mnemonic, (opcode >> 4) & 0xF))
}

/// Number of DDR values a program consumes and produces.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Arity {
    pub inputs: usize,
    pub outputs: usize,
}

pub fn arity(opcodes: &[u32]) -> Arity {
    let mut arity = Arity::default();
    for role in opcodes.iter().filter_map(|&op| classify(op)).map(|p| p.role) {
        if role.takes_input() {
            arity.inputs += 1;
        }
        if role.produces_output() {
            arity.outputs += 1;
        }
    }
    arity
}

pub fn rsr_ddr(at: u8) -> u32 {
    0x030000 | (SR_DDR << 8) | ((at as u32 & 0xF) << 4)
}

pub fn wsr_ddr(at: u8) -> u32 {
    0x130000 | (SR_DDR << 8) | ((at as u32 & 0xF) << 4)
}

pub fn xsr_ddr(at: u8) -> u32 {
    0x610000 | (SR_DDR << 8) | ((at as u32 & 0xF) << 4)
}

/// Return from debug mode. Mode 0 leaves OCD, mode 1 resumes with OCD enabled.
pub fn rfdo(mode: u8) -> u32 {
    0xF1E000 | ((mode as u32 & 0xF) << 8)
}

pub const RFDO0: u32 = 0xF1E000;
pub const RFDO1: u32 = 0xF1E100;

/// A named sequence of instructions run on a halted core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub name: &'static str,
    pub description: &'static str,
    pub opcodes: &'static [u32],
}

impl Program {
    pub fn arity(&self) -> Arity {
        arity(self.opcodes)
    }

    /// Look up a canned program by name.
    pub fn get(name: &str) -> Option<&'static Program> {
        PROGRAMS.iter().find(|p| p.name == name)
    }
}

pub const SAVE_REGS: Program = Program {
    name: "save_regs",
    description: "Read a0 and a1",
    opcodes: &[0x136800, 0x136810],
};

pub const RESTORE_REGS: Program = Program {
    name: "restore_regs",
    description: "Write a0 and a1",
    opcodes: &[0x036800, 0x036810],
};

pub const RD8: Program = Program {
    name: "rd8",
    description: "Load byte from address",
    opcodes: &[0x036800, 0x000002, 0x136800],
};

pub const RD16: Program = Program {
    name: "rd16",
    description: "Load halfword from address",
    opcodes: &[0x036800, 0x001002, 0x136800],
};

pub const RD32: Program = Program {
    name: "rd32",
    description: "Load word from address",
    opcodes: &[0x036800, 0x000008, 0x136800],
};

pub const RD32_X16: Program = Program {
    name: "rd32_x16",
    description: "Load 16 consecutive words from address",
    opcodes: &[
        0x036800,
        0x000018, 0x136810, 0x001018, 0x136810, 0x002018, 0x136810, 0x003018, 0x136810,
        0x004018, 0x136810, 0x005018, 0x136810, 0x006018, 0x136810, 0x007018, 0x136810,
        0x008018, 0x136810, 0x009018, 0x136810, 0x00A018, 0x136810, 0x00B018, 0x136810,
        0x00C018, 0x136810, 0x00D018, 0x136810, 0x00E018, 0x136810, 0x00F018, 0x136810,
    ],
};

pub const RD_REGS: Program = Program {
    name: "rd_regs",
    description: "Read a0 to a15",
    opcodes: &[
        0x136800, 0x136810, 0x136820, 0x136830, 0x136840, 0x136850, 0x136860, 0x136870,
        0x136880, 0x136890, 0x1368A0, 0x1368B0, 0x1368C0, 0x1368D0, 0x1368E0, 0x1368F0,
    ],
};

pub const WR8: Program = Program {
    name: "wr8",
    description: "Store byte to address",
    opcodes: &[0x036800, 0x036810, 0x004012],
};

pub const WR16: Program = Program {
    name: "wr16",
    description: "Store halfword to address",
    opcodes: &[0x036800, 0x036810, 0x005012],
};

pub const WR32: Program = Program {
    name: "wr32",
    description: "Store word to address",
    opcodes: &[0x036800, 0x036810, 0x000019],
};

pub static PROGRAMS: [Program; 10] = [
    SAVE_REGS, RESTORE_REGS, RD8, RD16, RD32, RD32_X16, RD_REGS, WR8, WR16, WR32,
];

#[test]
fn test_patterns_mutually_exclusive() {
    for program in PROGRAMS.iter() {
        for &opcode in program.opcodes.iter() {
            let matched = DDR_PATTERNS.iter().filter(|p| p.matches(opcode)).count();
            assert!(matched <= 1, "0x{:06X} in {} matched {} patterns",
                    opcode, program.name, matched);
        }
    }
    for a in DDR_PATTERNS.iter() {
        for b in DDR_PATTERNS.iter().filter(|b| *b != a) {
            assert!(!b.matches(a.value));
        }
    }
}

#[test]
fn test_program_arity() {
    assert_eq!(RD32.arity(), Arity { inputs: 1, outputs: 1 });
    assert_eq!(RD32_X16.arity(), Arity { inputs: 1, outputs: 16 });
    assert_eq!(RD_REGS.arity(), Arity { inputs: 0, outputs: 16 });
    assert_eq!(WR16.arity(), Arity { inputs: 2, outputs: 0 });
    assert_eq!(arity(&[xsr_ddr(3)]), Arity { inputs: 1, outputs: 1 });
    assert_eq!(arity(&[RFDO1]), Arity::default());
}

#[test]
fn test_encoders() {
    assert_eq!(rsr_ddr(0), RESTORE_REGS.opcodes[0]);
    assert_eq!(rsr_ddr(1), RESTORE_REGS.opcodes[1]);
    assert_eq!(wsr_ddr(1), SAVE_REGS.opcodes[1]);
    assert_eq!(wsr_ddr(15), 0x1368F0);
    assert_eq!(xsr_ddr(0), 0x616800);
    assert_eq!(rfdo(0), RFDO0);
    assert_eq!(rfdo(1), RFDO1);
    assert_eq!(describe(0x1368A0).as_deref(), Some("wsr a10, ddr"));
    assert_eq!(describe(0x000008), None);
}

#[test]
fn test_program_lookup() {
    assert_eq!(Program::get("rd16"), Some(&RD16));
    assert!(Program::get("rd64").is_none());
    let names: Vec<&str> = PROGRAMS.iter().map(|p| p.name).collect();
    assert_eq!(names.len(), 10);
}
