//! Bytecode: nibble-packed (opcode, operand) pairs.
//!
//! Compact form packs opcode 1..15 in the high nibble and operands 0..15
//! in the low nibble. Operands past 15 use the extended form: a prefix
//! byte whose high nibble is 0 and low nibble is the opcode, then a full
//! operand byte. Opcode numbers are part of the image contract.

use crate::oop::fatal;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    Extended = 0,
    PushInstance = 1,
    PushArgument = 2,
    PushTemporary = 3,
    PushLiteral = 4,
    PushConstant = 5,
    AssignInstance = 6,
    AssignTemporary = 7,
    MarkArguments = 8,
    SendMessage = 9,
    SendUnary = 10,
    SendBinary = 11,
    DoPrimitive = 12,
    DoSpecial = 13,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Opcode::Extended,
            1 => Opcode::PushInstance,
            2 => Opcode::PushArgument,
            3 => Opcode::PushTemporary,
            4 => Opcode::PushLiteral,
            5 => Opcode::PushConstant,
            6 => Opcode::AssignInstance,
            7 => Opcode::AssignTemporary,
            8 => Opcode::MarkArguments,
            9 => Opcode::SendMessage,
            10 => Opcode::SendUnary,
            11 => Opcode::SendBinary,
            12 => Opcode::DoPrimitive,
            13 => Opcode::DoSpecial,
            _ => fatal("unknown opcode"),
        }
    }
}

/// DoSpecial sub-opcodes. Branch family and SendToSuper read one more
/// byte: an absolute 1-based code offset, or a literal index.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Special {
    SelfReturn = 1,
    StackReturn = 2,
    Duplicate = 3,
    PopTop = 4,
    Branch = 5,
    BranchIfTrue = 6,
    BranchIfFalse = 7,
    AndBranch = 8,
    OrBranch = 9,
    SendToSuper = 10,
}

impl Special {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Special::SelfReturn,
            2 => Special::StackReturn,
            3 => Special::Duplicate,
            4 => Special::PopTop,
            5 => Special::Branch,
            6 => Special::BranchIfTrue,
            7 => Special::BranchIfFalse,
            8 => Special::AndBranch,
            9 => Special::OrBranch,
            10 => Special::SendToSuper,
            _ => fatal("unknown special opcode"),
        }
    }
}

// PushConstant operands.
pub const CONST_MINUS_ONE: u8 = 3;
pub const CONST_NIL: u8 = 4;
pub const CONST_TRUE: u8 = 5;
pub const CONST_FALSE: u8 = 6;
pub const CONST_CONTEXT: u8 = 7;

/// A decoded instruction, for emission, tests and disassembly. The
/// interpreter walks raw bytes instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    PushInstance(u8),
    PushArgument(u8),
    PushTemporary(u8),
    PushLiteral(u8),
    PushConstant(u8),
    AssignInstance(u8),
    AssignTemporary(u8),
    MarkArguments(u8),
    SendMessage(u8),
    SendUnary(u8),
    SendBinary(u8),
    DoPrimitive { argc: u8, number: u8 },
    SelfReturn,
    StackReturn,
    Duplicate,
    PopTop,
    Branch(u8),
    BranchIfTrue(u8),
    BranchIfFalse(u8),
    AndBranch(u8),
    OrBranch(u8),
    SendToSuper(u8),
}

fn push_pair(out: &mut Vec<u8>, op: Opcode, operand: u8) {
    if operand < 16 {
        out.push(((op as u8) << 4) | operand);
    } else {
        out.push(op as u8);
        out.push(operand);
    }
}

fn push_special(out: &mut Vec<u8>, sub: Special) {
    out.push(((Opcode::DoSpecial as u8) << 4) | sub as u8);
}

impl Instruction {
    pub fn encode(self, out: &mut Vec<u8>) {
        use Instruction::*;
        match self {
            PushInstance(n) => push_pair(out, Opcode::PushInstance, n),
            PushArgument(n) => push_pair(out, Opcode::PushArgument, n),
            PushTemporary(n) => push_pair(out, Opcode::PushTemporary, n),
            PushLiteral(n) => push_pair(out, Opcode::PushLiteral, n),
            PushConstant(n) => push_pair(out, Opcode::PushConstant, n),
            AssignInstance(n) => push_pair(out, Opcode::AssignInstance, n),
            AssignTemporary(n) => push_pair(out, Opcode::AssignTemporary, n),
            MarkArguments(n) => push_pair(out, Opcode::MarkArguments, n),
            SendMessage(n) => push_pair(out, Opcode::SendMessage, n),
            SendUnary(n) => push_pair(out, Opcode::SendUnary, n),
            SendBinary(n) => push_pair(out, Opcode::SendBinary, n),
            DoPrimitive { argc, number } => {
                push_pair(out, Opcode::DoPrimitive, argc);
                out.push(number);
            }
            SelfReturn => push_special(out, Special::SelfReturn),
            StackReturn => push_special(out, Special::StackReturn),
            Duplicate => push_special(out, Special::Duplicate),
            PopTop => push_special(out, Special::PopTop),
            Branch(t) => {
                push_special(out, Special::Branch);
                out.push(t);
            }
            BranchIfTrue(t) => {
                push_special(out, Special::BranchIfTrue);
                out.push(t);
            }
            BranchIfFalse(t) => {
                push_special(out, Special::BranchIfFalse);
                out.push(t);
            }
            AndBranch(t) => {
                push_special(out, Special::AndBranch);
                out.push(t);
            }
            OrBranch(t) => {
                push_special(out, Special::OrBranch);
                out.push(t);
            }
            SendToSuper(l) => {
                push_special(out, Special::SendToSuper);
                out.push(l);
            }
        }
    }
}

/// Cursor over a bytecode slice, yielding decoded instructions.
pub struct Decoder<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }

    /// Offset of the next instruction, 0-based.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn byte(&mut self) -> Option<u8> {
        let b = self.code.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    pub fn next(&mut self) -> Option<Instruction> {
        let first = self.byte()?;
        let (op, operand) = if first >> 4 == 0 {
            (Opcode::from_u8(first & 0x0f), self.byte()?)
        } else {
            (Opcode::from_u8(first >> 4), first & 0x0f)
        };
        use Instruction::*;
        Some(match op {
            Opcode::Extended => fatal("nested extended opcode"),
            Opcode::PushInstance => PushInstance(operand),
            Opcode::PushArgument => PushArgument(operand),
            Opcode::PushTemporary => PushTemporary(operand),
            Opcode::PushLiteral => PushLiteral(operand),
            Opcode::PushConstant => PushConstant(operand),
            Opcode::AssignInstance => AssignInstance(operand),
            Opcode::AssignTemporary => AssignTemporary(operand),
            Opcode::MarkArguments => MarkArguments(operand),
            Opcode::SendMessage => SendMessage(operand),
            Opcode::SendUnary => SendUnary(operand),
            Opcode::SendBinary => SendBinary(operand),
            Opcode::DoPrimitive => DoPrimitive {
                argc: operand,
                number: self.byte()?,
            },
            Opcode::DoSpecial => match Special::from_u8(operand) {
                Special::SelfReturn => SelfReturn,
                Special::StackReturn => StackReturn,
                Special::Duplicate => Duplicate,
                Special::PopTop => PopTop,
                Special::Branch => Branch(self.byte()?),
                Special::BranchIfTrue => BranchIfTrue(self.byte()?),
                Special::BranchIfFalse => BranchIfFalse(self.byte()?),
                Special::AndBranch => AndBranch(self.byte()?),
                Special::OrBranch => OrBranch(self.byte()?),
                Special::SendToSuper => SendToSuper(self.byte()?),
            },
        })
    }
}

/// Decode a whole method body; handy in tests.
pub fn decode_all(code: &[u8]) -> Vec<Instruction> {
    let mut d = Decoder::new(code);
    let mut out = Vec::new();
    while let Some(i) = d.next() {
        out.push(i);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::Instruction::*;
    use super::*;

    #[test]
    fn test_compact_form_below_sixteen() {
        let mut code = Vec::new();
        PushArgument(3).encode(&mut code);
        assert_eq!(code, vec![0x23]);
        assert_eq!(decode_all(&code), vec![PushArgument(3)]);
    }

    #[test]
    fn test_extended_form_from_sixteen() {
        let mut code = Vec::new();
        PushLiteral(16).encode(&mut code);
        assert_eq!(code, vec![0x04, 16]);
        assert_eq!(decode_all(&code), vec![PushLiteral(16)]);
    }

    #[test]
    fn test_do_primitive_carries_number_byte() {
        let mut code = Vec::new();
        DoPrimitive { argc: 2, number: 60 }.encode(&mut code);
        assert_eq!(code, vec![0xc2, 60]);
        assert_eq!(decode_all(&code), vec![DoPrimitive { argc: 2, number: 60 }]);
    }

    #[test]
    fn test_branch_target_byte() {
        let mut code = Vec::new();
        BranchIfFalse(9).encode(&mut code);
        Branch(200).encode(&mut code);
        assert_eq!(code, vec![0xd7, 9, 0xd5, 200]);
        assert_eq!(decode_all(&code), vec![BranchIfFalse(9), Branch(200)]);
    }

    #[test]
    fn test_round_trip_mixed_stream() {
        let prog = vec![
            PushArgument(0),
            MarkArguments(1),
            SendMessage(0),
            PushConstant(CONST_TRUE),
            BranchIfFalse(12),
            PushLiteral(40),
            DoPrimitive { argc: 1, number: 14 },
            StackReturn,
            SelfReturn,
        ];
        let mut code = Vec::new();
        for i in &prog {
            i.encode(&mut code);
        }
        assert_eq!(decode_all(&code), prog);
    }
}
