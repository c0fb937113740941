//! VCDIFF instruction code table.
//!
//! Every instruction byte of a delta window selects an entry of the code
//! table, pairing up to two instructions. The default table is generated
//! by the construction from RFC 3284, section 5.6; patches carrying an
//! application-defined table are rejected by the decoder.

use std::sync::LazyLock;

/// Kind of a delta instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Noop,
    Add,
    Run,
    Copy,
}

/// One half of a code table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// Size in bytes; `0` means the size follows in the instruction section.
    pub size: u8,
    /// Address mode for `Copy` instructions.
    pub mode: u8,
}

impl Instruction {
    const NOOP: Instruction = Instruction {
        kind: InstructionKind::Noop,
        size: 0,
        mode: 0,
    };

    const fn new(kind: InstructionKind, size: u8, mode: u8) -> Self {
        Self { kind, size, mode }
    }
}

/// A code table entry pairing up to two instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub first: Instruction,
    pub second: Instruction,
}

/// The instruction code table of a delta stream.
pub struct CodeTable {
    entries: [Entry; 256],
}

impl CodeTable {
    /// The entry for the given instruction code.
    pub fn entry(&self, code: u8) -> &Entry {
        &self.entries[code as usize]
    }
}

/// The default code table per RFC 3284, section 5.6.
pub fn default_table() -> &'static CodeTable {
    static TABLE: LazyLock<CodeTable> = LazyLock::new(build_default_table);
    &TABLE
}

fn build_default_table() -> CodeTable {
    use InstructionKind::*;

    let noop_pair = Entry {
        first: Instruction::NOOP,
        second: Instruction::NOOP,
    };
    let mut entries = [noop_pair; 256];
    let mut index = 0;
    let mut push = |first: Instruction, second: Instruction| {
        entries[index] = Entry { first, second };
        index += 1;
    };

    push(Instruction::new(Run, 0, 0), Instruction::NOOP);
    for size in 0..18 {
        push(Instruction::new(Add, size, 0), Instruction::NOOP);
    }
    for mode in 0..9 {
        push(Instruction::new(Copy, 0, mode), Instruction::NOOP);
        for size in 4..19 {
            push(Instruction::new(Copy, size, mode), Instruction::NOOP);
        }
    }
    for mode in 0..6 {
        for add_size in 1..5 {
            for copy_size in 4..7 {
                push(
                    Instruction::new(Add, add_size, 0),
                    Instruction::new(Copy, copy_size, mode),
                );
            }
        }
    }
    for mode in 6..9 {
        for add_size in 1..5 {
            push(
                Instruction::new(Add, add_size, 0),
                Instruction::new(Copy, 4, mode),
            );
        }
    }
    for mode in 0..9 {
        push(
            Instruction::new(Copy, 4, mode),
            Instruction::new(Add, 1, 0),
        );
    }
    assert_eq!(index, 256, "default code table must have 256 entries");
    CodeTable { entries }
}

#[cfg(test)]
mod tests {
    use super::InstructionKind::*;
    use super::*;

    #[test]
    fn test_default_table_layout() {
        let table = default_table();
        assert_eq!(table.entry(0).first.kind, Run);
        assert_eq!(table.entry(1).first.kind, Add);
        assert_eq!(table.entry(1).first.size, 0);
        assert_eq!(table.entry(18).first.size, 17);
        // COPY groups: size 0, then 4..18, for each of the nine modes.
        assert_eq!(table.entry(19).first.kind, Copy);
        assert_eq!(table.entry(19).first.size, 0);
        assert_eq!(table.entry(20).first.size, 4);
        assert_eq!(table.entry(34).first.size, 18);
        assert_eq!(table.entry(35).first.mode, 1);
        assert_eq!(table.entry(162).first.mode, 8);
        // Combined ADD + COPY.
        let entry = table.entry(163);
        assert_eq!((entry.first.kind, entry.first.size), (Add, 1));
        assert_eq!((entry.second.kind, entry.second.size), (Copy, 4));
        assert_eq!(entry.second.mode, 0);
        // Combined COPY + ADD.
        let entry = table.entry(247);
        assert_eq!((entry.first.kind, entry.first.size), (Copy, 4));
        assert_eq!((entry.second.kind, entry.second.size), (Add, 1));
        assert_eq!(table.entry(255).first.mode, 8);
    }
}
