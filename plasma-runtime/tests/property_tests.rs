//! Property-based tests for the format layer and the heap.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use proptest::prelude::*;

use plasma_runtime::format::{
    data_enc_bytes, instruction_info, num_immediate_bytes, write_instr, DataEnc, ImmediateType,
    ImmediateValue, Opcode, Width, WORD_SIZE,
};
use plasma_runtime::gc::capability::GcCapability;
use plasma_runtime::gc::RootTracer;
use plasma_runtime::machine::{Machine, MachineOptions};

fn width() -> impl Strategy<Value = Width> {
    (0u8..6).prop_map(|code| Width::from_u8(code).unwrap())
}

fn opcode() -> impl Strategy<Value = Opcode> {
    (0u8..=41).prop_map(|code| Opcode::from_file_u8(code).unwrap())
}

proptest! {
    /// Width codes survive a round trip and decode to their own code.
    #[test]
    fn width_code_roundtrip(w in width()) {
        prop_assert_eq!(Width::from_u8(w as u8), Some(w));
        prop_assert!(w.to_bytes() >= 1 && w.to_bytes() <= 8);
    }

    /// Data-slot tag bytes carry their encoding and byte count.
    #[test]
    fn data_enc_tag_roundtrip(enc_code in 0u8..6, bytes in 0u8..16) {
        let enc = DataEnc::from_tag(enc_code << 4).unwrap();
        let tag = enc.tag(bytes);
        prop_assert_eq!(DataEnc::from_tag(tag), Some(enc));
        prop_assert_eq!(data_enc_bytes(tag), bytes);
    }

    /// The sizing pass and the writing pass of write_instr agree for
    /// every opcode whose layout needs no symbolic resolution.
    #[test]
    fn instr_sizing_matches_writing(op in opcode(), w1 in width(), w2 in width(), raw in any::<u64>()) {
        let info = instruction_info(op);
        let width1 = (info.num_width_bytes > 0).then_some(w1);
        let width2 = (info.num_width_bytes > 1).then_some(w2);
        let imm = match info.immediate {
            ImmediateType::None => ImmediateValue::None,
            ImmediateType::Num => ImmediateValue::Num(raw),
            ImmediateType::Imm8 => ImmediateValue::U8(raw as u8),
            ImmediateType::ImportRef | ImmediateType::StructRefField => {
                ImmediateValue::U16(raw as u16)
            }
            _ => ImmediateValue::Word(raw as usize),
        };

        let size = write_instr(None, 0, op, width1, width2, imm);
        prop_assert!(size >= 1);
        let mut buffer = vec![0u8; size];
        let written = write_instr(Some(&mut buffer), 0, op, width1, width2, imm);
        prop_assert_eq!(written, size);
        prop_assert_eq!(buffer[0], op as u8);
    }

    /// Num immediates encode at the width the loader will fetch.
    #[test]
    fn num_immediates_match_width(w in width()) {
        let bytes = num_immediate_bytes(w);
        prop_assert!(matches!(bytes, 1 | 2 | 4 | 8));
        prop_assert!(bytes <= w.to_bytes().max(4));
    }

    /// Allocations of arbitrary small sizes produce distinct, live,
    /// word-aligned cells.
    #[test]
    fn allocations_are_aligned_and_live(sizes in prop::collection::vec(1usize..64, 1..20)) {
        let machine = Machine::new(MachineOptions::default()).unwrap();
        let tracer = RootTracer::new(&machine);
        let mut cells = Vec::new();
        for size in sizes {
            let cell = tracer.alloc(size);
            prop_assert!(!cell.is_null());
            prop_assert_eq!(cell as usize % WORD_SIZE, 0);
            prop_assert!(machine.heap().is_valid_object(cell));
            prop_assert!(!cells.contains(&(cell as usize)));
            cells.push(cell as usize);
        }
        machine.heap().check_consistency();
    }
}
