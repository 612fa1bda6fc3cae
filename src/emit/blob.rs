//! Emitting binary blobs as data directives.
//!
//! A blob is a byte array plus a relocation vector. Emission walks both in
//! parallel: each `AbsoluteLong` relocation produces a `long` whose value
//! is the blob's base label plus the addend; `DebugLine` relocations emit a
//! source-line comment and consume no bytes. Between relocations, runs of
//! one repeated byte compress into repeated-long or repeated-byte
//! directives and everything else packs up to sixteen bytes per line.
//!
//! The byte count emitted always equals the input length rounded up to a
//! multiple of four; the pad bytes are explicit zeros.

use super::EmitState;
use crate::ir::{Operand, OperandData, Reloc, RelocKind};
use std::fmt::Write;

/// Longest plain byte line.
const MAX_BYTES_ON_LINE: usize = 16;

pub(super) fn output_blob(st: &mut EmitState, label: Operand, blob: Operand) {
    let (mut data, relocs) = match st.ctx.pool.data(blob) {
        OperandData::ImmBinary { data, relocs } => (data.clone(), relocs.clone()),
        _ => {
            st.internal("bad binary blob");
            return;
        }
    };
    let label_name = st.operand_name(label);

    // long alignment, then the label in column 1
    if st.ctx.options.isa == crate::isa::IsaKind::P2 {
        st.s("\talignl\n");
    } else {
        st.s("\tlong\n");
    }
    st.s(&label_name);
    st.s("\n");

    while data.len() % 4 != 0 {
        data.push(0);
    }

    let mut addr = 0usize;
    let mut next_reloc = 0usize;
    while addr < data.len() {
        let mut pending = data.len() - addr;

        // consume any relocation landing exactly here
        while next_reloc < relocs.len() && relocs[next_reloc].offset as usize == addr {
            let reloc: &Reloc = &relocs[next_reloc];
            match &reloc.kind {
                RelocKind::DebugLine(line) => {
                    let _ = writeln!(st.out, "'-' {}", line);
                    next_reloc += 1;
                }
                RelocKind::AbsoluteLong => {
                    if pending < 4 {
                        st.internal("not enough space for reloc");
                        return;
                    }
                    let addend = reloc.addend;
                    let base = st.hub_address_expr(&label_name);
                    st.s("\tlong\t");
                    if addend == 0 {
                        let _ = writeln!(st.out, "{}", base);
                    } else if addend > 0 {
                        let _ = writeln!(st.out, "{} + {}", base, addend);
                    } else {
                        let _ = writeln!(st.out, "{} - {}", base, -addend);
                    }
                    st.flush_pending_fixup();
                    addr += 4;
                    next_reloc += 1;
                }
            }
            if addr >= data.len() {
                return;
            }
            pending = data.len() - addr;
        }
        if next_reloc < relocs.len() {
            let to_reloc = relocs[next_reloc].offset as usize - addr;
            if pending > to_reloc {
                pending = to_reloc;
            }
        }

        // long runs of one byte compress
        if pending > MAX_BYTES_ON_LINE {
            let first = data[addr];
            let mut run = 0usize;
            while run < pending && data[addr + run] == first {
                run += 1;
            }
            if run > 4 {
                if run % 4 == 0 {
                    let long = u32::from_le_bytes([first, first, first, first]);
                    let _ = writeln!(st.out, "\tlong\t${:08x}[{}]", long, run / 4);
                } else {
                    let _ = writeln!(st.out, "\tbyte\t${:02x}[{}]", first, run);
                }
                addr += run;
                continue;
            }
        }

        // plain packed bytes
        let take = pending.min(MAX_BYTES_ON_LINE);
        st.s("\tbyte\t");
        for (i, b) in data[addr..addr + take].iter().enumerate() {
            if i > 0 {
                st.s(", ");
            }
            let _ = write!(st.out, "${:02x}", b);
        }
        st.s("\n");
        addr += take;
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{CompileContext, Options, OutputMode};
    use crate::emit::ir_assemble;
    use crate::ir::{Ir, IrList, Opcode, OperandData, Reloc, RelocKind};
    use crate::isa::IsaKind;
    use smallvec::SmallVec;

    fn emit_blob(
        isa: IsaKind,
        output: OutputMode,
        data: Vec<u8>,
        relocs: Vec<Reloc>,
    ) -> String {
        let mut ctx = CompileContext::new(Options {
            isa,
            output,
            ..Options::default()
        });
        let mut list = IrList::new();
        let label = ctx.pool.get(OperandData::HubLabel("blob".into()));
        let blob = ctx.pool.add_blob(data, SmallVec::from_vec(relocs));
        let mut ir = Ir::new(Opcode::LabeledBlob);
        ir.dst = Some(label);
        ir.src = Some(blob);
        ctx.arena.emit(&mut list, ir);
        ir_assemble(&mut ctx, &list, None)
    }

    fn emitted_byte_count(text: &str) -> usize {
        let mut n = 0;
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("byte\t") {
                if let Some((val, rep)) = rest.split_once('[') {
                    let _ = val;
                    n += rep.trim_end_matches(']').parse::<usize>().unwrap();
                } else {
                    n += rest.split(',').count();
                }
            } else if let Some(rest) = line.strip_prefix("long\t") {
                if rest.is_empty() {
                    continue; // alignment directive
                }
                if let Some((_, rep)) = rest.split_once('[') {
                    n += 4 * rep.trim_end_matches(']').parse::<usize>().unwrap();
                } else {
                    n += 4;
                }
            }
        }
        n
    }

    #[test]
    fn blob_pads_to_long_multiple() {
        let text = emit_blob(IsaKind::P1, OutputMode::Asm, vec![1, 2, 3, 4, 5], vec![]);
        assert!(text.contains("blob\n"));
        assert_eq!(emitted_byte_count(&text), 8);
        assert!(text.contains("\tbyte\t$01, $02, $03, $04, $05, $00, $00, $00\n"));
    }

    #[test]
    fn reloc_long_with_addend() {
        // bytes 0-3 literal, bytes 4-7 relocated with +8
        let mut data = vec![0u8; 8];
        data[0] = 0xaa;
        let text = emit_blob(
            IsaKind::P1,
            OutputMode::Asm,
            data,
            vec![Reloc {
                kind: RelocKind::AbsoluteLong,
                offset: 4,
                addend: 8,
            }],
        );
        assert!(text.contains("\tlong\t@@@blob + 8\n"), "got: {}", text);
        assert!(text.contains("\tbyte\t$aa, $00, $00, $00\n"));
    }

    #[test]
    fn negative_addend_renders_minus() {
        let text = emit_blob(
            IsaKind::P1,
            OutputMode::Asm,
            vec![0u8; 4],
            vec![Reloc {
                kind: RelocKind::AbsoluteLong,
                offset: 0,
                addend: -4,
            }],
        );
        assert!(text.contains("\tlong\t@@@blob - 4\n"));
    }

    #[test]
    fn debug_line_relocs_consume_no_bytes() {
        let text = emit_blob(
            IsaKind::P1,
            OutputMode::Asm,
            vec![7u8; 4],
            vec![Reloc {
                kind: RelocKind::DebugLine("x := 1".into()),
                offset: 0,
                addend: 0,
            }],
        );
        assert!(text.contains("'-' x := 1\n"));
        assert_eq!(emitted_byte_count(&text), 4);
    }

    #[test]
    fn runs_compress_to_repeated_long() {
        let mut data = vec![0xaau8; 32];
        data.extend_from_slice(&[1, 2, 3, 4]);
        let text = emit_blob(IsaKind::P1, OutputMode::Asm, data, vec![]);
        assert!(text.contains("\tlong\t$aaaaaaaa[8]\n"), "got: {}", text);
        assert_eq!(emitted_byte_count(&text), 36);
    }

    #[test]
    fn odd_runs_compress_to_repeated_byte() {
        let mut data = vec![0x55u8; 19];
        data.extend_from_slice(&[9; 17]);
        let text = emit_blob(IsaKind::P1, OutputMode::Asm, data, vec![]);
        assert!(text.contains("\tbyte\t$55[19]\n"), "got: {}", text);
        assert_eq!(emitted_byte_count(&text), 36);
    }

    #[test]
    fn degraded_mode_reloc_joins_fixup_chain() {
        let text = emit_blob(
            IsaKind::P1,
            OutputMode::DegradedAsm,
            vec![0u8; 4],
            vec![Reloc {
                kind: RelocKind::AbsoluteLong,
                offset: 0,
                addend: 0,
            }],
        );
        assert!(text.contains("\tlong\t@blob\n__fixup_1\n"), "got: {}", text);
        assert!(text.contains("__fixup_ptr\n\tlong\t@__fixup_1 - 4\n"));
    }

    #[test]
    fn p2_blob_uses_alignl() {
        let text = emit_blob(IsaKind::P2, OutputMode::Asm, vec![1, 2, 3, 4], vec![]);
        assert!(text.contains("\talignl\nblob\n"));
    }
}
