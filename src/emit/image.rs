//! Raw machine images.
//!
//! When producing an image instead of assembler text, the module's DAT
//! block is rendered to bytes and (on P1) prefixed with the interpreter
//! boot header: clock frequency, clock mode, a checksum byte, the object
//! table pointers, and a minimal init bytecode that jumps into the
//! compiled code. The checksum byte is patched so the whole image sums to
//! `0x14` modulo 256, the value the boot ROM expects.

use crate::ast::{DatItem, Module, Symbol};
use crate::context::CompileContext;
use crate::diag::SourceLoc;
use std::path::Path;

/// Default clock frequency when the module defines none.
const DEFAULT_CLKFREQ: u32 = 80_000_000;
/// Default clock mode register value (`xtal1 + pll16x`).
const DEFAULT_CLKMODE: u8 = 0x6f;

/// Offset of the checksum byte within the header.
const CHECKSUM_OFFSET: usize = 5;

fn push_word(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_long(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// The module's clock settings, from its `_clkfreq`/`_clkmode` constants.
fn clock_settings(module: &Module) -> (u32, u8) {
    let freq = match module.symbols.lookup("_clkfreq") {
        Some(Symbol::Constant(v)) => *v as u32,
        _ => DEFAULT_CLKFREQ,
    };
    let mode = match module.symbols.lookup("_clkmode") {
        Some(Symbol::Constant(v)) => *v as u8,
        _ => DEFAULT_CLKMODE,
    };
    (freq, mode)
}

/// The interpreter boot header; the checksum byte is left zero and patched
/// by [`patch_checksum`].
fn boot_header(module: &Module) -> Vec<u8> {
    let (clkfreq, clkmode) = clock_settings(module);
    let mut out = Vec::with_capacity(32);
    push_long(&mut out, clkfreq);
    out.push(clkmode);
    out.push(0); // checksum, patched later
    push_word(&mut out, 0x0010); // object base
    push_word(&mut out, 0x7fe8); // variable base
    push_word(&mut out, 0x7ff0); // stack base
    push_word(&mut out, 0x0018); // initial program counter
    push_word(&mut out, 0x7ff8); // initial stack pointer
    push_word(&mut out, 0x0008); // object length
    out.push(0x02);
    out.push(0x00);
    push_word(&mut out, 0x0008);
    push_word(&mut out, 0x0000); // initial stack: 0 means first run
    // minimal init bytecode
    out.extend_from_slice(&[0x3f, 0x89, 0xc7, 0x10, 0xa4, 0x06, 0x2c, 0x32]);
    out
}

/// Patch the checksum byte so the image bytes sum to `0x14` modulo 256.
fn patch_checksum(image: &mut [u8]) {
    let sum: u8 = image.iter().fold(0u8, |a, b| a.wrapping_add(*b));
    image[CHECKSUM_OFFSET] = 0x14u8.wrapping_sub(sum);
}

/// Render the module's DAT block to raw bytes.
pub fn dat_to_binary(ctx: &mut CompileContext, module: &Module) -> Vec<u8> {
    let mut out = Vec::new();
    for item in &module.dat_block {
        match item {
            DatItem::Label(_) | DatItem::Fit(_) | DatItem::Org(_) => {}
            DatItem::Bytes(values) => {
                for v in values {
                    out.push(const_byte(ctx, v) as u8);
                }
            }
            DatItem::Words(values) => {
                for v in values {
                    push_word(&mut out, const_byte(ctx, v) as u16);
                }
            }
            DatItem::Longs(values) => {
                for v in values {
                    push_long(&mut out, const_byte(ctx, v) as u32);
                }
            }
            DatItem::Instr(instr) => {
                // the parser supplies the full encoding
                push_long(&mut out, instr.encoding);
            }
            DatItem::File { data, .. } => {
                out.extend_from_slice(data);
                while out.len() % 4 != 0 {
                    out.push(0);
                }
            }
            DatItem::Res(n) => {
                out.resize(out.len() + (*n as usize) * 4, 0);
            }
        }
    }
    out
}

fn const_byte(ctx: &mut CompileContext, v: &crate::ast::Expr) -> i64 {
    v.const_value().unwrap_or_else(|| {
        ctx.diags
            .error(SourceLoc::builtin(), "data item is not constant");
        0
    })
}

/// Build a complete machine image from the module's DAT block, with the
/// boot header when `prefix_header` is set.
pub fn build_image(ctx: &mut CompileContext, module: &Module, prefix_header: bool) -> Vec<u8> {
    let data = dat_to_binary(ctx, module);
    if !prefix_header {
        return data;
    }
    let mut image = boot_header(module);
    image.extend_from_slice(&data);
    patch_checksum(&mut image);
    image
}

/// Write the module's data to `path`, optionally prefixed with the boot
/// header. This is the image-producing counterpart of the text emitter.
pub fn output_dat_file(
    path: &Path,
    ctx: &mut CompileContext,
    module: &Module,
    prefix_header: bool,
) -> std::io::Result<()> {
    let image = build_image(ctx, module, prefix_header);
    std::fs::write(path, image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Language};
    use crate::context::Options;

    fn ctx() -> CompileContext {
        CompileContext::new(Options::default())
    }

    #[test]
    fn header_layout() {
        let mut m = Module::new("top", Language::Spin);
        m.symbols.insert("_clkfreq", Symbol::Constant(12_000_000));
        m.symbols.insert("_clkmode", Symbol::Constant(0x22));
        let h = boot_header(&m);
        assert_eq!(&h[0..4], &12_000_000u32.to_le_bytes());
        assert_eq!(h[4], 0x22);
        assert_eq!(h[5], 0); // checksum placeholder
        assert_eq!(h[24], 0x3f); // init bytecode follows the object table
        assert_eq!(h.len(), 32);
    }

    #[test]
    fn checksum_balances_image() {
        let mut m = Module::new("top", Language::Spin);
        m.dat_block.push(DatItem::Longs(vec![Expr::Int(0xdeadbeef)]));
        let image = build_image(&mut ctx(), &m, true);
        let sum: u8 = image.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(sum, 0x14);
    }

    #[test]
    fn dat_rendering() {
        let mut m = Module::new("top", Language::Spin);
        m.dat_block.push(DatItem::Bytes(vec![Expr::Int(1), Expr::Int(2)]));
        m.dat_block.push(DatItem::Words(vec![Expr::Int(0x0304)]));
        m.dat_block.push(DatItem::Longs(vec![Expr::Int(0x05060708)]));
        m.dat_block.push(DatItem::Res(1));
        let bytes = dat_to_binary(&mut ctx(), &m);
        assert_eq!(
            bytes,
            vec![1, 2, 0x04, 0x03, 0x08, 0x07, 0x06, 0x05, 0, 0, 0, 0]
        );
    }

    #[test]
    fn file_blob_pads_to_long() {
        let mut m = Module::new("top", Language::Spin);
        m.dat_block.push(DatItem::File {
            data: vec![9, 9, 9],
            relocs: vec![],
        });
        let bytes = dat_to_binary(&mut ctx(), &m);
        assert_eq!(bytes, vec![9, 9, 9, 0]);
    }
}
