//! The degraded-mode wrapper object.
//!
//! When the output must be assembled by a baseline assembler, the listing
//! is wrapped in a generated source object that starts the compiled code
//! in its own cog and exposes one mailbox-based stub per public function.
//! A stub acquires the mailbox spin-lock, writes its arguments into the
//! parameter slots, publishes the target entry point, and either polls for
//! completion (functions with results) or returns immediately.
//!
//! The text is produced by a small named-slot template engine rather than
//! string concatenation, so the contracts stay readable.

use crate::ast::Module;
use crate::types::Type;
use std::fmt::Write;

/// Expand `{name}` slots in `template` from `slots`. Unknown slots are
/// left verbatim so mistakes show up in the output.
pub fn expand(template: &str, slots: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in slots {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

const HEADER: &str = "\
CON
  __MBOX_SIZE = 20
  __STACK_SIZE = 128

VAR
  long __mbox[__MBOX_SIZE]   ' mailbox for communicating with remote COG
  long __objmem[{objlongs}]          ' space for hub data in COG code
  long __stack[__STACK_SIZE] ' stack for new COG
  byte __cognum              ' 1 + the ID of the running COG (0 if nothing running)

'' Code to start the object running in its own COG
'' This must always be called before any other methods
PUB __coginit(id)
  if (__cognum == 0) ' if the cog isn't running yet
    __fixup_addresses
    longfill(@__mbox, 0, __MBOX_SIZE)
    __mbox[1] := {entry_slot}
    __mbox[2] := @__objmem
    __mbox[3] := @__stack
    if (id < 0)
      id := cognew(@entry, @__mbox)
    else
      coginit(id, @entry, @__mbox) ' actually start the cog
    __cognum := id + 1
  return id

PUB __cognew
  return __coginit(-1)

'' Code to stop the remote COG
PUB __cogstop
  if __cognum
    __lock  ' wait until everyone else is finished
    cogstop(__cognum~ - 1)
    __mbox[0] := 0
    __cognum := 0

'' Code to lock access to the PASM COG
'' Multiple interpreter threads may want access to the PASM COG, so this
'' lock makes sure they don't step on each other.
PRI __lock
  repeat
    repeat until __mbox[0] == 0   ' wait until no other thread is using remote
    __mbox[0] := __cognum         ' try to claim it
  until __mbox[0] == __cognum     ' make sure we really did get it

  repeat until __mbox[1] == 0     ' now wait for the COG itself to be idle

'' Code to release access to the PASM COG
PRI __unlock
  __mbox[0] := 0

'' Check to see if the PASM COG is busy (still working on something)
PUB __busy
  return __mbox[1] <> 0

'' Code to send a message to the remote COG asking it to perform a method
'' func is the entrypoint of the method to perform
'' if getresult is nonzero we wait for the remote COG to answer
PRI __invoke(func, getresult) : r
  __mbox[1] := func - @entry     ' set the function to perform
  if getresult                   ' if we should wait for an answer
    repeat until __mbox[1] == 0  ' wait for remote COG to be idle
    r := __mbox[2]               ' pick up remote COG result
  __unlock                       ' release to other COGs
  return r

'' Code to convert relative addresses to absolute addresses
'' The compiled code contains some absolute pointers internally, but a
'' baseline assembler can only emit relative ones. The compiler inserts a
'' chain of fixups, each entry holding the relative address in the low
'' word and a pointer to the next fixup in the high word. This code
'' follows the chain and patches the relative addresses in place.
PRI __fixup_addresses | ptr, nextptr, temp
  ptr := __fixup_ptr[0]
  repeat while (ptr)      ' the fixup chain is terminated with a 0 pointer
    ptr := @@ptr          ' point to next fixup
    temp := long[ptr]     ' get the data
    nextptr := temp >> 16 ' high 16 bits contains link to next fixup
    temp := temp & $ffff  ' low 16 bits contains real pointer
    long[ptr] := @@temp   ' replace fixup data with real pointer
    ptr := nextptr
  __fixup_ptr[0] := 0 ' mark fixups as done

'--------------------------------------------------
' Stub functions to perform remote calls to the COG
'--------------------------------------------------

";

const FOOTER: &str = "\
'--------------------------------------------------
' The compiled object (translated to PASM)
' This is the code that will run in the remote COG
'--------------------------------------------------

";

/// Emit the wrapper object around the listing. In non-degraded mode only a
/// trivial `main` launcher is produced.
pub fn emit_wrapper_object(out: &mut String, module: &Module, p2: bool, degraded: bool) {
    if !degraded {
        out.push_str("PUB main\n  coginit(0, @entry, 0)\n");
        return;
    }
    let varlen = {
        let v = (module.varsize + 3) & !3;
        v.max(4)
    };
    let entry_slot = if p2 {
        "@entry".to_string()
    } else {
        "@pasm__init - @entry".to_string()
    };
    out.push_str(&expand(
        HEADER,
        &[
            ("objlongs", format!("{}", varlen / 4)),
            ("entry_slot", entry_slot),
        ],
    ));
    for f in module.functions.iter().filter(|f| f.is_public) {
        emit_stub(out, f);
    }
    out.push_str(FOOTER);
}

fn emit_stub(out: &mut String, f: &crate::ast::Function) {
    let _ = write!(out, "PUB {}", f.name);
    if !f.params.is_empty() {
        out.push('(');
        for (i, p) in f.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&p.name);
        }
        out.push(')');
    }
    if f.results.len() > 1 {
        out.push_str(" : r0");
        for i in 1..f.results.len() {
            let _ = write!(out, ", r{}", i);
        }
    }
    out.push('\n');
    out.push_str("  __lock\n");
    for (i, p) in f.params.iter().enumerate() {
        let _ = writeln!(out, "  __mbox[{}] := {}", i + 2, p.name);
    }
    // a function with results must be invoked synchronously
    let synchronous = if f.results.iter().any(|t| *t != Type::Void) {
        1
    } else {
        0
    };
    if f.results.len() < 2 {
        let _ = writeln!(
            out,
            "  return __invoke(@pasm_{}, {})\n",
            f.name, synchronous
        );
    } else {
        let _ = writeln!(out, "  __mbox[1] := @pasm_{} - @entry", f.name);
        out.push_str("  repeat until __mbox[1] == 0\n");
        for i in 0..f.results.len() {
            let _ = writeln!(out, "  r{} := __mbox[{}]", i, 2 + i);
        }
        out.push_str("  __unlock\n\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Function, Language, Param};

    #[test]
    fn slots_expand_by_name() {
        let t = expand(
            "long __objmem[{objlongs}] ' {missing}",
            &[("objlongs", "4".to_string())],
        );
        assert_eq!(t, "long __objmem[4] ' {missing}");
    }

    #[test]
    fn async_and_sync_stubs() {
        let mut m = crate::ast::Module::new("drv", Language::Spin);
        let mut start = Function::new("start", Language::Spin);
        start.params.push(Param {
            name: "pin".to_string(),
            ty: crate::types::Type::long(),
        });
        start.results.clear();
        m.functions.push(start);
        let mut read = Function::new("read", Language::Spin);
        read.results.push(crate::types::Type::long());
        m.functions.push(read);
        let mut hidden = Function::new("helper", Language::Spin);
        hidden.is_public = false;
        m.functions.push(hidden);

        let mut out = String::new();
        emit_wrapper_object(&mut out, &m, false, true);
        // no results: asynchronous invoke
        assert!(out.contains("PUB start(pin)\n  __lock\n  __mbox[2] := pin\n  return __invoke(@pasm_start, 0)\n"));
        // one result: synchronous invoke
        assert!(out.contains("  return __invoke(@pasm_read, 1)\n"));
        // private functions get no stub
        assert!(!out.contains("PUB helper"));
        // mailbox plumbing is present
        assert!(out.contains("PRI __fixup_addresses"));
        assert!(out.contains("__mbox[1] := @pasm__init - @entry"));
    }

    #[test]
    fn multi_result_stub_fetches_each_slot() {
        let mut m = crate::ast::Module::new("drv", Language::Spin);
        let mut f = Function::new("minmax", Language::Spin);
        f.results.push(crate::types::Type::long());
        f.results.push(crate::types::Type::long());
        m.functions.push(f);
        let mut out = String::new();
        emit_wrapper_object(&mut out, &m, false, true);
        assert!(out.contains("PUB minmax : r0, r1\n"));
        assert!(out.contains("  __mbox[1] := @pasm_minmax - @entry\n"));
        assert!(out.contains("  r1 := __mbox[3]\n"));
    }

    #[test]
    fn plain_mode_gets_launcher_only() {
        let m = crate::ast::Module::new("drv", Language::Spin);
        let mut out = String::new();
        emit_wrapper_object(&mut out, &m, false, false);
        assert_eq!(out, "PUB main\n  coginit(0, @entry, 0)\n");
    }
}
