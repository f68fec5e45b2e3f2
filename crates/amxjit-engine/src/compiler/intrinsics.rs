//! Inline native overrides
//!
//! The floating-point natives every script pulls in are small enough to
//! inline as x87 sequences instead of a full native call. At the `SYSREQ`
//! site the stack holds `[argc][arg1][arg2]`, so arguments sit at fixed
//! offsets off the VM stack pointer; each override leaves its result in the
//! PRI register and the stack untouched (the following `STACK` instruction
//! pops the arguments, as it would after a real call).

use rustc_hash::FxHashMap;

use crate::asm::{Emitter, Mem, Reg};

/// An override emits the whole replacement sequence for one native.
pub type NativeOverride = fn(&mut Emitter<'_>);

/// Build the override registry. Constructed once per compiler and frozen.
pub fn registry() -> FxHashMap<&'static str, NativeOverride> {
    let mut map: FxHashMap<&'static str, NativeOverride> = FxHashMap::default();
    map.insert("float", native_float);
    map.insert("floatabs", native_floatabs);
    map.insert("floatadd", native_floatadd);
    map.insert("floatsub", native_floatsub);
    map.insert("floatmul", native_floatmul);
    map.insert("floatdiv", native_floatdiv);
    map.insert("floatsqroot", native_floatsqroot);
    map.insert("floatlog", native_floatlog);
    map
}

fn arg(index: i32) -> Mem {
    Mem::base_disp(Reg::Esp, 4 * index)
}

// Spill st0 through a scratch stack slot into PRI.
fn store_result(e: &mut Emitter<'_>) {
    e.push_r(Reg::Eax);
    e.fstp_m32(Mem::base(Reg::Esp));
    e.pop_r(Reg::Eax);
}

fn native_float(e: &mut Emitter<'_>) {
    e.fild_m32(arg(1));
    store_result(e);
}

fn native_floatabs(e: &mut Emitter<'_>) {
    e.fld_m32(arg(1));
    e.fabs();
    store_result(e);
}

fn native_floatadd(e: &mut Emitter<'_>) {
    e.fld_m32(arg(1));
    e.fadd_m32(arg(2));
    store_result(e);
}

fn native_floatsub(e: &mut Emitter<'_>) {
    e.fld_m32(arg(1));
    e.fsub_m32(arg(2));
    store_result(e);
}

fn native_floatmul(e: &mut Emitter<'_>) {
    e.fld_m32(arg(1));
    e.fmul_m32(arg(2));
    store_result(e);
}

fn native_floatdiv(e: &mut Emitter<'_>) {
    e.fld_m32(arg(1));
    e.fdiv_m32(arg(2));
    store_result(e);
}

fn native_floatsqroot(e: &mut Emitter<'_>) {
    e.fld_m32(arg(1));
    e.fsqrt();
    store_result(e);
}

// log_base(value) = log2(value) / log2(base), via fyl2x twice.
fn native_floatlog(e: &mut Emitter<'_>) {
    e.fld1();
    e.fld_m32(arg(2));
    e.fyl2x();
    e.fld1();
    e.fdivrp();
    e.fld_m32(arg(1));
    e.fyl2x();
    store_result(e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{CodeBuffer, Mode};

    fn emit(f: NativeOverride) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        {
            let mut e = Emitter::new(&mut buf, Mode::Protected32);
            f(&mut e);
        }
        buf.finalise().unwrap();
        buf.into_bytes()
    }

    #[test]
    fn test_registry_contents() {
        let reg = registry();
        assert_eq!(reg.len(), 8);
        assert!(reg.contains_key("floatadd"));
        assert!(reg.contains_key("floatsqroot"));
        assert!(!reg.contains_key("floatcmp"));
    }

    #[test]
    fn test_floatadd_sequence() {
        // fld [esp+4]; fadd [esp+8]; push eax; fstp [esp]; pop eax
        assert_eq!(
            emit(native_floatadd),
            [
                0xD9, 0x44, 0x24, 0x04,
                0xD8, 0x44, 0x24, 0x08,
                0x50,
                0xD9, 0x1C, 0x24,
                0x58,
            ]
        );
    }

    #[test]
    fn test_float_uses_integer_load() {
        let code = emit(native_float);
        // fild dword [esp+4]
        assert_eq!(&code[..4], &[0xDB, 0x44, 0x24, 0x04]);
    }

    #[test]
    fn test_overrides_are_stack_neutral() {
        // Every override pairs its pushes and pops.
        for (_, f) in registry() {
            let code = emit(f);
            let pushes = code.iter().filter(|&&b| b == 0x50).count();
            let pops = code.iter().filter(|&&b| b == 0x58).count();
            assert_eq!(pushes, pops);
        }
    }
}
