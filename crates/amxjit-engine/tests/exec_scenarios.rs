//! End-to-end execution scenarios.
//!
//! The templates emit 32-bit x86, so the tests that actually run generated
//! code are confined to x86 hosts; everything compiles everywhere so the
//! scenarios stay type-checked.

#[cfg(target_arch = "x86")]
mod native_execution {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use amxjit_engine::amx::{Amx, AmxError, Cell, ImageBuilder, Program};
    use amxjit_engine::bytecode::Opcode as Op;
    use amxjit_engine::exec::{ExecEngine, SharedMemory};
    use amxjit_engine::VirtualMemoryManager;

    fn shared_memory() -> SharedMemory {
        Arc::new(Mutex::new(VirtualMemoryManager::new()))
    }

    /// Dispatch natives by name: enough host runtime for the scenarios.
    unsafe extern "C" fn test_callback(
        amx: *mut Amx,
        index: Cell,
        result: *mut Cell,
        _params: *mut Cell,
    ) -> i32 {
        let program = Program::new(amx);
        match program.native_name(index as usize) {
            Some("do_sleep") => {
                (*amx).error = AmxError::Sleep as i32;
                *result = 0xC0FFEE;
                (*amx).error
            }
            Some("give_seven") => {
                *result = 7;
                AmxError::None as i32
            }
            _ => AmxError::Callback as i32,
        }
    }

    #[test]
    fn test_arithmetic_chain_returns_ten() {
        let mut image = ImageBuilder::new()
            .public("chain", 0)
            .code(vec![
                Op::Proc as Cell,
                Op::ZeroPri as Cell,
                Op::AddC as Cell, 1,
                Op::AddC as Cell, 2,
                Op::AddC as Cell, 3,
                Op::AddC as Cell, 4,
                Op::Retn as Cell,
            ])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
        assert_eq!(retval, 10);
    }

    #[test]
    fn test_recursive_factorial() {
        let code = vec![
            Op::Proc as Cell,            // 0
            Op::LoadSPri as Cell, 12,    // 4
            Op::ConstAlt as Cell, 1,     // 12
            Op::Jsleq as Cell, 80,       // 20
            Op::LoadSPri as Cell, 12,    // 28
            Op::AddC as Cell, -1,        // 36
            Op::PushPri as Cell,         // 44
            Op::PushC as Cell, 4,        // 48
            Op::Call as Cell, 0,         // 56
            Op::LoadSAlt as Cell, 12,    // 64
            Op::Smul as Cell,            // 72
            Op::Retn as Cell,            // 76
            Op::ConstPri as Cell, 1,     // 80
            Op::Retn as Cell,            // 88
        ];
        let mut image = ImageBuilder::new().public("fact", 0).code(code).build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };

        for (n, expected) in [(0, 1), (1, 1), (5, 120), (7, 5040)] {
            image.push(n);
            let mut retval = 0;
            assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
            assert_eq!(retval, expected, "fact({n})");
        }
    }

    #[test]
    fn test_float_override_is_bit_exact() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .native("floatadd")
            .code(vec![
                Op::Proc as Cell,
                Op::PushC as Cell, 2.25f32.to_bits() as Cell,
                Op::PushC as Cell, 1.5f32.to_bits() as Cell,
                Op::PushC as Cell, 8,
                Op::SysreqC as Cell, 0,
                Op::Stack as Cell, 12,
                Op::Retn as Cell,
            ])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
        assert_eq!(retval as u32, 3.75f32.to_bits());
    }

    #[test]
    fn test_generic_native_round_trip() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .native("give_seven")
            .code(vec![
                Op::Proc as Cell,
                Op::PushC as Cell, 0,
                Op::SysreqC as Cell, 0,
                Op::Stack as Cell, 4,
                Op::AddC as Cell, 1,
                Op::Retn as Cell,
            ])
            .build();
        image.set_callback(test_callback);
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
        assert_eq!(retval, 8);
    }

    #[test]
    fn test_sleep_preserves_state_and_resume_continues() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .native("do_sleep")
            .code(vec![
                Op::Proc as Cell,        // 0
                Op::PushC as Cell, 0,    // 4
                Op::SysreqC as Cell, 0,  // 12
                Op::Stack as Cell, 4,    // 20
                Op::Retn as Cell,        // 28
            ])
            .build();
        image.set_callback(test_callback);
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };

        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::Sleep as i32);
        assert_eq!(image.amx.pri, 0xC0FFEE);
        // Resume continues after the sysreq...
        assert_eq!(image.amx.cip, 20);

        let mut resumed = 0;
        assert_eq!(engine.resume(Some(&mut resumed)), AmxError::None as i32);
        // ...with PRI carried through to the final return.
        assert_eq!(resumed, 0xC0FFEE);
    }

    #[test]
    fn test_bounds_violation_reports_err_bounds() {
        // Index 10 into a 4-cell array guarded by BOUNDS 3.
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .data(vec![11, 22, 33, 44])
            .code(vec![
                Op::Proc as Cell,
                Op::ConstAlt as Cell, 0,
                Op::ConstPri as Cell, 10,
                Op::Bounds as Cell, 3,
                Op::Lidx as Cell,
                Op::Retn as Cell,
            ])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::Bounds as i32);
        // The guarded array is intact.
        for (i, want) in [11, 22, 33, 44].into_iter().enumerate() {
            assert_eq!(image.data_cell(i as Cell * 4), want);
        }
    }

    #[test]
    fn test_in_bounds_lidx_reads_array() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .data(vec![11, 22, 33, 44])
            .code(vec![
                Op::Proc as Cell,
                Op::ConstAlt as Cell, 0,
                Op::ConstPri as Cell, 2,
                Op::Bounds as Cell, 3,
                Op::Lidx as Cell,
                Op::Retn as Cell,
            ])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
        assert_eq!(retval, 33);
    }

    #[test]
    fn test_division_by_zero_reports_err_divide() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![
                Op::Proc as Cell,
                Op::ConstPri as Cell, 9,
                Op::ZeroAlt as Cell,
                Op::Sdiv as Cell,
                Op::Retn as Cell,
            ])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        assert_eq!(engine.exec(None, 0), AmxError::Divide as i32);
    }

    #[test]
    fn test_switch_dispatch() {
        let code = vec![
            Op::Proc as Cell,            // 0
            Op::LoadSPri as Cell, 12,    // 4
            Op::Switch as Cell, 44,      // 12
            Op::ConstPri as Cell, 10,    // 20
            Op::Retn as Cell,            // 28
            Op::ConstPri as Cell, 20,    // 32
            Op::Retn as Cell,            // 40
            Op::Casetbl as Cell,         // 44
            2,
            72,
            1, 20,
            2, 32,
            Op::ZeroPri as Cell,         // 72
            Op::Retn as Cell,            // 76
        ];
        let mut image = ImageBuilder::new().public("select", 0).code(code).build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        for (arg, expected) in [(1, 10), (2, 20), (3, 0), (-7, 0)] {
            image.push(arg);
            let mut retval = -1;
            assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
            assert_eq!(retval, expected, "select({arg})");
        }
    }

    #[test]
    fn test_locals_and_loop() {
        // sum = 0; for (i = n; i > 0; i--) sum += i; return sum
        let code = vec![
            Op::Proc as Cell,            // 0
            Op::Stack as Cell, -8,       // 4   locals: sum@-4, i@-8
            Op::ZeroS as Cell, -4,       // 12
            Op::LoadSPri as Cell, 12,    // 20
            Op::StorSPri as Cell, -8,    // 28
            Op::LoadSPri as Cell, -8,    // 36  loop:
            Op::ZeroAlt as Cell,         // 44
            Op::Jsleq as Cell, 96,       // 48  if i <= 0 break
            Op::LoadSPri as Cell, -8,    // 56
            Op::LoadSAlt as Cell, -4,    // 64
            Op::Add as Cell,             // 72
            Op::StorSPri as Cell, -4,    // 76
            Op::DecS as Cell, -8,        // 84
            Op::Jump as Cell, 36,        // 92? -- see below
        ];
        // Recompute: Jump sits at ip 92? DecS ends at 92, so Jump at 92,
        // its operand at 96, and the exit path starts at 100.
        let code = {
            let mut c = code;
            assert_eq!(c.len() * 4, 100);
            c.extend_from_slice(&[
                Op::LoadSPri as Cell, -4, // 100
                Op::Stack as Cell, 8,     // 108
                Op::Retn as Cell,         // 116
            ]);
            // Fix the break target to the exit path.
            c[13] = 100;
            c
        };
        let mut image = ImageBuilder::new().public("sum", 0).code(code).build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        for (n, expected) in [(0, 0), (1, 1), (10, 55)] {
            image.push(n);
            let mut retval = -1;
            assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::None as i32);
            assert_eq!(retval, expected, "sum({n})");
        }
    }

    #[test]
    fn test_halt_returns_code_and_value() {
        let mut image = ImageBuilder::new()
            .public("go", 0)
            .code(vec![
                Op::Proc as Cell,
                Op::ConstPri as Cell, 0x55,
                Op::Halt as Cell, AmxError::Exit as Cell,
                Op::Retn as Cell,
            ])
            .build();
        let engine = unsafe { ExecEngine::new(image.amx_mut(), shared_memory(), None) };
        let mut retval = 0;
        assert_eq!(engine.exec(Some(&mut retval), 0), AmxError::Exit as i32);
        assert_eq!(retval, 0x55);
    }
}
