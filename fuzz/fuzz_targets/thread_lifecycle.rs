#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use trapstate::{ProcessorState, StackId, SvaError, ThreadPool};

const SLOTS: usize = 4;

#[derive(Debug, Arbitrary)]
enum Op {
    Init { entry: u16 },
    Release { handle: u8 },
    Swap { handle: u8 },
    ForgedRelease { word: usize },
}

fuzz_target!(|ops: Vec<Op>| {
    let cpu = Box::new(ProcessorState::new());
    let pool = Box::new(ThreadPool::<SLOTS>::new());
    let mut stack = vec![0u8; 4096];
    // Every id ever handed out, with whether it should still resolve.
    let mut handles: Vec<(StackId, bool)> = Vec::new();

    for op in ops {
        match op {
            Op::Init { entry } => {
                let live = handles.iter().filter(|(_, live)| *live).count();
                let result = pool.init_stack(&cpu, stack.as_mut_ptr(), stack.len(), entry as usize + 1, 0, 0, 0);
                match result {
                    Ok(id) => {
                        assert!(live < SLOTS);
                        assert!(handles.iter().all(|(old, _)| *old != id));
                        handles.push((id, true));
                    }
                    Err(err) => {
                        assert_eq!(err, SvaError::NoFreeThread);
                        assert_eq!(live, SLOTS);
                    }
                }
            }
            Op::Release { handle } if !handles.is_empty() => {
                let slot = handle as usize % handles.len();
                let (id, live) = handles[slot];
                let result = pool.release_stack(&cpu, id);
                if !live {
                    assert_eq!(result, Err(SvaError::StaleHandle(id.as_word())));
                } else if cpu.current_id() == id {
                    assert_eq!(result, Err(SvaError::ThreadRunning));
                } else {
                    assert_eq!(result, Ok(()));
                    handles[slot].1 = false;
                }
            }
            Op::Swap { handle } if !handles.is_empty() => {
                let (id, live) = handles[handle as usize % handles.len()];
                let before = cpu.current_id();
                let mut prev = StackId::NONE;
                match pool.swap_integer(&cpu, id, &mut prev) {
                    Ok(old) => {
                        assert!(live);
                        assert_eq!(cpu.current_id(), id);
                        if before != id {
                            assert_eq!(old, before);
                        }
                    }
                    Err(err) => {
                        assert!(!live);
                        assert_eq!(err, SvaError::StaleHandle(id.as_word()));
                        assert_eq!(cpu.current_id(), before);
                    }
                }
            }
            Op::ForgedRelease { word } => {
                let forged = StackId::from_word(word);
                if handles.iter().all(|(id, live)| !(*live && *id == forged)) {
                    assert!(pool.release_stack(&cpu, forged).is_err());
                }
            }
            _ => {}
        }

        for (id, live) in &handles {
            assert_eq!(pool.in_use(*id), *live);
        }
    }
});
