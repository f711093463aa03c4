#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use trapstate::config::MAX_IC;
use trapstate::InterruptContextPool;

#[derive(Debug, Arbitrary)]
enum Op {
    Enter { pc: usize },
    Leave,
    AllocateFp { used: bool },
    SavePush,
    SavePop,
}

fuzz_target!(|ops: Vec<Op>| {
    let mut pool = Box::new(InterruptContextPool::new());
    // Model: pc written into each live slot.
    let mut live: Vec<usize> = Vec::new();

    for op in ops {
        match op {
            Op::Enter { pc } if pool.depth() < MAX_IC => {
                let index = pool.enter();
                assert_eq!(index, live.len() + 1);
                let ic = pool.current_mut();
                ic.pc = pc;
                ic.mark_valid();
                live.push(pc);
            }
            Op::Leave if pool.depth() > 0 => {
                pool.leave(pool.depth());
                live.pop();
            }
            Op::AllocateFp { used } if pool.fp_index() < MAX_IC => {
                let before = pool.fp_index();
                match pool.allocate_fp(used) {
                    Some(slot) => assert!(slot == before || slot == before + 1),
                    None => assert!(!used),
                }
            }
            Op::SavePush if pool.saved_depth() < MAX_IC => {
                pool.saved_context_push();
            }
            Op::SavePop if pool.saved_depth() > 0 => {
                let fpstate = pool.current().fpstate;
                pool.saved_context_pop();
                assert_eq!(pool.current().fpstate, fpstate);
                if let Some(pc) = live.last_mut() {
                    *pc = pool.current().pc;
                }
            }
            _ => {}
        }

        assert_eq!(pool.depth(), live.len());
        assert!(pool.fp_index() <= MAX_IC);
        assert!(pool.saved_depth() <= MAX_IC);
        if let Some(pc) = live.last() {
            assert_eq!(pool.current().pc, *pc);
        }
    }
});
