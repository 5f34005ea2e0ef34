//! Optimizer driver.
//!
//! The passes run in a fixed sequence; two rounds reach the practical
//! fixed point (inlining exposes get-of-con pairs and duplicate
//! subexpressions, which the second round folds and sweeps). Running the
//! whole sequence again on already-optimized output is a no-op, which
//! the idempotence tests pin down.

use crate::cases::pass_cases;
use crate::cse::pass_cse;
use crate::decon::pass_decon;
use crate::inline::pass_inline;
use crate::purity::pass_purity;
use crate::scope::pass_scope;
use crate::sweep::pass_sweep;
use crate::term::FunTerm;
use crate::usage::pass_usage;
use tracing::debug;

const ROUNDS: usize = 2;

pub fn optimize(mut fun: FunTerm) -> FunTerm {
    for round in 0..ROUNDS {
        debug_assert_eq!(pass_scope(&fun), 0, "ill-scoped before round {}", round);
        pass_cases(&mut fun);
        pass_purity(&mut fun);
        fun = pass_inline(fun);
        pass_purity(&mut fun);
        pass_decon(&mut fun);
        pass_cse(&mut fun);
        pass_usage(&mut fun);
        fun = pass_sweep(fun);
        debug!(round, terms = fun.size(), "optimizer round complete");
    }
    assert_eq!(pass_scope(&fun), 0, "optimizer produced ill-scoped code");
    fun
}
