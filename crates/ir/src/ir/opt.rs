//! Scope specialization (drop / lift / clone) and the CFF lowering pass.
//!
//! The mangler rewrites a single-entry scope into a fresh copy whose entry
//! has some parameters dropped against concrete definitions and some free
//! definitions lifted into new parameters, folding branches and rewriting
//! tail self-calls as it goes. CFF lowering drives the mangler until every
//! call targets a basic block or a returning function.

use std::collections::{HashMap, HashSet};
use std::fmt;

use cranelift_entity::packed_option::ReservedValue;
use hashlink::LinkedHashMap;

use crate::ir::analysis::{verify, Scope, VerifyError};
use crate::ir::{DefId, LambdaAttr, NodeKind, World};
use crate::types::TypeId;

struct Mangler<'a> {
    scope: &'a Scope,
    to_drop: &'a [usize],
    drop_with: &'a [DefId],
    to_lift: &'a [DefId],
    type_map: &'a HashMap<TypeId, TypeId>,
    old2new: HashMap<DefId, DefId>,
    oentry: DefId,
    nentry: DefId,
}

/// Rewrites `scope` with the entry parameters at `to_drop` replaced by
/// `drop_with`, the free definitions `to_lift` appended as new parameters and
/// generic types substituted through `type_map`. Returns the new entry.
pub fn mangle(
    world: &mut World,
    scope: &Scope,
    to_drop: &[usize],
    drop_with: &[DefId],
    to_lift: &[DefId],
    type_map: &HashMap<TypeId, TypeId>,
) -> DefId {
    assert_eq!(to_drop.len(), drop_with.len());
    debug_assert!(to_drop.windows(2).all(|w| w[0] < w[1]), "drop indices must ascend");
    let oentry = scope.entry();
    let mut mangler = Mangler {
        scope,
        to_drop,
        drop_with,
        to_lift,
        type_map,
        old2new: HashMap::new(),
        oentry,
        nentry: DefId::reserved_value(),
    };
    mangler.mangle(world)
}

/// A copy of the scope with nothing dropped or lifted; isomorphic up to gid
/// renaming.
pub fn clone_scope(world: &mut World, scope: &Scope) -> DefId {
    mangle(world, scope, &[], &[], &[], &HashMap::new())
}

/// Drops the entry's first parameters against `with`.
pub fn drop_front(world: &mut World, scope: &Scope, with: &[DefId]) -> DefId {
    let to_drop: Vec<usize> = (0..with.len()).collect();
    mangle(world, scope, &to_drop, with, &[], &HashMap::new())
}

pub fn drop_at(
    world: &mut World,
    scope: &Scope,
    to_drop: &[usize],
    drop_with: &[DefId],
    type_map: &HashMap<TypeId, TypeId>,
) -> DefId {
    mangle(world, scope, to_drop, drop_with, &[], type_map)
}

/// Lifts free definitions into fresh trailing parameters of a new entry.
pub fn lift(
    world: &mut World,
    scope: &Scope,
    to_lift: &[DefId],
    type_map: &HashMap<TypeId, TypeId>,
) -> DefId {
    mangle(world, scope, &[], &[], to_lift, type_map)
}

impl<'a> Mangler<'a> {
    fn mangle(&mut self, world: &mut World) -> DefId {
        let o_elems: Vec<TypeId> = world.fn_args(world.ty(self.oentry)).to_vec();

        let mut nelems: Vec<TypeId> = o_elems
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.to_drop.contains(i))
            .map(|(_, &ty)| ty)
            .collect();
        for &def in self.to_lift {
            nelems.push(world.ty(def));
        }
        let n_ty = world.fn_ty(nelems);
        let n_ty = world.specialize_ty(n_ty, self.type_map);
        let name = self.name_of(world, self.oentry);
        self.nentry = world.lambda_sealed(n_ty, LambdaAttr::None, &name);

        // Wire the entry's old parameters to dropped definitions or new
        // parameters.
        let mut np = 0;
        let mut di = 0;
        for op in 0..o_elems.len() {
            let oparam = world.param_of(self.oentry, op);
            if di < self.to_drop.len() && self.to_drop[di] == op {
                self.old2new.insert(oparam, self.drop_with[di]);
                di += 1;
            } else {
                let nparam = world.param_of(self.nentry, np);
                np += 1;
                if let Some(name) = world.name(oparam) {
                    world.defs[nparam].name = Some(name);
                }
                self.old2new.insert(oparam, nparam);
            }
        }
        let offset = o_elems.len() - self.to_drop.len();
        for (x, &def) in self.to_lift.iter().enumerate() {
            let nparam = world.param_of(self.nentry, offset + x);
            if let Some(name) = world.name(def) {
                world.defs[nparam].name = Some(name);
            }
            self.old2new.insert(def, nparam);
        }

        // The old entry maps to itself so recursive references can be
        // spotted by the tail-call rewrite.
        self.old2new.insert(self.oentry, self.oentry);
        self.mangle_body(world, self.oentry, self.nentry);

        for &cur in &self.scope.rpo()[1..] {
            if let Some(&ncur) = self.old2new.get(&cur) {
                self.mangle_body(world, cur, ncur);
            }
        }

        self.nentry
    }

    fn name_of(&self, world: &World, def: DefId) -> String {
        match world.name(def) {
            Some(name) => crate::INTERNER.resolve(&name).to_string(),
            None => String::new(),
        }
    }

    fn mangle_head(&mut self, world: &mut World, olambda: DefId) -> DefId {
        debug_assert!(!self.old2new.contains_key(&olambda));
        let ty = world.specialize_ty(world.ty(olambda), self.type_map);
        let name = self.name_of(world, olambda);
        let nlambda = world.lambda_sealed(ty, world.attr(olambda), &name);
        self.old2new.insert(olambda, nlambda);
        for i in 0..world.num_params(olambda) {
            let oparam = world.param_of(olambda, i);
            let nparam = world.param_of(nlambda, i);
            if let Some(name) = world.name(oparam) {
                world.defs[nparam].name = Some(name);
            }
            self.old2new.insert(oparam, nparam);
        }
        nlambda
    }

    fn mangle_body(&mut self, world: &mut World, olambda: DefId, nlambda: DefId) {
        if world.empty(olambda) {
            return;
        }

        let mut ops: Vec<DefId> = Vec::with_capacity(world.num_ops(olambda));
        for i in 1..world.num_ops(olambda) {
            let op = world.op(olambda, i);
            ops.push(self.mangle_def(world, op));
        }

        // Fold the branch if the rewritten condition became known.
        let ocallee = world.callee(olambda);
        let ntarget = if world.kind(ocallee) == NodeKind::Select {
            let cond = self.mangle_def(world, world.op(ocallee, 0));
            let (tval, fval) = (world.op(ocallee, 1), world.op(ocallee, 2));
            if let Some(b) = world.as_lit(cond) {
                let taken = if b.get_bool() { tval } else { fval };
                self.mangle_def(world, taken)
            } else {
                let t = self.mangle_def(world, tval);
                let f = self.mangle_def(world, fval);
                world.select(cond, t, f)
            }
        } else {
            self.mangle_def(world, ocallee)
        };

        // Tail self-call with the dropped arguments intact: jump the new
        // entry instead, shedding the dropped slots.
        if ntarget == self.oentry {
            let substitute = self
                .to_drop
                .iter()
                .enumerate()
                .all(|(i, &di)| ops[di] == self.drop_with[i]);
            if substitute {
                let nargs: Vec<DefId> = ops
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !self.to_drop.contains(i))
                    .map(|(_, &d)| d)
                    .collect();
                world.jump(nlambda, self.nentry, &nargs);
                return;
            }
        }

        world.jump(nlambda, ntarget, &ops);
    }

    fn mangle_def(&mut self, world: &mut World, odef: DefId) -> DefId {
        let odef = world.resolve(odef);
        if let Some(&ndef) = self.old2new.get(&odef) {
            return ndef;
        }

        if world.is_lambda(odef) {
            if self.scope.contains(odef) {
                return self.mangle_head(world, odef);
            }
            self.old2new.insert(odef, odef);
            return odef;
        }
        if matches!(world.kind(odef), NodeKind::Param { .. }) {
            // A free parameter from an enclosing scope stays as it is.
            self.old2new.insert(odef, odef);
            return odef;
        }

        let ops: Vec<DefId> = world.ops(odef).to_vec();
        let mut nops = Vec::with_capacity(ops.len());
        let mut changed = false;
        for op in ops {
            let op = world.resolve(op);
            let nop = self.mangle_def(world, op);
            changed |= nop != op;
            nops.push(nop);
        }
        let ndef = if changed {
            world.rebuild(odef, &nops)
        } else {
            odef
        };
        self.old2new.insert(odef, ndef);
        ndef
    }
}

/*
 * CFF lowering
 */

#[derive(Clone, Copy, Debug)]
pub struct CffConfig {
    pub verify_after: bool,
    /// Iteration budget; `None` means run to convergence.
    pub max_iterations: Option<usize>,
}

impl Default for CffConfig {
    fn default() -> CffConfig {
        CffConfig {
            verify_after: true,
            max_iterations: None,
        }
    }
}

#[derive(Debug)]
pub enum CffError {
    /// The iteration budget ran out; the graph is left in its last
    /// consistent state.
    NonConvergence { iterations: usize },
    Verify(VerifyError),
}

impl fmt::Display for CffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CffError::NonConvergence { iterations } => {
                write!(f, "lowering did not converge after {} iterations", iterations)
            }
            CffError::Verify(err) => write!(f, "verification after lowering failed: {}", err),
        }
    }
}

/// Specializes every call to a higher-order target until all that remain
/// target basic blocks or returning functions, then cleans up and verifies.
pub fn lower_cff(world: &mut World) -> Result<(), CffError> {
    lower_cff_with(world, CffConfig::default())
}

pub fn lower_cff_with(world: &mut World, config: CffConfig) -> Result<(), CffError> {
    // Specialization cache keyed by [callee, dropped-or-hole args];
    // insertion-ordered so reruns behave identically.
    let mut cache: LinkedHashMap<Vec<DefId>, DefId> = LinkedHashMap::new();
    let mut top: HashSet<DefId> = HashSet::new();
    let mut local = true;
    let mut iterations = 0usize;

    loop {
        let mut todo = false;
        let entries = Scope::for_world(world).entries().to_vec();

        for entry in entries {
            let scope = Scope::new(world, entry);
            // The driver works on forward reachability: everything the entry
            // can jump into, not just the lambdas tied to its parameters.
            let reach = reachable_from(world, entry);

            for lambda in scope.rpo().iter().rev().copied().collect::<Vec<_>>() {
                if world.empty(lambda) {
                    continue;
                }
                let to = world.callee(lambda);
                if !world.is_lambda(to) || world.empty(to) {
                    continue;
                }
                let bad = if local {
                    to != entry && reach.contains(&to) && !world.is_basicblock(to)
                } else if top.contains(&to) {
                    !world.is_returning(to) && !reach.contains(&to)
                } else {
                    !world.is_basicblock(to)
                };
                if !bad {
                    continue;
                }

                log::debug!(
                    "bad call in {}: {}",
                    world.unique_name(lambda),
                    world.unique_name(to)
                );
                todo = true;

                let mut type_map = HashMap::new();
                let arg_fn = world.arg_fn_ty(lambda);
                let inferred = world.infer_with(world.ty(to), &mut type_map, arg_fn);
                debug_assert!(inferred, "call site does not unify with its callee");

                assert_eq!(world.num_args(lambda), world.num_params(to));
                let num_args = world.num_args(lambda);
                let mut key: Vec<DefId> = Vec::with_capacity(num_args + 1);
                key.push(to);
                let mut to_drop = Vec::new();
                let mut drop_with = Vec::new();
                for i in 0..num_args {
                    let param = world.param_of(to, i);
                    if world.ty_order(world.ty(param)) > 0 {
                        let arg = world.arg(lambda, i);
                        key.push(arg);
                        to_drop.push(i);
                        drop_with.push(arg);
                    } else {
                        key.push(DefId::reserved_value());
                    }
                }

                let target = match cache.get(&key) {
                    Some(&target) => target,
                    None => {
                        let to_scope = Scope::new(world, to);
                        let target = drop_at(world, &to_scope, &to_drop, &drop_with, &type_map);
                        cache.insert(key, target);
                        target
                    }
                };
                let target = thread_jump(world, target);

                let nargs: Vec<DefId> = (0..num_args)
                    .filter(|i| !to_drop.contains(i))
                    .map(|i| world.arg(lambda, i))
                    .collect();
                world.jump(lambda, target, &nargs);
            }

            top.insert(entry);
        }

        if !todo && local {
            log::debug!("switching to global phase");
            local = false;
            continue;
        }
        if !todo {
            break;
        }
        iterations += 1;
        if let Some(max) = config.max_iterations {
            if iterations > max {
                log::error!("CFF lowering exhausted its iteration budget");
                return Err(CffError::NonConvergence { iterations });
            }
        }
    }

    world.cleanup();

    if config.verify_after {
        verify(world).map_err(CffError::Verify)?;
        verify_first_order_params(world).map_err(CffError::Verify)?;
    }
    Ok(())
}

/// Eta-contracts a freshly specialized target: a lambda whose body just
/// forwards all of its parameters to another callee can be jumped past.
fn thread_jump(world: &World, mut target: DefId) -> DefId {
    for _ in 0..8 {
        if world.empty(target) {
            break;
        }
        let to = world.callee(target);
        if !world.is_lambda(to) || to == target {
            break;
        }
        let params = world.params(target);
        if world.num_args(target) != params.len() {
            break;
        }
        let forwards_all = (0..params.len()).all(|i| world.arg(target, i) == params[i]);
        if !forwards_all {
            break;
        }
        target = to;
    }
    target
}

/// Lambdas reachable from `entry` along successor edges, entry included.
fn reachable_from(world: &World, entry: DefId) -> HashSet<DefId> {
    let mut reach = HashSet::new();
    let mut stack = vec![entry];
    reach.insert(entry);
    while let Some(lambda) = stack.pop() {
        for succ in world.succs(lambda) {
            if reach.insert(succ) {
                stack.push(succ);
            }
        }
    }
    reach
}

/// After lowering, no higher-order parameter may belong to a lambda buried
/// inside a scope body.
fn verify_first_order_params(world: &mut World) -> Result<(), VerifyError> {
    let entries = Scope::for_world(world).entries().to_vec();
    for entry in entries {
        let scope = Scope::new(world, entry);
        for &lambda in scope.rpo() {
            for i in 0..world.num_ops(lambda) {
                let Some(op) = world.op_opt(lambda, i) else { continue };
                if let NodeKind::Param { lambda: owner, .. } = world.kind(op) {
                    if world.ty_order(world.ty(op)) > 0
                        && scope.contains(owner)
                        && owner != entry
                    {
                        return Err(VerifyError::HigherOrderParam { param: op });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::analysis::Scope;
    use crate::ir::*;
    use crate::types::PrimType;

    /// F(x) with body g(x, x + 1); dropping x against 5 must rebuild the
    /// body as g(5, 6) through the hash-consing factories.
    #[test]
    fn test_drop_constant_param() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let g_ty = world.fn_ty(vec![s32, s32]);
        let f_ty = world.fn_ty(vec![s32]);

        let g = world.lambda_sealed(g_ty, LambdaAttr::Extern, "g");
        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let x = world.param_of(f, 0);
        let one = world.literal_s32(1);
        let x1 = world.arith(ArithOp::Add, x, one);
        world.jump(f, g, &[x, x1]);

        let scope = Scope::new(&world, f);
        let five = world.literal_s32(5);
        let f2 = drop_front(&mut world, &scope, &[five]);

        assert_eq!(world.num_params(f2), 0);
        assert_eq!(world.callee(f2), g);
        assert_eq!(world.arg(f2, 0), five);
        let six = world.literal_s32(6);
        assert_eq!(world.arg(f2, 1), six);
        // The original scope is untouched.
        assert_eq!(world.arg(f, 0), x);
    }

    #[test]
    fn test_clone_is_isomorphic() {
        let (mut world, a, b, c, d) = branchy_scope();
        let scope = Scope::new(&world, a);
        let a2 = clone_scope(&mut world, &scope);

        assert_ne!(a2, a);
        assert_eq!(world.ty(a2), world.ty(a));
        let scope2 = Scope::new(&world, a2);
        assert_eq!(scope2.size(), scope.size());
        // The clone jumps through fresh copies, not the old blocks.
        for l in scope2.rpo() {
            assert!(![a, b, c, d].contains(l));
        }
    }

    /// Dropping the branch condition folds the diamond down to one path.
    #[test]
    fn test_drop_folds_branch() {
        let (mut world, a, _, _, _) = branchy_scope();
        let scope = Scope::new(&world, a);
        let t = world.literal_bool(true);
        let a2 = drop_at(&mut world, &scope, &[0], &[t], &HashMap::new());

        // a2(ret): the condition is true, so a2 jumps straight into the
        // then-branch copy.
        assert_eq!(world.num_params(a2), 1);
        let target = world.callee(a2);
        assert!(world.is_lambda(target));
        let name = world.name(target).map(|s| crate::INTERNER.resolve(&s).to_string());
        assert_eq!(name.as_deref(), Some("b"));
    }

    /// Lifting a free definition turns it into a fresh trailing parameter.
    #[test]
    fn test_lift_free_def() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let g_ty = world.fn_ty(vec![s32]);
        let f_ty = world.fn_ty(vec![]);
        let g = world.lambda_sealed(g_ty, LambdaAttr::Extern, "g");
        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let five = world.literal_s32(5);
        world.jump(f, g, &[five]);

        let scope = Scope::new(&world, f);
        let f2 = lift(&mut world, &scope, &[five], &HashMap::new());

        assert_eq!(world.num_params(f2), 1);
        let p = world.param_of(f2, 0);
        assert_eq!(world.ty(p), s32);
        assert_eq!(world.callee(f2), g);
        assert_eq!(world.arg(f2, 0), p);
    }

    /// Tail self-calls with the dropped constants intact jump the new entry.
    #[test]
    fn test_tail_self_call() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let bool_ty = world.prim_ty(PrimType::Bool);
        let ret_ty = world.fn_ty(vec![s32]);
        let f_ty = world.fn_ty(vec![bool_ty, s32, ret_ty]);

        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let flag = world.param_of(f, 0);
        let n = world.param_of(f, 1);
        let ret = world.param_of(f, 2);
        let one = world.literal_s32(1);
        let n1 = world.arith(ArithOp::Add, n, one);
        world.jump(f, f, &[flag, n1, ret]);

        let scope = Scope::new(&world, f);
        let t = world.literal_bool(true);
        let f2 = drop_at(&mut world, &scope, &[0], &[t], &HashMap::new());

        // The recursive jump sheds the dropped flag and targets the new
        // entry directly.
        assert_eq!(world.callee(f2), f2);
        assert_eq!(world.num_args(f2), 2);
    }

    /// apply(k, n) = k(n), called as apply(print, 3): after lowering the
    /// call site jumps print directly and apply is gone.
    #[test]
    fn test_lower_cff_apply() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let print_ty = world.fn_ty(vec![s32]);
        let apply_ty = world.fn_ty(vec![print_ty, s32]);
        let main_ty = world.fn_ty(vec![]);

        let print = world.lambda_sealed(print_ty, LambdaAttr::Intrinsic, "print");
        let apply = world.lambda_sealed(apply_ty, LambdaAttr::None, "apply");
        let k = world.param_of(apply, 0);
        let n = world.param_of(apply, 1);
        world.jump(apply, k, &[n]);

        let main = world.lambda_sealed(main_ty, LambdaAttr::Extern, "main");
        let three = world.literal_s32(3);
        world.jump(main, apply, &[print, three]);

        lower_cff(&mut world).unwrap();

        assert_eq!(world.callee(main), print);
        assert_eq!(world.args(main), vec![three]);
        assert!(matches!(world.kind(apply), NodeKind::Removed));
    }

    /// A branchy single-entry scope: a(cond, ret) -> {b, c} -> ret.
    fn branchy_scope() -> (World, DefId, DefId, DefId, DefId) {
        let mut world = World::new();
        let bool_ty = world.prim_ty(PrimType::Bool);
        let ret_ty = world.fn_ty(vec![]);
        let a_ty = world.fn_ty(vec![bool_ty, ret_ty]);
        let bb = world.fn_ty(vec![]);

        let a = world.lambda_sealed(a_ty, LambdaAttr::None, "a");
        let b = world.lambda_sealed(bb, LambdaAttr::None, "b");
        let c = world.lambda_sealed(bb, LambdaAttr::None, "c");
        let d = world.lambda_sealed(bb, LambdaAttr::None, "d");

        let cond = world.param_of(a, 0);
        let ret = world.param_of(a, 1);
        world.branch(a, cond, b, c);
        world.jump(b, d, &[]);
        world.jump(c, d, &[]);
        world.jump(d, ret, &[]);
        (world, a, b, c, d)
    }
}
