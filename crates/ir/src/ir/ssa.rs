//! Lambda terminators and on-the-fly SSA construction.
//!
//! Parameters are introduced lazily while the surface program is still being
//! built: `get_value` walks predecessors for a binding and appends a
//! parameter where the incoming definitions diverge, `seal` declares a
//! lambda's predecessor set final and fixes the deferred parameters, and
//! trivial parameters (all incoming arguments equal) are removed again on the
//! spot.

use cranelift_entity::packed_option::ReservedValue;

use crate::ir::{DefId, LambdaAttr, NodeKind, Todo, Use, World};
use crate::types::{TypeId, TypeNode};
use crate::INTERNER;

impl World {
    /// Terminates `lambda` with `to(args...)`. Any previous terminator is
    /// discarded.
    pub fn jump(&mut self, lambda: DefId, to: DefId, args: &[DefId]) {
        assert!(self.is_lambda(lambda));
        self.unset_ops(lambda);
        let ops = &mut self.defs[lambda].ops;
        ops.clear();
        ops.resize(args.len() + 1, DefId::reserved_value());
        self.set_op(lambda, 0, to);
        for (i, &arg) in args.iter().enumerate() {
            self.set_op(lambda, i + 1, arg);
        }
    }

    /// Terminates `lambda` with a conditional branch: a jump whose callee is
    /// `select(cond, tto, fto)`.
    pub fn branch(&mut self, lambda: DefId, cond: DefId, tto: DefId, fto: DefId) {
        let to = self.select(cond, tto, fto);
        self.jump(lambda, to, &[]);
    }

    /// Calls `to` in continuation-cascade style: creates the next
    /// continuation taking `ret_ty`, jumps `to(args..., next)` and returns
    /// `next` for the caller to keep building in.
    pub fn call(&mut self, lambda: DefId, to: DefId, args: &[DefId], ret_ty: TypeId) -> DefId {
        let next_ty = self.fn_ty(vec![ret_ty]);
        let name = format!("{}_cont", self.unique_name(to));
        let next = self.lambda(next_ty, LambdaAttr::None, &name);
        let mut cargs = args.to_vec();
        cargs.push(next);
        self.jump(lambda, to, &cargs);
        next
    }

    /// Appends a parameter, growing the lambda's function type in place.
    pub fn append_param(&mut self, lambda: DefId, ty: TypeId, name: &str) -> DefId {
        let old_ty = self.ty(lambda);
        let mut elems = match &self.types[old_ty] {
            TypeNode::Fn(elems) => elems.clone(),
            _ => panic!("{}: lambda type is not a function type", lambda),
        };
        elems.push(ty);
        let new_ty = self.fn_ty(elems);
        self.defs[lambda].ty = new_ty;
        let index = self.num_params(lambda);
        let param = self.param(ty, lambda, index);
        self.set_name(param, name);
        param
    }

    pub fn set_parent(&mut self, lambda: DefId, parent: Option<DefId>) {
        let lid = self.lambda_id(lambda);
        self.lambdas[lid].parent = parent;
    }

    /// Stores the binding `handle -> def` in `lambda`'s value table.
    pub fn set_value(&mut self, lambda: DefId, handle: usize, def: DefId) -> DefId {
        let lid = self.lambda_id(lambda);
        if self.lambdas[lid].values.len() <= handle {
            self.lambdas[lid].values.resize(handle + 1, None);
        }
        self.lambdas[lid].values[handle] = Some(def);
        def
    }

    /// Looks the binding up, appending parameters and predecessor arguments
    /// as needed. An unbound handle on a lambda without predecessors is
    /// reported and bound to `bottom`.
    pub fn get_value(&mut self, lambda: DefId, handle: usize, ty: TypeId, name: &str) -> DefId {
        let lid = self.lambda_id(lambda);
        if let Some(Some(def)) = self.lambdas[lid].values.get(handle) {
            return self.resolve(*def);
        }

        let parent = self.lambdas[lid].parent;
        if parent != Some(lambda) {
            // Non-heads share their parent's bindings.
            match parent {
                Some(parent) => return self.get_value(parent, handle, ty, name),
                None => return self.undefined_value(lambda, handle, ty, name),
            }
        }

        if !self.lambdas[lid].sealed {
            let param = self.append_param(lambda, ty, name);
            let index = self.num_params(lambda) - 1;
            let todo = Todo {
                handle,
                index,
                ty,
                name: INTERNER.get_or_intern(name),
            };
            self.lambdas[lid].todos.push(todo);
            return self.set_value(lambda, handle, param);
        }

        let preds = self.preds(lambda);
        match preds.len() {
            0 => self.undefined_value(lambda, handle, ty, name),
            1 => {
                let def = self.get_value(preds[0], handle, ty, name);
                self.set_value(lambda, handle, def)
            }
            _ => {
                if self.lambdas[lid].visited {
                    // Recursion through a cycle: break it with a parameter.
                    let param = self.append_param(lambda, ty, name);
                    return self.set_value(lambda, handle, param);
                }

                self.lambdas[lid].visited = true;
                let mut same: Option<DefId> = None;
                let mut diverged = false;
                for &pred in &preds {
                    let def = self.get_value(pred, handle, ty, name);
                    match same {
                        Some(s) if s != def => {
                            diverged = true;
                            break;
                        }
                        _ => same = Some(def),
                    }
                }
                let lid = self.lambda_id(lambda);
                self.lambdas[lid].visited = false;

                if !diverged {
                    return same.expect("at least two predecessors were visited");
                }

                // The recursive walk may already have appended the parameter.
                let cached = match self.lambdas[lid].values.get(handle) {
                    Some(&Some(def)) => Some(def),
                    _ => None,
                };
                let param = match cached {
                    Some(def) => self.resolve(def),
                    None => self.append_param(lambda, ty, name),
                };
                let index = match self.kind(param) {
                    NodeKind::Param { index, .. } => index as usize,
                    _ => panic!("{}: cached binding is not a parameter", param),
                };
                let todo = Todo {
                    handle,
                    index,
                    ty,
                    name: INTERNER.get_or_intern(name),
                };
                let fixed = self.fix(lambda, todo);
                self.set_value(lambda, handle, fixed)
            }
        }
    }

    fn undefined_value(&mut self, lambda: DefId, handle: usize, ty: TypeId, name: &str) -> DefId {
        log::warn!("'{}' may be undefined in {}", name, self.unique_name(lambda));
        let bot = self.bottom(ty);
        self.set_value(lambda, handle, bot)
    }

    /// Declares the predecessor set final. One-shot; fixes all pending
    /// parameter todos in insertion order.
    pub fn seal(&mut self, lambda: DefId) {
        let lid = self.lambda_id(lambda);
        assert!(!self.lambdas[lid].sealed, "{}: already sealed", lambda);
        self.lambdas[lid].sealed = true;

        let todos = std::mem::take(&mut self.lambdas[lid].todos);
        for todo in todos {
            self.fix(lambda, todo);
        }
    }

    /// Wires the arguments for the deferred parameter `todo.index` into every
    /// predecessor, then tries to eliminate the parameter again.
    fn fix(&mut self, lambda: DefId, todo: Todo) -> DefId {
        assert!(self.is_sealed(lambda), "{}: must be sealed", lambda);
        let param = self.param_of(lambda, todo.index);
        let name = INTERNER.resolve(&todo.name).to_string();

        for pred in self.preds(lambda) {
            assert!(!self.empty(pred), "{}: unterminated predecessor", pred);
            assert!(
                self.succs(pred).len() == 1,
                "{}: critical edge into {}",
                pred,
                lambda
            );

            // Make room for the new argument.
            if todo.index >= self.num_args(pred) {
                self.defs[pred]
                    .ops
                    .resize(todo.index + 2, DefId::reserved_value());
            }
            assert!(
                self.arg_opt(pred, todo.index).is_none(),
                "{}: argument {} already set",
                pred,
                todo.index
            );
            let def = self.get_value(pred, todo.handle, todo.ty, &name);
            self.set_op(pred, todo.index + 1, def);
        }

        self.try_remove_trivial_param(param)
    }

    /// If every predecessor passes the same non-self definition for `param`,
    /// replaces the parameter by it, retires the argument slots and re-checks
    /// successors whose parameters were fed by `param`.
    pub fn try_remove_trivial_param(&mut self, param: DefId) -> DefId {
        let (lambda, index) = match self.kind(param) {
            NodeKind::Param { lambda, index } => (lambda, index as usize),
            _ => panic!("{}: not a parameter", param),
        };
        assert!(self.is_sealed(lambda), "{}: must be sealed", lambda);

        let preds = self.preds(lambda);
        if preds.is_empty() {
            return param;
        }
        let mut same: Option<DefId> = None;
        for &pred in &preds {
            let def = match self.arg_opt(pred, index) {
                Some(def) => def,
                None => return param,
            };
            if def == param || Some(def) == same {
                continue;
            }
            if same.is_some() {
                return param; // non-trivial
            }
            same = Some(def);
        }
        let same = same.expect("parameter must have a non-self incoming definition");

        let uses: Vec<Use> = self.uses(param).collect();
        self.replace(param, same);

        // The argument slots feeding the removed parameter are dead now.
        let param_ty = self.ty(param);
        for &pred in &preds {
            let bot = self.bottom(param_ty);
            self.update_arg(pred, index, bot);
        }

        // Removing this parameter may render parameters of successors
        // trivial in turn.
        for u in uses {
            if self.is_lambda(u.user) && u.index >= 1 {
                let arg_index = u.index - 1;
                for succ in self.succs(u.user) {
                    if arg_index >= self.num_params(succ) {
                        continue;
                    }
                    let succ_param = self.param_of(succ, arg_index);
                    if succ_param != param && self.is_sealed(succ) {
                        self.try_remove_trivial_param(succ_param);
                    }
                }
            }
        }

        same
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::*;
    use crate::types::PrimType;

    /// entry H(n), body B jumping to itself: the classic loop-counter shape.
    #[test]
    fn test_ssa_loop_counter() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let h_ty = world.fn_ty(vec![s32]);
        let bb = world.fn_ty(vec![]);

        let h = world.lambda_sealed(h_ty, LambdaAttr::Extern, "entry");
        let b = world.lambda(bb, LambdaAttr::None, "body");

        const COUNTER: usize = 0;
        let one = world.literal_s32(1);
        world.set_value(h, COUNTER, one);
        world.jump(h, b, &[]);

        // Reading the counter in the unsealed body appends a parameter.
        let i = world.get_value(b, COUNTER, s32, "i");
        assert!(matches!(world.kind(i), NodeKind::Param { lambda, .. } if lambda == b));

        let inc = world.arith(ArithOp::Add, i, one);
        world.set_value(b, COUNTER, inc);
        world.jump(b, b, &[]);
        world.seal(b);

        // H passes the initial value, the self-edge passes i + 1.
        assert_eq!(world.num_params(b), 1);
        assert_eq!(world.arg(h, 0), one);
        assert_eq!(world.arg(b, 0), inc);
        assert_eq!(world.resolve(i), i);
        assert_eq!(world.get_value(b, COUNTER, s32, "i"), inc);
    }

    /// Both incoming edges carry the literal 7: the appended parameter is
    /// trivial and must disappear again.
    #[test]
    fn test_trivial_param_removal() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let h_ty = world.fn_ty(vec![s32]);
        let bb = world.fn_ty(vec![]);

        let h = world.lambda_sealed(h_ty, LambdaAttr::Extern, "entry");
        let b = world.lambda(bb, LambdaAttr::None, "body");

        const V: usize = 0;
        let seven = world.literal_s32(7);
        world.set_value(h, V, seven);
        world.jump(h, b, &[]);
        world.jump(b, b, &[]);
        world.seal(b);

        let got = world.get_value(b, V, s32, "v");
        assert_eq!(got, seven);
        // The temporarily appended parameter was replaced; the argument
        // slots it occupied are dead.
        assert_eq!(world.num_params(b), 1);
        let p = world.param_of(b, 0);
        assert_eq!(world.resolve(p), seven);
        assert!(matches!(world.kind(world.arg(h, 0)), NodeKind::Bottom));
        assert!(matches!(world.kind(world.arg(b, 0)), NodeKind::Bottom));
    }

    #[test]
    fn test_undefined_value_binds_bottom() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let bb = world.fn_ty(vec![]);
        let l = world.lambda_sealed(bb, LambdaAttr::None, "orphan");
        let v = world.get_value(l, 0, s32, "x");
        assert!(matches!(world.kind(v), NodeKind::Bottom));
        // The diagnosis is sticky: the handle now resolves without a rescan.
        assert_eq!(world.get_value(l, 0, s32, "x"), v);
    }

    #[test]
    fn test_non_head_delegates_to_parent() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let f_ty = world.fn_ty(vec![s32]);
        let bb = world.fn_ty(vec![]);
        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let inner = world.lambda_sealed(bb, LambdaAttr::None, "inner");
        world.set_parent(inner, Some(f));

        let x = world.param_of(f, 0);
        world.set_value(f, 0, x);
        let got = world.get_value(inner, 0, s32, "x");
        assert_eq!(got, x);
        // The binding stays in the head, not the delegating block.
        assert_eq!(world.num_params(inner), 0);
    }

    #[test]
    fn test_seal_is_one_shot() {
        let mut world = World::new();
        let bb = world.fn_ty(vec![]);
        let l = world.lambda(bb, LambdaAttr::None, "b");
        world.seal(l);
        assert!(world.is_sealed(l));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            world.seal(l);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_call_cascade() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let ret_ty = world.fn_ty(vec![s32]);
        let f_ty = world.fn_ty(vec![s32, ret_ty]);
        let bb = world.fn_ty(vec![]);

        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let caller = world.lambda_sealed(bb, LambdaAttr::Extern, "caller");
        let three = world.literal_s32(3);
        let next = world.call(caller, f, &[three], s32);

        assert_eq!(world.callee(caller), f);
        assert_eq!(world.arg(caller, 0), three);
        assert_eq!(world.arg(caller, 1), next);
        assert_eq!(world.num_params(next), 1);
    }
}
