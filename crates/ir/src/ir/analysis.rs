//! Scope and dominance analyses, plus the graph verifier.
//!
//! A scope is the set of lambdas reachable from its entries through
//! parameter use-chains, numbered in reverse postorder. Scopes are
//! self-contained snapshots: the sid maps live in the scope, not on the
//! lambdas, so there is never more than one writer per lambda.

use std::collections::HashMap;
use std::fmt;

use crate::ir::{DefId, NodeKind, World};

pub struct Scope {
    num_entries: usize,
    num_exits: usize,
    rpo: Vec<DefId>,
    sid: HashMap<DefId, usize>,
    succs: HashMap<DefId, Vec<DefId>>,
    preds: HashMap<DefId, Vec<DefId>>,
    backwards_rpo: Vec<DefId>,
    backwards_sid: HashMap<DefId, usize>,
}

impl Scope {
    /// The scope of a single entry. The membership walk is limited at the
    /// entry itself so it does not escape through the entry's own
    /// parameters.
    pub fn new(world: &World, entry: DefId) -> Scope {
        Scope::build(world, vec![entry], true)
    }

    pub fn from_entries(world: &World, entries: Vec<DefId>) -> Scope {
        Scope::build(world, entries, false)
    }

    /// The whole-world scope: top-level entries are auto-discovered. Lambdas
    /// are walked in arena order, so the discovered entry set is
    /// deterministic for identical construction order.
    pub fn for_world(world: &World) -> Scope {
        let pass = world.new_pass();
        let mut members = Vec::new();
        for lambda in world.lambda_defs() {
            if !world.is_visited(lambda, pass) {
                jump_to_param_users(world, pass, lambda, Some(lambda), &mut members);
            }
        }
        let mut entries = Vec::new();
        for lambda in world.lambda_defs() {
            if !world.is_visited(lambda, pass) {
                world.visit(lambda, pass);
                members.push(lambda);
                entries.push(lambda);
            }
        }
        Scope::process(world, entries, members)
    }

    fn build(world: &World, entries: Vec<DefId>, single: bool) -> Scope {
        let pass = world.new_pass();
        let mut members = Vec::new();
        for &entry in &entries {
            world.visit(entry, pass);
            members.push(entry);
        }
        for &entry in &entries {
            let limit = if single { Some(entry) } else { None };
            jump_to_param_users(world, pass, entry, limit, &mut members);
        }
        Scope::process(world, entries, members)
    }

    fn process(world: &World, entries: Vec<DefId>, members: Vec<DefId>) -> Scope {
        let member_set: HashMap<DefId, ()> = members.iter().map(|&m| (m, ())).collect();

        // Postorder over successor edges restricted to the scope. Entries
        // are numbered last so that, reversed, they carry the lowest sids in
        // presentation order.
        let pass = world.new_pass();
        let mut po = HashMap::new();
        for &entry in &entries {
            world.visit(entry, pass);
        }
        let mut num = 0;
        for &entry in &entries {
            for succ in world.succs(entry) {
                if member_set.contains_key(&succ) && !world.is_visited(succ, pass) {
                    num = number(world, pass, succ, num, &member_set, &mut po);
                }
            }
        }
        for &entry in entries.iter().rev() {
            po.insert(entry, num);
            num += 1;
        }

        // Convert postorder to reverse postorder; members without a number
        // are unreachable and retired from the scope.
        let mut sid = HashMap::new();
        let mut rpo = Vec::new();
        for &lambda in &members {
            if let Some(&p) = po.get(&lambda) {
                sid.insert(lambda, num - 1 - p);
                rpo.push(lambda);
            }
        }
        rpo.sort_by_key(|l| sid[l]);

        // Restricted edge sets, memoized per member.
        let mut succs = HashMap::new();
        let mut preds = HashMap::new();
        for &lambda in &rpo {
            let s: Vec<DefId> = world
                .succs(lambda)
                .into_iter()
                .filter(|l| sid.contains_key(l))
                .collect();
            let p: Vec<DefId> = world
                .preds(lambda)
                .into_iter()
                .filter(|l| sid.contains_key(l))
                .collect();
            succs.insert(lambda, s);
            preds.insert(lambda, p);
        }

        // Backwards numbering for post-dominance: exits are the lambdas
        // without in-scope successors.
        let exits: Vec<DefId> = rpo
            .iter()
            .copied()
            .filter(|l| succs[l].is_empty())
            .collect();
        let pass = world.new_pass();
        let mut bpo = HashMap::new();
        for &exit in &exits {
            world.visit(exit, pass);
        }
        let mut bnum = 0;
        for &exit in &exits {
            for &pred in &preds[&exit] {
                if !world.is_visited(pred, pass) {
                    bnum = number_backwards(world, pass, pred, bnum, &preds, &mut bpo);
                }
            }
        }
        for &exit in exits.iter().rev() {
            bpo.insert(exit, bnum);
            bnum += 1;
        }
        let mut backwards_sid = HashMap::new();
        let mut backwards_rpo = Vec::new();
        for &lambda in &rpo {
            if let Some(&p) = bpo.get(&lambda) {
                backwards_sid.insert(lambda, bnum - 1 - p);
                backwards_rpo.push(lambda);
            }
        }
        backwards_rpo.sort_by_key(|l| backwards_sid[l]);

        Scope {
            num_entries: entries.len(),
            num_exits: exits.len(),
            rpo,
            sid,
            succs,
            preds,
            backwards_rpo,
            backwards_sid,
        }
    }

    pub fn size(&self) -> usize {
        self.rpo.len()
    }

    pub fn entries(&self) -> &[DefId] {
        &self.rpo[..self.num_entries.min(self.rpo.len())]
    }

    pub fn entry(&self) -> DefId {
        assert_eq!(self.num_entries, 1, "scope has more than one entry");
        self.rpo[0]
    }

    /// Reverse-postorder members; entries first.
    pub fn rpo(&self) -> &[DefId] {
        &self.rpo
    }

    pub fn body(&self) -> &[DefId] {
        &self.rpo[self.num_entries.min(self.rpo.len())..]
    }

    pub fn contains(&self, lambda: DefId) -> bool {
        self.sid.contains_key(&lambda)
    }

    pub fn is_entry(&self, lambda: DefId) -> bool {
        self.entries().contains(&lambda)
    }

    pub fn sid(&self, lambda: DefId) -> Option<usize> {
        self.sid.get(&lambda).copied()
    }

    pub fn succs(&self, lambda: DefId) -> &[DefId] {
        &self.succs[&lambda]
    }

    pub fn preds(&self, lambda: DefId) -> &[DefId] {
        &self.preds[&lambda]
    }

    /// Members numbered backwards from the exits; exits first. Lambdas that
    /// reach no exit are absent.
    pub fn backwards_rpo(&self) -> &[DefId] {
        &self.backwards_rpo
    }

    pub fn exits(&self) -> &[DefId] {
        &self.backwards_rpo[..self.num_exits.min(self.backwards_rpo.len())]
    }

    pub fn backwards_body(&self) -> &[DefId] {
        &self.backwards_rpo[self.num_exits.min(self.backwards_rpo.len())..]
    }

    pub fn backwards_sid(&self, lambda: DefId) -> Option<usize> {
        self.backwards_sid.get(&lambda).copied()
    }

    pub fn domtree(&self) -> DomTree<'_> {
        DomTree::new(self, true)
    }

    pub fn postdomtree(&self) -> DomTree<'_> {
        DomTree::new(self, false)
    }
}

fn jump_to_param_users(
    world: &World,
    pass: u64,
    lambda: DefId,
    limit: Option<DefId>,
    members: &mut Vec<DefId>,
) {
    for &param in world.params(lambda) {
        find_user(world, pass, param, limit, members);
    }
}

fn find_user(world: &World, pass: u64, def: DefId, limit: Option<DefId>, members: &mut Vec<DefId>) {
    if world.is_lambda(def) {
        up(world, pass, def, limit, members);
    } else {
        if world.visit(def, pass) {
            return;
        }
        for u in world.uses(def).collect::<Vec<_>>() {
            find_user(world, pass, u.user, limit, members);
        }
    }
}

fn up(world: &World, pass: u64, lambda: DefId, limit: Option<DefId>, members: &mut Vec<DefId>) {
    if world.is_visited(lambda, pass) || limit == Some(lambda) {
        return;
    }
    world.visit(lambda, pass);
    members.push(lambda);
    jump_to_param_users(world, pass, lambda, limit, members);
    for pred in world.preds(lambda) {
        up(world, pass, pred, limit, members);
    }
}

fn number(
    world: &World,
    pass: u64,
    cur: DefId,
    mut i: usize,
    member_set: &HashMap<DefId, ()>,
    po: &mut HashMap<DefId, usize>,
) -> usize {
    world.visit(cur, pass);
    for succ in world.succs(cur) {
        if member_set.contains_key(&succ) && !world.is_visited(succ, pass) {
            i = number(world, pass, succ, i, member_set, po);
        }
    }
    po.insert(cur, i);
    i + 1
}

fn number_backwards(
    world: &World,
    pass: u64,
    cur: DefId,
    mut i: usize,
    preds: &HashMap<DefId, Vec<DefId>>,
    po: &mut HashMap<DefId, usize>,
) -> usize {
    world.visit(cur, pass);
    for &pred in &preds[&cur] {
        if !world.is_visited(pred, pass) {
            i = number_backwards(world, pass, pred, i, preds, po);
        }
    }
    po.insert(cur, i);
    i + 1
}

/// Dominator tree over a scope, built with the Cooper-Harvey-Kennedy
/// iterative algorithm on the scope's RPO numbering. `forwards = false`
/// yields the post-dominator tree: same algorithm over the backwards
/// numbering with successors in place of predecessors.
pub struct DomTree<'a> {
    scope: &'a Scope,
    forwards: bool,
    idom: Vec<usize>,
    children: Vec<Vec<usize>>,
}

impl<'a> DomTree<'a> {
    pub fn new(scope: &'a Scope, forwards: bool) -> DomTree<'a> {
        let mut tree = DomTree {
            scope,
            forwards,
            idom: Vec::new(),
            children: Vec::new(),
        };
        tree.create();
        tree
    }

    pub fn is_postdomtree(&self) -> bool {
        !self.forwards
    }

    fn nodes(&self) -> &'a [DefId] {
        if self.forwards {
            self.scope.rpo()
        } else {
            self.scope.backwards_rpo()
        }
    }

    fn roots(&self) -> &'a [DefId] {
        if self.forwards {
            self.scope.entries()
        } else {
            self.scope.exits()
        }
    }

    fn body(&self) -> &'a [DefId] {
        if self.forwards {
            self.scope.body()
        } else {
            self.scope.backwards_body()
        }
    }

    fn edge_preds(&self, lambda: DefId) -> &'a [DefId] {
        if self.forwards {
            self.scope.preds(lambda)
        } else {
            self.scope.succs(lambda)
        }
    }

    pub fn index(&self, lambda: DefId) -> usize {
        let idx = if self.forwards {
            self.scope.sid(lambda)
        } else {
            self.scope.backwards_sid(lambda)
        };
        idx.unwrap_or_else(|| panic!("{}: lambda has no number in this direction", lambda))
    }

    fn indexed(&self, lambda: DefId) -> Option<usize> {
        if self.forwards {
            self.scope.sid(lambda)
        } else {
            self.scope.backwards_sid(lambda)
        }
    }

    fn create(&mut self) {
        let n = self.nodes().len();
        self.idom = vec![usize::MAX; n];

        for &root in self.roots() {
            let i = self.index(root);
            self.idom[i] = i;
        }

        // Initial guess: the first predecessor that appears earlier in RPO.
        for &lambda in self.body() {
            let i = self.index(lambda);
            for &pred in self.edge_preds(lambda) {
                if let Some(pi) = self.indexed(pred) {
                    if pi < i {
                        self.idom[i] = pi;
                        break;
                    }
                }
            }
            assert_ne!(self.idom[i], usize::MAX, "no earlier predecessor in RPO");
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &lambda in self.body() {
                let i = self.index(lambda);
                let mut new_idom = usize::MAX;
                for &pred in self.edge_preds(lambda) {
                    let Some(pi) = self.indexed(pred) else { continue };
                    new_idom = if new_idom == usize::MAX {
                        pi
                    } else {
                        self.lca_index(new_idom, pi)
                    };
                }
                assert_ne!(new_idom, usize::MAX);
                if self.idom[i] != new_idom {
                    self.idom[i] = new_idom;
                    changed = true;
                }
            }
        }

        self.children = vec![Vec::new(); n];
        for &lambda in self.body() {
            let i = self.index(lambda);
            let parent = self.idom[i];
            self.children[parent].push(i);
        }
    }

    fn lca_index(&self, mut i: usize, mut j: usize) -> usize {
        while i != j {
            while i > j {
                i = self.idom[i];
            }
            while j > i {
                j = self.idom[j];
            }
        }
        i
    }

    /// The immediate dominator; roots dominate themselves.
    pub fn idom(&self, lambda: DefId) -> DefId {
        self.nodes()[self.idom[self.index(lambda)]]
    }

    pub fn lca(&self, a: DefId, b: DefId) -> DefId {
        self.nodes()[self.lca_index(self.index(a), self.index(b))]
    }

    pub fn children(&self, lambda: DefId) -> Vec<DefId> {
        self.children[self.index(lambda)]
            .iter()
            .map(|&i| self.nodes()[i])
            .collect()
    }

    pub fn depth(&self, lambda: DefId) -> usize {
        let mut i = self.index(lambda);
        let mut depth = 0;
        while self.idom[i] != i {
            i = self.idom[i];
            depth += 1;
        }
        depth
    }

    /// Whether `a` dominates `b`: every path from a root to `b` passes
    /// through `a`.
    pub fn dominates(&self, a: DefId, b: DefId) -> bool {
        let ai = self.index(a);
        let mut i = self.index(b);
        loop {
            if i == ai {
                return true;
            }
            if self.idom[i] == i {
                return false;
            }
            i = self.idom[i];
        }
    }
}

/*
 * verification
 */

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyError {
    /// A call site whose argument types do not unify with the callee's
    /// function type. Fatal for code generation, not for further rewriting.
    CallTypeMismatch { lambda: DefId },
    /// The use-def index is out of sync with the operand arrays.
    BrokenUse { def: DefId, index: usize },
    /// A higher-order parameter of a lambda buried inside a scope; CFF
    /// lowering must have eliminated these.
    HigherOrderParam { param: DefId },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::CallTypeMismatch { lambda } => {
                write!(f, "call in {} does not match the callee's type", lambda)
            }
            VerifyError::BrokenUse { def, index } => {
                write!(f, "use list of {} out of sync at operand {}", def, index)
            }
            VerifyError::HigherOrderParam { param } => {
                write!(f, "higher-order parameter {} survived lowering", param)
            }
        }
    }
}

/// Checks use-def symmetry and call-site types over the whole world.
pub fn verify(world: &mut World) -> Result<(), VerifyError> {
    verify_closedness(world)?;
    verify_calls(world)
}

fn verify_closedness(world: &World) -> Result<(), VerifyError> {
    for (def, _) in world.defs.iter() {
        if matches!(world.kind(def), NodeKind::Removed) {
            continue;
        }
        for i in 0..world.num_ops(def) {
            if let Some(op) = world.op_opt(def, i) {
                if !world.uses(op).any(|u| u.user == def && u.index == i) {
                    return Err(VerifyError::BrokenUse { def, index: i });
                }
            }
        }
        for u in world.uses(def) {
            if world.op_opt(u.user, u.index) != Some(world.resolve(def)) {
                return Err(VerifyError::BrokenUse {
                    def: u.user,
                    index: u.index,
                });
            }
        }
    }
    Ok(())
}

fn verify_calls(world: &mut World) -> Result<(), VerifyError> {
    for lambda in world.lambda_defs() {
        if world.empty(lambda) {
            continue;
        }
        let to = world.callee(lambda);
        let to_ty = world.ty(to);
        if matches!(world.kind(to), NodeKind::Bottom) {
            continue;
        }
        let arg_fn = world.arg_fn_ty(lambda);
        let mut map = HashMap::new();
        if !world.infer_with(to_ty, &mut map, arg_fn) {
            return Err(VerifyError::CallTypeMismatch { lambda });
        }
    }
    Ok(())
}

/// Like [`verify`], but reports to the log instead of failing; use between
/// passes where a broken graph should not abort the pipeline.
pub fn debug_verify(world: &mut World) {
    if let Err(err) = verify(world) {
        log::error!("verification failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::types::PrimType;

    /// A -> {B, C} -> D diamond. D leaves the scope by calling A's return
    /// continuation, which is what makes the inner blocks members of A's
    /// scope in the first place.
    fn diamond() -> (World, DefId, DefId, DefId, DefId) {
        let mut world = World::new();
        let bool_ty = world.prim_ty(PrimType::Bool);
        let ret_ty = world.fn_ty(vec![]);
        let entry_ty = world.fn_ty(vec![bool_ty, ret_ty]);
        let bb = world.fn_ty(vec![]);

        let a = world.lambda_sealed(entry_ty, LambdaAttr::Extern, "a");
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

    #[test]
    fn test_diamond_rpo() {
        let (world, a, b, c, d) = diamond();
        // B, C, D are reachable through A's parameter (the branch
        // condition), so the single-entry scope of A contains the diamond.
        let scope = Scope::new(&world, a);
        assert_eq!(scope.size(), 4);
        assert_eq!(scope.sid(a), Some(0));
        assert_eq!(scope.sid(d), Some(3));
        let (sb, sc) = (scope.sid(b).unwrap(), scope.sid(c).unwrap());
        assert!(sb != sc && sb >= 1 && sb <= 2 && sc >= 1 && sc <= 2);
        assert_eq!(scope.rpo()[0], a);
        assert_eq!(scope.rpo()[3], d);

        // Restricted edges.
        assert_eq!(scope.preds(d).len(), 2);
        assert_eq!(scope.succs(a).len(), 2);
        assert!(scope.preds(a).is_empty());
    }

    #[test]
    fn test_diamond_domtree() {
        let (world, a, b, c, d) = diamond();
        let scope = Scope::new(&world, a);
        let dom = scope.domtree();
        assert_eq!(dom.idom(b), a);
        assert_eq!(dom.idom(c), a);
        assert_eq!(dom.idom(d), a);
        assert_eq!(dom.idom(a), a);
        assert_eq!(dom.lca(b, c), a);
        assert!(dom.dominates(a, d));
        assert!(!dom.dominates(b, d));
        assert_eq!(dom.depth(d), 1);
        assert_eq!(dom.children(a).len(), 3);
    }

    #[test]
    fn test_diamond_postdomtree() {
        let (world, a, b, c, d) = diamond();
        let scope = Scope::new(&world, a);
        assert_eq!(scope.exits(), &[d]);
        let pdom = scope.postdomtree();
        assert!(pdom.is_postdomtree());
        assert_eq!(pdom.idom(b), d);
        assert_eq!(pdom.idom(c), d);
        assert_eq!(pdom.idom(a), d);
    }

    #[test]
    fn test_unreachable_members_are_retired() {
        let (world, a, _, _, _) = diamond();
        // An orphan lambda that uses A's parameter makes it a scope member,
        // but no forward path reaches it: it must not appear in the RPO.
        let mut world = world;
        let bb = world.fn_ty(vec![]);
        let orphan = world.lambda_sealed(bb, LambdaAttr::None, "orphan");
        let cond = world.param_of(a, 0);
        let halt = world.bottom(bb);
        world.jump(orphan, halt, &[cond]);

        let scope = Scope::new(&world, a);
        assert!(!scope.contains(orphan));
        assert_eq!(scope.sid(orphan), None);
    }

    #[test]
    fn test_scope_of_loop() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let ret_ty = world.fn_ty(vec![s32]);
        let h_ty = world.fn_ty(vec![s32, ret_ty]);
        let head_ty = world.fn_ty(vec![s32]);
        let bb = world.fn_ty(vec![]);

        let h = world.lambda_sealed(h_ty, LambdaAttr::Extern, "h");
        let head = world.lambda_sealed(head_ty, LambdaAttr::None, "head");
        let latch = world.lambda_sealed(bb, LambdaAttr::None, "latch");
        let exit = world.lambda_sealed(bb, LambdaAttr::None, "exit");

        let n = world.param_of(h, 0);
        let ret = world.param_of(h, 1);
        let i = world.param_of(head, 0);
        let one = world.literal_s32(1);

        world.jump(h, head, &[one]);
        let cond = world.cmp(CmpOp::Lt, i, n);
        world.branch(head, cond, latch, exit);
        let inc = world.arith(ArithOp::Add, i, one);
        world.jump(latch, head, &[inc]);
        world.jump(exit, ret, &[i]);

        let scope = Scope::new(&world, h);
        assert!(scope.contains(head) && scope.contains(latch) && scope.contains(exit));
        assert_eq!(scope.sid(h), Some(0));
        assert_eq!(scope.sid(head), Some(1));
        // The back edge makes the latch a predecessor of the loop header.
        assert!(scope.preds(head).contains(&latch));
        let dom = scope.domtree();
        assert_eq!(dom.idom(head), h);
        assert_eq!(dom.idom(latch), head);
        assert_eq!(dom.idom(exit), head);
        assert_eq!(scope.exits(), &[exit]);
    }

    #[test]
    fn test_verify_detects_call_mismatch() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let f_ty = world.fn_ty(vec![s32]);
        let bb = world.fn_ty(vec![]);
        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let caller = world.lambda_sealed(bb, LambdaAttr::Extern, "caller");
        let wrong = world.literal_bool(true);
        world.jump(caller, f, &[wrong]);
        assert!(matches!(
            verify(&mut world),
            Err(VerifyError::CallTypeMismatch { .. })
        ));

        let three = world.literal_s32(3);
        world.jump(caller, f, &[three]);
        let halt = world.bottom(f_ty);
        world.jump(f, halt, &[]);
        assert!(verify(&mut world).is_ok());
    }
}
