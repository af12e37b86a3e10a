//! The definition graph.
//!
//! Every vertex is a [`DefNode`] stored in one arena owned by the [`World`];
//! a [`DefId`] doubles as the node's gid since arena ids are handed out in
//! monotonically increasing order. Structural nodes (primops, literals) are
//! hash-consed: building the same `(kind, type, ops)` twice yields the same
//! id. Nominal nodes (lambdas and their parameters) have identity and mutable
//! operands.
//!
//! Control flow lives in the same graph: a terminated lambda's operands are
//! `[callee, arg0, arg1, ...]` and a conditional branch is a jump whose
//! callee is a `select` over two continuations.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use cranelift_entity::packed_option::ReservedValue;
use cranelift_entity::{entity_impl, PrimaryMap};
use lasso::Spur;

use crate::types::{PrimType, TypeId, TypeNode};
use crate::INTERNER;

pub mod analysis;
pub mod dot;
pub mod opt;
pub mod pretty;
pub mod ssa;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DefId(u32);
entity_impl!(DefId, "d");

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LambdaId(u32);
entity_impl!(LambdaId, "l");

/// Bit-exact literal payload. Equality and hashing go through the raw bits,
/// so `-0.0` and `0.0` are distinct literals.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Box(pub u64);

impl Box {
    pub fn from_bool(v: bool) -> Box {
        Box(v as u64)
    }

    pub fn from_s32(v: i32) -> Box {
        Box(v as u32 as u64)
    }

    pub fn from_s64(v: i64) -> Box {
        Box(v as u64)
    }

    pub fn from_u32(v: u32) -> Box {
        Box(v as u64)
    }

    pub fn from_u64(v: u64) -> Box {
        Box(v)
    }

    pub fn from_f32(v: f32) -> Box {
        Box(v.to_bits() as u64)
    }

    pub fn from_f64(v: f64) -> Box {
        Box(v.to_bits())
    }

    pub fn get_bool(self) -> bool {
        self.0 != 0
    }

    pub fn get_s32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn get_s64(self) -> i64 {
        self.0 as i64
    }

    pub fn get_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn get_u64(self) -> u64 {
        self.0
    }

    pub fn get_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn get_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum BitOp {
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The closed node taxonomy. `not` is not a kind of its own: it is encoded
/// as `xor` with the all-ones literal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NodeKind {
    Lambda(LambdaId),
    Param { lambda: DefId, index: u32 },
    PrimLit(Box),
    Bottom,
    Select,
    Tuple,
    Extract,
    Insert,
    Arith(ArithOp),
    Bit(BitOp),
    Shift(ShiftOp),
    Cmp(CmpOp),
    Load,
    Store,
    Enter,
    Leave,
    Slot { index: u32 },
    Addr,
    Bitcast,
    Convert,
    /// A retired arena slot. Arena storage is never freed; `cleanup` marks
    /// unreachable nodes instead.
    Removed,
}

impl NodeKind {
    pub fn is_nominal(self) -> bool {
        matches!(self, NodeKind::Lambda(_) | NodeKind::Param { .. })
    }

    /// Fixed operand count, `None` for variable-arity kinds (lambdas,
    /// tuples).
    pub fn arity(self) -> Option<usize> {
        match self {
            NodeKind::Lambda(_) | NodeKind::Tuple => None,
            NodeKind::Param { .. } | NodeKind::PrimLit(_) | NodeKind::Bottom => Some(0),
            NodeKind::Slot { .. } | NodeKind::Addr | NodeKind::Bitcast | NodeKind::Convert => {
                Some(1)
            }
            NodeKind::Enter => Some(1),
            NodeKind::Arith(_) | NodeKind::Bit(_) | NodeKind::Shift(_) | NodeKind::Cmp(_) => {
                Some(2)
            }
            NodeKind::Extract | NodeKind::Load | NodeKind::Leave => Some(2),
            NodeKind::Select | NodeKind::Insert | NodeKind::Store => Some(3),
            NodeKind::Removed => Some(0),
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            NodeKind::Arith(ArithOp::Add)
                | NodeKind::Arith(ArithOp::Mul)
                | NodeKind::Bit(_)
                | NodeKind::Cmp(CmpOp::Eq)
                | NodeKind::Cmp(CmpOp::Ne)
        )
    }

    pub fn is_associative(self) -> bool {
        matches!(
            self,
            NodeKind::Arith(ArithOp::Add) | NodeKind::Arith(ArithOp::Mul) | NodeKind::Bit(_)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Lambda(_) => "lambda",
            NodeKind::Param { .. } => "param",
            NodeKind::PrimLit(_) => "lit",
            NodeKind::Bottom => "bot",
            NodeKind::Select => "select",
            NodeKind::Tuple => "tuple",
            NodeKind::Extract => "extract",
            NodeKind::Insert => "insert",
            NodeKind::Arith(ArithOp::Add) => "add",
            NodeKind::Arith(ArithOp::Sub) => "sub",
            NodeKind::Arith(ArithOp::Mul) => "mul",
            NodeKind::Arith(ArithOp::Div) => "div",
            NodeKind::Arith(ArithOp::Rem) => "rem",
            NodeKind::Bit(BitOp::And) => "and",
            NodeKind::Bit(BitOp::Or) => "or",
            NodeKind::Bit(BitOp::Xor) => "xor",
            NodeKind::Shift(ShiftOp::Shl) => "shl",
            NodeKind::Shift(ShiftOp::Shr) => "shr",
            NodeKind::Shift(ShiftOp::Sar) => "sar",
            NodeKind::Cmp(CmpOp::Eq) => "eq",
            NodeKind::Cmp(CmpOp::Ne) => "ne",
            NodeKind::Cmp(CmpOp::Lt) => "lt",
            NodeKind::Cmp(CmpOp::Le) => "le",
            NodeKind::Cmp(CmpOp::Gt) => "gt",
            NodeKind::Cmp(CmpOp::Ge) => "ge",
            NodeKind::Load => "load",
            NodeKind::Store => "store",
            NodeKind::Enter => "enter",
            NodeKind::Leave => "leave",
            NodeKind::Slot { .. } => "slot",
            NodeKind::Addr => "addr",
            NodeKind::Bitcast => "bitcast",
            NodeKind::Convert => "convert",
            NodeKind::Removed => "removed",
        }
    }
}

/// A single user edge: `user.ops[index]` points at the def owning this use.
/// Use sets are ordered by `(user gid, index)` so analyses iterate
/// deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Use {
    pub user: DefId,
    pub index: usize,
}

pub struct DefNode {
    pub kind: NodeKind,
    pub ty: TypeId,
    ops: Vec<DefId>,
    uses: BTreeSet<Use>,
    pub name: Option<Spur>,
    visit: Cell<u64>,
    representative: Cell<Option<DefId>>,
}

impl DefNode {
    fn new(kind: NodeKind, ty: TypeId, ops: Vec<DefId>, name: Option<Spur>) -> DefNode {
        DefNode {
            kind,
            ty,
            ops,
            uses: BTreeSet::new(),
            name,
            visit: Cell::new(0),
            representative: Cell::new(None),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum LambdaAttr {
    None,
    Extern,
    Intrinsic,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Todo {
    pub handle: usize,
    pub index: usize,
    pub ty: TypeId,
    pub name: Spur,
}

pub struct LambdaData {
    pub def: DefId,
    pub attr: LambdaAttr,
    pub(crate) params: Vec<DefId>,
    pub(crate) sealed: bool,
    pub(crate) visited: bool,
    pub(crate) parent: Option<DefId>,
    pub(crate) values: Vec<Option<DefId>>,
    pub(crate) todos: Vec<Todo>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    kind: NodeKind,
    ty: TypeId,
    ops: Vec<DefId>,
}

/// Owns every definition and every type. All mutation goes through the
/// world; analyses hold non-owning [`DefId`] handles.
pub struct World {
    pub(crate) defs: PrimaryMap<DefId, DefNode>,
    pub(crate) lambdas: PrimaryMap<LambdaId, LambdaData>,
    pub(crate) types: PrimaryMap<TypeId, TypeNode>,
    pub(crate) type_interner: HashMap<TypeNode, TypeId>,
    interner: HashMap<NodeKey, DefId>,
    pass: Cell<u64>,
}

impl World {
    pub fn new() -> World {
        World {
            defs: PrimaryMap::new(),
            lambdas: PrimaryMap::new(),
            types: PrimaryMap::new(),
            type_interner: HashMap::new(),
            interner: HashMap::new(),
            pass: Cell::new(0),
        }
    }

    pub fn num_defs(&self) -> usize {
        self.defs.len()
    }

    pub fn kind(&self, def: DefId) -> NodeKind {
        self.defs[def].kind
    }

    pub fn ty(&self, def: DefId) -> TypeId {
        self.defs[def].ty
    }

    pub fn name(&self, def: DefId) -> Option<Spur> {
        self.defs[def].name
    }

    pub fn set_name(&mut self, def: DefId, name: &str) {
        self.defs[def].name = Some(INTERNER.get_or_intern(name));
    }

    pub fn unique_name(&self, def: DefId) -> String {
        match self.defs[def].name {
            Some(name) => format!("{}_{}", INTERNER.resolve(&name), def.as_u32()),
            None => format!("_{}", def.as_u32()),
        }
    }

    pub fn ops(&self, def: DefId) -> &[DefId] {
        &self.defs[def].ops
    }

    pub fn num_ops(&self, def: DefId) -> usize {
        self.defs[def].ops.len()
    }

    /// The `i`-th operand; panics if the slot is unset.
    pub fn op(&self, def: DefId, i: usize) -> DefId {
        let op = self.defs[def].ops[i];
        assert!(!op.is_reserved_value(), "{}: operand {} is unset", def, i);
        self.resolve(op)
    }

    pub fn op_opt(&self, def: DefId, i: usize) -> Option<DefId> {
        match self.defs[def].ops.get(i) {
            Some(&op) if !op.is_reserved_value() => Some(self.resolve(op)),
            _ => None,
        }
    }

    /// Uses in `(gid, operand index)` order.
    pub fn uses(&self, def: DefId) -> impl Iterator<Item = Use> + '_ {
        self.defs[def].uses.iter().copied()
    }

    pub fn num_uses(&self, def: DefId) -> usize {
        self.defs[def].uses.len()
    }

    /*
     * use-def maintenance
     */

    /// Assigns `ops[i]`, keeping the operand's use set in lock-step. The slot
    /// must be unset; use [`World::update_op`] to overwrite.
    pub fn set_op(&mut self, user: DefId, i: usize, def: DefId) {
        let def = self.resolve(def);
        let slot = self.defs[user].ops[i];
        assert!(slot.is_reserved_value(), "{}: operand {} already set", user, i);
        self.defs[user].ops[i] = def;
        self.defs[def].uses.insert(Use { user, index: i });
    }

    pub fn unset_op(&mut self, user: DefId, i: usize) {
        let old = self.defs[user].ops[i];
        if !old.is_reserved_value() {
            self.defs[old].uses.remove(&Use { user, index: i });
            self.defs[user].ops[i] = DefId::reserved_value();
        }
    }

    pub fn unset_ops(&mut self, user: DefId) {
        for i in 0..self.defs[user].ops.len() {
            self.unset_op(user, i);
        }
    }

    pub fn update_op(&mut self, user: DefId, i: usize, def: DefId) {
        self.unset_op(user, i);
        self.set_op(user, i, def);
    }

    /*
     * proxy / replace
     */

    /// Follows the representative chain, path-compressing as it goes, so a
    /// handle to a replaced node transparently names its replacement.
    pub fn resolve(&self, def: DefId) -> DefId {
        let mut cur = def;
        while let Some(next) = self.defs[cur].representative.get() {
            cur = next;
        }
        let mut walk = def;
        while let Some(next) = self.defs[walk].representative.get() {
            self.defs[walk].representative.set(Some(cur));
            walk = next;
        }
        cur
    }

    pub fn is_proxy(&self, def: DefId) -> bool {
        self.defs[def].representative.get().is_some()
    }

    /// Retires `old` in favour of `new`: existing users are rewired to `new`
    /// and later lookups of `old` forward to it. Replacing a node with one of
    /// its own transitive users must not introduce a representative cycle.
    pub fn replace(&mut self, old: DefId, new: DefId) {
        let new = self.resolve(new);
        assert_ne!(old, new, "{}: replacing def with itself", old);
        let uses: Vec<Use> = self.defs[old].uses.iter().copied().collect();
        self.defs[old].representative.set(Some(new));
        for u in uses {
            self.unset_op(u.user, u.index);
            self.set_op(u.user, u.index, new);
        }
    }

    /*
     * pass numbers
     */

    /// A fresh pass identifier; at most one analysis may use a given pass
    /// number at a time.
    pub fn new_pass(&self) -> u64 {
        self.pass.set(self.pass.get() + 1);
        self.pass.get()
    }

    /// Marks `def` visited in `pass`, returning whether it already was.
    pub fn visit(&self, def: DefId, pass: u64) -> bool {
        let cell = &self.defs[def].visit;
        if cell.get() == pass {
            return true;
        }
        cell.set(pass);
        false
    }

    pub fn is_visited(&self, def: DefId, pass: u64) -> bool {
        self.defs[def].visit.get() == pass
    }

    /*
     * nominal factories
     */

    /// Creates an unsealed lambda; predecessors may still be added. Use
    /// [`World::lambda_sealed`] when the lambda's predecessor set is final
    /// from the start.
    pub fn lambda(&mut self, ty: TypeId, attr: LambdaAttr, name: &str) -> DefId {
        self.lambda_impl(ty, attr, name, false)
    }

    pub fn lambda_sealed(&mut self, ty: TypeId, attr: LambdaAttr, name: &str) -> DefId {
        self.lambda_impl(ty, attr, name, true)
    }

    fn lambda_impl(&mut self, ty: TypeId, attr: LambdaAttr, name: &str, sealed: bool) -> DefId {
        let arg_tys: Vec<TypeId> = match &self.types[ty] {
            TypeNode::Fn(elems) => elems.clone(),
            _ => panic!("lambda type must be a function type"),
        };
        let lid = self.lambdas.push(LambdaData {
            def: DefId::reserved_value(),
            attr,
            params: Vec::new(),
            sealed,
            visited: false,
            parent: None,
            values: Vec::new(),
            todos: Vec::new(),
        });
        let name = INTERNER.get_or_intern(name);
        let def = self
            .defs
            .push(DefNode::new(NodeKind::Lambda(lid), ty, Vec::new(), Some(name)));
        self.lambdas[lid].def = def;
        self.lambdas[lid].parent = Some(def);
        for (i, &arg_ty) in arg_tys.iter().enumerate() {
            self.param(arg_ty, def, i);
        }
        def
    }

    fn param(&mut self, ty: TypeId, lambda: DefId, index: usize) -> DefId {
        let kind = NodeKind::Param {
            lambda,
            index: index as u32,
        };
        let def = self.defs.push(DefNode::new(kind, ty, Vec::new(), None));
        let lid = self.as_lambda(lambda).expect("param owner must be a lambda");
        self.lambdas[lid].params.push(def);
        def
    }

    pub fn is_lambda(&self, def: DefId) -> bool {
        matches!(self.defs[def].kind, NodeKind::Lambda(_))
    }

    pub fn as_lambda(&self, def: DefId) -> Option<LambdaId> {
        match self.defs[def].kind {
            NodeKind::Lambda(lid) => Some(lid),
            _ => None,
        }
    }

    pub(crate) fn lambda_id(&self, def: DefId) -> LambdaId {
        self.as_lambda(def)
            .unwrap_or_else(|| panic!("{}: not a lambda", def))
    }

    pub fn attr(&self, lambda: DefId) -> LambdaAttr {
        self.lambdas[self.lambda_id(lambda)].attr
    }

    pub fn is_sealed(&self, lambda: DefId) -> bool {
        self.lambdas[self.lambda_id(lambda)].sealed
    }

    pub fn params(&self, lambda: DefId) -> &[DefId] {
        &self.lambdas[self.lambda_id(lambda)].params
    }

    pub fn num_params(&self, lambda: DefId) -> usize {
        self.params(lambda).len()
    }

    pub fn param_of(&self, lambda: DefId, i: usize) -> DefId {
        self.params(lambda)[i]
    }

    /// The first parameter of memory type, if the lambda is memory-effectful.
    pub fn mem_param(&self, lambda: DefId) -> Option<DefId> {
        self.params(lambda)
            .iter()
            .copied()
            .find(|&p| matches!(self.types[self.defs[p].ty], TypeNode::Mem))
    }

    /// An unterminated lambda has no operands at all.
    pub fn empty(&self, lambda: DefId) -> bool {
        self.defs[lambda].ops.is_empty()
    }

    pub fn callee(&self, lambda: DefId) -> DefId {
        self.op(lambda, 0)
    }

    pub fn args(&self, lambda: DefId) -> Vec<DefId> {
        (0..self.num_args(lambda)).map(|i| self.arg(lambda, i)).collect()
    }

    pub fn num_args(&self, lambda: DefId) -> usize {
        self.defs[lambda].ops.len().saturating_sub(1)
    }

    pub fn arg(&self, lambda: DefId, i: usize) -> DefId {
        self.op(lambda, i + 1)
    }

    pub fn arg_opt(&self, lambda: DefId, i: usize) -> Option<DefId> {
        self.op_opt(lambda, i + 1)
    }

    pub fn update_arg(&mut self, lambda: DefId, i: usize, def: DefId) {
        self.update_op(lambda, i + 1, def);
    }

    pub fn is_basicblock(&self, lambda: DefId) -> bool {
        self.ty_is_basicblock(self.defs[lambda].ty)
    }

    pub fn is_returning(&self, lambda: DefId) -> bool {
        self.ty_is_returning(self.defs[lambda].ty)
    }

    /// The function type of the argument list of this lambda's jump.
    pub fn arg_fn_ty(&mut self, lambda: DefId) -> TypeId {
        let arg_tys: Vec<TypeId> = self.args(lambda).iter().map(|&a| self.ty(a)).collect();
        self.fn_ty(arg_tys)
    }

    /// All live lambdas in creation order.
    pub fn lambda_defs(&self) -> Vec<DefId> {
        self.lambdas
            .iter()
            .map(|(_, data)| data.def)
            .filter(|&d| matches!(self.defs[d].kind, NodeKind::Lambda(_)))
            .collect()
    }

    pub fn extern_lambdas(&self) -> Vec<DefId> {
        self.lambda_defs()
            .into_iter()
            .filter(|&d| self.attr(d) != LambdaAttr::None)
            .collect()
    }

    /*
     * hash-consed factories
     */

    fn intern(&mut self, kind: NodeKind, ty: TypeId, ops: Vec<DefId>) -> DefId {
        debug_assert!(!kind.is_nominal());
        let ops: Vec<DefId> = ops.iter().map(|&op| self.resolve(op)).collect();
        let key = NodeKey {
            kind,
            ty,
            ops: ops.clone(),
        };
        if let Some(&def) = self.interner.get(&key) {
            return def;
        }
        let def = self.defs.push(DefNode::new(kind, ty, ops.clone(), None));
        for (i, &op) in ops.iter().enumerate() {
            self.defs[op].uses.insert(Use { user: def, index: i });
        }
        self.interner.insert(key, def);
        def
    }

    pub fn literal(&mut self, prim: PrimType, value: Box) -> DefId {
        let ty = self.prim_ty(prim);
        self.intern(NodeKind::PrimLit(value), ty, Vec::new())
    }

    pub fn literal_bool(&mut self, v: bool) -> DefId {
        self.literal(PrimType::Bool, Box::from_bool(v))
    }

    pub fn literal_s32(&mut self, v: i32) -> DefId {
        self.literal(PrimType::S32, Box::from_s32(v))
    }

    pub fn literal_s64(&mut self, v: i64) -> DefId {
        self.literal(PrimType::S64, Box::from_s64(v))
    }

    pub fn literal_u32(&mut self, v: u32) -> DefId {
        self.literal(PrimType::U32, Box::from_u32(v))
    }

    pub fn literal_u64(&mut self, v: u64) -> DefId {
        self.literal(PrimType::U64, Box::from_u64(v))
    }

    /// The all-ones literal of `prim`; `xor` against it encodes `not`.
    pub fn allset(&mut self, prim: PrimType) -> DefId {
        let value = match prim {
            PrimType::Bool => Box::from_bool(true),
            PrimType::S32 | PrimType::U32 => Box(0xffff_ffff),
            PrimType::S64 | PrimType::U64 => Box(u64::MAX),
            PrimType::F32 | PrimType::F64 => panic!("allset of float type"),
        };
        self.literal(prim, value)
    }

    pub fn bottom(&mut self, ty: TypeId) -> DefId {
        self.intern(NodeKind::Bottom, ty, Vec::new())
    }

    pub fn as_lit(&self, def: DefId) -> Option<Box> {
        match self.defs[self.resolve(def)].kind {
            NodeKind::PrimLit(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_zero(&self, def: DefId) -> bool {
        self.as_lit(def).map_or(false, |b| b.0 == 0)
    }

    pub fn is_allset(&self, def: DefId) -> bool {
        let def = self.resolve(def);
        match (self.as_lit(def), self.as_prim_ty(self.defs[def].ty)) {
            (Some(b), Some(PrimType::Bool)) => b.get_bool(),
            (Some(b), Some(PrimType::S32 | PrimType::U32)) => b.0 == 0xffff_ffff,
            (Some(b), Some(PrimType::S64 | PrimType::U64)) => b.0 == u64::MAX,
            _ => false,
        }
    }

    /// `select(cond, tval, fval)`: folds a known condition away, otherwise
    /// interns the node. Used as a jump callee to express branches.
    pub fn select(&mut self, cond: DefId, tval: DefId, fval: DefId) -> DefId {
        let (cond, tval, fval) = (self.resolve(cond), self.resolve(tval), self.resolve(fval));
        assert_eq!(self.ty(tval), self.ty(fval), "select arms differ in type");
        if let Some(b) = self.as_lit(cond) {
            return if b.get_bool() { tval } else { fval };
        }
        if tval == fval {
            return tval;
        }
        let ty = self.ty(tval);
        self.intern(NodeKind::Select, ty, vec![cond, tval, fval])
    }

    pub fn arith(&mut self, op: ArithOp, a: DefId, b: DefId) -> DefId {
        let (a, b) = (self.resolve(a), self.resolve(b));
        let ty = self.ty(a);
        assert_eq!(ty, self.ty(b), "arith operands differ in type");
        let prim = self.as_prim_ty(ty).expect("arith on non-primitive type");
        if matches!(op, ArithOp::Div | ArithOp::Rem) && self.is_zero(b) && !prim.is_float() {
            return self.bottom(ty);
        }
        if let (Some(x), Some(y)) = (self.as_lit(a), self.as_lit(b)) {
            return self.literal(prim, fold_arith(op, prim, x, y));
        }
        self.intern(NodeKind::Arith(op), ty, vec![a, b])
    }

    pub fn bit(&mut self, op: BitOp, a: DefId, b: DefId) -> DefId {
        let (a, b) = (self.resolve(a), self.resolve(b));
        let ty = self.ty(a);
        assert_eq!(ty, self.ty(b), "bit operands differ in type");
        let prim = self.as_prim_ty(ty).expect("bitop on non-primitive type");
        if let (Some(x), Some(y)) = (self.as_lit(a), self.as_lit(b)) {
            let bits = match op {
                BitOp::And => x.0 & y.0,
                BitOp::Or => x.0 | y.0,
                BitOp::Xor => x.0 ^ y.0,
            };
            return self.literal(prim, truncate(prim, bits));
        }
        self.intern(NodeKind::Bit(op), ty, vec![a, b])
    }

    pub fn not(&mut self, a: DefId) -> DefId {
        let prim = self.as_prim_ty(self.ty(a)).expect("not on non-primitive type");
        let ones = self.allset(prim);
        self.bit(BitOp::Xor, ones, a)
    }

    pub fn shift(&mut self, op: ShiftOp, a: DefId, b: DefId) -> DefId {
        let (a, b) = (self.resolve(a), self.resolve(b));
        let ty = self.ty(a);
        let prim = self.as_prim_ty(ty).expect("shift on non-primitive type");
        if let (Some(x), Some(y)) = (self.as_lit(a), self.as_lit(b)) {
            return self.literal(prim, fold_shift(op, prim, x, y));
        }
        self.intern(NodeKind::Shift(op), ty, vec![a, b])
    }

    pub fn cmp(&mut self, op: CmpOp, a: DefId, b: DefId) -> DefId {
        let (a, b) = (self.resolve(a), self.resolve(b));
        let ty = self.ty(a);
        assert_eq!(ty, self.ty(b), "cmp operands differ in type");
        let prim = self.as_prim_ty(ty).expect("cmp on non-primitive type");
        if let (Some(x), Some(y)) = (self.as_lit(a), self.as_lit(b)) {
            return self.literal_bool(fold_cmp(op, prim, x, y));
        }
        let bool_ty = self.prim_ty(PrimType::Bool);
        self.intern(NodeKind::Cmp(op), bool_ty, vec![a, b])
    }

    pub fn tuple(&mut self, elems: Vec<DefId>) -> DefId {
        let elems: Vec<DefId> = elems.iter().map(|&e| self.resolve(e)).collect();
        let tys = elems.iter().map(|&e| self.ty(e)).collect();
        let ty = self.tuple_ty(tys);
        self.intern(NodeKind::Tuple, ty, elems)
    }

    /// `extract(agg, index)`; folds a literal index into a tuple node.
    pub fn extract(&mut self, agg: DefId, index: DefId) -> DefId {
        let (agg, index) = (self.resolve(agg), self.resolve(index));
        if let (NodeKind::Tuple, Some(i)) = (self.kind(agg), self.as_lit(index)) {
            return self.op(agg, i.get_u64() as usize);
        }
        let elem_ty = match (&self.types[self.ty(agg)], self.as_lit(index)) {
            (TypeNode::Tuple(elems), Some(i)) => elems[i.get_u64() as usize],
            (TypeNode::Tuple(elems), None) => {
                let first = elems[0];
                assert!(
                    elems.iter().all(|&e| e == first),
                    "extract with unknown index from a heterogeneous tuple"
                );
                first
            }
            _ => panic!("extract from non-tuple"),
        };
        self.intern(NodeKind::Extract, elem_ty, vec![agg, index])
    }

    pub fn extract_at(&mut self, agg: DefId, index: usize) -> DefId {
        let index = self.literal_u64(index as u64);
        self.extract(agg, index)
    }

    pub fn insert(&mut self, agg: DefId, index: DefId, value: DefId) -> DefId {
        let ty = self.ty(agg);
        self.intern(NodeKind::Insert, ty, vec![agg, index, value])
    }

    pub fn load(&mut self, mem: DefId, ptr: DefId) -> DefId {
        let pointee = match self.types[self.ty(ptr)] {
            TypeNode::Ptr(p) => p,
            _ => panic!("load through non-pointer"),
        };
        let mem_ty = self.mem_ty();
        let ty = self.tuple_ty(vec![mem_ty, pointee]);
        self.intern(NodeKind::Load, ty, vec![mem, ptr])
    }

    pub fn store(&mut self, mem: DefId, ptr: DefId, value: DefId) -> DefId {
        let ty = self.mem_ty();
        self.intern(NodeKind::Store, ty, vec![mem, ptr, value])
    }

    pub fn enter(&mut self, mem: DefId) -> DefId {
        let mem_ty = self.mem_ty();
        let frame_ty = self.frame_ty();
        let ty = self.tuple_ty(vec![mem_ty, frame_ty]);
        self.intern(NodeKind::Enter, ty, vec![mem])
    }

    pub fn leave(&mut self, mem: DefId, frame: DefId) -> DefId {
        let ty = self.mem_ty();
        self.intern(NodeKind::Leave, ty, vec![mem, frame])
    }

    pub fn slot(&mut self, frame: DefId, index: u32, pointee: TypeId) -> DefId {
        let ty = self.ptr_ty(pointee);
        self.intern(NodeKind::Slot { index }, ty, vec![frame])
    }

    pub fn addr(&mut self, lambda: DefId) -> DefId {
        let lambda = self.resolve(lambda);
        let ty = self.ptr_ty(self.ty(lambda));
        self.intern(NodeKind::Addr, ty, vec![lambda])
    }

    pub fn bitcast(&mut self, ty: TypeId, def: DefId) -> DefId {
        let def = self.resolve(def);
        if self.ty(def) == ty {
            return def;
        }
        self.intern(NodeKind::Bitcast, ty, vec![def])
    }

    pub fn convert(&mut self, ty: TypeId, def: DefId) -> DefId {
        let def = self.resolve(def);
        if self.ty(def) == ty {
            return def;
        }
        self.intern(NodeKind::Convert, ty, vec![def])
    }

    /// Builds the structural node of `old`'s kind and type over `new_ops`,
    /// re-entering the folding factories. Returns `old` itself when the
    /// operands are unchanged, by virtue of hash-consing.
    pub fn rebuild(&mut self, old: DefId, new_ops: &[DefId]) -> DefId {
        let old = self.resolve(old);
        match self.kind(old) {
            NodeKind::Select => self.select(new_ops[0], new_ops[1], new_ops[2]),
            NodeKind::Arith(op) => self.arith(op, new_ops[0], new_ops[1]),
            NodeKind::Bit(op) => self.bit(op, new_ops[0], new_ops[1]),
            NodeKind::Shift(op) => self.shift(op, new_ops[0], new_ops[1]),
            NodeKind::Cmp(op) => self.cmp(op, new_ops[0], new_ops[1]),
            NodeKind::Tuple => self.tuple(new_ops.to_vec()),
            NodeKind::Extract => self.extract(new_ops[0], new_ops[1]),
            NodeKind::Insert => self.insert(new_ops[0], new_ops[1], new_ops[2]),
            NodeKind::Load => self.load(new_ops[0], new_ops[1]),
            NodeKind::Store => self.store(new_ops[0], new_ops[1], new_ops[2]),
            NodeKind::Enter => self.enter(new_ops[0]),
            NodeKind::Leave => self.leave(new_ops[0], new_ops[1]),
            NodeKind::Addr => self.addr(new_ops[0]),
            kind @ (NodeKind::Slot { .. } | NodeKind::Bitcast | NodeKind::Convert) => {
                let ty = self.ty(old);
                self.intern(kind, ty, new_ops.to_vec())
            }
            NodeKind::PrimLit(_) | NodeKind::Bottom => old,
            NodeKind::Lambda(_) | NodeKind::Param { .. } | NodeKind::Removed => {
                panic!("rebuild of nominal node {}", old)
            }
        }
    }

    /*
     * control-flow neighbours
     */

    /// All lambdas referenced from this lambda's operands, found by walking
    /// through intervening structural nodes.
    pub fn succs(&self, lambda: DefId) -> Vec<DefId> {
        let mut result = Vec::new();
        let mut queue = VecDeque::new();
        let mut done = HashSet::new();
        for i in 0..self.num_ops(lambda) {
            if let Some(op) = self.op_opt(lambda, i) {
                if done.insert(op) {
                    queue.push_back(op);
                }
            }
        }
        while let Some(def) = queue.pop_front() {
            if self.is_lambda(def) {
                result.push(def);
            } else {
                for i in 0..self.num_ops(def) {
                    if let Some(op) = self.op_opt(def, i) {
                        if done.insert(op) {
                            queue.push_back(op);
                        }
                    }
                }
            }
        }
        result
    }

    /// All lambdas that mention this lambda anywhere in their operands, found
    /// by walking the use chains upward.
    pub fn preds(&self, lambda: DefId) -> Vec<DefId> {
        let mut result = Vec::new();
        let mut queue = VecDeque::new();
        let mut done = HashSet::new();
        for u in self.defs[lambda].uses.iter() {
            if done.insert(u.user) {
                queue.push_back(u.user);
            }
        }
        while let Some(def) = queue.pop_front() {
            if self.is_lambda(def) {
                result.push(def);
            } else {
                for u in self.defs[def].uses.iter() {
                    if done.insert(u.user) {
                        queue.push_back(u.user);
                    }
                }
            }
        }
        result
    }

    /// Lambdas this lambda jumps to: the callee, or both arms of a `select`
    /// callee.
    pub fn direct_succs(&self, lambda: DefId) -> Vec<DefId> {
        let mut result = Vec::new();
        if self.empty(lambda) {
            return result;
        }
        let to = self.callee(lambda);
        if self.is_lambda(to) {
            result.push(to);
        } else if self.kind(to) == NodeKind::Select {
            for i in 1..3 {
                let arm = self.op(to, i);
                if self.is_lambda(arm) {
                    result.push(arm);
                }
            }
        }
        result
    }

    /// Lambdas that jump to this one: users at callee position, looking
    /// through `select`.
    pub fn direct_preds(&self, lambda: DefId) -> Vec<DefId> {
        let mut result = Vec::new();
        for u in self.defs[lambda].uses.iter() {
            if self.kind(u.user) == NodeKind::Select {
                for su in self.defs[u.user].uses.iter() {
                    if su.index == 0 && self.is_lambda(su.user) {
                        result.push(su.user);
                    }
                }
            } else if u.index == 0 && self.is_lambda(u.user) {
                result.push(u.user);
            }
        }
        result
    }

    /*
     * cleanup
     */

    /// Garbage-collects everything unreachable from extern and intrinsic
    /// lambdas. Retired nodes become [`NodeKind::Removed`]; their operand
    /// slots and interner entries are dropped so use lists stay in sync.
    pub fn cleanup(&mut self) {
        let pass = self.new_pass();
        let mut stack: Vec<DefId> = self.extern_lambdas();
        for &root in &stack {
            self.visit(root, pass);
        }
        while let Some(def) = stack.pop() {
            if self.is_lambda(def) {
                for &p in self.params(def) {
                    if !self.visit(p, pass) {
                        stack.push(p);
                    }
                }
            }
            for i in 0..self.num_ops(def) {
                if let Some(op) = self.op_opt(def, i) {
                    if !self.visit(op, pass) {
                        stack.push(op);
                    }
                }
            }
        }

        let dead: Vec<DefId> = self
            .defs
            .iter()
            .filter(|(d, node)| !matches!(node.kind, NodeKind::Removed) && !self.is_visited(*d, pass))
            .map(|(d, _)| d)
            .collect();
        let dead_keys: Vec<NodeKey> = self
            .interner
            .iter()
            .filter(|&(_, &d)| !self.is_visited(d, pass))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead_keys {
            self.interner.remove(&key);
        }
        for &d in &dead {
            self.unset_ops(d);
        }
        for &d in &dead {
            self.defs[d].kind = NodeKind::Removed;
            self.defs[d].uses.clear();
        }
        log::debug!("cleanup: retired {} of {} defs", dead.len(), self.defs.len());
    }
}

impl Default for World {
    fn default() -> World {
        World::new()
    }
}

fn truncate(prim: PrimType, bits: u64) -> Box {
    match prim {
        PrimType::Bool => Box(bits & 1),
        PrimType::S32 | PrimType::U32 | PrimType::F32 => Box(bits & 0xffff_ffff),
        PrimType::S64 | PrimType::U64 | PrimType::F64 => Box(bits),
    }
}

fn fold_arith(op: ArithOp, prim: PrimType, a: Box, b: Box) -> Box {
    match prim {
        PrimType::Bool => panic!("arith on bool"),
        PrimType::S32 => {
            let (x, y) = (a.get_s32(), b.get_s32());
            Box::from_s32(match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Div => x.wrapping_div(y),
                ArithOp::Rem => x.wrapping_rem(y),
            })
        }
        PrimType::S64 => {
            let (x, y) = (a.get_s64(), b.get_s64());
            Box::from_s64(match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Div => x.wrapping_div(y),
                ArithOp::Rem => x.wrapping_rem(y),
            })
        }
        PrimType::U32 => {
            let (x, y) = (a.get_u32(), b.get_u32());
            Box::from_u32(match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Div => x / y,
                ArithOp::Rem => x % y,
            })
        }
        PrimType::U64 => {
            let (x, y) = (a.get_u64(), b.get_u64());
            Box::from_u64(match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Div => x / y,
                ArithOp::Rem => x % y,
            })
        }
        PrimType::F32 => {
            let (x, y) = (a.get_f32(), b.get_f32());
            Box::from_f32(match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Rem => x % y,
            })
        }
        PrimType::F64 => {
            let (x, y) = (a.get_f64(), b.get_f64());
            Box::from_f64(match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Rem => x % y,
            })
        }
    }
}

fn fold_shift(op: ShiftOp, prim: PrimType, a: Box, b: Box) -> Box {
    let amount = b.get_u64() as u32;
    match prim {
        PrimType::S32 | PrimType::U32 => {
            let x = a.get_u32();
            let bits = match op {
                ShiftOp::Shl => x.wrapping_shl(amount),
                ShiftOp::Shr => x.wrapping_shr(amount),
                ShiftOp::Sar => (x as i32).wrapping_shr(amount) as u32,
            };
            Box::from_u32(bits)
        }
        PrimType::S64 | PrimType::U64 => {
            let x = a.get_u64();
            let bits = match op {
                ShiftOp::Shl => x.wrapping_shl(amount),
                ShiftOp::Shr => x.wrapping_shr(amount),
                ShiftOp::Sar => (x as i64).wrapping_shr(amount) as u64,
            };
            Box::from_u64(bits)
        }
        _ => panic!("shift on {:?}", prim),
    }
}

fn fold_cmp(op: CmpOp, prim: PrimType, a: Box, b: Box) -> bool {
    fn rel<T: PartialOrd + PartialEq>(op: CmpOp, x: T, y: T) -> bool {
        match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        }
    }
    match prim {
        PrimType::Bool => rel(op, a.get_bool(), b.get_bool()),
        PrimType::S32 => rel(op, a.get_s32(), b.get_s32()),
        PrimType::S64 => rel(op, a.get_s64(), b.get_s64()),
        PrimType::U32 => rel(op, a.get_u32(), b.get_u32()),
        PrimType::U64 => rel(op, a.get_u64(), b.get_u64()),
        PrimType::F32 => rel(op, a.get_f32(), b.get_f32()),
        PrimType::F64 => rel(op, a.get_f64(), b.get_f64()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimType;

    #[test]
    fn test_hash_consing() {
        let mut world = World::new();
        let a = world.literal_s32(7);
        let b = world.literal_s32(7);
        assert_eq!(a, b);
        let c = world.literal_s32(8);
        assert_ne!(a, c);

        let x = world.arith(ArithOp::Add, a, c);
        let y = world.arith(ArithOp::Add, b, c);
        assert_eq!(x, y);
        // Operand order matters: hash-consing does not normalize
        // commutative operations.
        let z = world.arith(ArithOp::Add, c, a);
        assert_ne!(x, z);
    }

    #[test]
    fn test_literal_payload_is_bit_exact() {
        let mut world = World::new();
        let pos = world.literal(PrimType::F64, Box::from_f64(0.0));
        let neg = world.literal(PrimType::F64, Box::from_f64(-0.0));
        assert_ne!(pos, neg);
        // Same bits, different type: still distinct nodes.
        let s = world.literal_s32(1);
        let u = world.literal_u32(1);
        assert_ne!(s, u);
    }

    #[test]
    fn test_constant_folding() {
        let mut world = World::new();
        let five = world.literal_s32(5);
        let one = world.literal_s32(1);
        let six = world.arith(ArithOp::Add, five, one);
        assert_eq!(world.as_lit(six).unwrap().get_s32(), 6);

        let t = world.literal_bool(true);
        let lt = world.cmp(CmpOp::Lt, five, one);
        assert_eq!(world.as_lit(lt).unwrap().get_bool(), false);

        let a = world.literal_s32(10);
        let b = world.literal_s32(20);
        assert_eq!(world.select(t, a, b), a);
        let f = world.literal_bool(false);
        assert_eq!(world.select(f, a, b), b);

        let zero = world.literal_s32(0);
        let div = world.arith(ArithOp::Div, five, zero);
        assert_eq!(world.kind(div), NodeKind::Bottom);
    }

    #[test]
    fn test_not_is_xor_allset() {
        let mut world = World::new();
        let zero = world.literal_u32(0);
        let inverted = world.not(zero);
        assert!(world.is_allset(inverted));
        let back = world.not(inverted);
        assert_eq!(back, zero);
    }

    #[test]
    fn test_direct_neighbours() {
        let mut world = World::new();
        let bool_ty = world.prim_ty(PrimType::Bool);
        let ret_ty = world.fn_ty(vec![]);
        let a_ty = world.fn_ty(vec![bool_ty, ret_ty]);
        let bb = world.fn_ty(vec![]);
        let a = world.lambda_sealed(a_ty, LambdaAttr::Extern, "a");
        let b = world.lambda_sealed(bb, LambdaAttr::None, "b");
        let c = world.lambda_sealed(bb, LambdaAttr::None, "c");
        let cond = world.param_of(a, 0);
        world.branch(a, cond, b, c);
        world.jump(b, c, &[]);

        // A branch reaches both arms; the select is looked through.
        assert_eq!(world.direct_succs(a), vec![b, c]);
        assert_eq!(world.direct_preds(b), vec![a]);
        let cpreds = world.direct_preds(c);
        assert_eq!(cpreds.len(), 2);
        assert!(cpreds.contains(&a) && cpreds.contains(&b));
        // Passing a lambda as an argument is not a direct edge.
        let d = world.lambda_sealed(bb, LambdaAttr::None, "d");
        world.jump(c, d, &[]);
        let e = world.lambda_sealed(ret_ty, LambdaAttr::None, "e");
        world.jump(d, e, &[]);
        let f_ty = world.fn_ty(vec![bb]);
        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        world.jump(e, f, &[d]);
        assert!(world.direct_preds(d).contains(&c));
        assert!(!world.direct_preds(d).contains(&e));
        assert!(world.preds(d).contains(&e));
    }

    #[test]
    fn test_extract_folds_tuple() {
        let mut world = World::new();
        let a = world.literal_s32(1);
        let b = world.literal_s32(2);
        let t = world.tuple(vec![a, b]);
        assert_eq!(world.extract_at(t, 0), a);
        assert_eq!(world.extract_at(t, 1), b);
    }

    #[test]
    fn test_use_def_symmetry() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let ty = world.fn_ty(vec![s32]);
        let l = world.lambda_sealed(ty, LambdaAttr::None, "f");
        let x = world.param_of(l, 0);
        let one = world.literal_s32(1);
        let sum = world.arith(ArithOp::Add, x, one);

        // Structural node registered itself with both operands.
        assert!(world.uses(x).any(|u| u.user == sum && u.index == 0));
        assert!(world.uses(one).any(|u| u.user == sum && u.index == 1));

        // Use iteration is ordered by (gid, index).
        let two = world.literal_s32(2);
        let sum2 = world.arith(ArithOp::Add, x, two);
        let users: Vec<Use> = world.uses(x).collect();
        assert_eq!(users, vec![
            Use { user: sum, index: 0 },
            Use { user: sum2, index: 0 }
        ]);
    }

    #[test]
    fn test_replace_forwards_and_rewires() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let ty = world.fn_ty(vec![s32]);
        let l = world.lambda_sealed(ty, LambdaAttr::None, "f");
        let x = world.param_of(l, 0);
        let one = world.literal_s32(1);
        let sum = world.arith(ArithOp::Add, x, one);

        let seven = world.literal_s32(7);
        world.replace(x, seven);
        assert_eq!(world.resolve(x), seven);
        // The user's operand slot was physically repaired.
        assert_eq!(world.op(sum, 0), seven);
        assert!(world.uses(seven).any(|u| u.user == sum && u.index == 0));
        assert_eq!(world.num_uses(x), 0);
    }

    #[test]
    fn test_rebuild_reuses_and_folds() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let ty = world.fn_ty(vec![s32]);
        let l = world.lambda_sealed(ty, LambdaAttr::None, "f");
        let x = world.param_of(l, 0);
        let one = world.literal_s32(1);
        let sum = world.arith(ArithOp::Add, x, one);

        assert_eq!(world.rebuild(sum, &[x, one]), sum);
        let five = world.literal_s32(5);
        let rebuilt = world.rebuild(sum, &[five, one]);
        assert_eq!(world.as_lit(rebuilt).unwrap().get_s32(), 6);
    }

    #[test]
    fn test_cleanup_retires_unreachable() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let bb = world.fn_ty(vec![s32]);
        let keep = world.lambda_sealed(bb, LambdaAttr::Extern, "keep");
        let dead = world.lambda_sealed(bb, LambdaAttr::None, "dead");
        let lit = world.literal_s32(3);
        world.jump(keep, keep, &[lit]);
        world.jump(dead, keep, &[lit]);

        world.cleanup();
        assert!(matches!(world.kind(dead), NodeKind::Removed));
        assert!(world.is_lambda(keep));
        // The dead lambda's use of `keep` is gone; only the self-jump
        // remains.
        assert!(world.uses(keep).all(|u| u.user != dead));
    }
}
