//! Hash-consed type system.
//!
//! Continuations never return, so a function type is `fn(t0, ..., tn)` with
//! no result; "returning" is modelled by passing a return continuation as an
//! argument. Types are interned in the [`World`](crate::ir::World): equal
//! structure means equal [`TypeId`].

use std::collections::HashMap;
use std::fmt::Write;

use cranelift_entity::entity_impl;

use crate::ir::World;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);
entity_impl!(TypeId, "t");

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum PrimType {
    Bool,
    S32,
    S64,
    U32,
    U64,
    F32,
    F64,
}

impl PrimType {
    pub fn is_float(self) -> bool {
        matches!(self, PrimType::F32 | PrimType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, PrimType::S32 | PrimType::S64)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeNode {
    Prim(PrimType),
    /// The distinguished memory token. Memory-effectful lambdas carry it as
    /// parameter 0.
    Mem,
    /// A stack frame token produced by `enter`.
    Frame,
    Ptr(TypeId),
    Tuple(Vec<TypeId>),
    /// `fn(t0, ..., tn)`; continuations take their arguments and never
    /// return.
    Fn(Vec<TypeId>),
    /// A generic type variable, subject to `specialize`/`infer_with`.
    Generic(u32),
}

impl World {
    pub(crate) fn intern_ty(&mut self, node: TypeNode) -> TypeId {
        if let Some(&id) = self.type_interner.get(&node) {
            return id;
        }
        let id = self.types.push(node.clone());
        self.type_interner.insert(node, id);
        id
    }

    pub fn type_node(&self, ty: TypeId) -> &TypeNode {
        &self.types[ty]
    }

    pub fn prim_ty(&mut self, prim: PrimType) -> TypeId {
        self.intern_ty(TypeNode::Prim(prim))
    }

    pub fn mem_ty(&mut self) -> TypeId {
        self.intern_ty(TypeNode::Mem)
    }

    pub fn frame_ty(&mut self) -> TypeId {
        self.intern_ty(TypeNode::Frame)
    }

    pub fn ptr_ty(&mut self, pointee: TypeId) -> TypeId {
        self.intern_ty(TypeNode::Ptr(pointee))
    }

    pub fn tuple_ty(&mut self, elems: Vec<TypeId>) -> TypeId {
        self.intern_ty(TypeNode::Tuple(elems))
    }

    pub fn fn_ty(&mut self, elems: Vec<TypeId>) -> TypeId {
        self.intern_ty(TypeNode::Fn(elems))
    }

    pub fn generic_ty(&mut self, index: u32) -> TypeId {
        self.intern_ty(TypeNode::Generic(index))
    }

    pub fn as_prim_ty(&self, ty: TypeId) -> Option<PrimType> {
        match self.types[ty] {
            TypeNode::Prim(p) => Some(p),
            _ => None,
        }
    }

    pub fn fn_args(&self, ty: TypeId) -> &[TypeId] {
        match &self.types[ty] {
            TypeNode::Fn(elems) => elems,
            _ => panic!("{}: not a function type", ty),
        }
    }

    /// 0 for value types; a function type is one order above its highest
    /// argument.
    pub fn ty_order(&self, ty: TypeId) -> usize {
        match &self.types[ty] {
            TypeNode::Prim(_) | TypeNode::Mem | TypeNode::Frame | TypeNode::Generic(_) => 0,
            TypeNode::Ptr(_) => 0,
            TypeNode::Tuple(elems) => elems.iter().map(|&e| self.ty_order(e)).max().unwrap_or(0),
            TypeNode::Fn(elems) => {
                1 + elems.iter().map(|&e| self.ty_order(e)).max().unwrap_or(0)
            }
        }
    }

    /// A basic block takes first-order arguments only.
    pub fn ty_is_basicblock(&self, ty: TypeId) -> bool {
        matches!(self.types[ty], TypeNode::Fn(_)) && self.ty_order(ty) == 1
    }

    /// A returning continuation takes exactly one higher-order argument: its
    /// return continuation.
    pub fn ty_is_returning(&self, ty: TypeId) -> bool {
        match &self.types[ty] {
            TypeNode::Fn(elems) => {
                if self.ty_order(ty) != 2 {
                    return false;
                }
                elems.iter().filter(|&&e| self.ty_order(e) == 1).count() == 1
            }
            _ => false,
        }
    }

    /// Substitutes generic type variables according to `map`.
    pub fn specialize_ty(&mut self, ty: TypeId, map: &HashMap<TypeId, TypeId>) -> TypeId {
        if map.is_empty() {
            return ty;
        }
        match self.types[ty].clone() {
            TypeNode::Generic(_) => map.get(&ty).copied().unwrap_or(ty),
            TypeNode::Prim(_) | TypeNode::Mem | TypeNode::Frame => ty,
            TypeNode::Ptr(pointee) => {
                let pointee = self.specialize_ty(pointee, map);
                self.ptr_ty(pointee)
            }
            TypeNode::Tuple(elems) => {
                let elems = elems.iter().map(|&e| self.specialize_ty(e, map)).collect();
                self.tuple_ty(elems)
            }
            TypeNode::Fn(elems) => {
                let elems = elems.iter().map(|&e| self.specialize_ty(e, map)).collect();
                self.fn_ty(elems)
            }
        }
    }

    /// Unifies `ty` against `other`, binding generic variables of `ty` into
    /// `map`. Returns whether unification succeeded; `map` may hold partial
    /// bindings on failure.
    pub fn infer_with(&self, ty: TypeId, map: &mut HashMap<TypeId, TypeId>, other: TypeId) -> bool {
        if ty == other {
            return true;
        }
        match (&self.types[ty], &self.types[other]) {
            (TypeNode::Generic(_), _) => match map.get(&ty) {
                Some(&bound) => bound == other,
                None => {
                    map.insert(ty, other);
                    true
                }
            },
            (TypeNode::Prim(a), TypeNode::Prim(b)) => a == b,
            (TypeNode::Mem, TypeNode::Mem) | (TypeNode::Frame, TypeNode::Frame) => true,
            (TypeNode::Ptr(a), TypeNode::Ptr(b)) => self.infer_with(*a, map, *b),
            (TypeNode::Tuple(a), TypeNode::Tuple(b)) | (TypeNode::Fn(a), TypeNode::Fn(b)) => {
                let (a, b) = (a.clone(), b.clone());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(&x, &y)| self.infer_with(x, map, y))
            }
            _ => false,
        }
    }

    pub fn ty_to_string(&self, ty: TypeId) -> String {
        let mut out = String::new();
        self.write_ty(&mut out, ty).unwrap();
        out
    }

    fn write_ty(&self, out: &mut String, ty: TypeId) -> std::fmt::Result {
        match &self.types[ty] {
            TypeNode::Prim(PrimType::Bool) => write!(out, "bool"),
            TypeNode::Prim(PrimType::S32) => write!(out, "s32"),
            TypeNode::Prim(PrimType::S64) => write!(out, "s64"),
            TypeNode::Prim(PrimType::U32) => write!(out, "u32"),
            TypeNode::Prim(PrimType::U64) => write!(out, "u64"),
            TypeNode::Prim(PrimType::F32) => write!(out, "f32"),
            TypeNode::Prim(PrimType::F64) => write!(out, "f64"),
            TypeNode::Mem => write!(out, "mem"),
            TypeNode::Frame => write!(out, "frame"),
            TypeNode::Generic(i) => write!(out, "g{}", i),
            TypeNode::Ptr(pointee) => {
                write!(out, "ptr ")?;
                self.write_ty(out, *pointee)
            }
            TypeNode::Tuple(elems) => {
                write!(out, "(")?;
                for (i, &e) in elems.iter().enumerate() {
                    if i != 0 {
                        write!(out, ", ")?;
                    }
                    self.write_ty(out, e)?;
                }
                write!(out, ")")
            }
            TypeNode::Fn(elems) => {
                write!(out, "fn(")?;
                for (i, &e) in elems.iter().enumerate() {
                    if i != 0 {
                        write!(out, ", ")?;
                    }
                    self.write_ty(out, e)?;
                }
                write!(out, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_are_interned() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let a = world.fn_ty(vec![s32, s32]);
        let b = world.fn_ty(vec![s32, s32]);
        assert_eq!(a, b);
        let c = world.fn_ty(vec![s32]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_order_basicblock_returning() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let bb = world.fn_ty(vec![s32, s32]);
        assert_eq!(world.ty_order(s32), 0);
        assert_eq!(world.ty_order(bb), 1);
        assert!(world.ty_is_basicblock(bb));
        assert!(!world.ty_is_returning(bb));

        let ret = world.fn_ty(vec![s32]);
        let f = world.fn_ty(vec![s32, ret]);
        assert_eq!(world.ty_order(f), 2);
        assert!(!world.ty_is_basicblock(f));
        assert!(world.ty_is_returning(f));

        // Two higher-order arguments: neither a basic block nor returning.
        let g = world.fn_ty(vec![ret, ret]);
        assert!(!world.ty_is_basicblock(g));
        assert!(!world.ty_is_returning(g));
    }

    #[test]
    fn test_specialize_and_infer() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let g0 = world.generic_ty(0);
        let generic_fn = world.fn_ty(vec![g0, g0]);
        let concrete_fn = world.fn_ty(vec![s32, s32]);

        let mut map = HashMap::new();
        assert!(world.infer_with(generic_fn, &mut map, concrete_fn));
        assert_eq!(map.get(&g0), Some(&s32));
        assert_eq!(world.specialize_ty(generic_fn, &map), concrete_fn);

        // Conflicting bindings fail.
        let u32t = world.prim_ty(PrimType::U32);
        let mixed = world.fn_ty(vec![s32, u32t]);
        let mut map = HashMap::new();
        assert!(!world.infer_with(generic_fn, &mut map, mixed));
    }
}
