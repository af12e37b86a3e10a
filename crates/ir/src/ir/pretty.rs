//! Pretty-printer for the definition graph.

use ::pretty::{DocAllocator, DocBuilder, Pretty};

use crate::ir::{DefId, LambdaAttr, NodeKind, World};

pub struct PrettyDef<'a>(pub &'a World, pub DefId);
pub struct PrettyLambda<'a>(pub &'a World, pub DefId);

impl<'a, D, A> Pretty<'a, D, A> for PrettyDef<'a>
where
    D: DocAllocator<'a, A>,
    D::Doc: Clone,
    A: Clone + 'a,
{
    fn pretty(self, allocator: &'a D) -> DocBuilder<'a, D, A> {
        let PrettyDef(world, def) = self;
        let def = world.resolve(def);
        match world.kind(def) {
            NodeKind::Lambda(_) | NodeKind::Param { .. } => {
                allocator.text(world.unique_name(def))
            }
            NodeKind::PrimLit(b) => {
                use crate::types::PrimType::*;
                let text = match world.as_prim_ty(world.ty(def)) {
                    Some(Bool) => format!("{}", b.get_bool()),
                    Some(S32) => format!("{}", b.get_s32()),
                    Some(S64) => format!("{}", b.get_s64()),
                    Some(U32) => format!("{}", b.get_u32()),
                    Some(U64) => format!("{}", b.get_u64()),
                    Some(F32) => format!("{}", b.get_f32()),
                    Some(F64) => format!("{}", b.get_f64()),
                    None => format!("0x{:x}", b.get_u64()),
                };
                allocator.text(text)
            }
            NodeKind::Bottom => allocator.text("bot"),
            NodeKind::Removed => allocator.text("<removed>"),
            kind => {
                let ops = allocator.intersperse(
                    world.ops(def).iter().map(|&op| PrettyDef(world, op).pretty(allocator)),
                    allocator.text(", "),
                );
                allocator.text(kind.name()) + ops.parens()
            }
        }
    }
}

impl<'a, D, A> Pretty<'a, D, A> for PrettyLambda<'a>
where
    D: DocAllocator<'a, A>,
    D::Doc: Clone,
    A: Clone + 'a,
{
    fn pretty(self, allocator: &'a D) -> DocBuilder<'a, D, A> {
        let PrettyLambda(world, lambda) = self;

        let params = allocator.intersperse(
            world.params(lambda).iter().map(|&p| {
                allocator.text(world.unique_name(p))
                    + allocator.text(": ")
                    + allocator.text(world.ty_to_string(world.ty(p)))
            }),
            allocator.text(", "),
        );
        let attr = match world.attr(lambda) {
            LambdaAttr::None => allocator.nil(),
            LambdaAttr::Extern => allocator.text(" extern"),
            LambdaAttr::Intrinsic => allocator.text(" intrinsic"),
        };
        let head = allocator.text(world.unique_name(lambda)) + params.parens() + attr;

        if world.empty(lambda) {
            return head.group();
        }
        let args = allocator.intersperse(
            (0..world.num_args(lambda)).map(|i| {
                match world.arg_opt(lambda, i) {
                    Some(arg) => PrettyDef(world, arg).pretty(allocator),
                    None => allocator.text("_"),
                }
            }),
            allocator.text(", "),
        );
        let jump = PrettyDef(world, world.callee(lambda)).pretty(allocator) + args.parens();
        (head + allocator.text(" = ") + allocator.line() + jump)
            .nest(4)
            .group()
    }
}

impl World {
    pub fn pretty<'a, D, A>(&'a self, allocator: &'a D) -> DocBuilder<'a, D, A>
    where
        D: DocAllocator<'a, A>,
        D::Doc: Clone,
        A: Clone + 'a,
    {
        allocator.intersperse(
            self.lambda_defs()
                .into_iter()
                .map(|l| PrettyLambda(self, l).pretty(allocator)),
            allocator.hardline(),
        )
    }

    /// The whole world rendered at the given width.
    pub fn dump(&self, width: usize) -> String {
        let allocator = ::pretty::BoxAllocator;
        let doc = self.pretty::<_, ()>(&allocator);
        let mut out = Vec::new();
        doc.1.render(width, &mut out).expect("render failed");
        String::from_utf8(out).expect("printer produced invalid utf-8")
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::*;
    use crate::types::PrimType;

    #[test]
    fn test_dump_renders_jump() {
        let mut world = World::new();
        let s32 = world.prim_ty(PrimType::S32);
        let g_ty = world.fn_ty(vec![s32]);
        let f_ty = world.fn_ty(vec![s32]);
        let g = world.lambda_sealed(g_ty, LambdaAttr::Extern, "g");
        let f = world.lambda_sealed(f_ty, LambdaAttr::None, "f");
        let x = world.param_of(f, 0);
        let one = world.literal_s32(1);
        let x1 = world.arith(ArithOp::Add, x, one);
        world.jump(f, g, &[x1]);

        let out = world.dump(80);
        assert!(out.contains("g_0"));
        assert!(out.contains("extern"));
        assert!(out.contains("add("));
        assert!(out.contains("1)"));
    }
}
