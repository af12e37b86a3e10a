use clap::Parser;

use tapir_ir::ir::analysis::Scope;
use tapir_ir::ir::opt::{lower_cff_with, CffConfig};
use tapir_ir::ir::{dot, CmpOp, DefId, LambdaAttr, World};
use tapir_ir::types::PrimType;
use tapir_ir::ArithOp;

#[derive(clap::Parser, Debug)]
pub struct CommandArgs {
    #[arg(long = "dot", help = "Dump the entry scope as graphviz after lowering")]
    pub dot: bool,

    #[arg(long = "no-verify", help = "Skip verification after lowering")]
    pub no_verify: bool,

    #[arg(long = "iterations", help = "Iteration budget for the lowering pass")]
    pub iterations: Option<usize>,

    #[arg(long = "width", default_value_t = 100, help = "Printer width")]
    pub width: usize,
}

/// Builds the demo program:
///
/// ```text
/// main() = apply(printk, 3)
/// apply(k, n) = k(n)
/// printk(v) = count(v, print)
/// count(n, ret) = head()  -- counts i upwards from 1 until i >= n, ret(i)
/// ```
fn build_demo(world: &mut World) -> DefId {
    let s32 = world.prim_ty(PrimType::S32);
    let ret_ty = world.fn_ty(vec![s32]);

    let print = world.lambda_sealed(ret_ty, LambdaAttr::Intrinsic, "print");

    // count(n, ret): a counting loop built through the SSA interface; the
    // loop variable only becomes a parameter of `head` during sealing.
    let count_ty = world.fn_ty(vec![s32, ret_ty]);
    let count = world.lambda_sealed(count_ty, LambdaAttr::None, "count");
    let bb = world.fn_ty(vec![]);
    let head = world.lambda(bb, LambdaAttr::None, "head");
    let latch = world.lambda(bb, LambdaAttr::None, "latch");
    let exit = world.lambda(bb, LambdaAttr::None, "exit");

    const I: usize = 0;
    let n = world.param_of(count, 0);
    let ret = world.param_of(count, 1);
    let one = world.literal_s32(1);
    world.set_value(count, I, one);
    world.jump(count, head, &[]);

    let i = world.get_value(head, I, s32, "i");
    let cond = world.cmp(CmpOp::Lt, i, n);
    world.branch(head, cond, latch, exit);
    world.seal(latch);
    world.seal(exit);

    let i_latch = world.get_value(latch, I, s32, "i");
    let inc = world.arith(ArithOp::Add, i_latch, one);
    world.set_value(latch, I, inc);
    world.jump(latch, head, &[]);
    world.seal(head);

    let i_exit = world.get_value(exit, I, s32, "i");
    world.jump(exit, ret, &[i_exit]);

    // printk(v) = count(v, print)
    let printk = world.lambda_sealed(ret_ty, LambdaAttr::None, "printk");
    let v = world.param_of(printk, 0);
    world.jump(printk, count, &[v, print]);

    // apply(k, n) = k(n), called with (printk, 3)
    let apply_ty = world.fn_ty(vec![ret_ty, s32]);
    let apply = world.lambda_sealed(apply_ty, LambdaAttr::None, "apply");
    let k = world.param_of(apply, 0);
    let an = world.param_of(apply, 1);
    world.jump(apply, k, &[an]);

    let main_ty = world.fn_ty(vec![]);
    let main = world.lambda_sealed(main_ty, LambdaAttr::Extern, "main");
    let three = world.literal_s32(3);
    world.jump(main, apply, &[printk, three]);
    main
}

fn main() {
    env_logger::init();
    let args = CommandArgs::parse();

    let mut world = World::new();
    build_demo(&mut world);

    println!("before lowering:");
    println!("{}", world.dump(args.width));

    let config = CffConfig {
        verify_after: !args.no_verify,
        max_iterations: args.iterations,
    };
    if let Err(err) = lower_cff_with(&mut world, config) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }

    println!();
    println!("after lowering:");
    println!("{}", world.dump(args.width));

    if args.dot {
        let scope = Scope::for_world(&world);
        println!();
        println!("{}", dot::dot(&world, &scope));
    }
}
