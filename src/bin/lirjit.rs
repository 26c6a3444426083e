//! lirjit demo driver.
//!
//! Builds a few fragments with the builder API, compiles them, calls the
//! generated code and prints the results together with the context
//! statistics.
//!
//! # Examples
//!
//! ```text
//! lirjit --input 100
//! lirjit --verbose --optimize --input 10
//! RUST_LOG=lirjit=debug lirjit
//! ```

use std::process;

use clap::Parser;
use lirjit::{EntryPoint, FinalizeError, JitContext, ValueKind};

#[derive(Parser)]
#[command(name = "lirjit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, compile and run sample LIR fragments", long_about = None)]
struct Cli {
    /// Trace every LIR instruction and log native listings
    #[arg(short, long)]
    verbose: bool,

    /// Enable CSE and expression simplification
    #[arg(short = 'O', long)]
    optimize: bool,

    /// Argument passed to the sample fragments
    #[arg(short, long, default_value_t = 10)]
    input: i64,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut ctx = JitContext::new(cli.verbose);

    let fragments = [
        ("double_it", build_double_it(&mut ctx, cli.optimize)),
        ("sum_to", build_sum_to(&mut ctx, cli.optimize)),
        ("square_sum", build_square_sum(&mut ctx, cli.optimize)),
    ];
    for (name, result) in &fragments {
        if let Err(e) = result {
            eprintln!("{name}: {e}");
            process::exit(1);
        }
    }

    if cli.verbose {
        for (name, _) in &fragments {
            if let Some(listing) = ctx.fragment_listing(name) {
                println!("fragment {name}:\n{listing}");
            }
        }
    }

    run(&ctx, cli.input);
    print!("{}", ctx.stats());
}

#[cfg(all(unix, target_arch = "x86_64"))]
fn run(ctx: &JitContext, input: i64) {
    let (Some(double_it), Some(sum_to), Some(square_sum)) =
        (ctx.lookup("double_it"), ctx.lookup("sum_to"), ctx.lookup("square_sum"))
    else {
        eprintln!("missing compiled fragment");
        process::exit(1);
    };

    // SAFETY: signatures match how the fragments were built, and ctx is alive.
    unsafe {
        let double_it: extern "C" fn(i64) -> i32 = double_it.cast();
        let sum_to: extern "C" fn(i64) -> i32 = sum_to.cast();
        let square_sum: extern "C" fn(f64, f64) -> f64 = square_sum.cast();
        println!("double_it({input}) = {}", double_it(input));
        println!("sum_to({input}) = {}", sum_to(input));
        println!("square_sum({input}, 0.5) = {}", square_sum(input as f64, 0.5));
    }
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
fn run(_ctx: &JitContext, _input: i64) {
    println!("generated code can only run on unix x86-64 hosts");
}

/// `int double_it(int64 x) { return (int)x * 2; }`
fn build_double_it(ctx: &mut JitContext, optimize: bool) -> Result<EntryPoint, FinalizeError> {
    let mut fb = ctx.create_function_builder("double_it", optimize);
    let x = fb.insert_parameter();
    let x = fb.q2i(x);
    let two = fb.immi(2);
    let result = fb.muli(x, two);
    fb.reti(result);
    fb.finalize()
}

/// `int sum_to(int64 n) { int s = 0; for (int i = 1; i <= n; i++) s += i; return s; }`
fn build_sum_to(ctx: &mut JitContext, optimize: bool) -> Result<EntryPoint, FinalizeError> {
    let mut fb = ctx.create_function_builder("sum_to", optimize);
    let n = fb.insert_parameter();
    let n = fb.q2i(n);
    let vars = fb.alloca(8);
    let zero = fb.immi(0);
    let one = fb.immi(1);
    fb.store_i(zero, vars, 0);
    fb.store_i(one, vars, 4);

    let test = fb.add_label();
    let i = fb.load_i(vars, 4);
    let done = fb.gti(i, n);
    let exit = fb.cbr_true(done, None);

    let sum = fb.load_i(vars, 0);
    let sum = fb.addi(sum, i);
    fb.store_i(sum, vars, 0);
    let next = fb.addi(i, one);
    fb.store_i(next, vars, 4);
    fb.br(Some(test));

    let out = fb.add_label();
    fb.set_jmp_target(exit, out);
    let sum = fb.load_i(vars, 0);
    fb.reti(sum);
    fb.finalize()
}

/// `double square_sum(double a, double b) { return a * a + b * b; }`
fn build_square_sum(ctx: &mut JitContext, optimize: bool) -> Result<EntryPoint, FinalizeError> {
    let mut fb = ctx.create_function_builder("square_sum", optimize);
    let a = fb.parameter(ValueKind::F64);
    let b = fb.parameter(ValueKind::F64);
    let aa = fb.muld(a, a);
    let bb = fb.muld(b, b);
    let result = fb.addd(aa, bb);
    fb.retd(result);
    fb.finalize()
}
