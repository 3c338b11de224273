//! Static operator table.
//!
//! Every elementwise and reduction operator is declared once here with its
//! host math and the WGSL snippets the GPU backend splices into its kernels.
//! The kernel registry and the tensor method surface are both generated from
//! these entries.
//!
//! Snippet vocabulary:
//!
//! - unary: `x` is the input, `g` the output gradient
//! - binary: `x` is the input, `y` the other operand (already scaled by alpha)
//! - reductions: `acc`/`x` in `step`, `lhs`/`rhs` in `combine`, `total`/`n` in
//!   `finish` and `x`/`out`/`g`/`n` in the gradient

use core::f32::consts::{LN_2, LN_10, PI};

/// An elementwise operator of one operand.
pub struct UnaryOp {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub forward: fn(f32) -> f32,
    /// `(x, g) -> dx`
    pub grad: fn(f32, f32) -> f32,
    pub shader: &'static str,
    pub grad_shader: &'static str,
}

/// An elementwise operator of two equally shaped operands.
pub struct BinaryOp {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    /// Whether the tensor surface exposes the `alpha` scale on `other`.
    pub alpha: bool,
    pub forward: fn(f32, f32) -> f32,
    /// `(x, y, g) -> (dx, dy)`
    pub grad: fn(f32, f32, f32) -> (f32, f32),
    pub shader: &'static str,
    pub input_grad_shader: &'static str,
    pub other_grad_shader: &'static str,
}

/// A reduction of a whole tensor to a scalar.
pub struct ReductionOp {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub init: f32,
    pub step: fn(f32, f32) -> f32,
    pub combine: fn(f32, f32) -> f32,
    /// `(total, n) -> out`
    pub finish: fn(f32, f32) -> f32,
    /// `(x, out, g, n) -> dx`; `None` when the reduction is not differentiable.
    pub grad: Option<fn(f32, f32, f32, f32) -> f32>,
    pub shader_init: &'static str,
    pub shader_step: &'static str,
    pub shader_combine: &'static str,
    pub shader_finish: &'static str,
    pub grad_shader: Option<&'static str>,
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn sinc(x: f32) -> f32 {
    if x == 0.0 {
        1.0
    } else {
        let xp = x * PI;
        xp.sin() / xp
    }
}

fn sinc_grad(x: f32, g: f32) -> f32 {
    if x == 0.0 {
        0.0
    } else {
        let xp = x * PI;
        g * PI * (xp * xp.cos() - xp.sin()) / (xp * xp)
    }
}

fn frac(x: f32) -> f32 {
    if x >= 0.0 { x.fract() } else { -(-x).fract() }
}

fn copysign_grad(x: f32, y: f32, g: f32) -> (f32, f32) {
    if x == 0.0 {
        return (0.0, 0.0);
    }
    let dir = match (y >= 0.0, x >= 0.0) {
        (true, true) | (false, false) => 1.0,
        _ => -1.0,
    };
    (g * dir, 0.0)
}

macro_rules! unary_op {
    (
        $id:ident, $name:literal, [$($alias:literal),*],
        |$x:ident| $fwd:expr,
        |$gx:ident, $g:ident| $grad:expr,
        $shader:literal, $grad_shader:literal
    ) => {
        pub static $id: UnaryOp = UnaryOp {
            name: $name,
            aliases: &[$($alias),*],
            forward: |$x: f32| -> f32 { $fwd },
            grad: |$gx: f32, $g: f32| -> f32 { $grad },
            shader: $shader,
            grad_shader: $grad_shader,
        };
    };
}

macro_rules! binary_op {
    (
        $id:ident, $name:literal, [$($alias:literal),*], alpha: $alpha:literal,
        |$x:ident, $y:ident| $fwd:expr,
        |$gx:ident, $gy:ident, $g:ident| $grad:expr,
        $shader:literal, $dx:literal, $dy:literal
    ) => {
        pub static $id: BinaryOp = BinaryOp {
            name: $name,
            aliases: &[$($alias),*],
            alpha: $alpha,
            forward: |$x: f32, $y: f32| -> f32 { $fwd },
            grad: |$gx: f32, $gy: f32, $g: f32| -> (f32, f32) { $grad },
            shader: $shader,
            input_grad_shader: $dx,
            other_grad_shader: $dy,
        };
    };
}

unary_op!(ABS, "abs", ["absolute"], |x| x.abs(), |x, g| g * sign(x), "abs(x)", "g * sign(x)");
unary_op!(ACOS, "acos", ["arccos"], |x| x.acos(), |x, g| -g / (1.0 - x * x).sqrt(),
    "acos(x)", "-g / sqrt(1.0 - x * x)");
unary_op!(ACOSH, "acosh", ["arccosh"], |x| x.acosh(), |x, g| g / (x * x - 1.0).sqrt(),
    "acosh(x)", "g / sqrt(x * x - 1.0)");
unary_op!(ASIN, "asin", ["arcsin"], |x| x.asin(), |x, g| g / (1.0 - x * x).sqrt(),
    "asin(x)", "g / sqrt(1.0 - x * x)");
unary_op!(ASINH, "asinh", ["arcsinh"], |x| x.asinh(), |x, g| g / (x * x + 1.0).sqrt(),
    "asinh(x)", "g / sqrt(x * x + 1.0)");
unary_op!(ATAN, "atan", ["arctan"], |x| x.atan(), |x, g| g / (1.0 + x * x),
    "atan(x)", "g / (1.0 + x * x)");
unary_op!(CEIL, "ceil", [], |x| x.ceil(), |_x, _g| 0.0, "ceil(x)", "0.0");
unary_op!(COS, "cos", [], |x| x.cos(), |x, g| -g * x.sin(), "cos(x)", "-g * sin(x)");
unary_op!(COSH, "cosh", [], |x| x.cosh(), |x, g| g * x.sinh(), "cosh(x)", "g * sinh(x)");
unary_op!(DEG2RAD, "deg2rad", [], |x| x * 0.017_453_292, |_x, g| g * 0.017_453_292,
    "x * 0.017453292519943295", "g * 0.017453292519943295");
unary_op!(EXP, "exp", [], |x| x.exp(), |x, g| g * x.exp(), "exp(x)", "g * exp(x)");
unary_op!(EXP2, "exp2", [], |x| x.exp2(), |x, g| g * x.exp2() * LN_2,
    "exp2(x)", "g * exp2(x) * 0.6931471805599453");
unary_op!(EXPM1, "expm1", [], |x| x.exp_m1(), |x, g| g * x.exp(), "exp(x) - 1.0", "g * exp(x)");
unary_op!(FLOOR, "floor", [], |x| x.floor(), |_x, _g| 0.0, "floor(x)", "0.0");
unary_op!(FRAC, "frac", [], |x| frac(x), |_x, g| g,
    "select(-fract(-x), fract(x), x >= 0.0)", "g");
unary_op!(LOG, "log", [], |x| x.ln(), |x, g| g / x, "log(x)", "g / x");
unary_op!(LOG10, "log10", [], |x| x.log10(), |x, g| g / (x * LN_10),
    "log(x) * 0.4342944819032518", "g / (x * 2.302585092994046)");
unary_op!(LOG1P, "log1p", [], |x| x.ln_1p(), |x, g| g / (x + 1.0), "log(x + 1.0)", "g / (x + 1.0)");
unary_op!(LOG2, "log2", [], |x| x.log2(), |x, g| g / (x * LN_2),
    "log2(x)", "g / (x * 0.6931471805599453)");
unary_op!(NEG, "neg", ["negative"], |x| -x, |_x, g| -g, "-x", "-g");
unary_op!(POSITIVE, "positive", [], |x| x, |_x, g| g, "x", "g");
unary_op!(RAD2DEG, "rad2deg", [], |x| x * 57.295_78, |_x, g| g * 57.295_78,
    "x * 57.29577951308232", "g * 57.29577951308232");
unary_op!(RECIPROCAL, "reciprocal", [], |x| 1.0 / x, |x, g| -g / (x * x), "1.0 / x", "-g / (x * x)");
unary_op!(RELU, "relu", [], |x| x.max(0.0), |x, g| if x > 0.0 { g } else { 0.0 },
    "max(x, 0.0)", "select(0.0, g, x > 0.0)");
unary_op!(ROUND, "round", [], |x| x.round_ties_even(), |_x, _g| 0.0, "round(x)", "0.0");
unary_op!(RSQRT, "rsqrt", [], |x| 1.0 / x.sqrt(), |x, g| -g / (2.0 * x.sqrt() * x),
    "inverseSqrt(x)", "-g / (2.0 * sqrt(x) * x)");
unary_op!(SIGMOID, "sigmoid", [], |x| sigmoid(x), |x, g| {
        let s = sigmoid(x);
        g * s * (1.0 - s)
    },
    "1.0 / (1.0 + exp(-x))",
    "g * (1.0 / (1.0 + exp(-x))) * (1.0 - 1.0 / (1.0 + exp(-x)))");
unary_op!(SIGN, "sign", [], |x| sign(x), |_x, _g| 0.0, "sign(x)", "0.0");
unary_op!(SILU, "silu", [], |x| x * sigmoid(x), |x, g| {
        let s = sigmoid(x);
        g * (s + x * s * (1.0 - s))
    },
    "x / (1.0 + exp(-x))",
    "g * (1.0 / (1.0 + exp(-x)) + x * (1.0 / (1.0 + exp(-x))) * (1.0 - 1.0 / (1.0 + exp(-x))))");
unary_op!(SIN, "sin", [], |x| x.sin(), |x, g| g * x.cos(), "sin(x)", "g * cos(x)");
unary_op!(SINC, "sinc", [], |x| sinc(x), |x, g| sinc_grad(x, g),
    "select(sin(x * 3.141592653589793) / (x * 3.141592653589793), 1.0, x == 0.0)",
    "select(g * 3.141592653589793 * (x * 3.141592653589793 * cos(x * 3.141592653589793) - sin(x * 3.141592653589793)) / (x * 3.141592653589793 * x * 3.141592653589793), 0.0, x == 0.0)");
unary_op!(SINH, "sinh", [], |x| x.sinh(), |x, g| g * x.cosh(), "sinh(x)", "g * cosh(x)");
unary_op!(SQRT, "sqrt", [], |x| x.sqrt(), |x, g| g / (2.0 * x.sqrt()), "sqrt(x)", "g / (2.0 * sqrt(x))");
unary_op!(SQUARE, "square", [], |x| x * x, |x, g| 2.0 * g * x, "x * x", "2.0 * g * x");
unary_op!(TAN, "tan", [], |x| x.tan(), |x, g| g / (x.cos() * x.cos()), "tan(x)", "g / (cos(x) * cos(x))");
unary_op!(TANH, "tanh", [], |x| x.tanh(), |x, g| {
        let t = x.tanh();
        g * (1.0 - t * t)
    },
    "tanh(x)", "g * (1.0 - tanh(x) * tanh(x))");
unary_op!(TRUNC, "trunc", ["fix"], |x| x.trunc(), |_x, _g| 0.0, "trunc(x)", "0.0");

binary_op!(ADD, "add", [], alpha: true, |x, y| x + y, |_x, _y, g| (g, g), "x + y", "g", "g");
binary_op!(SUB, "sub", ["subtract"], alpha: true, |x, y| x - y, |_x, _y, g| (g, -g),
    "x - y", "g", "-g");
binary_op!(MUL, "mul", ["multiply"], alpha: true, |x, y| x * y, |x, y, g| (g * y, g * x),
    "x * y", "g * y", "g * x");
binary_op!(DIV, "div", ["divide"], alpha: true, |x, y| x / y, |x, y, g| (g / y, -g * x / (y * y)),
    "x / y", "g / y", "-g * x / (y * y)");
binary_op!(POW, "pow", [], alpha: false, |x, y| x.powf(y),
    |x, y, g| (g * y * x.powf(y - 1.0), g * x.powf(y) * x.ln()),
    "pow(x, y)", "g * y * pow(x, y - 1.0)", "g * pow(x, y) * log(x)");
binary_op!(ATAN2, "atan2", ["arctan2"], alpha: false, |x, y| x.atan2(y),
    |x, y, g| (g * y / (x * x + y * y), -g * x / (x * x + y * y)),
    "atan2(x, y)", "g * y / (x * x + y * y)", "-g * x / (x * x + y * y)");
binary_op!(COPYSIGN, "copysign", [], alpha: false,
    |x, y| if y >= 0.0 { x.abs() } else { -x.abs() },
    |x, y, g| copysign_grad(x, y, g),
    "select(-abs(x), abs(x), y >= 0.0)",
    "select(g * select(select(1.0, -1.0, x >= 0.0), select(-1.0, 1.0, x >= 0.0), y >= 0.0), 0.0, x == 0.0)",
    "0.0");
binary_op!(HYPOT, "hypot", [], alpha: false, |x, y| x.hypot(y), |x, y, g| {
        let h = x.hypot(y);
        (g * x / h, g * y / h)
    },
    "sqrt(x * x + y * y)", "g * x / sqrt(x * x + y * y)", "g * y / sqrt(x * x + y * y)");
binary_op!(LDEXP, "ldexp", [], alpha: false, |x, y| x * y.exp2(),
    |x, y, g| (g * y.exp2(), g * x * y.exp2() * LN_2),
    "x * exp2(y)", "g * exp2(y)", "g * x * exp2(y) * 0.6931471805599453");
binary_op!(LOGADDEXP, "logaddexp", [], alpha: false, |x, y| (x.exp() + y.exp()).ln(), |x, y, g| {
        let (ex, ey) = (x.exp(), y.exp());
        (g * ex / (ex + ey), g * ey / (ex + ey))
    },
    "log(exp(x) + exp(y))", "g * exp(x) / (exp(x) + exp(y))", "g * exp(y) / (exp(x) + exp(y))");
binary_op!(LOGADDEXP2, "logaddexp2", [], alpha: false, |x, y| (x.exp2() + y.exp2()).log2(),
    |x, y, g| {
        let (ex, ey) = (x.exp2(), y.exp2());
        (g * ex / (ex + ey), g * ey / (ex + ey))
    },
    "log2(exp2(x) + exp2(y))",
    "g * exp2(x) / (exp2(x) + exp2(y))",
    "g * exp2(y) / (exp2(x) + exp2(y))");
binary_op!(XLOGY, "xlogy", [], alpha: false, |x, y| if x == 0.0 { 0.0 } else { x * y.ln() },
    |x, y, g| if x == 0.0 { (0.0, 0.0) } else { (g * y.ln(), g * x / y) },
    "select(x * log(y), 0.0, x == 0.0)",
    "select(g * log(y), 0.0, x == 0.0)",
    "select(g * x / y, 0.0, x == 0.0)");

pub static SUM: ReductionOp = ReductionOp {
    name: "sum",
    aliases: &[],
    init: 0.0,
    step: |acc, x| acc + x,
    combine: |lhs, rhs| lhs + rhs,
    finish: |total, _n| total,
    grad: Some(|_x, _out, g, _n| g),
    shader_init: "0.0",
    shader_step: "acc + x",
    shader_combine: "lhs + rhs",
    shader_finish: "total",
    grad_shader: Some("g"),
};

pub static MEAN: ReductionOp = ReductionOp {
    name: "mean",
    aliases: &[],
    init: 0.0,
    step: |acc, x| acc + x,
    combine: |lhs, rhs| lhs + rhs,
    finish: |total, n| total / n,
    grad: Some(|_x, _out, g, n| g / n),
    shader_init: "0.0",
    shader_step: "acc + x",
    shader_combine: "lhs + rhs",
    shader_finish: "total / n",
    grad_shader: Some("g / n"),
};

pub static PROD: ReductionOp = ReductionOp {
    name: "prod",
    aliases: &[],
    init: 1.0,
    step: |acc, x| acc * x,
    combine: |lhs, rhs| lhs * rhs,
    finish: |total, _n| total,
    grad: Some(|x, out, g, _n| g * out / x),
    shader_init: "1.0",
    shader_step: "acc * x",
    shader_combine: "lhs * rhs",
    shader_finish: "total",
    grad_shader: Some("g * out / x"),
};

pub static NORM: ReductionOp = ReductionOp {
    name: "norm",
    aliases: &[],
    init: 0.0,
    step: |acc, x| acc + x * x,
    combine: |lhs, rhs| lhs + rhs,
    finish: |total, _n| total.sqrt(),
    grad: Some(|x, out, g, _n| g * x / out),
    shader_init: "0.0",
    shader_step: "acc + x * x",
    shader_combine: "lhs + rhs",
    shader_finish: "sqrt(total)",
    grad_shader: Some("g * x / out"),
};

pub static ALL: ReductionOp = ReductionOp {
    name: "all",
    aliases: &[],
    init: 1.0,
    step: |acc, x| if x != 0.0 { acc } else { 0.0 },
    combine: |lhs, rhs| lhs * rhs,
    finish: |total, _n| total,
    grad: Some(|_x, out, g, _n| if out != 0.0 { g } else { 0.0 }),
    shader_init: "1.0",
    shader_step: "select(0.0, acc, x != 0.0)",
    shader_combine: "lhs * rhs",
    shader_finish: "total",
    grad_shader: Some("select(0.0, g, out != 0.0)"),
};

pub static ANY: ReductionOp = ReductionOp {
    name: "any",
    aliases: &[],
    init: 0.0,
    step: |acc, x| if x != 0.0 { 1.0 } else { acc },
    combine: f32::max,
    finish: |total, _n| total,
    grad: Some(|_x, out, g, _n| if out != 0.0 { g } else { 0.0 }),
    shader_init: "0.0",
    shader_step: "select(acc, 1.0, x != 0.0)",
    shader_combine: "max(lhs, rhs)",
    shader_finish: "total",
    grad_shader: Some("select(0.0, g, out != 0.0)"),
};

pub static COUNT_NONZERO: ReductionOp = ReductionOp {
    name: "count_nonzero",
    aliases: &[],
    init: 0.0,
    step: |acc, x| if x != 0.0 { acc + 1.0 } else { acc },
    combine: |lhs, rhs| lhs + rhs,
    finish: |total, _n| total,
    grad: None,
    shader_init: "0.0",
    shader_step: "select(acc, acc + 1.0, x != 0.0)",
    shader_combine: "lhs + rhs",
    shader_finish: "total",
    grad_shader: None,
};

pub static UNARY_OPS: &[&UnaryOp] = &[
    &ABS, &ACOS, &ACOSH, &ASIN, &ASINH, &ATAN, &CEIL, &COS, &COSH, &DEG2RAD, &EXP, &EXP2, &EXPM1,
    &FLOOR, &FRAC, &LOG, &LOG10, &LOG1P, &LOG2, &NEG, &POSITIVE, &RAD2DEG, &RECIPROCAL, &RELU,
    &ROUND, &RSQRT, &SIGMOID, &SIGN, &SILU, &SIN, &SINC, &SINH, &SQRT, &SQUARE, &TAN, &TANH,
    &TRUNC,
];

pub static BINARY_OPS: &[&BinaryOp] = &[
    &ADD, &SUB, &MUL, &DIV, &POW, &ATAN2, &COPYSIGN, &HYPOT, &LDEXP, &LOGADDEXP, &LOGADDEXP2,
    &XLOGY,
];

pub static REDUCTION_OPS: &[&ReductionOp] =
    &[&SUM, &MEAN, &PROD, &NORM, &ALL, &ANY, &COUNT_NONZERO];

/// Finds a unary operator by name or alias.
pub fn unary_op(name: &str) -> Option<&'static UnaryOp> {
    UNARY_OPS
        .iter()
        .copied()
        .find(|op| op.name == name || op.aliases.contains(&name))
}

/// Finds a binary operator by name or alias.
pub fn binary_op(name: &str) -> Option<&'static BinaryOp> {
    BINARY_OPS
        .iter()
        .copied()
        .find(|op| op.name == name || op.aliases.contains(&name))
}

pub fn reduction_op(name: &str) -> Option<&'static ReductionOp> {
    REDUCTION_OPS
        .iter()
        .copied()
        .find(|op| op.name == name || op.aliases.contains(&name))
}
