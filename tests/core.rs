use rand::Rng;
use torchlet::approx::approx_eq;
use torchlet::ops::table::{self, BinaryOp, UnaryOp};
use torchlet::{tensor, Error, Tensor};

fn tracked(values: &[f32]) -> Tensor {
    let t = Tensor::from_vec(values.to_vec(), &[values.len()]).unwrap();
    t.set_requires_grad(true).unwrap();
    t
}

fn grad_of(t: &Tensor) -> Vec<f32> {
    t.grad().expect("gradient was not populated").to_vec().unwrap()
}

#[test]
fn test_polynomial_backward() {
    let a = tracked(&[1.0, 2.0, 3.0]);
    let b = a.sub(&a.mul(&a).unwrap()).unwrap();
    b.sum().unwrap().backward(None).unwrap();
    assert_eq!(grad_of(&a), vec![-1.0, -3.0, -5.0]);
}

#[test]
fn test_sigmoid_backward() {
    let x = tensor!([2.0]).unwrap();
    x.set_requires_grad(true).unwrap();
    x.sigmoid().unwrap().backward(None).unwrap();
    assert!(approx_eq(&grad_of(&x)[0], &0.104_993_6));
}

#[test]
fn test_diamond_graph_accumulates() {
    let a = tracked(&[3.0]);
    let r = a.mul(&a).unwrap().add(&a.add(&a).unwrap()).unwrap();
    assert_eq!(r.item().unwrap(), 15.0);
    r.backward(None).unwrap();
    assert_eq!(grad_of(&a), vec![8.0]);
}

#[test]
fn test_untracked_operands_get_no_gradient() {
    let a = tracked(&[1.0, 2.0]);
    let c = Tensor::from_vec(vec![5.0, 7.0], &[2]).unwrap();
    let y = a.mul(&c).unwrap();
    y.sum().unwrap().backward(None).unwrap();
    assert_eq!(grad_of(&a), vec![5.0, 7.0]);
    assert!(c.grad().is_none());
}

#[test]
fn test_explicit_gradient_seed() {
    let a = tracked(&[1.0, 2.0]);
    let y = a.square().unwrap();
    let seed = Tensor::from_vec(vec![10.0, 100.0], &[2]).unwrap();
    y.backward(Some(&seed)).unwrap();
    assert_eq!(grad_of(&a), vec![20.0, 400.0]);
}

#[test]
fn test_implicit_seed_rejects_vectors() {
    let a = tracked(&[1.0, 2.0]);
    let err = a.exp().unwrap().backward(None).unwrap_err();
    assert!(matches!(err, Error::ImplicitGradRankError(_)));
}

#[test]
fn test_misshaped_gradient_is_rejected() {
    let a = tracked(&[1.0, 2.0, 3.0]);
    let err = a.backward(Some(&Tensor::ones(&[5]).unwrap())).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert!(a.grad().is_none());

    let y = a.square().unwrap();
    y.backward(Some(&Tensor::ones(&[3]).unwrap())).unwrap();
    assert_eq!(grad_of(&a), vec![2.0, 4.0, 6.0]);

    assert!(y.backward(Some(&Tensor::ones(&[2]).unwrap())).is_err());
    assert_eq!(y.grad().unwrap().shape(), &[3]);
    assert_eq!(grad_of(&y), vec![1.0, 1.0, 1.0]);
    assert_eq!(grad_of(&a), vec![2.0, 4.0, 6.0]);
}

#[test]
fn test_interior_flag_is_immutable() {
    let a = tracked(&[1.0]);
    let y = a.exp().unwrap();
    assert!(matches!(y.set_requires_grad(false), Err(Error::ImmutableGradFlag)));
    let leaf = y.detach();
    leaf.set_requires_grad(false).unwrap();
    assert!(leaf.is_leaf());
}

#[test]
fn test_inplace_on_tracked_tensor_conflicts() {
    let a = tracked(&[1.0, 2.0]);
    assert!(matches!(a.neg_(), Err(Error::GradientConflict)));
    assert!(matches!(
        a.add_(&Tensor::ones(&[2]).unwrap()),
        Err(Error::GradientConflict)
    ));
    assert_eq!(a.to_vec().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_inplace_mutation_is_visible_through_views() {
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let flat = a.with_shape(&[4], &[1]).unwrap();
    a.add_with_alpha_(&Tensor::ones(&[2, 2]).unwrap(), 10.0).unwrap();
    assert_eq!(flat.to_vec().unwrap(), vec![11.0, 12.0, 13.0, 14.0]);
}

#[test]
fn test_mean_and_norm_gradients() {
    let a = tracked(&[3.0, 4.0]);
    a.norm().unwrap().backward(None).unwrap();
    assert!(approx_eq(&grad_of(&a), &vec![0.6_f32, 0.8]));

    let b = tracked(&[1.0, 2.0, 3.0, 4.0]);
    b.mean().unwrap().backward(None).unwrap();
    assert_eq!(grad_of(&b), vec![0.25; 4]);
}

fn close(analytic: f32, numeric: f32) -> bool {
    (analytic - numeric).abs() <= 1e-2 * numeric.abs().max(1.0)
}

#[test]
fn test_unary_gradients_match_finite_differences() {
    let smooth: [&UnaryOp; 24] = [
        &table::ACOS,
        &table::ASIN,
        &table::ASINH,
        &table::ATAN,
        &table::COS,
        &table::COSH,
        &table::EXP,
        &table::EXP2,
        &table::EXPM1,
        &table::LOG,
        &table::LOG10,
        &table::LOG1P,
        &table::LOG2,
        &table::NEG,
        &table::RECIPROCAL,
        &table::RSQRT,
        &table::SIGMOID,
        &table::SILU,
        &table::SIN,
        &table::SINC,
        &table::SINH,
        &table::SQRT,
        &table::TAN,
        &table::TANH,
    ];
    let mut rng = rand::rng();
    let values: Vec<f32> = (0..8).map(|_| rng.random_range(0.2..0.8)).collect();
    let h = 1e-3;

    for op in smooth {
        let x = tracked(&values);
        x.unary(op).unwrap().sum().unwrap().backward(None).unwrap();
        for (v, g) in values.iter().zip(grad_of(&x)) {
            let numeric = ((op.forward)(v + h) - (op.forward)(v - h)) / (2.0 * h);
            assert!(close(g, numeric), "{} at {v}: {g} vs {numeric}", op.name);
        }
    }
}

#[test]
fn test_binary_gradients_match_finite_differences() {
    let smooth: [&BinaryOp; 10] = [
        &table::ADD,
        &table::SUB,
        &table::MUL,
        &table::DIV,
        &table::POW,
        &table::ATAN2,
        &table::HYPOT,
        &table::LDEXP,
        &table::LOGADDEXP,
        &table::XLOGY,
    ];
    let mut rng = rand::rng();
    let xs: Vec<f32> = (0..6).map(|_| rng.random_range(0.5..1.5)).collect();
    let ys: Vec<f32> = (0..6).map(|_| rng.random_range(0.5..1.5)).collect();
    let h = 1e-3;

    for op in smooth {
        let (x, y) = (tracked(&xs), tracked(&ys));
        x.binary(op, &y, 1.0)
            .unwrap()
            .sum()
            .unwrap()
            .backward(None)
            .unwrap();
        let (dx, dy) = (grad_of(&x), grad_of(&y));
        for i in 0..xs.len() {
            let (a, b) = (xs[i], ys[i]);
            let nx = ((op.forward)(a + h, b) - (op.forward)(a - h, b)) / (2.0 * h);
            let ny = ((op.forward)(a, b + h) - (op.forward)(a, b - h)) / (2.0 * h);
            assert!(close(dx[i], nx), "d{}/dx at ({a}, {b})", op.name);
            assert!(close(dy[i], ny), "d{}/dy at ({a}, {b})", op.name);
        }
    }
}

#[test]
fn test_training_step_reduces_loss() {
    // one linear layer fitted to y = 2x with plain gradient descent
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[4, 1]).unwrap();
    let target = Tensor::from_vec(vec![2.0, 4.0, 6.0, 8.0], &[4, 1]).unwrap();
    let w = Tensor::from_vec(vec![0.5], &[1, 1]).unwrap();

    let loss_at = |w: &Tensor| -> f32 {
        w.set_requires_grad(true).unwrap();
        let pred = torchlet::linear(&x, w, None).unwrap();
        let loss = pred.sub(&target).unwrap().square().unwrap().mean().unwrap();
        loss.backward(None).unwrap();
        loss.item().unwrap()
    };

    let mut losses = Vec::new();
    for _ in 0..5 {
        losses.push(loss_at(&w));
        let grad = w.grad().unwrap();
        w.zero_grad();
        w.set_requires_grad(false).unwrap();
        w.sub_with_alpha_(&grad, 0.05).unwrap();
    }
    assert!(losses.windows(2).all(|pair| pair[1] < pair[0]), "{losses:?}");
}
