use rand::Rng;
use torchlet::device::Device;
use torchlet::shape::{default_strides, element_count, is_contiguous};
use torchlet::{tensor, DType, Error, Tensor, TensorSpec};

fn random_shape(rng: &mut impl Rng) -> Vec<usize> {
    let rank = rng.random_range(0..=4);
    (0..rank).map(|_| rng.random_range(1..=4)).collect()
}

fn iota(shape: &[usize]) -> Tensor {
    let n = element_count(shape);
    Tensor::from_vec((0..n).map(|v| v as f32).collect(), shape).unwrap()
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0, 2.0], [3.0, 4.0]]).unwrap();
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.strides(), &[2, 1]);
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let scalar = tensor!(7).unwrap();
    assert!(scalar.shape().is_empty());
    assert_eq!(scalar.item().unwrap(), 7.0);

    let cube = tensor!([[[1, 2]], [[3, 4]]]).unwrap();
    assert_eq!(cube.shape(), &[2, 1, 2]);
}

#[test]
fn test_parse_tensor() {
    let t = Tensor::parse("[[1.5, -2], [3, 4e-1]]").unwrap();
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.to_vec().unwrap(), vec![1.5, -2.0, 3.0, 0.4]);
    assert!(matches!(
        Tensor::parse("[[1, 2], [3]]"),
        Err(Error::InvalidSpec(_))
    ));
    assert!(Tensor::parse("[1, two]").is_err());
}

#[test]
fn test_default_strided_views_are_contiguous() {
    let mut rng = rand::rng();
    for _ in 0..32 {
        let shape = random_shape(&mut rng);
        let t = Tensor::zeros(&shape).unwrap();
        assert_eq!(t.numel(), shape.iter().product::<usize>());
        assert!(t.is_contiguous());
        assert!(is_contiguous(&shape, &default_strides(&shape)));
    }
}

#[test]
fn test_with_same_shape_reads_back_identically() {
    let mut rng = rand::rng();
    for _ in 0..16 {
        let shape = random_shape(&mut rng);
        let t = iota(&shape);
        let view = t.with_shape(t.shape(), t.strides()).unwrap();
        assert!(view.shares_storage(&t));
        assert_eq!(view.to_vec().unwrap(), t.to_vec().unwrap());
    }
}

#[test]
fn test_with_shape_rejects_other_sizes() {
    let t = iota(&[2, 3]);
    let err = t.with_shape(&[4], &[1]).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn test_with_shape_carries_requires_grad() {
    let t = iota(&[2, 2]);
    t.set_requires_grad(true).unwrap();
    let view = t.with_shape(&[4], &[1]).unwrap();
    assert!(view.requires_grad());
    assert!(view.is_leaf());
}

#[test]
fn test_expand_repeats_rows() {
    let mut rng = rand::rng();
    let (m, n) = (rng.random_range(2..6), rng.random_range(1..6));
    let row = iota(&[1, n]);
    let expanded = row.expand(&[m as isize, n as isize]).unwrap();
    assert_eq!(expanded.shape(), &[m, n]);
    assert!(expanded.shares_storage(&row));
    assert!(!expanded.is_contiguous());

    let values = expanded.to_vec().unwrap();
    let first = &values[..n];
    for r in values.chunks(n) {
        assert_eq!(r, first);
    }

    let copied = expanded.contiguous().unwrap();
    assert!(copied.is_contiguous());
    assert!(!copied.shares_storage(&row));
    assert_eq!(copied.to_vec().unwrap(), values);
}

#[test]
fn test_broadcast_then_add() {
    let m = iota(&[2, 3]);
    let bias = tensor!([10.0, 20.0, 30.0]).unwrap();
    let b = bias.expand(&[2, 3]).unwrap().contiguous().unwrap();
    assert_eq!(
        m.add(&b).unwrap().to_vec().unwrap(),
        vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]
    );
}

#[test]
fn test_transpose_readback_follows_strides() {
    let m = iota(&[2, 3]);
    let t = m.t().unwrap();
    assert_eq!(t.shape(), &[3, 2]);
    assert_eq!(t.strides(), &[1, 3]);
    assert_eq!(t.to_vec().unwrap(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    assert!(iota(&[2, 2, 2]).t().is_err());
}

#[test]
fn test_views_over_shared_storage() {
    let device = Device::cpu();
    let storage = device.upload(&[0u8; 24]).unwrap();
    let a = Tensor::from_spec(TensorSpec::from_storage(storage.clone()).with_shape([2, 3])).unwrap();
    let b = Tensor::from_spec(
        TensorSpec::from_storage(storage)
            .with_shape([3])
            .with_strides([2]),
    )
    .unwrap();
    assert!(a.shares_storage(&b));
    a.add_(&Tensor::ones(&[2, 3]).unwrap()).unwrap();
    assert_eq!(b.to_vec().unwrap(), vec![1.0, 1.0, 1.0]);
}

#[test]
fn test_int32_tensors_truncate() {
    let t = Tensor::from_spec(
        TensorSpec::from_data(tensor!(@data [-1.7, 2.9, 3.0]))
            .with_dtype(DType::Int32),
    )
    .unwrap();
    assert_eq!(t.dtype(), DType::Int32);
    assert_eq!(t.to_vec().unwrap(), vec![-1.0, 2.0, 3.0]);
    assert_eq!(t.abs().unwrap().to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(t.abs().unwrap().dtype(), DType::Int32);
}

#[test]
fn test_spec_shape_must_match_data() {
    let spec = TensorSpec::from_data(tensor!(@data [1.0, 2.0, 3.0, 4.0])).with_shape([2, 2]);
    assert_eq!(Tensor::from_spec(spec).unwrap().shape(), &[2, 2]);
    let bad = TensorSpec::from_data(tensor!(@data [1.0, 2.0, 3.0])).with_shape([2, 2]);
    assert!(matches!(
        Tensor::from_spec(bad),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        Tensor::from_spec(TensorSpec::default()),
        Err(Error::InvalidSpec(_))
    ));
}

#[test]
fn test_factories() {
    assert_eq!(Tensor::zeros(&[3]).unwrap().to_vec().unwrap(), vec![0.0; 3]);
    assert_eq!(Tensor::ones(&[2, 2]).unwrap().to_vec().unwrap(), vec![1.0; 4]);
    assert_eq!(Tensor::full(&[2], -2.5).unwrap().to_vec().unwrap(), vec![-2.5; 2]);
    assert!(Tensor::zeros(&[0, 3]).unwrap().to_vec().unwrap().is_empty());
    assert!(matches!(
        Tensor::from_vec(vec![1.0, 2.0], &[3]),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_display() {
    let t = iota(&[2, 3]);
    assert_eq!(t.to_string(), "tensor([2, 3], float32)");
    t.set_requires_grad(true).unwrap();
    assert_eq!(t.exp().unwrap().to_string(), "tensor([2, 3], float32, grad_fn)");
}
