use cotangent::autodiff::{differentiate, jacobian};
use cotangent::dtype::DType;
use cotangent::error::Error;
use cotangent::expr::{Expr, ExprKind, Var};
use cotangent::reduction::{sum, Combiner, IterVar, Range};
use cotangent::tensor::{compute, placeholder, Tensor};
use cotangent::transform::subtensors;

fn dims(extents: &[i32]) -> Vec<Expr> {
    extents.iter().map(|e| Expr::from(*e)).collect()
}

fn body(t: &Tensor) -> &Expr {
    &t.op().as_compute().unwrap().body[t.value_index()]
}

/// O[i] = exp(I[i])
fn exp_graph() -> (Tensor, Tensor) {
    let input = placeholder(dims(&[4]), DType::f32(), "I");
    let reader = input.clone();
    let output = compute(
        dims(&[4]),
        move |idx| Expr::exp(reader.call(vec![idx[0].clone()])),
        "O",
        "",
    );
    (output, input)
}

#[test]
fn test_elementwise_exp() {
    let (output, input) = exp_graph();
    let res = differentiate(&output, &[input.clone()], None, None).unwrap();

    let adjoint = &res.result[0];
    assert_eq!(adjoint.shape(), dims(&[4, 4]).as_slice());
    assert_eq!(adjoint.name(), "O.I.grad");
    // The masked sum over the Jacobian collapses to a direct product with
    // the head; the delta mask pinned the reduction axis.
    assert_eq!(
        body(adjoint).to_string(),
        "(identity(ax0, ax1)*exp(I(ax1)))"
    );

    // The head is the adjoint of the output by definition.
    assert_eq!(res.adjoints[&output].name(), "identity");
    // A single consumer: the adjoint is its only summand.
    assert_eq!(res.adjoint_summands[&input][&output], res.adjoints[&input]);
}

/// O[i,j] = sum_k A[i,k]*B[k,j]
fn matmul_graph() -> (Tensor, Tensor, Tensor) {
    let a = placeholder(dims(&[2, 3]), DType::f32(), "A");
    let b = placeholder(dims(&[3, 4]), DType::f32(), "B");
    let (ar, br) = (a.clone(), b.clone());
    let output = compute(
        dims(&[2, 4]),
        move |idx| {
            let k = IterVar::reduce(
                Var::new("k", DType::i32()),
                Range::from_extent(Expr::from(3i32)),
            );
            let kv = Expr::var(k.var.clone());
            sum(
                Expr::mul(
                    ar.call(vec![idx[0].clone(), kv.clone()]),
                    br.call(vec![kv, idx[1].clone()]),
                ),
                vec![k],
            )
        },
        "O",
        "",
    );
    (output, a, b)
}

#[test]
fn test_matmul_gradient() {
    let (output, a, _b) = matmul_graph();
    let res = differentiate(&output, &[a.clone()], None, None).unwrap();

    let adjoint = &res.result[0];
    // head.shape[..2] ++ A.shape
    assert_eq!(adjoint.shape(), dims(&[2, 4, 2, 3]).as_slice());

    // One contraction axis survives: the Jacobian's delta pinned the
    // other one to a data axis.
    let ExprKind::Reduce { axis, source, .. } = body(adjoint).kind() else {
        panic!("expected a reduce, got {}", body(adjoint));
    };
    assert_eq!(axis.len(), 1);
    assert_eq!(
        source[0].to_string(),
        "(identity(ax0, ax1, ax2, k1)*B(ax3, k1))"
    );
}

/// O = sum_k I[k]^2, scalar output.
fn sum_of_squares_graph() -> (Tensor, Tensor) {
    let input = placeholder(dims(&[5]), DType::f32(), "I");
    let reader = input.clone();
    let output = compute(
        vec![],
        move |_| {
            let k = IterVar::reduce(
                Var::new("k", DType::i32()),
                Range::from_extent(Expr::from(5i32)),
            );
            let kv = Expr::var(k.var.clone());
            sum(
                Expr::mul(reader.call(vec![kv.clone()]), reader.call(vec![kv])),
                vec![k],
            )
        },
        "O",
        "",
    );
    (output, input)
}

#[test]
fn test_sum_of_squares() {
    let (output, input) = sum_of_squares_graph();
    let res = differentiate(&output, &[input.clone()], None, None).unwrap();

    let adjoint = &res.result[0];
    assert_eq!(adjoint.shape(), dims(&[5]).as_slice());
    // d/dI[j] sum I[k]^2 = 2*I[j], emitted as I[j] + I[j] times the
    // (scalar) head.
    assert_eq!(
        body(adjoint).to_string(),
        "(identity()*(I(ax0) + I(ax0)))"
    );
}

/// O[i] = max(I1[i], I2[i])
#[test]
fn test_elementwise_max() {
    let i1 = placeholder(dims(&[3]), DType::f32(), "I1");
    let i2 = placeholder(dims(&[3]), DType::f32(), "I2");
    let (r1, r2) = (i1.clone(), i2.clone());
    let output = compute(
        dims(&[3]),
        move |idx| {
            Expr::max(
                r1.call(vec![idx[0].clone()]),
                r2.call(vec![idx[0].clone()]),
            )
        },
        "O",
        "",
    );
    let res = differentiate(&output, &[i1.clone(), i2.clone()], None, None).unwrap();

    // Gradient flows to I1 where I1 >= I2, to I2 on the strict complement.
    assert_eq!(
        body(&res.result[0]).to_string(),
        "select((I1(ax1) >= I2(ax1)), identity(ax0, ax1), 0f)"
    );
    assert_eq!(
        body(&res.result[1]).to_string(),
        "select(!(I1(ax1) >= I2(ax1)), identity(ax0, ax1), 0f)"
    );
}

/// Reduction with a hand-written sum combiner over I[k]*I[k].
#[test]
fn test_custom_combiner_reduction() {
    let input = placeholder(dims(&[5]), DType::f32(), "I");
    let reader = input.clone();
    let output = compute(
        vec![],
        move |_| {
            let a = Var::new("a", DType::f32());
            let b = Var::new("b", DType::f32());
            let combiner = Combiner::new(
                vec![a.clone()],
                vec![b.clone()],
                vec![Expr::add(Expr::var(a), Expr::var(b))],
                vec![Expr::make_zero(DType::f32())],
            );
            let k = IterVar::reduce(
                Var::new("k", DType::i32()),
                Range::from_extent(Expr::from(5i32)),
            );
            let kv = Expr::var(k.var.clone());
            Expr::reduce(
                combiner,
                vec![Expr::mul(reader.call(vec![kv.clone()]), reader.call(vec![kv]))],
                vec![k],
                Expr::const_true(),
                0,
            )
        },
        "O",
        "",
    );
    let res = differentiate(&output, &[input.clone()], None, None).unwrap();
    // Same gradient as the stock sum: the paired combiner collapsed back
    // to an ordinary sum before the delta pinned the axis away.
    assert_eq!(
        body(&res.result[0]).to_string(),
        "(identity()*(I(ax0) + I(ax0)))"
    );
}

/// An input the output never reads gets a zero adjoint, not an absence.
#[test]
fn test_unreachable_input_gets_zero_adjoint() {
    let (output, _input) = exp_graph();
    let unrelated = placeholder(dims(&[3]), DType::f32(), "B");
    let res = differentiate(&output, &[unrelated.clone()], None, None).unwrap();

    let adjoint = &res.result[0];
    assert_eq!(adjoint.shape(), dims(&[4, 3]).as_slice());
    assert_eq!(adjoint.dtype(), output.dtype());
    assert!(body(adjoint).is_const_zero());
    assert!(res.adjoint_summands[&unrelated].is_empty());
}

/// With the identity graph O = I, the adjoint of I is the identity head.
#[test]
fn test_identity_graph() {
    let input = placeholder(dims(&[4]), DType::f32(), "I");
    let reader = input.clone();
    let output = compute(
        dims(&[4]),
        move |idx| reader.call(vec![idx[0].clone()]),
        "O",
        "",
    );
    let res = differentiate(&output, &[input], None, None).unwrap();
    let adjoint = &res.result[0];
    assert_eq!(adjoint.shape(), dims(&[4, 4]).as_slice());
    // The tail call to the head was inlined; what is left is the identity
    // tensor's own body.
    assert_eq!(body(adjoint).to_string(), "float32((ax0 == ax1))");
}

/// Chain rule: O = exp(tanh(I)), elementwise.
#[test]
fn test_chain_rule_composition() {
    let input = placeholder(dims(&[4]), DType::f32(), "I");
    let reader = input.clone();
    let mid = compute(
        dims(&[4]),
        move |idx| Expr::tanh(reader.call(vec![idx[0].clone()])),
        "G",
        "",
    );
    let mid_reader = mid.clone();
    let output = compute(
        dims(&[4]),
        move |idx| Expr::exp(mid_reader.call(vec![idx[0].clone()])),
        "O",
        "",
    );
    let res = differentiate(&output, &[input.clone()], None, None).unwrap();

    // The adjoint of I reads the adjoint of the intermediate tensor: the
    // chain is composed edge by edge, not flattened.
    let adjoint = &res.result[0];
    assert_eq!(adjoint.name(), "G.I.grad");
    let reads = subtensors(body(adjoint));
    assert!(reads[0].same_as(&res.adjoints[&mid]));
    assert_eq!(res.adjoints[&mid].name(), "O.G.grad");
    // The local factor d tanh = 1 - tanh^2 appears in the body.
    assert!(body(adjoint)
        .to_string()
        .contains("(1f - (tanh(I(ax1))*tanh(I(ax1))))"));
}

/// A diamond: O[i] = exp(I[i]) + tanh(I[i]) through two intermediates.
/// The two contributions are summed in reverse-dependency discovery
/// order, as a left fold.
#[test]
fn test_diamond_accumulates_in_discovery_order() {
    let input = placeholder(dims(&[4]), DType::f32(), "I");
    let r1 = input.clone();
    let g1 = compute(
        dims(&[4]),
        move |idx| Expr::exp(r1.call(vec![idx[0].clone()])),
        "G1",
        "",
    );
    let r2 = input.clone();
    let g2 = compute(
        dims(&[4]),
        move |idx| Expr::tanh(r2.call(vec![idx[0].clone()])),
        "G2",
        "",
    );
    let (g1r, g2r) = (g1.clone(), g2.clone());
    let output = compute(
        dims(&[4]),
        move |idx| {
            Expr::add(
                g1r.call(vec![idx[0].clone()]),
                g2r.call(vec![idx[0].clone()]),
            )
        },
        "O",
        "",
    );
    let res = differentiate(&output, &[input.clone()], None, None).unwrap();

    let adjoint = &res.result[0];
    assert_eq!(adjoint.name(), "add");
    let summands = &res.adjoint_summands[&input];
    assert_eq!(summands.len(), 2);

    // The DFS stack pops G2 before G1, so G2's contribution is the left
    // operand of the fold.
    let reads = subtensors(body(adjoint));
    assert_eq!(reads.len(), 2);
    assert!(reads[0].same_as(&summands[&g2]));
    assert!(reads[1].same_as(&summands[&g1]));
}

#[test]
fn test_empty_inputs_populates_all_adjoints() {
    let (output, input) = exp_graph();
    let res = differentiate(&output, &[], None, None).unwrap();
    assert!(res.result.is_empty());
    assert!(res.adjoints.contains_key(&input));
    assert!(res.adjoints.contains_key(&output));
}

#[test]
fn test_custom_head_shapes_adjoints() {
    let (output, input) = exp_graph();
    let head = placeholder(dims(&[7, 4]), DType::f32(), "H");
    let res = differentiate(&output, &[input], Some(head), None).unwrap();
    assert_eq!(res.result[0].shape(), dims(&[7, 4]).as_slice());
}

#[test]
fn test_head_shape_is_validated() {
    let (output, input) = exp_graph();
    // Last axis does not match the output's shape.
    let head = placeholder(dims(&[7, 3]), DType::f32(), "H");
    assert!(matches!(
        differentiate(&output, &[input.clone()], Some(head), None),
        Err(Error::RankMismatch { .. })
    ));
    // Rank below the output's rank.
    let head = placeholder(vec![], DType::f32(), "H");
    assert!(matches!(
        differentiate(&output, &[input], Some(head), None),
        Err(Error::RankMismatch { .. })
    ));
}

#[test]
fn test_custom_fdiff_is_used() {
    let (output, input) = exp_graph();
    let fdiff = |consumer: &Tensor, producer: &Tensor, head: &Tensor| -> cotangent::Result<Tensor> {
        let mut shape: Vec<Expr> = head.shape()[..head.ndim() - consumer.ndim()].to_vec();
        shape.extend(producer.shape().iter().cloned());
        Ok(cotangent::tensor::full(shape, producer.dtype(), 0.0))
    };
    let res = differentiate(&output, &[input], None, Some(&fdiff)).unwrap();
    assert!(body(&res.result[0]).is_const_zero());
}

#[test]
fn test_misshapen_fdiff_output_fails_fast() {
    let (output, input) = exp_graph();
    let fdiff = |_: &Tensor, producer: &Tensor, _: &Tensor| -> cotangent::Result<Tensor> {
        Ok(cotangent::tensor::full(
            vec![Expr::from(1i32)],
            producer.dtype(),
            0.0,
        ))
    };
    assert!(matches!(
        differentiate(&output, &[input], None, Some(&fdiff)),
        Err(Error::RankMismatch { .. })
    ));
}

#[test]
fn test_determinism() {
    let render = |res: &cotangent::DifferentiationResult| {
        let t = &res.result[0];
        format!("{} := {}", t.name(), body(t))
    };
    let (o1, i1) = matmul_graph_for_determinism();
    let (o2, i2) = matmul_graph_for_determinism();
    let r1 = differentiate(&o1, &[i1], None, None).unwrap();
    let r2 = differentiate(&o2, &[i2], None, None).unwrap();
    assert_eq!(render(&r1), render(&r2));
}

fn matmul_graph_for_determinism() -> (Tensor, Tensor) {
    let (output, a, _) = matmul_graph();
    (output, a)
}

/// Differentiating the adjoint again, now with respect to the head,
/// produces a well-formed tensor of the expected doubled shape.
#[test]
fn test_second_differentiation_through_head() {
    let (output, input) = exp_graph();
    let res = differentiate(&output, &[input], None, None).unwrap();
    let adjoint = &res.result[0];
    let head = &res.adjoints[&output];
    let jac = jacobian(adjoint, head, true).unwrap();
    let mut expected = adjoint.shape().to_vec();
    expected.extend(head.shape().iter().cloned());
    assert_eq!(jac.shape(), expected.as_slice());
}
