//! Test oracles shared by the attack tests.

mod pgd;

use crate::{logit_loss, GradientOracle};
use aegis_core::{AegisError, LossFunc, Result};
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use std::cell::Cell;

/// `logits = W · flatten(x) + b` with closed-form input gradients.
pub(crate) struct AffineOracle {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    pub sample_shape: Vec<usize>,
}

impl AffineOracle {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>, sample_shape: &[usize]) -> Self {
        assert_eq!(weights.ncols(), sample_shape.iter().product::<usize>());
        assert_eq!(weights.nrows(), bias.len());
        Self {
            weights,
            bias,
            sample_shape: sample_shape.to_vec(),
        }
    }

    fn flatten(&self, inputs: &ArrayD<f32>) -> Array2<f32> {
        let n = inputs.shape()[0];
        inputs
            .to_shape((n, self.weights.ncols()))
            .expect("test inputs are contiguous")
            .to_owned()
    }
}

impl GradientOracle for AffineOracle {
    fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    fn num_classes(&self) -> usize {
        self.weights.nrows()
    }

    fn logits(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        Ok(self.flatten(inputs).dot(&self.weights.t()) + &self.bias)
    }

    fn loss(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<Array1<f32>> {
        let logits = self.logits(inputs)?;
        Ok(logits
            .rows()
            .into_iter()
            .zip(labels)
            .map(|(row, &y)| logit_loss(row, y, loss_func).0)
            .collect())
    }

    fn loss_gradient(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<ArrayD<f32>> {
        let logits = self.logits(inputs)?;
        let mut grad = Array2::<f32>::zeros((labels.len(), self.weights.ncols()));
        for ((row, &y), mut out) in logits.rows().into_iter().zip(labels).zip(grad.rows_mut()) {
            let (_, dlogits) = logit_loss(row, y, loss_func);
            out.assign(&dlogits.dot(&self.weights));
        }
        Ok(grad
            .into_shape_with_order(IxDyn(inputs.shape()))
            .expect("gradient has as many elements as the inputs"))
    }
}

/// Counts gradient queries made against an inner oracle.
pub(crate) struct CountingOracle<O> {
    pub inner: O,
    pub gradient_calls: Cell<usize>,
}

impl<O> CountingOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            gradient_calls: Cell::new(0),
        }
    }
}

impl<O: GradientOracle> GradientOracle for CountingOracle<O> {
    fn sample_shape(&self) -> &[usize] {
        self.inner.sample_shape()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn logits(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        self.inner.logits(inputs)
    }

    fn loss(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<Array1<f32>> {
        self.inner.loss(inputs, labels, loss_func)
    }

    fn loss_gradient(
        &self,
        inputs: &ArrayD<f32>,
        labels: &[usize],
        loss_func: LossFunc,
    ) -> Result<ArrayD<f32>> {
        self.gradient_calls.set(self.gradient_calls.get() + 1);
        self.inner.loss_gradient(inputs, labels, loss_func)
    }
}

/// What a misbehaving oracle returns from `loss_gradient`.
#[derive(Clone, Copy)]
pub(crate) enum Fault {
    Error,
    NanGradient,
    WrongShape,
}

/// Two-feature, two-class oracle whose gradient query misbehaves.
pub(crate) struct FaultyOracle {
    pub fault: Fault,
}

impl GradientOracle for FaultyOracle {
    fn sample_shape(&self) -> &[usize] {
        &[2]
    }

    fn num_classes(&self) -> usize {
        2
    }

    fn logits(&self, inputs: &ArrayD<f32>) -> Result<Array2<f32>> {
        Ok(Array2::zeros((inputs.shape()[0], 2)))
    }

    fn loss(&self, inputs: &ArrayD<f32>, _: &[usize], _: LossFunc) -> Result<Array1<f32>> {
        Ok(Array1::zeros(inputs.shape()[0]))
    }

    fn loss_gradient(
        &self,
        inputs: &ArrayD<f32>,
        _: &[usize],
        _: LossFunc,
    ) -> Result<ArrayD<f32>> {
        match self.fault {
            Fault::Error => Err(AegisError::OracleFailure(
                "numeric overflow in gradient computation".to_string(),
            )),
            Fault::NanGradient => Ok(ArrayD::from_elem(inputs.raw_dim(), f32::NAN)),
            Fault::WrongShape => Ok(ArrayD::zeros(IxDyn(&[inputs.shape()[0], 1]))),
        }
    }
}
