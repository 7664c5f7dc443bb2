//! Trainable parameter with a shared gradient slot.
//!
//! Cloning a `Parameter` yields another handle to the same storage, so an
//! optimizer and the model it updates observe the same values and gradients.

use crate::utils::error::{MeshError, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Shape, Tensor, Var};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone, Debug)]
pub struct Parameter {
    var: Var,
    grad: Arc<RwLock<Option<Tensor>>>,
}

impl Parameter {
    /// New parameter holding a private copy of `tensor`.
    pub fn new(tensor: &Tensor) -> Result<Self> {
        Ok(Self::from_var(Var::from_tensor(&tensor.copy()?)?))
    }

    /// Wrap an existing variable, sharing its storage.
    pub fn from_var(var: Var) -> Self {
        Self {
            var,
            grad: Arc::new(RwLock::new(None)),
        }
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    /// Current value.
    pub fn tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Snapshot that does not alias the parameter storage.
    pub fn snapshot(&self) -> Result<Tensor> {
        Ok(self.var.as_tensor().copy()?)
    }

    /// Overwrite the value in place, converting dtype if needed.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        if value.dims() != self.var.dims() {
            return Err(MeshError::Checkpoint(format!(
                "shape mismatch: parameter is {:?}, value is {:?}",
                self.var.dims(),
                value.dims()
            )));
        }
        let value = value.to_dtype(self.dtype())?.to_device(self.device())?;
        self.var.set(&value)?;
        Ok(())
    }

    pub fn shape(&self) -> &Shape {
        self.var.shape()
    }

    pub fn dtype(&self) -> DType {
        self.var.dtype()
    }

    pub fn device(&self) -> &Device {
        self.var.device()
    }

    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.grad.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_grad(&self, grad: Option<Tensor>) -> Result<()> {
        if let Some(g) = &grad {
            self.check_grad_shape(g)?;
        }
        *self.grad.write().unwrap_or_else(PoisonError::into_inner) = grad;
        Ok(())
    }

    /// Add `grad` to the gradient slot.
    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        self.check_grad_shape(grad)?;
        let mut slot = self.grad.write().unwrap_or_else(PoisonError::into_inner);
        let summed = match slot.as_ref() {
            Some(existing) => existing.add(&grad.to_dtype(existing.dtype())?)?,
            None => grad.clone(),
        };
        *slot = Some(summed);
        Ok(())
    }

    /// Pull this parameter's gradient out of a backward pass, if it has one.
    pub fn accumulate_from(&self, grads: &GradStore) -> Result<bool> {
        match grads.get(self.var.as_tensor()) {
            Some(g) => {
                self.accumulate_grad(g)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn take_grad(&self) -> Option<Tensor> {
        self.grad.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn zero_grad(&self) {
        *self.grad.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// True when both handles share storage.
    pub fn same_storage(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.grad, &other.grad)
    }

    fn check_grad_shape(&self, grad: &Tensor) -> Result<()> {
        if grad.dims() != self.var.dims() {
            return Err(MeshError::Config(format!(
                "gradient shape {:?} does not match parameter shape {:?}",
                grad.dims(),
                self.var.dims()
            )));
        }
        Ok(())
    }
}
