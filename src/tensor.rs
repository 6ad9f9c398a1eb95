//! A Tensor with autograd capabilities.

use crate::error::Result;
use ndarray::{Array, ArrayD, Axis, IxDyn};
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

type BackwardOp = Rc<dyn Fn(&Tensor)>;

/// Holds the actual tensor data, its gradient, and graph information.
#[derive(Default)]
pub struct TensorData {
    pub data: ArrayD<f32>,
    pub grad: Option<Tensor>,
    backward: Option<BackwardOp>,
    prev: Vec<Tensor>,
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("data", &self.data)
            .field("grad", &self.grad)
            .field("backward", &self.backward.as_ref().map(|_| "BackwardOp"))
            .field("prev", &self.prev.len())
            .finish()
    }
}

/// The public Tensor struct, a smart pointer to the underlying data.
/// Cloning a Tensor only copies the Rc pointer, so a layer and the graph
/// built from its output share the same parameter storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub inner: Rc<RefCell<TensorData>>,
}

// Pointer identity, so tensors can live in the HashSet used by the topological sort.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Tensor {}
impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.inner.as_ptr()).hash(state);
    }
}

impl Tensor {
    /// Creates a new leaf tensor from raw data and a shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let data = Array::from_shape_vec(IxDyn(&shape), data)?;
        Ok(Self::from_data(data))
    }

    /// Creates a leaf tensor from an existing `ndarray::ArrayD`.
    pub fn from_data(data: ArrayD<f32>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TensorData {
                data,
                ..Default::default()
            })),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::from_data(Array::zeros(IxDyn(shape)))
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::from_data(Array::ones(IxDyn(shape)))
    }

    pub fn ones_like(tensor: &Tensor) -> Self {
        Self::ones(&tensor.shape())
    }

    /// Builds a non-leaf node: `data` computed from `prev`, with `backward`
    /// distributing the incoming gradient back to `prev`.
    fn from_op(data: ArrayD<f32>, prev: Vec<Tensor>, backward: BackwardOp) -> Self {
        let out = Self::from_data(data);
        {
            let mut inner = out.inner.borrow_mut();
            inner.prev = prev;
            inner.backward = Some(backward);
        }
        out
    }

    // --- Accessors ---
    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().data.shape().to_vec()
    }
    pub fn ndim(&self) -> usize {
        self.inner.borrow().data.ndim()
    }
    pub fn data(&self) -> Ref<'_, ArrayD<f32>> {
        Ref::map(self.inner.borrow(), |d| &d.data)
    }
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.borrow().grad.clone()
    }
    pub fn set_grad(&self, grad: Tensor) {
        self.inner.borrow_mut().grad = Some(grad);
    }
    fn add_grad(&self, grad: Tensor) {
        let mut inner = self.inner.borrow_mut();
        let merged = match inner.grad.take() {
            Some(existing) => Tensor::from_data(&*existing.data() + &*grad.data()),
            None => grad,
        };
        inner.grad = Some(merged);
    }

    /// Replaces the data of a leaf tensor in place. Callers check the shape.
    pub(crate) fn assign(&self, data: ArrayD<f32>) {
        let mut inner = self.inner.borrow_mut();
        inner.data = data;
        inner.grad = None;
    }

    // --- Autograd ---

    /// Runs backpropagation from this tensor, seeding its gradient with ones.
    ///
    /// Intermediate nodes drop their graph links and gradients as they are
    /// processed, which breaks the Rc chains between them. Leaf tensors keep
    /// their accumulated gradients.
    pub fn backward(&self) {
        fn build_topo(node: &Tensor, visited: &mut HashSet<Tensor>, topo: &mut Vec<Tensor>) {
            if visited.insert(node.clone()) {
                for child in &node.inner.borrow().prev {
                    build_topo(child, visited, topo);
                }
                topo.push(node.clone());
            }
        }
        let mut topo = Vec::new();
        let mut visited = HashSet::new();
        build_topo(self, &mut visited, &mut topo);

        self.set_grad(Tensor::ones_like(self));

        for node in topo.iter().rev() {
            let backward_fn = node.inner.borrow().backward.clone();
            let Some(backward_fn) = backward_fn else {
                continue;
            };
            if let Some(grad) = node.grad() {
                backward_fn(&grad);
            }
            let mut inner = node.inner.borrow_mut();
            inner.prev.clear();
            inner.backward = None;
            inner.grad = None;
        }
    }

    pub fn zero_grad(&self) {
        self.inner.borrow_mut().grad = None;
    }

    // --- Graph-aware operations ---

    /// Element-wise square root.
    pub fn sqrt(&self) -> Tensor {
        let out = Tensor::from_data(self.data().mapv(f32::sqrt));
        let self_clone = self.clone();
        // The output is reached through a weak pointer so the node does not keep itself alive.
        let out_weak = Rc::downgrade(&out.inner);
        let backward: BackwardOp = Rc::new(move |grad: &Tensor| {
            if let Some(out_rc) = out_weak.upgrade() {
                // d(sqrt(x))/dx = 1 / (2 * sqrt(x))
                let out_tensor = Tensor { inner: out_rc };
                let twice = out_tensor.data().mapv(|v| 2.0 * v);
                let grad_data = &*grad.data() / &twice;
                self_clone.add_grad(Tensor::from_data(grad_data));
            }
        });
        {
            let mut inner = out.inner.borrow_mut();
            inner.prev = vec![self.clone()];
            inner.backward = Some(backward);
        }
        out
    }

    /// Sums all elements into a tensor of shape `[1]`.
    pub fn sum(&self) -> Tensor {
        let out_data = Array::from_elem(IxDyn(&[1]), self.data().sum());
        let self_clone = self.clone();
        let self_shape = self.shape();
        Tensor::from_op(
            out_data,
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let grad_val = grad.data().sum();
                self_clone.add_grad(Tensor::from_data(Array::from_elem(
                    IxDyn(&self_shape),
                    grad_val,
                )));
            }),
        )
    }

    /// Sums elements along an axis.
    pub fn sum_axis(&self, axis: usize, keep_dims: bool) -> Tensor {
        let ax = Axis(axis);
        let summed = self.data().sum_axis(ax);
        let out_data = if keep_dims {
            summed.insert_axis(ax)
        } else {
            summed
        };
        let self_clone = self.clone();
        let self_shape = self.shape();
        Tensor::from_op(
            out_data,
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                let grad_data = if keep_dims {
                    grad.data().clone()
                } else {
                    grad.data().clone().insert_axis(ax)
                };
                let broadcasted = grad_data
                    .broadcast(IxDyn(&self_shape))
                    .unwrap_or_else(|| {
                        panic!("sum_axis gradient cannot broadcast to {:?}", self_shape)
                    })
                    .to_owned();
                self_clone.add_grad(Tensor::from_data(broadcasted));
            }),
        )
    }

    /// Mean along an axis.
    pub fn mean_axis(&self, axis: usize, keep_dims: bool) -> Tensor {
        let n = self.shape()[axis] as f32;
        self.sum_axis(axis, keep_dims) / n
    }

    /// Biased (population) variance along an axis: divides by N, not N - 1.
    pub fn var_axis(&self, axis: usize, keep_dims: bool) -> Tensor {
        let mean = self.mean_axis(axis, true);
        let centered = self - &mean;
        let squared = &centered * &centered;
        squared.mean_axis(axis, keep_dims)
    }
}

/// Sums a gradient back down to the shape of an operand that was broadcast
/// in the forward pass (e.g. a per-feature scale applied to a whole batch).
fn sum_grad_to_shape(grad_data: ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    let grad_shape = grad_data.shape().to_vec();
    if grad_shape == target_shape {
        return grad_data;
    }

    let grad_ndim = grad_shape.len();
    let target_ndim = target_shape.len();
    let lead = grad_ndim.saturating_sub(target_ndim);

    // Prepended axes, then axes where the operand had size 1.
    let mut axes_to_sum: Vec<usize> = (0..lead).collect();
    for (i, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && grad_shape[i + lead] > 1 {
            axes_to_sum.push(i + lead);
        }
    }

    let mut summed = grad_data;
    for &axis in axes_to_sum.iter().rev() {
        summed = summed.sum_axis(Axis(axis));
    }

    let summed_shape = summed.shape().to_vec();
    summed
        .into_shape(IxDyn(target_shape))
        .unwrap_or_else(|e| {
            panic!(
                "Failed to reshape summed grad from {:?} to {:?}: {}",
                summed_shape, target_shape, e
            )
        })
}

// --- Operator overloads ---

impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Tensor {
        let (lhs_c, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_op(
            &*self.data() + &*rhs.data(),
            vec![self.clone(), rhs.clone()],
            Rc::new(move |grad: &Tensor| {
                let g = grad.data().clone();
                lhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(g.clone(), &lhs_c.shape())));
                rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(g, &rhs_c.shape())));
            }),
        )
    }
}
impl<'a> Add<&'a Tensor> for Tensor {
    type Output = Tensor;
    fn add(self, rhs: &'a Tensor) -> Tensor {
        &self + rhs
    }
}
impl Add<f32> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: f32) -> Tensor {
        let self_clone = self.clone();
        Tensor::from_op(
            &*self.data() + rhs,
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| self_clone.add_grad(grad.clone())),
        )
    }
}
impl Add<f32> for Tensor {
    type Output = Tensor;
    fn add(self, rhs: f32) -> Tensor {
        &self + rhs
    }
}

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Tensor {
        let (lhs_c, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_op(
            &*self.data() - &*rhs.data(),
            vec![self.clone(), rhs.clone()],
            Rc::new(move |grad: &Tensor| {
                let g = grad.data().clone();
                let neg = g.mapv(|v| -v);
                lhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(g, &lhs_c.shape())));
                rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(neg, &rhs_c.shape())));
            }),
        )
    }
}
impl<'a> Sub<&'a Tensor> for Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &'a Tensor) -> Tensor {
        &self - rhs
    }
}

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Tensor {
        let (lhs_c, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_op(
            &*self.data() * &*rhs.data(),
            vec![self.clone(), rhs.clone()],
            Rc::new(move |grad: &Tensor| {
                // Both products are computed before any add_grad, since lhs and
                // rhs may be the same tensor (x * x).
                let for_lhs = &*grad.data() * &*rhs_c.data();
                let for_rhs = &*grad.data() * &*lhs_c.data();
                lhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(for_lhs, &lhs_c.shape())));
                rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(for_rhs, &rhs_c.shape())));
            }),
        )
    }
}
impl<'a> Mul<&'a Tensor> for Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &'a Tensor) -> Tensor {
        &self * rhs
    }
}

impl Div for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Tensor {
        let (lhs_c, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_op(
            &*self.data() / &*rhs.data(),
            vec![self.clone(), rhs.clone()],
            Rc::new(move |grad: &Tensor| {
                let for_lhs = &*grad.data() / &*rhs_c.data();
                let rhs_sq = rhs_c.data().mapv(|v| v * v);
                let neg_lhs = lhs_c.data().mapv(|v| -v);
                let for_rhs = &*grad.data() * &(&neg_lhs / &rhs_sq);
                lhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(for_lhs, &lhs_c.shape())));
                rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(for_rhs, &rhs_c.shape())));
            }),
        )
    }
}
impl<'a> Div<&'a Tensor> for Tensor {
    type Output = Tensor;
    fn div(self, rhs: &'a Tensor) -> Tensor {
        &self / rhs
    }
}
impl Div<f32> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: f32) -> Tensor {
        let self_clone = self.clone();
        Tensor::from_op(
            &*self.data() / rhs,
            vec![self.clone()],
            Rc::new(move |grad: &Tensor| {
                self_clone.add_grad(Tensor::from_data(&*grad.data() / rhs))
            }),
        )
    }
}
impl Div<f32> for Tensor {
    type Output = Tensor;
    fn div(self, rhs: f32) -> Tensor {
        &self / rhs
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape: {:?})\n{}", self.shape(), self.data())
    }
}
