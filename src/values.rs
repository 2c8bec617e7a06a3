//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::backprop_fns::BackpropFunc;

type SharedValue = Rc<RefCell<InnerValue>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None))))
    }

    /// Create a new value derived from an operation on `operands` (i.e. not a leaf node)
    fn new_derived(data: f32, backprop_fn: BackpropFunc, operands: &[&Value]) -> Self {
        let mut inner = InnerValue::new(data, Some(backprop_fn));
        inner.children = operands.iter().map(|v| v.0.clone()).collect();
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    /// Whether the value was created directly rather than by an operation
    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backprop_fn.is_none()
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be exclusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Unlike PyTorch which only zeros out the gradients of the leaf nodes, this zeros out
    /// all gradients in the computation graph which are children of this node
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    pub fn backward(&self) {
        let order = self.topological_order();
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // outputs before inputs
        for value in order.iter().rev() {
            let (backprop_fn, operands) = {
                let inner = value.0.borrow();
                let operands = inner
                    .children
                    .iter()
                    .map(|c| Value(c.clone()))
                    .collect::<Vec<_>>();
                (inner.backprop_fn, operands)
            };
            if let Some(f) = backprop_fn {
                f.apply(&operands, value);
            }
        }
    }

    /// Every node reachable from this one, inputs before the outputs that consume them.
    /// Iterative so that long reduction chains (e.g. a 784 wide dot product) don't recurse.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !visited.insert(value.id()) {
                continue;
            }
            stack.push((value.clone(), true));
            for c in value.0.borrow().children.iter() {
                if !visited.contains(&c.borrow().id) {
                    stack.push((Value(c.clone()), false));
                }
            }
        }
        order
    }
}

// Various operations on values
impl Value {
    pub fn pow(&self, other: &Value) -> Value {
        Value::new_derived(
            self.data().powf(other.data()),
            BackpropFunc::Pow,
            &[self, other],
        )
    }

    pub fn relu(&self) -> Value {
        Value::new_derived(self.data().max(0.0), BackpropFunc::ReLU, &[self])
    }

    pub fn exp(&self) -> Value {
        Value::new_derived(self.data().exp(), BackpropFunc::Exp, &[self])
    }

    /// Natural logarithm
    pub fn ln(&self) -> Value {
        Value::new_derived(self.data().ln(), BackpropFunc::Ln, &[self])
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        write!(
            f,
            "Value(data={}, grad={}, op={:?}, n_children={})",
            inner.data,
            inner.grad,
            inner.backprop_fn,
            inner.children.len()
        )
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        Value::new_derived(self.data() + other.data(), BackpropFunc::Add, &[self, other])
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        Value::new_derived(self.data() - other.data(), BackpropFunc::Sub, &[self, other])
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        Value::new_derived(self.data() * other.data(), BackpropFunc::Mul, &[self, other])
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        Value::new_derived(self.data() / other.data(), BackpropFunc::Div, &[self, other])
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::new_derived(-self.data(), BackpropFunc::Neg, &[self])
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Value::new(0.0), |acc, v| acc + v)
    }
}

/// Convenience macro to implement operations on `[Value]` when ownership can be transferred
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt, $struct:ident) => {
        impl $trait for $struct {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +, Value);
impl_arithmetic!(Sub, sub, -, Value);
impl_arithmetic!(Mul, mul, *, Value);
impl_arithmetic!(Div, div, /, Value);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: f32,
    /// gradient of the value with respect to the output
    pub(crate) grad: f32,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: 0.0,
            children: vec![],
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            backprop_fn,
        }
    }
}
