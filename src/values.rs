//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

use crate::backprop_fns::{
    BackpropFunc, update_gradients_one_operand, update_gradients_two_operands,
};

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None))))
    }

    /// Create a new value derived from an operation on other values (i.e. not a leaf node)
    fn new_derived(data: f32, backprop_fn: BackpropFunc, children: Vec<SharedValue>) -> Self {
        let mut inner = InnerValue::new(data, Some(backprop_fn));
        inner.children = children;
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    pub fn is_finite(&self) -> bool {
        self.data().is_finite()
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be excusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Identity of the node. Nodes of a live graph are all allocated, so the address is unique.
    fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Unlike PyTorch which only zeros out the gradients of the leaf nodes, this zeros out
    /// all gradients in the computation graph which are children of this node
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    pub fn backward(&self) {
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // apply backprop, reversed to start from root first
        for value in self.topological_order().into_iter().rev() {
            let (backprop_fn, children) = {
                let inner = value.0.borrow();
                let children = inner
                    .children
                    .iter()
                    .map(|c| Value(c.clone()))
                    .collect::<Vec<_>>();
                (inner.backprop_fn, children)
            };
            let Some(f) = backprop_fn else {
                continue;
            };
            debug_assert!(f.n_operands() == children.len());
            match children.as_slice() {
                [in1] => update_gradients_one_operand(in1, &value),
                [in1, in2] => update_gradients_two_operands(in1, in2, &value),
                _ => panic!("Unsupported number of operands: {}", children.len()),
            }
        }
    }

    /// Post order over the graph rooted at this node (children before parents).
    ///
    /// Iterative so that long chains (e.g. a KL summed over thousands of weights)
    /// cannot exhaust the stack.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<usize> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];

        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !visited.insert(value.id()) {
                continue;
            }
            let children = value
                .0
                .borrow()
                .children
                .iter()
                .map(|c| Value(c.clone()))
                .collect::<Vec<_>>();
            stack.push((value, true));
            for child in children {
                if !visited.contains(&child.id()) {
                    stack.push((child, false));
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
            vec![self.0.clone(), other.0.clone()],
        )
    }

    pub fn relu(&self) -> Value {
        Value::new_derived(
            self.data().max(0.0),
            BackpropFunc::ReLU,
            vec![self.0.clone()],
        )
    }

    pub fn exp(&self) -> Value {
        Value::new_derived(self.data().exp(), BackpropFunc::Exp, vec![self.0.clone()])
    }

    /// `self * c` for a constant `c`, which does not take part in backprop
    pub fn scale(&self, c: f32) -> Value {
        self * &Value::new(c)
    }

    pub fn square(&self) -> Value {
        self.pow(&Value::new(2.0))
    }
}

/// Implements a binary operator on `&Value`, recording the operands for backprop
macro_rules! impl_binary_op(
    ($trait:ident, $trait_method:ident, $func:ident, $operator:tt) => {
        impl $trait for &Value {
            type Output = Value;

            fn $trait_method(self, other: &Value) -> Value {
                Value::new_derived(
                    self.data() $operator other.data(),
                    BackpropFunc::$func,
                    vec![self.0.clone(), other.0.clone()],
                )
            }
        }
    }
);
impl_binary_op!(Add, add, Add, +);
impl_binary_op!(Sub, sub, Sub, -);
impl_binary_op!(Mul, mul, Mul, *);
// non-finite results are propagated so that a diverging loss is visible
impl_binary_op!(Div, div, Div, /);

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::new_derived(-self.data(), BackpropFunc::Neg, vec![self.0.clone()])
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

impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    pub(crate) data: f32,
    /// gradient of the value with respect to the output
    pub(crate) grad: f32,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    pub fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: 0.0,
            children: vec![],
            backprop_fn,
        }
    }
}

// Dropping a long chain of derived values recursively would overflow the stack,
// so nodes which are uniquely owned are unlinked one at a time.
impl Drop for InnerValue {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(child) = pending.pop() {
            if let Ok(cell) = Rc::try_unwrap(child) {
                let mut inner = cell.into_inner();
                pending.append(&mut inner.children);
            }
        }
    }
}
