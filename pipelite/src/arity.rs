//! Fixed-arity adapters for multi-argument transforms.
//!
//! A stage consumes exactly one value. When the previous stage returns a
//! tuple, these adapters let the next stage be written as a function of
//! the tuple's fields:
//!
//! ```
//! use pipelite::{Pipeline, arity::spread2};
//!
//! let pipeline = Pipeline::new(1)
//!     .register(|n: &u32| (*n, n * n))
//!     .unwrap()
//!     .register(spread2(|n: &u32, square: &u32| format!("{n}^2 = {square}")))
//!     .unwrap();
//! # drop(pipeline);
//! ```

/// Adapt `f(&A, &B)` into a transform over `(A, B)`.
pub fn spread2<A, B, R, F>(f: F) -> impl Fn(&(A, B)) -> R + Send + Sync + 'static
where
    A: 'static,
    B: 'static,
    R: 'static,
    F: Fn(&A, &B) -> R + Send + Sync + 'static,
{
    move |(a, b): &(A, B)| f(a, b)
}

/// Adapt `f(&A, &B, &C)` into a transform over `(A, B, C)`.
pub fn spread3<A, B, C, R, F>(f: F) -> impl Fn(&(A, B, C)) -> R + Send + Sync + 'static
where
    A: 'static,
    B: 'static,
    C: 'static,
    R: 'static,
    F: Fn(&A, &B, &C) -> R + Send + Sync + 'static,
{
    move |(a, b, c): &(A, B, C)| f(a, b, c)
}
