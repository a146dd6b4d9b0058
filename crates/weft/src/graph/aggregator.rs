// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

//! Aggregate input view: a variable-cardinality sibling set collected for
//! one key, exposed to the task body without copying the values.

use crate::core::copy::DataCopy;
use crate::core::ser::Codec;
use std::marker::PhantomData;
use std::sync::Arc;

/// Ordered view over the values gathered on an aggregate input.
pub struct Aggregate<'a, V: Codec> {
    copies: &'a [Arc<DataCopy>],
    _value: PhantomData<&'a V>,
}

impl<'a, V: Codec> Aggregate<'a, V> {
    pub(crate) fn new(copies: &'a [Arc<DataCopy>]) -> Self {
        Self {
            copies,
            _value: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Value at arrival position `i`.
    ///
    /// Panics on slot type mismatch; the builder guarantees the type, so a
    /// mismatch here is a runtime bug.
    pub fn get(&self, i: usize) -> &'a V {
        self.copies[i]
            .get_ref::<V>()
            .expect("aggregate slot holds a value of the declared type")
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a V> + '_ {
        self.copies.iter().map(|c| {
            c.get_ref::<V>()
                .expect("aggregate slot holds a value of the declared type")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_exposes_values_in_arrival_order() {
        let copies = vec![
            DataCopy::new(10u64),
            DataCopy::new(20u64),
            DataCopy::new(30u64),
        ];
        let agg: Aggregate<'_, u64> = Aggregate::new(&copies);
        assert_eq!(agg.len(), 3);
        assert!(!agg.is_empty());
        assert_eq!(*agg.get(1), 20);
        let sum: u64 = agg.iter().sum();
        assert_eq!(sum, 60);
    }
}
