//! One-to-many (ragged) column encoding.
//!
//! A column whose rows have varying lengths is stored as two flat sequences:
//! the concatenated row elements and an index of cumulative end offsets.
//! Row `i` is `data[index[i-1]..index[i]]` with `index[-1] = 0`.
//!
//! ```text
//! rows  = [[1, 2], [3], [4, 5, 6]]
//! data  = [1, 2, 3, 4, 5, 6]
//! index = [2, 3, 6]
//! ```

use crate::model::value::{Primitive, Value};

/// A ragged column held as flattened data plus cumulative end offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct RaggedColumn<R> {
    data: Vec<Value<R>>,
    index: Vec<u64>,
}

impl<R> Default for RaggedColumn<R> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            index: Vec::new(),
        }
    }
}

impl<R> RaggedColumn<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a sequence of rows.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<Value<R>>>,
    {
        let mut column = Self::new();
        for row in rows {
            column.push_row(row);
        }
        column
    }

    /// Rebuilds a column from its stored parts.
    ///
    /// The index must be non-decreasing and end at `data.len()`.
    pub fn from_parts(data: Vec<Value<R>>, index: Vec<u64>) -> Result<Self, String> {
        let mut prev = 0u64;
        for (i, &end) in index.iter().enumerate() {
            if end < prev {
                return Err(format!("offset {} at row {} is below previous offset {}", end, i, prev));
            }
            prev = end;
        }
        if prev as usize != data.len() {
            return Err(format!("last offset {} does not match data length {}", prev, data.len()));
        }
        Ok(Self { data, index })
    }

    /// Appends a row. Extends the data and pushes one offset.
    pub fn push_row(&mut self, row: Vec<Value<R>>) {
        self.data.extend(row);
        self.index.push(self.data.len() as u64);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns row `i`.
    pub fn row(&self, i: usize) -> Option<&[Value<R>]> {
        let end = *self.index.get(i)? as usize;
        let start = if i == 0 { 0 } else { self.index[i - 1] as usize };
        self.data.get(start..end)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Value<R>]> {
        (0..self.len()).filter_map(move |i| self.row(i))
    }

    /// Flattened row elements.
    pub fn data(&self) -> &[Value<R>] {
        &self.data
    }

    /// Cumulative end offsets, one per row.
    pub fn index(&self) -> &[u64] {
        &self.index
    }

    /// Splits the column back into its rows.
    pub fn into_rows(self) -> Vec<Vec<Value<R>>> {
        let mut rows = Vec::with_capacity(self.index.len());
        let mut data = self.data.into_iter();
        let mut prev = 0u64;
        for end in self.index {
            rows.push(data.by_ref().take((end - prev) as usize).collect());
            prev = end;
        }
        rows
    }

    /// Smallest unsigned primitive able to hold every offset.
    pub fn index_primitive(&self) -> Primitive {
        index_primitive_for(self.data.len() as u64)
    }

    /// The offsets as a list value in [`index_primitive`](Self::index_primitive).
    pub fn index_value<S>(&self) -> Value<S> {
        let p = self.index_primitive();
        Value::List(
            self.index
                .iter()
                .map(|&end| match p {
                    Primitive::UInt8 => Value::UInt8(end as u8),
                    Primitive::UInt16 => Value::UInt16(end as u16),
                    Primitive::UInt32 => Value::UInt32(end as u32),
                    _ => Value::UInt64(end),
                })
                .collect(),
        )
    }
}

/// Smallest unsigned primitive that can hold `max`.
pub fn index_primitive_for(max: u64) -> Primitive {
    if max <= u8::MAX as u64 {
        Primitive::UInt8
    } else if max <= u16::MAX as u64 {
        Primitive::UInt16
    } else if max <= u32::MAX as u64 {
        Primitive::UInt32
    } else {
        Primitive::UInt64
    }
}

/// Reads stored offsets, accepting any non-negative integer dtype.
pub fn decode_offsets<S>(value: &Value<S>) -> Option<Vec<u64>> {
    value
        .as_list()?
        .iter()
        .map(|v| v.as_integer().and_then(|i| u64::try_from(i).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ints(values: &[i64]) -> Vec<Value<()>> {
        values.iter().map(|&v| Value::Int64(v)).collect()
    }

    #[test]
    fn test_encode_three_rows() {
        let column = RaggedColumn::from_rows(vec![ints(&[1, 2]), ints(&[3]), ints(&[4, 5, 6])]);
        assert_eq!(column.index(), &[2, 3, 6]);
        assert_eq!(column.data(), ints(&[1, 2, 3, 4, 5, 6]).as_slice());
        assert_eq!(column.row(1), Some(ints(&[3]).as_slice()));
        assert_eq!(column.row(3), None);
        assert_eq!(column.index_primitive(), Primitive::UInt8);
        assert_eq!(
            column.index_value::<()>(),
            Value::List(vec![Value::UInt8(2), Value::UInt8(3), Value::UInt8(6)])
        );
    }

    #[test]
    fn test_empty_rows() {
        let column = RaggedColumn::from_rows(vec![ints(&[]), ints(&[7]), ints(&[])]);
        assert_eq!(column.index(), &[0, 1, 1]);
        assert_eq!(column.row(0), Some(&[][..]));
        assert_eq!(column.row(2), Some(&[][..]));
        assert_eq!(column.into_rows(), vec![ints(&[]), ints(&[7]), ints(&[])]);
    }

    #[test]
    fn test_from_parts_rejects_bad_offsets() {
        assert!(RaggedColumn::from_parts(ints(&[1, 2, 3]), vec![2, 1, 3]).is_err());
        assert!(RaggedColumn::from_parts(ints(&[1, 2, 3]), vec![1, 2]).is_err());
        assert!(RaggedColumn::from_parts(ints(&[1, 2, 3]), vec![1, 3]).is_ok());
    }

    #[test]
    fn test_index_width() {
        assert_eq!(index_primitive_for(255), Primitive::UInt8);
        assert_eq!(index_primitive_for(256), Primitive::UInt16);
        assert_eq!(index_primitive_for(70_000), Primitive::UInt32);
        assert_eq!(index_primitive_for(u64::MAX), Primitive::UInt64);
        let stored: Value<()> = Value::List(vec![Value::UInt16(3), Value::Int32(9)]);
        assert_eq!(decode_offsets(&stored), Some(vec![3, 9]));
        let negative: Value<()> = Value::List(vec![Value::Int8(-1)]);
        assert_eq!(decode_offsets(&negative), None);
    }

    proptest! {
        #[test]
        fn prop_rows_survive_encoding(rows in prop::collection::vec(prop::collection::vec(any::<i64>(), 0..6), 0..20)) {
            let rows: Vec<Vec<Value<()>>> = rows.iter().map(|r| ints(r)).collect();
            let column = RaggedColumn::from_rows(rows.clone());
            prop_assert_eq!(column.len(), rows.len());
            for (i, row) in rows.iter().enumerate() {
                prop_assert_eq!(column.row(i), Some(row.as_slice()));
            }
            let stored = RaggedColumn::from_parts(column.data().to_vec(), column.index().to_vec()).unwrap();
            prop_assert_eq!(stored.into_rows(), rows);
        }
    }
}
