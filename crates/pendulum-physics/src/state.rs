//! Column-oriented host state for the pendulum ensemble
//!
//! Every scalar field lives in its own contiguous `Vec<f32>` so the device
//! buffers can mirror them one-to-one and work-items read coalesced memory.
//! Columns are never interleaved into per-instance records.

use thiserror::Error;

/// One scalar column of the ensemble state.
///
/// The discriminant is the kernel binding index, so the declaration order
/// must match the bindings in `pendulum.wgsl`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Length1 = 0,
    Length2 = 1,
    Mass1 = 2,
    Mass2 = 3,
    Theta1 = 4,
    Theta2 = 5,
    Omega1 = 6,
    Omega2 = 7,
}

impl Field {
    /// All fields in binding order
    pub const ALL: [Field; 8] = [
        Field::Length1,
        Field::Length2,
        Field::Mass1,
        Field::Mass2,
        Field::Theta1,
        Field::Theta2,
        Field::Omega1,
        Field::Omega2,
    ];

    /// Binding index of this field's buffer in the kernel
    pub fn binding(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            Field::Length1 => "length1",
            Field::Length2 => "length2",
            Field::Mass1 => "mass1",
            Field::Mass2 => "mass2",
            Field::Theta1 => "theta1",
            Field::Theta2 => "theta2",
            Field::Omega1 => "omega1",
            Field::Omega2 => "omega2",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A pair of columns exchanged with callers as `(first rod, second rod)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// (theta1, theta2)
    Position,
    /// (omega1, omega2)
    Velocity,
    /// (length1, length2)
    Length,
    /// (mass1, mass2)
    Mass,
}

impl Quantity {
    pub fn fields(self) -> (Field, Field) {
        match self {
            Quantity::Position => (Field::Theta1, Field::Theta2),
            Quantity::Velocity => (Field::Omega1, Field::Omega2),
            Quantity::Length => (Field::Length1, Field::Length2),
            Quantity::Mass => (Field::Mass1, Field::Mass2),
        }
    }
}

/// Caller supplied a different number of pairs than there are instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expected {expected} pairs, got {actual}")]
pub struct SizeMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Host-resident structure-of-arrays state for N double pendulums.
///
/// N is fixed at construction; all eight columns always have length N.
#[derive(Debug, Clone, PartialEq)]
pub struct StateStore {
    len: usize,
    columns: [Vec<f32>; 8],
}

impl StateStore {
    /// Allocate zero-filled columns for `len` instances
    pub fn new(len: usize) -> Self {
        Self {
            len,
            columns: std::array::from_fn(|_| vec![0.0; len]),
        }
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column(&self, field: Field) -> &[f32] {
        &self.columns[field as usize]
    }

    pub fn column_mut(&mut self, field: Field) -> &mut [f32] {
        &mut self.columns[field as usize]
    }

    /// Raw bytes of a column, as uploaded to its device buffer
    pub fn column_bytes(&self, field: Field) -> &[u8] {
        bytemuck::cast_slice(self.column(field))
    }

    /// Overwrite a whole column.
    ///
    /// Used by device read-back; the slice must hold exactly N values.
    pub fn replace_column(&mut self, field: Field, values: &[f32]) -> Result<(), SizeMismatch> {
        if values.len() != self.len {
            return Err(SizeMismatch {
                expected: self.len,
                actual: values.len(),
            });
        }
        self.columns[field as usize].copy_from_slice(values);
        Ok(())
    }

    /// Set both columns of a quantity from N pairs.
    ///
    /// On a length mismatch nothing is written.
    pub fn set_pairs(&mut self, quantity: Quantity, pairs: &[(f32, f32)]) -> Result<(), SizeMismatch> {
        if pairs.len() != self.len {
            return Err(SizeMismatch {
                expected: self.len,
                actual: pairs.len(),
            });
        }

        let (first, second) = quantity.fields();
        for (slot, &(a, _)) in self.columns[first as usize].iter_mut().zip(pairs) {
            *slot = a;
        }
        for (slot, &(_, b)) in self.columns[second as usize].iter_mut().zip(pairs) {
            *slot = b;
        }
        Ok(())
    }

    /// Copy both columns of a quantity out as N pairs
    pub fn pairs(&self, quantity: Quantity) -> Vec<(f32, f32)> {
        let (first, second) = quantity.fields();
        self.column(first)
            .iter()
            .copied()
            .zip(self.column(second).iter().copied())
            .collect()
    }

    pub fn set_positions(&mut self, pairs: &[(f32, f32)]) -> Result<(), SizeMismatch> {
        self.set_pairs(Quantity::Position, pairs)
    }

    pub fn set_velocities(&mut self, pairs: &[(f32, f32)]) -> Result<(), SizeMismatch> {
        self.set_pairs(Quantity::Velocity, pairs)
    }

    pub fn set_lengths(&mut self, pairs: &[(f32, f32)]) -> Result<(), SizeMismatch> {
        self.set_pairs(Quantity::Length, pairs)
    }

    pub fn set_masses(&mut self, pairs: &[(f32, f32)]) -> Result<(), SizeMismatch> {
        self.set_pairs(Quantity::Mass, pairs)
    }

    pub fn positions(&self) -> Vec<(f32, f32)> {
        self.pairs(Quantity::Position)
    }

    pub fn velocities(&self) -> Vec<(f32, f32)> {
        self.pairs(Quantity::Velocity)
    }

    pub fn lengths(&self) -> Vec<(f32, f32)> {
        self.pairs(Quantity::Length)
    }

    pub fn masses(&self) -> Vec<(f32, f32)> {
        self.pairs(Quantity::Mass)
    }
}
