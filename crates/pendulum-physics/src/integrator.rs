//! CPU reference of the kernel's integration scheme
//!
//! Mirrors `pendulum.wgsl` operation for operation: classical fourth-order
//! Runge-Kutta over (θ1, θ2, ω1, ω2) with fixed Δt. Used to check device
//! results and to reason about the scheme without a GPU.

use crate::{Field, StateStore};

/// One instance's full state, gathered from the columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendulumRow {
    pub theta1: f32,
    pub theta2: f32,
    pub omega1: f32,
    pub omega2: f32,
    pub length1: f32,
    pub length2: f32,
    pub mass1: f32,
    pub mass2: f32,
}

/// Time derivative of (θ1, θ2, ω1, ω2)
#[derive(Debug, Clone, Copy, PartialEq)]
struct Derivative {
    theta1: f32,
    theta2: f32,
    omega1: f32,
    omega2: f32,
}

/// Angular accelerations (α1, α2) of a double pendulum with point masses
/// on massless rods.
pub fn angular_accelerations(row: &PendulumRow, g: f32) -> (f32, f32) {
    let PendulumRow {
        theta1: t1,
        theta2: t2,
        omega1: w1,
        omega2: w2,
        length1: l1,
        length2: l2,
        mass1: m1,
        mass2: m2,
    } = *row;

    let d = t1 - t2;
    let den = 2.0 * m1 + m2 - m2 * (2.0 * d).cos();

    let num1 = -g * (2.0 * m1 + m2) * t1.sin()
        - m2 * g * (t1 - 2.0 * t2).sin()
        - 2.0 * d.sin() * m2 * (w2 * w2 * l2 + w1 * w1 * l1 * d.cos());
    let num2 = 2.0
        * d.sin()
        * (w1 * w1 * l1 * (m1 + m2) + g * (m1 + m2) * t1.cos() + w2 * w2 * l2 * m2 * d.cos());

    (num1 / (l1 * den), num2 / (l2 * den))
}

fn derivative(row: &PendulumRow, g: f32) -> Derivative {
    let (alpha1, alpha2) = angular_accelerations(row, g);
    Derivative {
        theta1: row.omega1,
        theta2: row.omega2,
        omega1: alpha1,
        omega2: alpha2,
    }
}

fn offset(row: &PendulumRow, k: &Derivative, h: f32) -> PendulumRow {
    PendulumRow {
        theta1: row.theta1 + h * k.theta1,
        theta2: row.theta2 + h * k.theta2,
        omega1: row.omega1 + h * k.omega1,
        omega2: row.omega2 + h * k.omega2,
        ..*row
    }
}

/// Advance one instance by a single RK4 step of length `dt`
pub fn rk4_step(row: &PendulumRow, g: f32, dt: f32) -> PendulumRow {
    let k1 = derivative(row, g);
    let k2 = derivative(&offset(row, &k1, 0.5 * dt), g);
    let k3 = derivative(&offset(row, &k2, 0.5 * dt), g);
    let k4 = derivative(&offset(row, &k3, dt), g);

    let sixth = dt / 6.0;
    PendulumRow {
        theta1: row.theta1 + sixth * (k1.theta1 + 2.0 * k2.theta1 + 2.0 * k3.theta1 + k4.theta1),
        theta2: row.theta2 + sixth * (k1.theta2 + 2.0 * k2.theta2 + 2.0 * k3.theta2 + k4.theta2),
        omega1: row.omega1 + sixth * (k1.omega1 + 2.0 * k2.omega1 + 2.0 * k3.omega1 + k4.omega1),
        omega2: row.omega2 + sixth * (k1.omega2 + 2.0 * k2.omega2 + 2.0 * k3.omega2 + k4.omega2),
        ..*row
    }
}

impl StateStore {
    /// Gather instance `index` from the columns
    pub fn row(&self, index: usize) -> PendulumRow {
        PendulumRow {
            theta1: self.column(Field::Theta1)[index],
            theta2: self.column(Field::Theta2)[index],
            omega1: self.column(Field::Omega1)[index],
            omega2: self.column(Field::Omega2)[index],
            length1: self.column(Field::Length1)[index],
            length2: self.column(Field::Length2)[index],
            mass1: self.column(Field::Mass1)[index],
            mass2: self.column(Field::Mass2)[index],
        }
    }

    /// Advance every instance by one step on the CPU.
    ///
    /// Only theta and omega are written, one slot per instance.
    pub fn integrate(&mut self, g: f32, dt: f32) {
        for i in 0..self.len() {
            let next = rk4_step(&self.row(i), g, dt);
            self.column_mut(Field::Theta1)[i] = next.theta1;
            self.column_mut(Field::Theta2)[i] = next.theta2;
            self.column_mut(Field::Omega1)[i] = next.omega1;
            self.column_mut(Field::Omega2)[i] = next.omega2;
        }
    }
}
