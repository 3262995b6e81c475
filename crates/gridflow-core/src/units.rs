//! Typed physical quantities used by the network records.
//!
//! Network data arrives in engineering units (MW, Mvar, kV) while the solvers
//! work in per-unit on the system MVA base. Keeping the two apart in the type
//! system means a load in MW can never be added to a per-unit injection by
//! accident; the conversion always goes through [`Megawatts::to_per_unit`] and
//! friends with an explicit base.
//!
//! ```
//! use gridflow_core::units::{Degrees, Megawatts};
//!
//! let load = Megawatts(45.0) + Megawatts(5.0);
//! assert_eq!(load.to_per_unit(100.0), 0.5);
//!
//! let shift = Degrees(-5.0).to_radians();
//! assert!((shift.value() + 0.0872664626).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

macro_rules! quantity {
    ($(#[$meta:meta])* $name:ident, $suffix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub f64);

        impl $name {
            #[inline]
            pub const fn new(value: f64) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn value(self) -> f64 {
                self.0
            }

            #[inline]
            pub fn is_finite(self) -> bool {
                self.0.is_finite()
            }

            #[inline]
            pub fn abs(self) -> Self {
                Self(self.0.abs())
            }
        }

        impl Add for $name {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
            }
        }

        impl Sub for $name {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $name {
            type Output = Self;
            fn neg(self) -> Self {
                Self(-self.0)
            }
        }

        impl Mul<f64> for $name {
            type Output = Self;
            fn mul(self, rhs: f64) -> Self {
                Self(self.0 * rhs)
            }
        }

        impl Div<f64> for $name {
            type Output = Self;
            fn div(self, rhs: f64) -> Self {
                Self(self.0 / rhs)
            }
        }

        impl std::iter::Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                Self(iter.map(|q| q.0).sum())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:.4} {}", self.0, $suffix)
            }
        }
    };
}

quantity!(
    /// Active power in MW.
    Megawatts,
    "MW"
);
quantity!(
    /// Reactive power in Mvar.
    Megavars,
    "Mvar"
);
quantity!(
    /// Apparent power in MVA. Used for thermal ratings.
    MegavoltAmperes,
    "MVA"
);
quantity!(
    /// Line-to-line voltage in kV.
    Kilovolts,
    "kV"
);
quantity!(
    /// Dimensionless per-unit value on the relevant base.
    PerUnit,
    "pu"
);
quantity!(
    /// Angle in radians. All solver arithmetic uses radians.
    Radians,
    "rad"
);
quantity!(
    /// Angle in degrees, for input convenience and display.
    Degrees,
    "deg"
);

impl Megawatts {
    /// Normalize onto a system MVA base.
    #[inline]
    pub fn to_per_unit(self, base_mva: f64) -> f64 {
        self.0 / base_mva
    }

    #[inline]
    pub fn from_per_unit(pu: f64, base_mva: f64) -> Self {
        Self(pu * base_mva)
    }
}

impl Megavars {
    /// Normalize onto a system MVA base.
    #[inline]
    pub fn to_per_unit(self, base_mva: f64) -> f64 {
        self.0 / base_mva
    }

    #[inline]
    pub fn from_per_unit(pu: f64, base_mva: f64) -> Self {
        Self(pu * base_mva)
    }
}

impl MegavoltAmperes {
    #[inline]
    pub fn to_per_unit(self, base_mva: f64) -> f64 {
        self.0 / base_mva
    }

    /// A zero rating conventionally means "no limit".
    #[inline]
    pub fn is_unlimited(self) -> bool {
        self.0 <= 0.0
    }
}

impl Radians {
    #[inline]
    pub fn to_degrees(self) -> Degrees {
        Degrees(self.0.to_degrees())
    }
}

impl Degrees {
    #[inline]
    pub fn to_radians(self) -> Radians {
        Radians(self.0.to_radians())
    }
}

impl From<Degrees> for Radians {
    fn from(d: Degrees) -> Self {
        d.to_radians()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_unit_conversion_uses_explicit_base() {
        assert_eq!(Megawatts(50.0).to_per_unit(100.0), 0.5);
        assert_eq!(Megavars(-20.0).to_per_unit(200.0), -0.1);
        assert_eq!(Megawatts::from_per_unit(1.5, 100.0), Megawatts(150.0));
    }

    #[test]
    fn angle_round_trip() {
        let rad = Degrees(180.0).to_radians();
        assert!((rad.value() - std::f64::consts::PI).abs() < 1e-12);
        assert!((rad.to_degrees().value() - 180.0).abs() < 1e-12);
    }

    #[test]
    fn zero_rating_is_unlimited() {
        assert!(MegavoltAmperes(0.0).is_unlimited());
        assert!(!MegavoltAmperes(120.0).is_unlimited());
    }

    #[test]
    fn sums_and_display() {
        let total: Megawatts = [Megawatts(1.0), Megawatts(2.5)].into_iter().sum();
        assert_eq!(total, Megawatts(3.5));
        assert_eq!(format!("{}", Megavars(1.0)), "1.0000 Mvar");
    }
}
