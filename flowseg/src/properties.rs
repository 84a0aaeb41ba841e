//! Named tuning properties.
//!
//! Components expose their tuning constants as named, bounded properties, so that they can be
//! listed and overridden at runtime (e.g. from the command line) without touching the defaults.

use crate::error::{Error, Result};
use std::fmt;
use std::ops::Deref;

/// Object with custom properties.
pub trait Properties {
    /// Get available properties.
    fn props_mut(&mut self) -> Vec<(&str, PropertyMut)> {
        vec![]
    }

    fn props(&mut self) -> Vec<(&str, Property)> {
        self.props_mut()
            .into_iter()
            .map(|(n, p)| (n, p.into()))
            .collect()
    }

    /// Set a property from its textual value.
    ///
    /// Returns `Ok(false)` if there is no property with the given name.
    fn set_prop(&mut self, name: &str, value: &str) -> Result<bool> {
        match self.props_mut().into_iter().find(|(n, _)| *n == name) {
            Some((_, mut prop)) => prop.parse_set(name, value).map(|_| true),
            None => Ok(false),
        }
    }
}

/// Apply a `name=value` assignment to the first of `targets` that has the named property.
pub fn apply_assignment(targets: &mut [&mut dyn Properties], assignment: &str) -> Result<()> {
    let (name, value) = assignment
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("expected NAME=VALUE, got `{assignment}`")))?;
    let (name, value) = (name.trim(), value.trim());

    for target in targets.iter_mut() {
        if target.set_prop(name, value)? {
            return Ok(());
        }
    }

    Err(Error::Config(format!("unknown property `{name}`")))
}

/// Property with a lower and upper bound.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundedProp<T> {
    pub val: T,
    pub min: T,
    pub max: T,
}

impl<T> Deref for BoundedProp<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.val
    }
}

impl<'a, T: Copy> From<BoundedPropMut<'a, T>> for BoundedProp<T> {
    fn from(BoundedPropMut { val, min, max }: BoundedPropMut<'a, T>) -> Self {
        Self {
            val: *val,
            min,
            max,
        }
    }
}

/// Snapshot of a property value.
#[derive(Clone, Debug, PartialEq)]
pub enum Property {
    Bool(bool),
    Float(BoundedProp<f64>),
    Usize(BoundedProp<usize>),
}

impl<'a> From<PropertyMut<'a>> for Property {
    fn from(prop: PropertyMut<'a>) -> Self {
        match prop {
            PropertyMut::Bool(b) => Self::Bool(*b),
            PropertyMut::Float(p) => Self::Float(p.into()),
            PropertyMut::Usize(p) => Self::Usize(p.into()),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(p) => write!(f, "{} [{}, {}]", p.val, p.min, p.max),
            Self::Usize(p) => write!(f, "{} [{}, {}]", p.val, p.min, p.max),
        }
    }
}

/// Mutable reference to a bounded value.
pub struct BoundedPropMut<'a, T> {
    pub val: &'a mut T,
    pub min: T,
    pub max: T,
}

impl<'a, T: PartialOrd + Copy + fmt::Display> BoundedPropMut<'a, T> {
    fn try_set(&mut self, name: &str, val: T) -> Result<()> {
        if val < self.min || val > self.max {
            return Err(Error::Config(format!(
                "{name} must lie within [{}, {}], got {val}",
                self.min, self.max
            )));
        }
        *self.val = val;
        Ok(())
    }
}

/// Mutable reference to a property.
pub enum PropertyMut<'a> {
    Bool(&'a mut bool),
    Float(BoundedPropMut<'a, f64>),
    Usize(BoundedPropMut<'a, usize>),
}

impl<'a> PropertyMut<'a> {
    /// Create a boolean property.
    ///
    /// # Arguments
    ///
    /// * `b` - reference to the underlying boolean to be mutated.
    pub fn bool(b: &'a mut bool) -> Self {
        Self::Bool(b)
    }

    /// Create a floating point property.
    ///
    /// # Arguments
    ///
    /// * `val` - reference to the underlying float to be mutated.
    /// * `min` - lowest value for the property.
    /// * `max` - highest value for the property.
    pub fn float(val: &'a mut f64, min: f64, max: f64) -> Self {
        Self::Float(BoundedPropMut { val, min, max })
    }

    /// Create an integer property.
    ///
    /// # Arguments
    ///
    /// * `val` - reference to the underlying usize to be mutated.
    /// * `min` - lowest value for the property.
    /// * `max` - highest value for the property.
    pub fn usize(val: &'a mut usize, min: usize, max: usize) -> Self {
        Self::Usize(BoundedPropMut { val, min, max })
    }

    /// Parse `value` and store it, checking the bounds.
    pub fn parse_set(&mut self, name: &str, value: &str) -> Result<()> {
        let invalid = || Error::Config(format!("invalid value `{value}` for {name}"));

        match self {
            Self::Bool(b) => **b = value.parse().map_err(|_| invalid())?,
            Self::Float(p) => {
                let v: f64 = value.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                p.try_set(name, v)?
            }
            Self::Usize(p) => p.try_set(name, value.parse().map_err(|_| invalid())?)?,
        }

        Ok(())
    }
}
