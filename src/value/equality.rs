//! Pluggable equality used by the authority to drop writes that would not
//! change anything.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Equality predicate over `T`, lifted over absence by [`Equality::matches`].
///
/// Must be pure: it runs on every write attempt, possibly while the value
/// is being read.
pub struct Equality<T> {
    eq: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            eq: self.eq.clone(),
        }
    }
}

impl<T> fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Equality(<fn>)")
    }
}

impl<T: 'static> Equality<T> {
    pub fn new<F>(eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self { eq: Arc::new(eq) }
    }

    /// Every write counts as a change
    pub fn never() -> Self {
        Self::new(|_, _| false)
    }
}

impl<T> Equality<T> {
    pub fn is_equal(&self, a: &T, b: &T) -> bool {
        (self.eq)(a, b)
    }

    /// Compare two possibly absent values. Two absents are equal, absent and
    /// present never are.
    pub fn matches(&self, current: Option<&T>, next: Option<&T>) -> bool {
        match (current, next) {
            (None, None) => true,
            (Some(a), Some(b)) => self.is_equal(a, b),
            _ => false,
        }
    }
}

impl<T: PartialEq + 'static> Equality<T> {
    /// `PartialEq`, the default for values that have it
    pub fn partial_eq() -> Self {
        Self::new(|a: &T, b: &T| a == b)
    }
}

impl<T: PartialEq + 'static> Default for Equality<T> {
    fn default() -> Self {
        Self::partial_eq()
    }
}

impl<T: Serialize + 'static> Equality<T> {
    /// Structural comparison of the serialized JSON form.
    ///
    /// Object key order does not matter. A value that fails to serialize is
    /// never equal to anything.
    pub fn json() -> Self {
        Self::new(|a: &T, b: &T| {
            match (serde_json::to_value(a), serde_json::to_value(b)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        })
    }
}
