//! Canonical activity codes and the translation from back-end codes.

use crate::{E, I};

/// Activity of a bound or constraint in a working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityStatus {
    /// Active at its upper bound.
    ActiveAbove,
    /// Active at its lower bound.
    ActiveBelow,
    /// Active as an equality (lower and upper bound coincide).
    ActiveEquality,
    #[default]
    /// Not in the working set.
    Inactive,
}

/// Raw activity code used by the back-end: `-1` lower, `0` inactive, `+1`
/// upper.
pub type RawActivity = i8;

/// Translates one back-end activity code into the canonical code, resolving
/// ties at equality rows (where the two bounds are bitwise equal) to
/// [`ActivityStatus::ActiveEquality`].
pub fn translate_activity(code: RawActivity, lower: E, upper: E) -> ActivityStatus {
    if code != 0 && lower == upper {
        return ActivityStatus::ActiveEquality;
    }
    match code {
        -1 => ActivityStatus::ActiveBelow,
        0 => ActivityStatus::Inactive,
        1 => ActivityStatus::ActiveAbove,
        _ => {
            debug_assert!(false, "unknown back-end activity code {code}");
            ActivityStatus::Inactive
        }
    }
}

/// Translates a full array of back-end codes against the bound pair arrays.
pub fn translate_working_set(
    codes: &[RawActivity],
    lower: &[E],
    upper: &[E],
) -> Vec<ActivityStatus> {
    debug_assert_eq!(codes.len(), lower.len());
    debug_assert_eq!(codes.len(), upper.len());
    (0..codes.len() as I)
        .map(|i| translate_activity(codes[i], lower[i], upper[i]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_sides() {
        assert_eq!(translate_activity(-1, 0., 1.), ActivityStatus::ActiveBelow);
        assert_eq!(translate_activity(1, 0., 1.), ActivityStatus::ActiveAbove);
        assert_eq!(translate_activity(0, 0., 1.), ActivityStatus::Inactive);
    }

    #[test]
    fn test_equality_resolution() {
        assert_eq!(translate_activity(-1, 2., 2.), ActivityStatus::ActiveEquality);
        assert_eq!(translate_activity(1, 2., 2.), ActivityStatus::ActiveEquality);
        assert_eq!(translate_activity(0, 2., 2.), ActivityStatus::Inactive);
    }

    #[test]
    fn test_translate_array() {
        let codes = [-1, 0, 1];
        let lower = [0., 0., 5.];
        let upper = [1., 1., 5.];
        assert_eq!(
            translate_working_set(&codes, &lower, &upper),
            vec![
                ActivityStatus::ActiveBelow,
                ActivityStatus::Inactive,
                ActivityStatus::ActiveEquality,
            ]
        );
    }
}
