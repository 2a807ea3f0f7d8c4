//! A small, compositional condition language over attribute values.
//!
//! Conditions serve two masters: they lower to backend query operators, and
//! they evaluate in memory as plain predicates. Their textual description is
//! part of the public contract — it appears verbatim in write-condition error
//! messages.

use std::fmt;

/// Comparison operator of a single-operand condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Gt,
    Lte,
    Gte,
    Ne,
}

impl Comparison {
    /// Whether this comparison requires an ordering on the operand type.
    pub fn requires_ordering(self) -> bool {
        matches!(self, Comparison::Lt | Comparison::Gt | Comparison::Lte | Comparison::Gte)
    }
}

/// Composition operator of a multi-operand condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    And,
    Or,
    Not,
}

/// A condition over a value of type `T`: either a single comparison or a
/// composition of other conditions.
///
/// The constructors make invalid shapes unrepresentable: `and`/`or` take at
/// least two operands, `not` takes exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition<T> {
    Single { op: Comparison, operand: T },
    Multi { op: Composition, operands: Vec<Condition<T>> },
}

impl<T> Condition<T> {
    pub fn eq(operand: T) -> Self {
        Condition::Single { op: Comparison::Eq, operand }
    }

    pub fn lt(operand: T) -> Self {
        Condition::Single { op: Comparison::Lt, operand }
    }

    pub fn gt(operand: T) -> Self {
        Condition::Single { op: Comparison::Gt, operand }
    }

    pub fn lte(operand: T) -> Self {
        Condition::Single { op: Comparison::Lte, operand }
    }

    pub fn gte(operand: T) -> Self {
        Condition::Single { op: Comparison::Gte, operand }
    }

    pub fn ne(operand: T) -> Self {
        Condition::Single { op: Comparison::Ne, operand }
    }

    pub fn and(
        first: Condition<T>,
        second: Condition<T>,
        additional: impl IntoIterator<Item = Condition<T>>,
    ) -> Self {
        let mut operands = vec![first, second];
        operands.extend(additional);
        Condition::Multi { op: Composition::And, operands }
    }

    pub fn or(
        first: Condition<T>,
        second: Condition<T>,
        additional: impl IntoIterator<Item = Condition<T>>,
    ) -> Self {
        let mut operands = vec![first, second];
        operands.extend(additional);
        Condition::Multi { op: Composition::Or, operands }
    }

    pub fn not(condition: Condition<T>) -> Self {
        Condition::Multi {
            op: Composition::Not,
            operands: vec![condition],
        }
    }

    /// Maps every operand in the tree, preserving its shape.
    pub fn map<U>(self, f: &impl Fn(T) -> U) -> Condition<U> {
        match self {
            Condition::Single { op, operand } => Condition::Single { op, operand: f(operand) },
            Condition::Multi { op, operands } => Condition::Multi {
                op,
                operands: operands.into_iter().map(|c| c.map(f)).collect(),
            },
        }
    }

    /// Whether any comparison in the tree requires an ordering on `T`.
    pub fn requires_ordering(&self) -> bool {
        match self {
            Condition::Single { op, .. } => op.requires_ordering(),
            Condition::Multi { operands, .. } => operands.iter().any(Condition::requires_ordering),
        }
    }
}

impl<T> Condition<T>
where
    T: PartialEq + PartialOrd,
{
    /// Evaluates the condition against a value.
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Condition::Single { op, operand } => match op {
                Comparison::Eq => value == operand,
                Comparison::Ne => value != operand,
                Comparison::Lt => value < operand,
                Comparison::Gt => value > operand,
                Comparison::Lte => value <= operand,
                Comparison::Gte => value >= operand,
            },
            Condition::Multi { op, operands } => match op {
                Composition::And => operands.iter().all(|c| c.matches(value)),
                Composition::Or => operands.iter().any(|c| c.matches(value)),
                Composition::Not => !operands[0].matches(value),
            },
        }
    }
}

/// The description is computed by a pure function over the tree. Single
/// comparisons render as e.g. "to be equal to 10"; `and`/`or` join their
/// operands with " and "/" or "; `not` prefixes "not ".
impl<T> fmt::Display for Condition<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Single { op, operand } => {
                let phrase = match op {
                    Comparison::Eq => "to be equal to",
                    Comparison::Lt => "to be less than",
                    Comparison::Gt => "to be greater than",
                    Comparison::Lte => "to be less than or equal to",
                    Comparison::Gte => "to be greater than or equal to",
                    Comparison::Ne => "to not be equal to",
                };
                write!(f, "{} {}", phrase, operand)
            },
            Condition::Multi { op, operands } => match op {
                Composition::And | Composition::Or => {
                    let separator = if *op == Composition::And { " and " } else { " or " };
                    let mut first = true;
                    for operand in operands {
                        if !first {
                            f.write_str(separator)?;
                        }
                        first = false;
                        write!(f, "{}", operand)?;
                    }
                    Ok(())
                },
                Composition::Not => write!(f, "not {}", operands[0]),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_operand_descriptions() {
        assert_eq!(Condition::eq(10).to_string(), "to be equal to 10");
        assert_eq!(Condition::lt(10).to_string(), "to be less than 10");
        assert_eq!(Condition::gt(10).to_string(), "to be greater than 10");
        assert_eq!(Condition::lte(10).to_string(), "to be less than or equal to 10");
        assert_eq!(Condition::gte(10).to_string(), "to be greater than or equal to 10");
        assert_eq!(Condition::ne(10).to_string(), "to not be equal to 10");
    }

    #[test]
    fn composite_descriptions() {
        let and = Condition::and(Condition::gt(1), Condition::lt(10), []);
        assert_eq!(and.to_string(), "to be greater than 1 and to be less than 10");

        let or = Condition::or(Condition::eq(1), Condition::eq(2), [Condition::eq(3)]);
        assert_eq!(
            or.to_string(),
            "to be equal to 1 or to be equal to 2 or to be equal to 3"
        );

        let not = Condition::not(Condition::eq(7));
        assert_eq!(not.to_string(), "not to be equal to 7");
    }

    #[test]
    fn matches_evaluates_the_tree() {
        let condition = Condition::and(
            Condition::gte(2),
            Condition::not(Condition::eq(5)),
            [Condition::lte(9)],
        );

        assert!(condition.matches(&2));
        assert!(condition.matches(&9));
        assert!(!condition.matches(&5));
        assert!(!condition.matches(&1));
        assert!(!condition.matches(&10));
    }

    #[test]
    fn map_preserves_shape() {
        let condition = Condition::or(Condition::eq(1), Condition::eq(2), []);
        let mapped = condition.map(&|v: i32| v.to_string());

        assert_eq!(
            mapped,
            Condition::or(Condition::eq("1".to_owned()), Condition::eq("2".to_owned()), [])
        );
    }
}
