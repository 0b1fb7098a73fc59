//! Type conversion edge cases.
//!
//! Covers NULL handling, lossless integer handling and the exact decimal
//! type across its full 38-digit range.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use tdswire_types::{FromSql, Numeric, SqlValue, ToSql, TypeError};

// ============================================================================
// NULL Handling
// ============================================================================

mod null_handling {
    use super::*;

    #[test]
    fn test_null_to_option_string() {
        let result = Option::<String>::from_sql(&SqlValue::Null).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_null_to_string_fails() {
        let result = String::from_sql(&SqlValue::Null);
        assert!(matches!(result, Err(TypeError::UnexpectedNull)));
    }

    #[test]
    fn test_option_some_to_sql() {
        let v: Option<i32> = Some(42);
        assert_eq!(v.to_sql().unwrap(), SqlValue::Int(42));
    }
}

// ============================================================================
// Integer Boundaries
// ============================================================================

mod integer_boundaries {
    use super::*;

    #[test]
    fn test_bigint_extremes_survive() {
        for v in [i64::MIN, i64::MAX, (1 << 53) + 1] {
            let sql = v.to_sql().unwrap();
            assert_eq!(i64::from_sql(&sql).unwrap(), v);
        }
    }

    #[test]
    fn test_tinyint_is_unsigned() {
        assert_eq!(u8::from_sql(&SqlValue::TinyInt(255)).unwrap(), 255);
        assert_eq!(i16::from_sql(&SqlValue::TinyInt(255)).unwrap(), 255);
    }
}

// ============================================================================
// Numeric
// ============================================================================

mod numeric {
    use super::*;

    #[test]
    fn test_numeric_from_bigint() {
        let n = Numeric::from_sql(&SqlValue::BigInt(i64::MIN)).unwrap();
        assert_eq!(n.value(), i128::from(i64::MIN));
        assert_eq!(n.scale(), 0);
    }

    #[test]
    fn test_numeric_wide_to_f64_fails() {
        let n: Numeric = "12345678901234567890.5".parse().unwrap();
        assert!(matches!(
            f64::from_sql(&SqlValue::Numeric(n)),
            Err(TypeError::OutOfRange { .. })
        ));
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(value in -(10i128.pow(38) - 1)..(10i128.pow(38)), scale in 0u8..=38) {
            let n = Numeric::new(value, scale).unwrap();
            let parsed: Numeric = n.to_string().parse().unwrap();
            prop_assert_eq!(parsed, n);
        }
    }
}
