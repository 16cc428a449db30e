//! Hub-and-spoke canonical type system for database type mapping.
//!
//! Every supported dialect converts its native types to a small closed set
//! of canonical types and back. Instead of n*(n-1) direct mappers for n
//! databases, each dialect provides two conversions:
//! - `ToCanonical`: native type → canonical type
//! - `FromCanonical`: canonical type → native type
//!
//! ```text
//! Source DB   →  CanonicalType      →  Target DB
//!   MySQL     →  VariableString(50) →  NVARCHAR(50)  (SQL Server)
//!   Oracle    →  Decimal(10,2)      →  NUMERIC(10,2) (PostgreSQL)
//! ```
//!
//! Lossy conversions are flagged on both legs; nothing narrows silently.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::schema::Column;

/// Canonical type representation for cross-database type mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalType {
    /// 32-bit (or narrower) signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInteger,
    /// Exact decimal. Precision is total digits, scale is digits after the point.
    Decimal { precision: u8, scale: u8 },
    /// Binary floating point (double precision).
    Float,
    /// Boolean/bit.
    Boolean,
    /// Fixed-length character string.
    FixedString(u32),
    /// Variable-length character string with a maximum length.
    VariableString(u32),
    /// Unlimited text.
    Text,
    /// Binary data of any length.
    Binary,
    /// Date only.
    Date,
    /// Time of day only.
    Time,
    /// Date and time without timezone.
    Timestamp,
    /// Date and time with timezone.
    #[serde(rename = "timestamp_tz")]
    TimestampTz,
    /// Vendor-specific type with no portable equivalent. Carries the native name.
    Unknown(String),
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalType::Integer => write!(f, "Integer"),
            CanonicalType::BigInteger => write!(f, "BigInteger"),
            CanonicalType::Decimal { precision, scale } => {
                write!(f, "Decimal({},{})", precision, scale)
            }
            CanonicalType::Float => write!(f, "Float"),
            CanonicalType::Boolean => write!(f, "Boolean"),
            CanonicalType::FixedString(n) => write!(f, "FixedString({})", n),
            CanonicalType::VariableString(n) => write!(f, "VariableString({})", n),
            CanonicalType::Text => write!(f, "Text"),
            CanonicalType::Binary => write!(f, "Binary"),
            CanonicalType::Date => write!(f, "Date"),
            CanonicalType::Time => write!(f, "Time"),
            CanonicalType::Timestamp => write!(f, "Timestamp"),
            CanonicalType::TimestampTz => write!(f, "TimestampTZ"),
            CanonicalType::Unknown(name) => write!(f, "Unknown({})", name),
        }
    }
}

/// How a destination canonical type relates to a source canonical type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRelation {
    /// Same canonical type.
    Equal,
    /// Same kind, destination at least as wide.
    Wider,
    /// Same kind, destination narrower; values may not fit.
    Narrower(String),
    /// Different kind that can hold every source value.
    SafeConversion,
    /// Different kind that cannot hold every source value.
    Incompatible,
    /// One side is `Unknown`.
    Unsupported,
}

impl CanonicalType {
    /// Whether this is the `Unknown` fallback.
    pub fn is_unknown(&self) -> bool {
        matches!(self, CanonicalType::Unknown(_))
    }

    /// Whether values are character data.
    pub fn is_string(&self) -> bool {
        matches!(
            self,
            CanonicalType::FixedString(_) | CanonicalType::VariableString(_) | CanonicalType::Text
        )
    }

    /// Whether the type is a keyset-paginable integer.
    pub fn is_integer(&self) -> bool {
        matches!(self, CanonicalType::Integer | CanonicalType::BigInteger)
    }

    /// Declared character length, if any. `Text` is unbounded.
    pub fn char_length(&self) -> Option<u32> {
        match self {
            CanonicalType::FixedString(n) | CanonicalType::VariableString(n) => Some(*n),
            _ => None,
        }
    }

    /// Classify how `dest` relates to `self` as a source column type.
    pub fn relation_to(&self, dest: &CanonicalType) -> TypeRelation {
        use CanonicalType::*;

        if self.is_unknown() || dest.is_unknown() {
            return TypeRelation::Unsupported;
        }
        if self == dest {
            return TypeRelation::Equal;
        }

        match (self, dest) {
            (
                Decimal {
                    precision: sp,
                    scale: ss,
                },
                Decimal {
                    precision: dp,
                    scale: ds,
                },
            ) => {
                let src_int_digits = sp.saturating_sub(*ss);
                let dst_int_digits = dp.saturating_sub(*ds);
                if dst_int_digits < src_int_digits || ds < ss {
                    TypeRelation::Narrower(format!(
                        "DECIMAL({},{}) narrowed to DECIMAL({},{})",
                        sp, ss, dp, ds
                    ))
                } else {
                    TypeRelation::Wider
                }
            }
            (FixedString(s), FixedString(d)) | (VariableString(s), VariableString(d)) => {
                if d < s {
                    TypeRelation::Narrower(format!("length {} narrowed to {}", s, d))
                } else {
                    TypeRelation::Wider
                }
            }
            (FixedString(s), VariableString(d)) => {
                if d < s {
                    TypeRelation::Narrower(format!("length {} narrowed to {}", s, d))
                } else {
                    TypeRelation::SafeConversion
                }
            }
            (VariableString(s), FixedString(d)) => {
                if d < s {
                    TypeRelation::Narrower(format!("length {} narrowed to {}", s, d))
                } else {
                    // Padding changes trailing whitespace semantics.
                    TypeRelation::SafeConversion
                }
            }
            (FixedString(_) | VariableString(_), Text) => TypeRelation::SafeConversion,
            (Text, FixedString(n) | VariableString(n)) => {
                TypeRelation::Narrower(format!("unbounded text narrowed to length {}", n))
            }
            (BigInteger, Integer) => {
                TypeRelation::Narrower("64-bit integer narrowed to 32-bit".to_string())
            }
            (Integer, BigInteger) => TypeRelation::Wider,
            (Integer, Decimal { precision, scale }) if precision - scale.min(precision) >= 10 => {
                TypeRelation::SafeConversion
            }
            (BigInteger, Decimal { precision, scale }) if precision - scale.min(precision) >= 19 => {
                TypeRelation::SafeConversion
            }
            (Integer | BigInteger, Decimal { precision, scale }) => TypeRelation::Narrower(
                format!("integer stored in DECIMAL({},{})", precision, scale),
            ),
            (Decimal { .. } | BigInteger, Float) => {
                TypeRelation::Narrower("exact value stored as binary float".to_string())
            }
            (Integer | Boolean, Float) => TypeRelation::SafeConversion,
            (Boolean, Integer | BigInteger) => TypeRelation::SafeConversion,
            (Timestamp, TimestampTz) | (Date, Timestamp | TimestampTz) => {
                TypeRelation::SafeConversion
            }
            (_, Text) if !matches!(self, Binary) => TypeRelation::SafeConversion,
            _ => TypeRelation::Incompatible,
        }
    }
}

/// Result of converting a native type to canonical form.
#[derive(Debug, Clone)]
pub struct CanonicalTypeInfo {
    /// The canonical type representation.
    pub canonical_type: CanonicalType,
    /// Whether information was lost in the conversion to canonical.
    pub is_lossy: bool,
    /// Warning message if the conversion is lossy.
    pub warning: Option<String>,
}

impl CanonicalTypeInfo {
    /// Create a lossless canonical type conversion.
    pub fn lossless(canonical_type: CanonicalType) -> Self {
        Self {
            canonical_type,
            is_lossy: false,
            warning: None,
        }
    }

    /// Create a lossy canonical type conversion with a warning.
    pub fn lossy(canonical_type: CanonicalType, warning: impl Into<String>) -> Self {
        Self {
            canonical_type,
            is_lossy: true,
            warning: Some(warning.into()),
        }
    }

    /// `Unknown` mapping for a vendor-specific type.
    pub fn unsupported(native: &str) -> Self {
        Self::lossy(
            CanonicalType::Unknown(native.to_string()),
            format!("type '{}' has no portable equivalent", native),
        )
    }
}

/// Native type chosen for a canonical type, with any loss recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    /// Native type string used in DDL.
    pub target_type: String,
    /// Whether the target cannot represent every value of the canonical type.
    pub is_lossy: bool,
    /// Human-readable reason when lossy.
    pub warning: Option<String>,
}

impl TypeMapping {
    /// Create a lossless mapping.
    pub fn lossless(target_type: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            is_lossy: false,
            warning: None,
        }
    }

    /// Create a lossy mapping with a warning.
    pub fn lossy(target_type: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            is_lossy: true,
            warning: Some(warning.into()),
        }
    }
}

/// Per-column result of a composed mapping.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    /// Column name.
    pub name: String,
    /// Canonical type of the source column.
    pub canonical: CanonicalType,
    /// Native type on the target.
    pub target_type: String,
    /// Whether the column is nullable.
    pub is_nullable: bool,
    /// Whether any step lost information.
    pub is_lossy: bool,
    /// Combined warning from both steps.
    pub warning: Option<String>,
}

/// Convert native database types to canonical types.
pub trait ToCanonical: Send + Sync {
    /// Convert a native type to canonical form.
    ///
    /// `max_length` is -1 for MAX/unbounded types. `precision` and `scale`
    /// are 0 when the catalog does not report them.
    fn to_canonical(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> CanonicalTypeInfo;
}

/// Convert canonical types to native database types.
///
/// Implementations re-derive size and precision for the target; when the
/// target cannot hold the full range the mapping widens where possible and
/// is flagged lossy otherwise.
#[allow(clippy::wrong_self_convention)]
pub trait FromCanonical: Send + Sync {
    /// Convert a canonical type to native form.
    fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping;
}

/// Clamp decimal precision to a vendor maximum, flagging the loss.
pub fn clamp_decimal(precision: u8, scale: u8, max_precision: u8) -> (u8, u8, Option<String>) {
    if precision <= max_precision {
        return (precision, scale, None);
    }
    let new_scale = scale.min(max_precision);
    (
        max_precision,
        new_scale,
        Some(format!(
            "DECIMAL({},{}) exceeds maximum precision {}; clamped to DECIMAL({},{})",
            precision, scale, max_precision, max_precision, new_scale
        )),
    )
}

/// Parse catalog precision/scale into canonical decimal bounds.
///
/// Precision 0 (unconstrained NUMERIC) becomes the widest portable decimal.
/// Precision beyond what the canonical form can carry is clamped and
/// reported lossy.
pub fn decimal_from_catalog(precision: i32, scale: i32) -> CanonicalTypeInfo {
    let max = u8::MAX as i32;
    let bounded = if precision <= 0 { 38 } else { precision.min(max) };
    let bounded_scale = scale.clamp(0, bounded);
    let decimal = CanonicalType::Decimal {
        precision: bounded as u8,
        scale: bounded_scale as u8,
    };
    if precision > max || scale > bounded {
        CanonicalTypeInfo::lossy(
            decimal,
            format!(
                "DECIMAL({},{}) exceeds maximum precision {}; clamped to DECIMAL({},{})",
                precision, scale, max, bounded, bounded_scale
            ),
        )
    } else {
        CanonicalTypeInfo::lossless(decimal)
    }
}

/// Parse a catalog character length into a canonical string type.
///
/// -1 (MAX) or lengths beyond `text_threshold` become `Text`.
pub fn string_from_catalog(fixed: bool, max_length: i32, text_threshold: u32) -> CanonicalType {
    if max_length < 0 || max_length as i64 > text_threshold as i64 {
        return CanonicalType::Text;
    }
    let length = if max_length == 0 { 1 } else { max_length as u32 };
    if fixed {
        CanonicalType::FixedString(length)
    } else {
        CanonicalType::VariableString(length)
    }
}

/// Composed type mapper that chains ToCanonical and FromCanonical conversions.
///
/// This is the mapper used by the inspector for compatibility reports and
/// by the orchestrator when generating destination DDL.
pub struct ComposedMapper {
    /// Converts source types to canonical.
    source_converter: Arc<dyn ToCanonical>,
    /// Converts canonical types to target.
    target_converter: Arc<dyn FromCanonical>,
}

impl ComposedMapper {
    /// Create a new composed mapper.
    pub fn new(
        source_converter: Arc<dyn ToCanonical>,
        target_converter: Arc<dyn FromCanonical>,
    ) -> Self {
        Self {
            source_converter,
            target_converter,
        }
    }

    /// Map a native source type all the way to a native target type.
    pub fn map_type(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> (CanonicalType, TypeMapping) {
        let canonical_info = self
            .source_converter
            .to_canonical(data_type, max_length, precision, scale);

        let mut target_mapping = self
            .target_converter
            .from_canonical(&canonical_info.canonical_type);

        if canonical_info.is_lossy {
            target_mapping.is_lossy = true;
            match (&canonical_info.warning, &target_mapping.warning) {
                (Some(src_warn), Some(tgt_warn)) => {
                    target_mapping.warning = Some(format!("{} {}", src_warn, tgt_warn));
                }
                (Some(src_warn), None) => {
                    target_mapping.warning = Some(src_warn.clone());
                }
                (None, _) => {}
            }
        }

        (canonical_info.canonical_type, target_mapping)
    }

    /// Map an already-canonical type onto the target.
    pub fn map_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
        self.target_converter.from_canonical(canonical)
    }

    /// Map a column.
    pub fn map_column(&self, col: &Column) -> ColumnMapping {
        let (canonical, mapping) =
            self.map_type(&col.data_type, col.max_length, col.precision, col.scale);

        ColumnMapping {
            name: col.name.clone(),
            canonical,
            target_type: mapping.target_type,
            is_nullable: col.is_nullable,
            is_lossy: mapping.is_lossy,
            warning: mapping.warning,
        }
    }
}

impl fmt::Debug for ComposedMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedMapper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_type_display() {
        assert_eq!(CanonicalType::Integer.to_string(), "Integer");
        assert_eq!(
            CanonicalType::Decimal {
                precision: 10,
                scale: 2
            }
            .to_string(),
            "Decimal(10,2)"
        );
        assert_eq!(
            CanonicalType::VariableString(255).to_string(),
            "VariableString(255)"
        );
        assert_eq!(CanonicalType::TimestampTz.to_string(), "TimestampTZ");
    }

    #[test]
    fn test_relation_narrowing_strings() {
        let src = CanonicalType::VariableString(50);
        let dst = CanonicalType::VariableString(20);
        assert!(matches!(src.relation_to(&dst), TypeRelation::Narrower(_)));
        assert_eq!(
            dst.relation_to(&CanonicalType::VariableString(50)),
            TypeRelation::Wider
        );
    }

    #[test]
    fn test_relation_decimal() {
        let src = CanonicalType::Decimal {
            precision: 10,
            scale: 2,
        };
        assert_eq!(
            src.relation_to(&CanonicalType::Decimal {
                precision: 12,
                scale: 2
            }),
            TypeRelation::Wider
        );
        assert!(matches!(
            src.relation_to(&CanonicalType::Decimal {
                precision: 10,
                scale: 0
            }),
            TypeRelation::Narrower(_)
        ));
    }

    #[test]
    fn test_relation_kinds() {
        use CanonicalType::*;
        assert_eq!(Integer.relation_to(&BigInteger), TypeRelation::Wider);
        assert!(matches!(
            BigInteger.relation_to(&Integer),
            TypeRelation::Narrower(_)
        ));
        assert_eq!(
            Timestamp.relation_to(&TimestampTz),
            TypeRelation::SafeConversion
        );
        assert_eq!(Date.relation_to(&Boolean), TypeRelation::Incompatible);
        assert_eq!(Binary.relation_to(&Text), TypeRelation::Incompatible);
        assert_eq!(
            Unknown("geometry".into()).relation_to(&Text),
            TypeRelation::Unsupported
        );
    }

    #[test]
    fn test_clamp_decimal() {
        assert_eq!(clamp_decimal(10, 2, 38), (10, 2, None));
        let (p, s, warn) = clamp_decimal(65, 30, 38);
        assert_eq!((p, s), (38, 30));
        assert!(warn.unwrap().contains("clamped"));
    }

    #[test]
    fn test_catalog_helpers() {
        let info = decimal_from_catalog(0, 0);
        assert_eq!(
            info.canonical_type,
            CanonicalType::Decimal {
                precision: 38,
                scale: 0
            }
        );
        assert!(!info.is_lossy);

        let info = decimal_from_catalog(1000, 20);
        assert_eq!(
            info.canonical_type,
            CanonicalType::Decimal {
                precision: 255,
                scale: 20
            }
        );
        assert!(info.is_lossy);
        assert!(info.warning.unwrap().contains("DECIMAL(1000,20)"));
        assert_eq!(string_from_catalog(false, -1, 8000), CanonicalType::Text);
        assert_eq!(
            string_from_catalog(true, 10, 8000),
            CanonicalType::FixedString(10)
        );
    }

    struct MockToCanonical;
    impl ToCanonical for MockToCanonical {
        fn to_canonical(&self, data_type: &str, _: i32, _: i32, _: i32) -> CanonicalTypeInfo {
            match data_type {
                "int" => CanonicalTypeInfo::lossless(CanonicalType::Integer),
                "money" => CanonicalTypeInfo::lossy(
                    CanonicalType::Decimal {
                        precision: 19,
                        scale: 4,
                    },
                    "currency semantics dropped.",
                ),
                other => CanonicalTypeInfo::unsupported(other),
            }
        }
    }

    struct MockFromCanonical;
    impl FromCanonical for MockFromCanonical {
        fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
            match canonical {
                CanonicalType::Integer => TypeMapping::lossless("INTEGER"),
                CanonicalType::Decimal { precision, scale } => {
                    TypeMapping::lossless(format!("NUMERIC({},{})", precision, scale))
                }
                _ => TypeMapping::lossy("TEXT", "stored as text."),
            }
        }
    }

    #[test]
    fn test_composed_mapper_lossless() {
        let mapper = ComposedMapper::new(Arc::new(MockToCanonical), Arc::new(MockFromCanonical));
        let (canonical, mapping) = mapper.map_type("int", 0, 0, 0);
        assert_eq!(canonical, CanonicalType::Integer);
        assert_eq!(mapping.target_type, "INTEGER");
        assert!(!mapping.is_lossy);
    }

    #[test]
    fn test_composed_mapper_merges_warnings() {
        let mapper = ComposedMapper::new(Arc::new(MockToCanonical), Arc::new(MockFromCanonical));
        let (_, mapping) = mapper.map_type("money", 0, 0, 0);
        assert_eq!(mapping.target_type, "NUMERIC(19,4)");
        assert!(mapping.is_lossy);
        assert!(mapping.warning.unwrap().contains("currency"));

        let (canonical, mapping) = mapper.map_type("geometry", 0, 0, 0);
        assert!(canonical.is_unknown());
        let warning = mapping.warning.unwrap();
        assert!(warning.contains("geometry"));
        assert!(warning.contains("stored as text"));
    }
}
