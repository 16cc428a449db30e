//! SQL Server native ⇄ canonical type tables.

use crate::dialect::{
    clamp_decimal, decimal_from_catalog, string_from_catalog, CanonicalType, CanonicalTypeInfo,
    FromCanonical, ToCanonical, TypeMapping,
};

use super::MssqlDialect;

const MAX_DECIMAL_PRECISION: u8 = 38;

/// Longest NCHAR/NVARCHAR before MAX is required.
const MAX_NVARCHAR: u32 = 4000;

impl ToCanonical for MssqlDialect {
    fn to_canonical(
        &self,
        data_type: &str,
        max_length: i32,
        precision: i32,
        scale: i32,
    ) -> CanonicalTypeInfo {
        let lower = data_type.to_lowercase();
        match lower.as_str() {
            "tinyint" | "smallint" | "int" => CanonicalTypeInfo::lossless(CanonicalType::Integer),
            "bigint" => CanonicalTypeInfo::lossless(CanonicalType::BigInteger),
            "bit" => CanonicalTypeInfo::lossless(CanonicalType::Boolean),
            "decimal" | "numeric" => {
                decimal_from_catalog(precision, scale)
            }
            "money" => CanonicalTypeInfo::lossless(CanonicalType::Decimal {
                precision: 19,
                scale: 4,
            }),
            "smallmoney" => CanonicalTypeInfo::lossless(CanonicalType::Decimal {
                precision: 10,
                scale: 4,
            }),
            "float" | "real" => CanonicalTypeInfo::lossless(CanonicalType::Float),
            "char" | "nchar" => {
                CanonicalTypeInfo::lossless(string_from_catalog(true, max_length, 8000))
            }
            "varchar" | "nvarchar" => {
                CanonicalTypeInfo::lossless(string_from_catalog(false, max_length, 8000))
            }
            "text" | "ntext" => CanonicalTypeInfo::lossless(CanonicalType::Text),
            "xml" => CanonicalTypeInfo::lossy(CanonicalType::Text, "XML stored as text"),
            "uniqueidentifier" => {
                CanonicalTypeInfo::lossy(CanonicalType::FixedString(36), "GUID stored as text")
            }
            "binary" | "varbinary" | "image" => CanonicalTypeInfo::lossless(CanonicalType::Binary),
            "rowversion" | "timestamp" => CanonicalTypeInfo::lossy(
                CanonicalType::Binary,
                "ROWVERSION copied as plain binary",
            ),
            "date" => CanonicalTypeInfo::lossless(CanonicalType::Date),
            "time" => CanonicalTypeInfo::lossless(CanonicalType::Time),
            "datetime" | "datetime2" | "smalldatetime" => {
                CanonicalTypeInfo::lossless(CanonicalType::Timestamp)
            }
            "datetimeoffset" => CanonicalTypeInfo::lossless(CanonicalType::TimestampTz),
            _ => CanonicalTypeInfo::unsupported(data_type),
        }
    }
}

impl FromCanonical for MssqlDialect {
    fn from_canonical(&self, canonical: &CanonicalType) -> TypeMapping {
        match canonical {
            CanonicalType::Integer => TypeMapping::lossless("INT"),
            CanonicalType::BigInteger => TypeMapping::lossless("BIGINT"),
            CanonicalType::Decimal { precision, scale } => {
                let (p, s, warning) = clamp_decimal(*precision, *scale, MAX_DECIMAL_PRECISION);
                let target = format!("DECIMAL({},{})", p, s);
                match warning {
                    Some(w) => TypeMapping::lossy(target, w),
                    None => TypeMapping::lossless(target),
                }
            }
            CanonicalType::Float => TypeMapping::lossless("FLOAT"),
            CanonicalType::Boolean => TypeMapping::lossless("BIT"),
            CanonicalType::FixedString(n) if *n <= MAX_NVARCHAR => {
                TypeMapping::lossless(format!("NCHAR({})", n))
            }
            CanonicalType::VariableString(n) if *n <= MAX_NVARCHAR => {
                TypeMapping::lossless(format!("NVARCHAR({})", n))
            }
            CanonicalType::FixedString(_) | CanonicalType::VariableString(_) | CanonicalType::Text => {
                TypeMapping::lossless("NVARCHAR(MAX)")
            }
            CanonicalType::Binary => TypeMapping::lossless("VARBINARY(MAX)"),
            CanonicalType::Date => TypeMapping::lossless("DATE"),
            CanonicalType::Time => TypeMapping::lossless("TIME(7)"),
            CanonicalType::Timestamp => TypeMapping::lossless("DATETIME2(7)"),
            CanonicalType::TimestampTz => TypeMapping::lossless("DATETIMEOFFSET(7)"),
            CanonicalType::Unknown(native) => {
                TypeMapping::lossy("NVARCHAR(MAX)", format!("'{}' stored as text", native))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_canonical() {
        let d = MssqlDialect::new();
        assert_eq!(
            d.to_canonical("nvarchar", -1, 0, 0).canonical_type,
            CanonicalType::Text
        );
        assert_eq!(
            d.to_canonical("nvarchar", 20, 0, 0).canonical_type,
            CanonicalType::VariableString(20)
        );
        assert_eq!(
            d.to_canonical("money", 0, 19, 4).canonical_type,
            CanonicalType::Decimal {
                precision: 19,
                scale: 4
            }
        );
        assert_eq!(
            d.to_canonical("datetime2", 0, 0, 7).canonical_type,
            CanonicalType::Timestamp
        );
        assert!(d.to_canonical("geography", 0, 0, 0).canonical_type.is_unknown());
    }

    #[test]
    fn test_from_canonical_clamps_precision() {
        let d = MssqlDialect::new();
        let m = d.from_canonical(&CanonicalType::Decimal {
            precision: 65,
            scale: 30,
        });
        assert_eq!(m.target_type, "DECIMAL(38,30)");
        assert!(m.is_lossy);
        assert!(m.warning.unwrap().contains("exceeds maximum precision"));
    }

    #[test]
    fn test_from_canonical_strings() {
        let d = MssqlDialect::new();
        assert_eq!(
            d.from_canonical(&CanonicalType::VariableString(50)).target_type,
            "NVARCHAR(50)"
        );
        assert_eq!(
            d.from_canonical(&CanonicalType::VariableString(9000)).target_type,
            "NVARCHAR(MAX)"
        );
        assert_eq!(d.from_canonical(&CanonicalType::Boolean).target_type, "BIT");
    }
}
